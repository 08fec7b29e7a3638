pub mod client;
pub mod config;
pub mod config_string;
pub mod error;
pub mod net;
pub mod ring;
pub mod server;
pub mod snapshot;
pub mod time;
pub mod usercmd;

pub use client::{ClientState, Connection};
pub use config::{ConfigError, ConnectionConfig, ServerConfig, TimeBaseConfig};
pub use config_string::{
    ConfigStringTable, GameState, PatchOutcome, SystemInfo, CS_SERVERINFO, CS_SYSTEMINFO,
    MAX_CONFIGSTRINGS, MAX_GAMESTATE_CHARS,
};
pub use error::ProtocolError;
pub use net::{
    CommandTarget, DatagramChannel, LoopbackChannel, NetworkEndpoint, NetworkStats, PacketError,
    ReliableCommandLog, ServerCommand, SnapshotMessage, DEFAULT_PORT, MAX_RELIABLE_COMMANDS,
};
pub use ring::SequenceRing;
pub use server::{ClientSession, SessionEvent, SessionManager, SessionState};
pub use snapshot::{
    EntityState, EntityStateRing, Frame, PlayerState, SnapFlags, Snapshot, SnapshotRing,
    PACKET_BACKUP,
};
pub use time::{ConnectionState, TimeAdjustment, TimeBase};
pub use usercmd::{Buttons, UserCommand, UserCommandRing, CMD_BACKUP};
