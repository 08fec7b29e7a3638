mod channel;
mod cipher;
mod command;
mod endpoint;
mod protocol;
mod reliable;
mod stats;

pub use channel::{DatagramChannel, LoopbackChannel};
pub use cipher::{
    decode_client_packet, decode_server_packet, encode_client_packet, encode_server_packet,
    CLIENT_HEADER_LEN, SERVER_HEADER_LEN,
};
pub use command::{parse_leading_int, tokenize, CommandTarget, ServerCommand};
pub use endpoint::NetworkEndpoint;
pub use protocol::{
    is_out_of_band, sequence_greater_than, ClientHeader, ClientPacket, ConfigStringEntry,
    GameStateMessage, OutOfBand, PacketError, SequencedCommand, ServerHeader, ServerPacket,
    SnapshotMessage, DEFAULT_PORT, MAX_PACKET_SIZE, OUT_OF_BAND_MARKER, PROTOCOL_VERSION,
};
pub use reliable::{ReliableCommandLog, MAX_RELIABLE_COMMANDS, MAX_STRING_CHARS};
pub use stats::{rand_u32, NetworkStats};
