use crate::net::PacketError;

/// Fatal protocol violations. Any of these tears down the whole session;
/// none of them is retried.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("requested snapshot {requested} but latest is {latest}")]
    FutureSnapshot { requested: u32, latest: u32 },
    #[error("requested user command {requested} but current is {current}")]
    FutureUserCommand { requested: u32, current: u32 },
    #[error("requested server command {requested} that was never received (latest {latest})")]
    ServerCommandNotReceived { requested: u32, latest: u32 },
    #[error("server command {requested} was cycled out (latest {latest})")]
    ServerCommandCycledOut { requested: u32, latest: u32 },
    #[error("configstring index {index} out of range (max {max})")]
    ConfigStringIndex { index: i64, max: usize },
    #[error("gamestate exceeds {max} chars")]
    GameStateOverflow { max: usize },
    #[error("{side} command overflow")]
    CommandOverflow { side: &'static str },
    #[error("lost reliable commands: expected {expected}, got {received}")]
    LostReliableCommands { expected: u32, received: u32 },
    #[error("frame server time went backwards ({time} < {previous})")]
    FrameTimeWentBackwards { time: i32, previous: i32 },
    #[error("undecodable payload, keystream desync: {0}")]
    Desync(#[source] PacketError),
    #[error("server disconnected: {reason}")]
    ServerDisconnected { reason: String },
    #[error("not connected")]
    NotConnected,
    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),
    #[error("{0}")]
    Packet(#[from] PacketError),
}

impl ProtocolError {
    /// Reason text handed to the peer or user when the session is dropped.
    pub fn drop_reason(&self) -> String {
        match self {
            ProtocolError::ServerDisconnected { reason } => reason.clone(),
            other => other.to_string(),
        }
    }
}
