use serde::{Deserialize, Serialize};
use tether::ConnectionConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub connection_timeout_secs: u64,
    /// Outgoing packets per second once connected.
    pub command_rate: u32,
    pub handshake_resend_ms: u64,
    pub connection: ConnectionConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connection_timeout_secs: 30,
            command_rate: 30,
            handshake_resend_ms: 1000,
            connection: ConnectionConfig::default(),
        }
    }
}
