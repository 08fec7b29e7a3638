use rkyv::util::AlignedVec;
use rkyv::{rancor, Archive, Deserialize, Serialize};

use crate::snapshot::{EntityState, PlayerState, MAX_MAP_AREA_BYTES};
use crate::usercmd::UserCommand;

pub const MAX_PACKET_SIZE: usize = 16384;
pub const PROTOCOL_VERSION: u32 = 1;
pub const DEFAULT_PORT: u16 = 27960;
pub const OUT_OF_BAND_MARKER: u32 = 0xFFFF_FFFF;

const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, thiserror::Error)]
pub enum PacketError {
    #[error("serialization failed: {0}")]
    Serialize(rancor::Error),
    #[error("deserialization failed: {0}")]
    Deserialize(rancor::Error),
    #[error("datagram of {len} bytes is shorter than the {needed}-byte header")]
    Truncated { len: usize, needed: usize },
    #[error("datagram of {len} bytes exceeds the maximum packet size")]
    Oversize { len: usize },
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

pub fn is_out_of_band(data: &[u8]) -> bool {
    data.len() >= 4 && read_u32(data, 0) == OUT_OF_BAND_MARKER
}

/// Plaintext prefix of every client-to-server datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ClientHeader {
    pub server_id: u32,
    pub message_ack: u32,
    pub reliable_ack: u32,
}

impl ClientHeader {
    pub const LEN: usize = 12;

    pub fn new(server_id: u32, message_ack: u32, reliable_ack: u32) -> Self {
        Self {
            server_id,
            message_ack,
            reliable_ack,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.server_id.to_le_bytes());
        out.extend_from_slice(&self.message_ack.to_le_bytes());
        out.extend_from_slice(&self.reliable_ack.to_le_bytes());
    }

    pub fn read(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::LEN {
            return Err(PacketError::Truncated {
                len: data.len(),
                needed: Self::LEN,
            });
        }
        Ok(Self {
            server_id: read_u32(data, 0),
            message_ack: read_u32(data, 4),
            reliable_ack: read_u32(data, 8),
        })
    }
}

/// Plaintext prefix of every server-to-client datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerHeader {
    pub sequence: u32,
    pub reliable_ack: u32,
}

impl ServerHeader {
    pub const LEN: usize = 8;

    pub fn new(sequence: u32, reliable_ack: u32) -> Self {
        Self {
            sequence,
            reliable_ack,
        }
    }

    pub fn write(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.reliable_ack.to_le_bytes());
    }

    pub fn read(data: &[u8]) -> Result<Self, PacketError> {
        if data.len() < Self::LEN {
            return Err(PacketError::Truncated {
                len: data.len(),
                needed: Self::LEN,
            });
        }
        Ok(Self {
            sequence: read_u32(data, 0),
            reliable_ack: read_u32(data, 4),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SequencedCommand {
    pub sequence: u32,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ConfigStringEntry {
    pub index: u32,
    pub value: String,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct GameStateMessage {
    pub client_num: u32,
    pub command_sequence: u32,
    pub config_strings: Vec<ConfigStringEntry>,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct SnapshotMessage {
    pub server_time: i32,
    pub snap_flags: u32,
    pub area_mask: [u8; MAX_MAP_AREA_BYTES],
    pub command_number: u32,
    pub player_state: PlayerState,
    pub entities: Vec<EntityState>,
}

/// Cipher-protected body of a server-to-client datagram.
#[derive(Debug, Clone, Default, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ServerPacket {
    pub commands: Vec<SequencedCommand>,
    pub gamestate: Option<GameStateMessage>,
    pub snapshot: Option<SnapshotMessage>,
}

/// Cipher-protected body of a client-to-server datagram.
#[derive(Debug, Clone, Default, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct ClientPacket {
    /// Client netchan sequence; the header carries only acknowledgements.
    pub sequence: u32,
    pub commands: Vec<SequencedCommand>,
    pub user_commands: Vec<UserCommand>,
}

/// Connectionless messages, sent in the clear behind [`OUT_OF_BAND_MARKER`].
#[derive(Debug, Clone, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub enum OutOfBand {
    GetChallenge,
    Challenge { challenge: u32 },
    Connect { challenge: u32, protocol: u32 },
    ConnectResponse { client_num: u32 },
    Reject { reason: String },
}

macro_rules! wire_codec {
    ($ty:ty, $header_len:expr) => {
        impl $ty {
            /// Fails with [`PacketError::Oversize`] when the payload plus its
            /// header would not fit in one datagram.
            pub fn to_bytes(&self) -> Result<Vec<u8>, PacketError> {
                let bytes = rkyv::to_bytes::<rancor::Error>(self)
                    .map(|aligned| aligned.into_vec())
                    .map_err(PacketError::Serialize)?;
                let len = bytes.len() + $header_len;
                if len > MAX_PACKET_SIZE {
                    return Err(PacketError::Oversize { len });
                }
                Ok(bytes)
            }

            pub fn from_bytes(data: &[u8]) -> Result<Self, PacketError> {
                let mut aligned: AlignedVec = AlignedVec::with_capacity(data.len());
                aligned.extend_from_slice(data);
                rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
            }
        }
    };
}

wire_codec!(ServerPacket, ServerHeader::LEN);
wire_codec!(ClientPacket, ClientHeader::LEN);

impl OutOfBand {
    pub fn encode(&self) -> Result<Vec<u8>, PacketError> {
        let body = rkyv::to_bytes::<rancor::Error>(self).map_err(PacketError::Serialize)?;
        let mut out = Vec::with_capacity(4 + body.len());
        out.extend_from_slice(&OUT_OF_BAND_MARKER.to_le_bytes());
        out.extend_from_slice(&body);
        Ok(out)
    }

    pub fn decode(datagram: &[u8]) -> Result<Self, PacketError> {
        if !is_out_of_band(datagram) {
            return Err(PacketError::Truncated {
                len: datagram.len(),
                needed: 4,
            });
        }
        let mut aligned: AlignedVec = AlignedVec::with_capacity(datagram.len() - 4);
        aligned.extend_from_slice(&datagram[4..]);
        rkyv::from_bytes::<Self, rancor::Error>(&aligned).map_err(PacketError::Deserialize)
    }
}
