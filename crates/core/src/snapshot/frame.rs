use bitflags::bitflags;
use rkyv::{Archive, Deserialize, Serialize};

pub const MAX_MAP_AREA_BYTES: usize = 32;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct SnapFlags: u32 {
        /// The server withheld a snapshot because of rate limits.
        const RATE_DELAYED = 1 << 0;
        /// Snapshot taken before the client entered the world.
        const NOT_ACTIVE = 1 << 1;
        /// Toggled every server map restart.
        const SERVER_COUNT = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct PlayerState {
    pub command_time: i32,
    pub client_num: u32,
    pub origin: [f32; 3],
    pub velocity: [f32; 3],
    pub view_angles: [f32; 3],
    pub weapon: u8,
    pub health: i32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct EntityState {
    pub number: u32,
    pub entity_type: u8,
    pub origin: [f32; 3],
    pub angles: [f32; 3],
    pub flags: u32,
    pub model_index: u16,
    pub frame: u16,
}

impl EntityState {
    pub fn new(number: u32, entity_type: u8) -> Self {
        Self {
            number,
            entity_type,
            ..Default::default()
        }
    }
}

/// Per-frame record kept in the snapshot ring. Entities live in the shared
/// entity ring at `[entity_range_start, entity_range_start + entity_count)`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frame {
    pub valid: bool,
    pub message_num: u32,
    pub snap_flags: SnapFlags,
    pub server_command_sequence: u32,
    pub server_time: i32,
    pub area_mask: [u8; MAX_MAP_AREA_BYTES],
    pub command_number: u32,
    pub player_state: PlayerState,
    pub entity_range_start: u32,
    pub entity_count: u32,
}

impl Frame {
    pub fn new(message_num: u32, server_time: i32) -> Self {
        Self {
            valid: true,
            message_num,
            snap_flags: SnapFlags::empty(),
            server_command_sequence: 0,
            server_time,
            area_mask: [0; MAX_MAP_AREA_BYTES],
            command_number: 0,
            player_state: PlayerState::default(),
            entity_range_start: 0,
            entity_count: 0,
        }
    }
}

/// What a consumer gets back for a retrievable frame.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub message_num: u32,
    pub snap_flags: SnapFlags,
    pub server_command_sequence: u32,
    pub server_time: i32,
    pub area_mask: [u8; MAX_MAP_AREA_BYTES],
    pub command_number: u32,
    pub player_state: PlayerState,
    pub entities: Vec<EntityState>,
}
