mod frame;
mod ring;

pub use frame::{EntityState, Frame, PlayerState, SnapFlags, Snapshot, MAX_MAP_AREA_BYTES};
pub use ring::{
    EntityStateRing, SnapshotRing, MAX_ENTITIES_IN_SNAPSHOT, MAX_PARSE_ENTITIES, PACKET_BACKUP,
};
