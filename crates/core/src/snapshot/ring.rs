use crate::error::ProtocolError;
use crate::net::sequence_greater_than;
use crate::ring::SequenceRing;

use super::frame::{EntityState, Frame, Snapshot};

pub const PACKET_BACKUP: usize = 32;
pub const MAX_PARSE_ENTITIES: usize = 2048;
pub const MAX_ENTITIES_IN_SNAPSHOT: usize = 256;

/// Flat stream of entity states shared by every stored frame. Frames that
/// changed the same entities overlap, so this is sized well above a single
/// snapshot rather than `PACKET_BACKUP * MAX_ENTITIES_IN_SNAPSHOT`.
#[derive(Debug, Clone)]
pub struct EntityStateRing {
    ring: SequenceRing<EntityState>,
    write_pos: u32,
}

impl Default for EntityStateRing {
    fn default() -> Self {
        Self::new(MAX_PARSE_ENTITIES)
    }
}

impl EntityStateRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: SequenceRing::new(capacity),
            write_pos: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Next position to be written.
    pub fn write_pos(&self) -> u32 {
        self.write_pos
    }

    /// Appends `entities` and returns the position of the first one.
    pub fn append(&mut self, entities: &[EntityState]) -> u32 {
        let start = self.write_pos;
        for entity in entities {
            self.ring.insert(self.write_pos, *entity);
            self.write_pos = self.write_pos.wrapping_add(1);
        }
        start
    }

    /// A range starting at `start` survives until the cursor has moved a full
    /// ring past it.
    pub fn is_live(&self, start: u32) -> bool {
        (self.write_pos.wrapping_sub(start) as usize) < self.capacity()
    }

    pub fn get(&self, pos: u32) -> Option<&EntityState> {
        if !self.is_live(pos) {
            return None;
        }
        self.ring.get(pos)
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.write_pos = 0;
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotRing {
    frames: SequenceRing<Frame>,
    entities: EntityStateRing,
    max_entities: usize,
    latest: u32,
}

impl Default for SnapshotRing {
    fn default() -> Self {
        Self::new(PACKET_BACKUP, MAX_PARSE_ENTITIES)
    }
}

impl SnapshotRing {
    pub fn new(frame_capacity: usize, entity_capacity: usize) -> Self {
        Self {
            frames: SequenceRing::new(frame_capacity),
            entities: EntityStateRing::new(entity_capacity),
            max_entities: MAX_ENTITIES_IN_SNAPSHOT.min(entity_capacity),
            latest: 0,
        }
    }

    pub fn with_max_entities(mut self, max_entities: usize) -> Self {
        self.max_entities = max_entities.min(self.entities.capacity());
        self
    }

    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }

    /// Message number of the newest stored frame (0 before the first one).
    pub fn latest_sequence(&self) -> u32 {
        self.latest
    }

    pub fn latest(&self) -> Option<&Frame> {
        self.frames.latest().and_then(|seq| self.frames.get(seq))
    }

    pub fn entities(&self) -> &EntityStateRing {
        &self.entities
    }

    /// Stores `frame` under `frame.message_num` and marks it valid. Frames
    /// not newer than the latest stored one are refused.
    pub fn store(&mut self, mut frame: Frame, entities: &[EntityState]) -> bool {
        if self.frames.latest().is_some() && !sequence_greater_than(frame.message_num, self.latest)
        {
            log::debug!(
                "refusing frame {}, latest is {}",
                frame.message_num,
                self.latest
            );
            return false;
        }

        let entities = if entities.len() > self.max_entities {
            log::warn!(
                "frame {}: truncated {} entities to {}",
                frame.message_num,
                entities.len(),
                self.max_entities
            );
            &entities[..self.max_entities]
        } else {
            entities
        };

        frame.valid = true;
        frame.entity_range_start = self.entities.append(entities);
        frame.entity_count = entities.len() as u32;

        self.latest = frame.message_num;
        self.frames.insert(frame.message_num, frame);
        true
    }

    /// `Ok(None)` when the frame fell out of either ring or was never valid.
    /// Asking for a frame newer than anything stored is a protocol violation.
    pub fn fetch(&self, sequence: u32) -> Result<Option<Snapshot>, ProtocolError> {
        if sequence_greater_than(sequence, self.latest) {
            return Err(ProtocolError::FutureSnapshot {
                requested: sequence,
                latest: self.latest,
            });
        }

        if self.latest.wrapping_sub(sequence) as usize >= self.capacity() {
            return Ok(None);
        }

        let Some(frame) = self.frames.get(sequence) else {
            return Ok(None);
        };
        if !frame.valid {
            return Ok(None);
        }
        if !self.entities.is_live(frame.entity_range_start) {
            return Ok(None);
        }

        let mut entities = Vec::with_capacity(frame.entity_count as usize);
        for i in 0..frame.entity_count {
            match self.entities.get(frame.entity_range_start.wrapping_add(i)) {
                Some(entity) => entities.push(*entity),
                None => return Ok(None),
            }
        }

        Ok(Some(Snapshot {
            message_num: frame.message_num,
            snap_flags: frame.snap_flags,
            server_command_sequence: frame.server_command_sequence,
            server_time: frame.server_time,
            area_mask: frame.area_mask,
            command_number: frame.command_number,
            player_state: frame.player_state,
            entities,
        }))
    }

    pub fn clear(&mut self) {
        self.frames.clear();
        self.entities.clear();
        self.latest = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entities(count: usize) -> Vec<EntityState> {
        (0..count as u32).map(|n| EntityState::new(n, 0)).collect()
    }

    fn ring_with(frames: impl IntoIterator<Item = u32>) -> SnapshotRing {
        let mut ring = SnapshotRing::default();
        for seq in frames {
            assert!(ring.store(Frame::new(seq, seq as i32 * 50), &entities(2)));
        }
        ring
    }

    #[test]
    fn fetch_returns_stored_frame() {
        let ring = ring_with(1..=3);
        let snap = ring.fetch(2).unwrap().unwrap();

        assert_eq!(snap.message_num, 2);
        assert_eq!(snap.server_time, 100);
        assert_eq!(snap.entities.len(), 2);
    }

    #[test]
    fn backup_boundary() {
        let mut ring = ring_with([10]);
        for seq in 11..10 + PACKET_BACKUP as u32 {
            ring.store(Frame::new(seq, 0), &[]);
        }
        assert!(ring.fetch(10).unwrap().is_some());

        ring.store(Frame::new(10 + PACKET_BACKUP as u32, 0), &[]);
        assert!(ring.fetch(10).unwrap().is_none());
    }

    #[test]
    fn future_request_is_fatal() {
        let ring = ring_with([5]);
        assert!(matches!(
            ring.fetch(6),
            Err(ProtocolError::FutureSnapshot {
                requested: 6,
                latest: 5
            })
        ));
    }

    #[test]
    fn skipped_frames_are_unavailable() {
        let ring = ring_with([1, 3]);
        assert!(ring.fetch(2).unwrap().is_none());
        assert!(ring.fetch(0).unwrap().is_none());
    }

    #[test]
    fn store_marks_frame_valid() {
        let mut ring = ring_with([1]);
        let mut frame = Frame::new(2, 100);
        frame.valid = false;
        assert!(ring.store(frame, &entities(1)));

        let snap = ring.fetch(2).unwrap().unwrap();
        assert_eq!(snap.server_time, 100);
        assert!(ring.latest().unwrap().valid);
    }

    #[test]
    fn evicted_entities_make_frame_unavailable() {
        let mut ring = SnapshotRing::new(8, 16).with_max_entities(8);
        ring.store(Frame::new(1, 0), &entities(8));
        ring.store(Frame::new(2, 0), &entities(7));
        assert!(ring.fetch(1).unwrap().is_some());

        ring.store(Frame::new(3, 0), &entities(1));
        assert!(ring.fetch(1).unwrap().is_none());
        assert_eq!(ring.fetch(2).unwrap().unwrap().entities.len(), 7);
    }

    #[test]
    fn oversized_frame_is_truncated() {
        let mut ring = SnapshotRing::default();
        ring.store(Frame::new(1, 0), &entities(MAX_ENTITIES_IN_SNAPSHOT + 10));

        let snap = ring.fetch(1).unwrap().unwrap();
        assert_eq!(snap.entities.len(), MAX_ENTITIES_IN_SNAPSHOT);
    }

    #[test]
    fn stale_frame_is_refused() {
        let mut ring = ring_with([7]);
        assert!(!ring.store(Frame::new(6, 0), &[]));
        assert!(!ring.store(Frame::new(7, 0), &[]));
        assert_eq!(ring.latest_sequence(), 7);
        assert_eq!(ring.latest().unwrap().message_num, 7);
    }
}
