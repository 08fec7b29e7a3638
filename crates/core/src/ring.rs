use crate::net::sequence_greater_than;

/// Fixed-capacity ring addressed by a monotonically increasing sequence number.
///
/// Slot `i` holds whatever sequence `s` with `s & mask == i` was written last.
/// Older entries sharing the slot are gone for good once overwritten.
#[derive(Debug, Clone)]
pub struct SequenceRing<T> {
    slots: Vec<Option<(u32, T)>>,
    mask: u32,
    latest: Option<u32>,
}

impl<T> SequenceRing<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity <= u32::MAX as usize,
            "ring capacity must be a power of two, got {capacity}"
        );

        Self {
            slots: (0..capacity).map(|_| None).collect(),
            mask: (capacity - 1) as u32,
            latest: None,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    fn index(&self, sequence: u32) -> usize {
        (sequence & self.mask) as usize
    }

    pub fn latest(&self) -> Option<u32> {
        self.latest
    }

    pub fn insert(&mut self, sequence: u32, value: T) {
        let index = self.index(sequence);
        self.slots[index] = Some((sequence, value));

        match self.latest {
            Some(latest) if !sequence_greater_than(sequence, latest) => {}
            _ => self.latest = Some(sequence),
        }
    }

    /// Distance from the newest written sequence, or `None` when `sequence`
    /// lies in the future (or nothing has been written yet).
    pub fn age(&self, sequence: u32) -> Option<u32> {
        let latest = self.latest?;
        if sequence_greater_than(sequence, latest) {
            return None;
        }
        Some(latest.wrapping_sub(sequence))
    }

    pub fn contains(&self, sequence: u32) -> bool {
        self.get(sequence).is_some()
    }

    pub fn get(&self, sequence: u32) -> Option<&T> {
        let age = self.age(sequence)?;
        if age as usize >= self.capacity() {
            return None;
        }

        match &self.slots[self.index(sequence)] {
            Some((stored, value)) if *stored == sequence => Some(value),
            _ => None,
        }
    }

    /// Raw masked slot, whichever sequence last wrote it.
    pub fn slot(&self, sequence: u32) -> Option<&T> {
        self.slots[self.index(sequence)]
            .as_ref()
            .map(|(_, value)| value)
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.latest = None;
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_none()
    }
}
