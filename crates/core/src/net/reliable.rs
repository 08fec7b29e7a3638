use super::protocol::{sequence_greater_than, SequencedCommand};
use crate::ring::SequenceRing;

pub const MAX_RELIABLE_COMMANDS: usize = 64;
pub const MAX_STRING_CHARS: usize = 1024;

/// Ring of reliable text commands for one direction of one peer pair.
///
/// Doubles as keystream material for the transport cipher, which reads the
/// masked slot without caring which sequence last wrote it.
#[derive(Debug, Clone)]
pub struct ReliableCommandLog {
    ring: SequenceRing<String>,
    sequence: u32,
}

impl Default for ReliableCommandLog {
    fn default() -> Self {
        Self::new()
    }
}

impl ReliableCommandLog {
    pub fn new() -> Self {
        Self::with_capacity(MAX_RELIABLE_COMMANDS)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: SequenceRing::new(capacity),
            sequence: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Sequence number of the newest command written.
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Appends `text` as the next sequence number and returns it.
    pub fn push(&mut self, text: &str) -> u32 {
        let sequence = self.sequence.wrapping_add(1);
        self.insert(sequence, text);
        sequence
    }

    /// Stores `text` at an explicit sequence number, as received from the peer.
    pub fn insert(&mut self, sequence: u32, text: &str) {
        self.ring.insert(sequence, truncate_command(text).to_string());
        if let Some(latest) = self.ring.latest() {
            self.sequence = latest;
        }
    }

    /// Command replay: `None` once `sequence` has been cycled out.
    pub fn get(&self, sequence: u32) -> Option<&str> {
        self.ring.get(sequence).map(String::as_str)
    }

    /// Whether `sequence` has already fallen out of the ring window.
    pub fn is_cycled_out(&self, sequence: u32) -> bool {
        !sequence_greater_than(sequence, self.sequence)
            && self.sequence.wrapping_sub(sequence) as usize >= self.capacity()
    }

    /// Keystream source for the masked slot of `sequence`; empty if never written.
    pub fn keystream(&self, sequence: u32) -> &[u8] {
        let bytes = self
            .ring
            .slot(sequence)
            .map(String::as_bytes)
            .unwrap_or_default();

        match bytes.iter().position(|&b| b == 0) {
            Some(end) => &bytes[..end],
            None => bytes,
        }
    }

    /// Every stored command newer than `acknowledged`, oldest first. These
    /// ride along in each outgoing packet until the peer acknowledges them.
    pub fn unacknowledged(&self, acknowledged: u32) -> Vec<SequencedCommand> {
        if !sequence_greater_than(self.sequence, acknowledged) {
            return Vec::new();
        }

        let pending = (self.sequence.wrapping_sub(acknowledged) as usize).min(self.capacity());
        let first = self.sequence.wrapping_sub(pending as u32).wrapping_add(1);

        (0..pending as u32)
            .map(|i| first.wrapping_add(i))
            .filter_map(|sequence| {
                self.get(sequence).map(|text| SequencedCommand {
                    sequence,
                    text: text.to_string(),
                })
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.sequence = 0;
    }

    /// Restarts numbering at `sequence` without keeping any stored text.
    pub fn reset_to(&mut self, sequence: u32) {
        self.ring.clear();
        self.sequence = sequence;
    }
}

fn truncate_command(text: &str) -> &str {
    let limit = MAX_STRING_CHARS - 1;
    if text.len() <= limit {
        return text;
    }

    let mut end = limit;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    log::warn!("reliable command truncated from {} to {} bytes", text.len(), end);
    &text[..end]
}
