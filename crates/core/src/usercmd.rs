use bitflags::bitflags;
use rkyv::{Archive, Deserialize, Serialize};

use crate::error::ProtocolError;
use crate::net::sequence_greater_than;
use crate::ring::SequenceRing;

pub const CMD_BACKUP: usize = 64;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Buttons: u32 {
        const ATTACK = 1 << 0;
        const TALK = 1 << 1;
        const USE = 1 << 2;
        const WALKING = 1 << 4;
        const ALT_ATTACK = 1 << 7;
        const ANY = 1 << 11;
    }
}

/// One locally sampled input tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Archive, Serialize, Deserialize)]
#[rkyv(derive(Debug))]
pub struct UserCommand {
    pub number: u32,
    pub server_time: i32,
    pub angles: [i16; 3],
    pub buttons: u32,
    pub weapon: u8,
    pub forward_move: i8,
    pub right_move: i8,
    pub up_move: i8,
}

impl UserCommand {
    pub fn new(server_time: i32) -> Self {
        Self {
            server_time,
            ..Default::default()
        }
    }

    pub fn buttons(&self) -> Buttons {
        Buttons::from_bits_truncate(self.buttons)
    }

    pub fn set_buttons(&mut self, buttons: Buttons) {
        self.buttons = buttons.bits();
    }
}

#[derive(Debug, Clone)]
pub struct UserCommandRing {
    ring: SequenceRing<UserCommand>,
    current: u32,
}

impl Default for UserCommandRing {
    fn default() -> Self {
        Self::new(CMD_BACKUP)
    }
}

impl UserCommandRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            ring: SequenceRing::new(capacity),
            current: 0,
        }
    }

    /// Number of the newest stored command (0 before the first one).
    pub fn current(&self) -> u32 {
        self.current
    }

    /// Numbers and stores `cmd` as the next command.
    pub fn push(&mut self, mut cmd: UserCommand) -> u32 {
        self.current = self.current.wrapping_add(1);
        cmd.number = self.current;
        self.ring.insert(self.current, cmd);
        self.current
    }

    /// `Ok(None)` once `number` has been overwritten. Asking for a command
    /// that was never generated is a protocol violation.
    pub fn fetch(&self, number: u32) -> Result<Option<UserCommand>, ProtocolError> {
        if sequence_greater_than(number, self.current) {
            return Err(ProtocolError::FutureUserCommand {
                requested: number,
                current: self.current,
            });
        }

        Ok(self.ring.get(number).copied())
    }

    /// Up to `count` newest commands, oldest first.
    pub fn recent(&self, count: usize) -> Vec<UserCommand> {
        let count = count.min(self.ring.capacity()).min(self.current as usize);
        let first = self.current.wrapping_sub(count as u32).wrapping_add(1);

        (0..count as u32)
            .filter_map(|i| self.ring.get(first.wrapping_add(i)).copied())
            .collect()
    }

    pub fn clear(&mut self) {
        self.ring.clear();
        self.current = 0;
    }
}
