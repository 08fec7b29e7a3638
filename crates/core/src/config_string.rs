use crate::error::ProtocolError;
use crate::net::ConfigStringEntry;

pub const MAX_CONFIGSTRINGS: usize = 1024;
pub const MAX_GAMESTATE_CHARS: usize = 16000;

pub const CS_SERVERINFO: usize = 0;
pub const CS_SYSTEMINFO: usize = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOutcome {
    /// The slot already held exactly this value.
    Unchanged,
    Rebuilt,
}

/// Packed copy of the table as handed to game logic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameState {
    pub string_offsets: Vec<u32>,
    pub data: Vec<u8>,
    pub data_count: usize,
}

/// Every configstring packed into one NUL-separated buffer. Offset 0 is the
/// shared empty string, so a zero offset means the slot is unset.
#[derive(Debug, Clone)]
pub struct ConfigStringTable {
    offsets: Vec<u32>,
    data: Vec<u8>,
}

impl Default for ConfigStringTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStringTable {
    pub fn new() -> Self {
        Self {
            offsets: vec![0; MAX_CONFIGSTRINGS],
            data: vec![0],
        }
    }

    /// Bytes used so far, including the reserved leading NUL.
    pub fn data_count(&self) -> usize {
        self.data.len()
    }

    fn slot(&self, index: usize) -> &[u8] {
        let start = self.offsets[index] as usize;
        let len = self.data[start..]
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.data.len() - start);
        &self.data[start..start + len]
    }

    /// `None` for out-of-range or unset slots.
    pub fn get(&self, index: usize) -> Option<&str> {
        if index >= MAX_CONFIGSTRINGS || self.offsets[index] == 0 {
            return None;
        }
        std::str::from_utf8(self.slot(index)).ok()
    }

    /// Replaces slot `index` and repacks the whole buffer so offsets stay
    /// consistent. Overflowing the buffer leaves the table untouched.
    pub fn apply_patch(&mut self, index: i64, value: &str) -> Result<PatchOutcome, ProtocolError> {
        let slot = usize::try_from(index)
            .ok()
            .filter(|&i| i < MAX_CONFIGSTRINGS)
            .ok_or(ProtocolError::ConfigStringIndex {
                index,
                max: MAX_CONFIGSTRINGS,
            })?;

        let value = until_nul(value.as_bytes());
        if self.slot(slot) == value {
            return Ok(PatchOutcome::Unchanged);
        }

        let mut offsets = vec![0u32; MAX_CONFIGSTRINGS];
        let mut data = Vec::with_capacity(self.data.len() + value.len() + 1);
        data.push(0);

        for (i, offset) in offsets.iter_mut().enumerate() {
            let bytes = if i == slot { value } else { self.slot(i) };
            if bytes.is_empty() {
                continue;
            }
            append_packed(&mut data, offset, bytes)?;
        }

        self.offsets = offsets;
        self.data = data;
        Ok(PatchOutcome::Rebuilt)
    }

    /// Replaces the whole table with a received gamestate.
    pub fn reset_from(&mut self, entries: &[ConfigStringEntry]) -> Result<(), ProtocolError> {
        let mut offsets = vec![0u32; MAX_CONFIGSTRINGS];
        let mut data = vec![0u8];

        for entry in entries {
            let index = entry.index as usize;
            if index >= MAX_CONFIGSTRINGS {
                return Err(ProtocolError::ConfigStringIndex {
                    index: entry.index as i64,
                    max: MAX_CONFIGSTRINGS,
                });
            }
            let value = until_nul(entry.value.as_bytes());
            if value.is_empty() {
                offsets[index] = 0;
                continue;
            }
            append_packed(&mut data, &mut offsets[index], value)?;
        }

        self.offsets = offsets;
        self.data = data;
        Ok(())
    }

    /// Non-empty slots in index order, as sent in a gamestate.
    pub fn entries(&self) -> Vec<ConfigStringEntry> {
        (0..MAX_CONFIGSTRINGS)
            .filter_map(|i| {
                self.get(i).filter(|v| !v.is_empty()).map(|v| ConfigStringEntry {
                    index: i as u32,
                    value: v.to_owned(),
                })
            })
            .collect()
    }

    pub fn game_state(&self) -> GameState {
        GameState {
            string_offsets: self.offsets.clone(),
            data: self.data.clone(),
            data_count: self.data.len(),
        }
    }

    pub fn clear(&mut self) {
        self.offsets.fill(0);
        self.data.clear();
        self.data.push(0);
    }
}

/// Slots are NUL-terminated, so anything past an embedded NUL is unreachable.
fn until_nul(bytes: &[u8]) -> &[u8] {
    bytes
        .iter()
        .position(|&b| b == 0)
        .map_or(bytes, |end| &bytes[..end])
}

fn append_packed(data: &mut Vec<u8>, offset: &mut u32, bytes: &[u8]) -> Result<(), ProtocolError> {
    if bytes.len() + 1 + data.len() > MAX_GAMESTATE_CHARS {
        return Err(ProtocolError::GameStateOverflow {
            max: MAX_GAMESTATE_CHARS,
        });
    }
    *offset = data.len() as u32;
    data.extend_from_slice(bytes);
    data.push(0);
    Ok(())
}

/// Looks up `key` in a `\key\value\key\value` info string. Keys compare
/// case-insensitively.
pub fn info_value_for_key<'a>(info: &'a str, key: &str) -> Option<&'a str> {
    let mut parts = info.strip_prefix('\\').unwrap_or(info).split('\\');
    while let Some(k) = parts.next() {
        let value = parts.next().unwrap_or("");
        if k.eq_ignore_ascii_case(key) {
            return Some(value);
        }
    }
    None
}

/// Session variables carried in `CS_SYSTEMINFO`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SystemInfo {
    pub server_id: u32,
    pub pure: bool,
    pub cheats: bool,
}

impl SystemInfo {
    pub fn parse(info: &str) -> Self {
        let int = |key| {
            info_value_for_key(info, key)
                .map(crate::net::parse_leading_int)
                .unwrap_or(0)
        };

        Self {
            server_id: int("sv_serverid") as u32,
            pure: int("sv_pure") != 0,
            cheats: int("sv_cheats") != 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn patch_is_idempotent() {
        let mut table = ConfigStringTable::new();
        assert_eq!(
            table.apply_patch(5, "mapname\\test").unwrap(),
            PatchOutcome::Rebuilt
        );
        let before = table.game_state();

        assert_eq!(
            table.apply_patch(5, "mapname\\test").unwrap(),
            PatchOutcome::Unchanged
        );
        assert_eq!(table.game_state(), before);
        assert_eq!(table.get(5), Some("mapname\\test"));
    }

    #[test]
    fn embedded_nul_truncates_value() {
        let mut table = ConfigStringTable::new();
        let command = crate::net::ServerCommand::parse("cs 5 \"a\0b\"");
        let crate::net::ServerCommand::ConfigString { index, value } = command else {
            panic!("expected configstring command");
        };

        assert_eq!(table.apply_patch(index, &value).unwrap(), PatchOutcome::Rebuilt);
        let before = table.game_state();
        assert_eq!(table.apply_patch(index, &value).unwrap(), PatchOutcome::Unchanged);
        assert_eq!(table.apply_patch(index, "a").unwrap(), PatchOutcome::Unchanged);
        assert_eq!(table.game_state(), before);
        assert_eq!(table.get(5), Some("a"));
        assert_eq!(table.data_count(), 3);

        table
            .reset_from(&[ConfigStringEntry {
                index: 7,
                value: "x\0y".into(),
            }])
            .unwrap();
        assert_eq!(table.get(7), Some("x"));
        assert_eq!(table.data_count(), 3);
    }

    #[test]
    fn rebuild_keeps_slot_order() {
        let mut table = ConfigStringTable::new();
        table.apply_patch(3, "three").unwrap();
        table.apply_patch(1, "one").unwrap();

        let state = table.game_state();
        assert_eq!(state.string_offsets[1], 1);
        assert_eq!(state.string_offsets[3], 5);
        assert_eq!(state.data_count, 1 + 4 + 6);

        table.apply_patch(1, "uno!").unwrap();
        assert_eq!(table.get(3), Some("three"));
        assert_eq!(table.game_state().string_offsets[3], 6);
    }

    #[test]
    fn clearing_a_slot_frees_it() {
        let mut table = ConfigStringTable::new();
        table.apply_patch(2, "x").unwrap();
        table.apply_patch(2, "").unwrap();

        assert_eq!(table.get(2), None);
        assert_eq!(table.data_count(), 1);
    }

    #[test]
    fn overflow_is_fatal_and_leaves_table_intact() {
        let mut table = ConfigStringTable::new();
        let big = "a".repeat(MAX_GAMESTATE_CHARS / 2);
        table.apply_patch(0, &big).unwrap();

        assert!(matches!(
            table.apply_patch(1, &big),
            Err(ProtocolError::GameStateOverflow { .. })
        ));
        assert_eq!(table.get(1), None);
        assert_eq!(table.get(0).map(str::len), Some(big.len()));
    }

    #[test]
    fn out_of_range_index_is_fatal() {
        let mut table = ConfigStringTable::new();
        assert!(table.apply_patch(-1, "x").is_err());
        assert!(table.apply_patch(MAX_CONFIGSTRINGS as i64, "x").is_err());
        assert_eq!(table.get(MAX_CONFIGSTRINGS), None);
    }

    #[test]
    fn reset_from_gamestate() {
        let mut table = ConfigStringTable::new();
        table.apply_patch(9, "stale").unwrap();

        let entries = vec![
            ConfigStringEntry {
                index: 0,
                value: "\\mapname\\q3dm1".into(),
            },
            ConfigStringEntry {
                index: 1,
                value: "\\sv_serverid\\42".into(),
            },
        ];
        table.reset_from(&entries).unwrap();

        assert_eq!(table.get(9), None);
        assert_eq!(table.entries(), entries);
    }

    #[test]
    fn info_lookup() {
        let info = "\\sv_serverid\\1234\\sv_pure\\1\\mapname\\mp_test";
        assert_eq!(info_value_for_key(info, "MAPNAME"), Some("mp_test"));
        assert_eq!(info_value_for_key(info, "missing"), None);

        let sys = SystemInfo::parse(info);
        assert_eq!(sys.server_id, 1234);
        assert!(sys.pure);
        assert!(!sys.cheats);
    }
}
