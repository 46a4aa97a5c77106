//! Decoding of raw change-record buffers.
//!
//! A completed read hands back a byte buffer holding variable-length
//! records packed back to back. Each record is:
//!
//! ```text
//! u32 next_entry_offset   // LE; 0 = last record, else offset to the next
//! u32 action              // LE; OS action code
//! u32 name_len            // LE; length in BYTES of the name that follows
//! u16 name[name_len / 2]  // UTF-16LE path fragment, relative to the
//!                         // watched root, not NUL-terminated
//! ```
//!
//! Decoding never reads past the transferred length and stops (with a
//! diagnostic) on a malformed header or offset rather than guessing.

use std::path::{Path, PathBuf};

use crate::event::{ChangeType, EventSink};

pub const ACTION_ADDED: u32 = 0x1;
pub const ACTION_REMOVED: u32 = 0x2;
pub const ACTION_MODIFIED: u32 = 0x3;
pub const ACTION_RENAMED_FROM: u32 = 0x4;
pub const ACTION_RENAMED_TO: u32 = 0x5;

const HEADER_LEN: usize = 12;

/// One decoded change record: the raw action code and the path fragment
/// relative to the watched root. An empty fragment means the root itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub action: u32,
    pub name: String,
}

/// Iterator over the records packed into `buf`.
pub struct Records<'a> {
    buf: &'a [u8],
    offset: usize,
    done: bool,
}

/// Decode the records in the first `buf.len()` bytes of a read buffer.
pub fn records(buf: &[u8]) -> Records<'_> {
    Records {
        buf,
        offset: 0,
        done: buf.is_empty(),
    }
}

impl Iterator for Records<'_> {
    type Item = ChangeRecord;

    fn next(&mut self) -> Option<ChangeRecord> {
        if self.done {
            return None;
        }

        let header = match self.buf.get(self.offset..self.offset + HEADER_LEN) {
            Some(header) => header,
            None => {
                tracing::warn!(
                    offset = self.offset,
                    len = self.buf.len(),
                    "truncated change record header; discarding remainder"
                );
                self.done = true;
                return None;
            }
        };
        let next_offset = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let action = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let name_len = u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;

        let name_start = self.offset + HEADER_LEN;
        let name_bytes = match self.buf.get(name_start..name_start + name_len) {
            Some(bytes) => bytes,
            None => {
                tracing::warn!(
                    offset = self.offset,
                    name_len,
                    len = self.buf.len(),
                    "change record name extends past buffer; discarding remainder"
                );
                self.done = true;
                return None;
            }
        };
        let units: Vec<u16> = name_bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        let name = String::from_utf16_lossy(&units);

        if next_offset == 0 {
            self.done = true;
        } else {
            let next = self.offset + next_offset;
            // Offsets must move strictly forward or decoding could loop.
            if next <= self.offset || next >= self.buf.len() {
                tracing::warn!(
                    offset = self.offset,
                    next_offset,
                    len = self.buf.len(),
                    "invalid next-entry offset; discarding remainder"
                );
                self.done = true;
            } else {
                self.offset = next;
            }
        }

        Some(ChangeRecord { action, name })
    }
}

/// Map an OS action code to the normalized change type; `None` for codes
/// this engine does not recognize.
pub fn change_type_for(action: u32) -> Option<ChangeType> {
    match action {
        ACTION_ADDED | ACTION_RENAMED_TO => Some(ChangeType::Created),
        ACTION_REMOVED | ACTION_RENAMED_FROM => Some(ChangeType::Removed),
        ACTION_MODIFIED => Some(ChangeType::Modified),
        _ => None,
    }
}

/// Absolute path for a record fragment under `root`.
///
/// An empty fragment refers to the root itself; leading separators are
/// trimmed before joining so a stray absolute-looking fragment cannot
/// escape the root.
pub fn resolve_path(root: &Path, fragment: &str) -> PathBuf {
    let trimmed = fragment.trim_start_matches(['/', '\\']);
    if trimmed.is_empty() {
        root.to_path_buf()
    } else {
        root.join(trimmed)
    }
}

/// Decode every record in `buf` and emit exactly one event per record.
pub(crate) fn emit_records(buf: &[u8], root: &Path, sink: &dyn EventSink) {
    for record in records(buf) {
        let path = resolve_path(root, &record.name);
        match change_type_for(record.action) {
            Some(change) => {
                tracing::trace!(action = record.action, path = %path.display(), "change detected");
                sink.path_changed(change, &path);
            }
            None => {
                tracing::warn!(
                    action = record.action,
                    path = %path.display(),
                    "unknown change action"
                );
                sink.unknown_event(&path);
            }
        }
    }
}

/// Encode records into the raw buffer layout.
///
/// Mainly useful together with the simulated backend, which injects these
/// buffers as read completions.
pub fn encode_records(records: &[(u32, &str)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (i, (action, name)) in records.iter().enumerate() {
        let units: Vec<u16> = name.encode_utf16().collect();
        let name_len = (units.len() * 2) as u32;
        let next_offset = if i + 1 == records.len() {
            0
        } else {
            HEADER_LEN as u32 + name_len
        };
        out.extend_from_slice(&next_offset.to_le_bytes());
        out.extend_from_slice(&action.to_le_bytes());
        out.extend_from_slice(&name_len.to_le_bytes());
        for unit in units {
            out.extend_from_slice(&unit.to_le_bytes());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_three_records_in_order() {
        let buf = encode_records(&[
            (ACTION_ADDED, "foo.txt"),
            (ACTION_MODIFIED, "foo.txt"),
            (ACTION_REMOVED, "bar.txt"),
        ]);
        let root = Path::new("/r");

        let decoded: Vec<(ChangeType, PathBuf)> = records(&buf)
            .map(|rec| {
                (
                    change_type_for(rec.action).expect("known action"),
                    resolve_path(root, &rec.name),
                )
            })
            .collect();

        assert_eq!(
            decoded,
            vec![
                (ChangeType::Created, root.join("foo.txt")),
                (ChangeType::Modified, root.join("foo.txt")),
                (ChangeType::Removed, root.join("bar.txt")),
            ]
        );
    }

    #[test]
    fn test_rename_actions_map_to_removed_and_created() {
        assert_eq!(
            change_type_for(ACTION_RENAMED_FROM),
            Some(ChangeType::Removed)
        );
        assert_eq!(
            change_type_for(ACTION_RENAMED_TO),
            Some(ChangeType::Created)
        );
    }

    #[test]
    fn test_unknown_action_has_no_mapping() {
        assert_eq!(change_type_for(0x99), None);
    }

    #[test]
    fn test_empty_fragment_resolves_to_root() {
        let root = Path::new("/watched");
        assert_eq!(resolve_path(root, ""), PathBuf::from("/watched"));
        // Leading separators must not make the fragment absolute.
        assert_eq!(
            resolve_path(root, "\\sub\\file"),
            Path::new("/watched").join("sub\\file")
        );
    }

    #[test]
    fn test_truncated_header_stops_decoding() {
        let mut buf = encode_records(&[(ACTION_ADDED, "a")]);
        // Claim a successor record that is only a partial header.
        let len = buf.len() as u32;
        buf[0..4].copy_from_slice(&len.to_le_bytes());
        buf.extend_from_slice(&[0u8; 4]);

        let decoded: Vec<ChangeRecord> = records(&buf).collect();
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].name, "a");
    }

    #[test]
    fn test_name_past_end_stops_decoding() {
        let mut buf = encode_records(&[(ACTION_ADDED, "abc")]);
        // Inflate the declared name length past the buffer end.
        buf[8..12].copy_from_slice(&1024u32.to_le_bytes());

        assert_eq!(records(&buf).count(), 0);
    }

    #[test]
    fn test_backward_offset_stops_decoding() {
        let mut buf = encode_records(&[(ACTION_ADDED, "a"), (ACTION_REMOVED, "b")]);
        // Corrupt the first record's next-entry offset to point far past
        // the end of the buffer.
        buf[0..4].copy_from_slice(&u32::MAX.to_le_bytes());

        assert_eq!(records(&buf).count(), 1);
    }

    #[test]
    fn test_zero_transferred_buffer_yields_nothing() {
        assert_eq!(records(&[]).count(), 0);
    }
}
