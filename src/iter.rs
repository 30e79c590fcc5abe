//! Traversal over a buffer's valid entries.
//!
//! Two surfaces cover the same walk: [`MetaBuffer::snapshot`] (and the
//! `Iterator` it feeds) for idiomatic consumption, and [`EntryCursor`]
//! for callers that drive traversal step-wise. Both skip Unset entries,
//! resolve borrowed entries through their owning buffer, and produce
//! ascending tag-index order on dense maps.

use crate::buffer::{read_local_bytes, MetaBuffer};
use crate::error::{Error, Result};
use std::sync::Arc;

/// An owned snapshot of one valid entry.
#[derive(Debug, Clone)]
pub struct EntrySnapshot {
    /// Stable numeric tag identifier.
    pub tag: u32,
    /// Human-readable tag name from the registry (diagnostics).
    pub name: String,
    /// Payload size in bytes at snapshot time.
    pub size: u32,
    /// Element count.
    pub count: u32,
    /// Camera scope recorded in this buffer's entry.
    pub camera_id: Option<u32>,
    /// The payload bytes.
    pub bytes: Vec<u8>,
    /// Whether the bytes were resolved through another buffer.
    pub borrowed: bool,
}

enum Pending {
    Ready(EntrySnapshot),
    Borrowed {
        tag: u32,
        camera_id: Option<u32>,
        owner: Arc<MetaBuffer>,
    },
}

impl MetaBuffer {
    /// Snapshot every valid entry.
    ///
    /// Local entries are read under this buffer's map read lock;
    /// borrowed entries are resolved through their owner afterwards, so
    /// no two map locks are ever held together. Entries whose owner has
    /// vanished are skipped.
    pub fn snapshot(&self) -> Vec<EntrySnapshot> {
        let mut items = Vec::new();
        {
            let map = self.map_read();
            let regions = self.regions_snapshot();
            for entry in map.valid_entries() {
                match &entry.parent {
                    Some(weak) => {
                        if let Some(owner) = weak.upgrade() {
                            items.push(Pending::Borrowed {
                                tag: entry.tag,
                                camera_id: entry.camera_id,
                                owner,
                            });
                        }
                    }
                    None => {
                        if let Ok(bytes) = read_local_bytes(entry, &regions) {
                            items.push(Pending::Ready(EntrySnapshot {
                                tag: entry.tag,
                                name: self.registry().name(entry.tag).to_string(),
                                size: entry.size,
                                count: entry.count,
                                camera_id: entry.camera_id,
                                bytes,
                                borrowed: false,
                            }));
                        }
                    }
                }
            }
        }

        items
            .into_iter()
            .filter_map(|item| match item {
                Pending::Ready(snap) => Some(snap),
                Pending::Borrowed {
                    tag,
                    camera_id,
                    owner,
                } => owner.get_tag(tag).ok().map(|value| EntrySnapshot {
                    tag,
                    name: self.registry().name(tag).to_string(),
                    size: value.bytes.len() as u32,
                    count: value.count,
                    camera_id,
                    bytes: value.bytes,
                    borrowed: true,
                }),
            })
            .collect()
    }

    /// Iterate owned snapshots of every valid entry.
    pub fn iter(&self) -> std::vec::IntoIter<EntrySnapshot> {
        self.snapshot().into_iter()
    }

    /// Step-wise cursor over the buffer's valid entries.
    pub fn cursor(&self) -> EntryCursor {
        EntryCursor {
            snaps: self.snapshot(),
            pos: 0,
        }
    }

    /// Render a reproducible, read-only diagnostic listing.
    pub fn dump(&self) -> String {
        use std::fmt::Write;

        let (external, internal, merge) = self.references();
        let mut out = String::new();
        let _ = writeln!(
            out,
            "MetaBuffer {} ({:?} map, {} entries, refs ext:{external} int:{internal} merge:{merge})",
            self.id(),
            self.map_kind(),
            self.entry_count(),
        );
        for snap in self.snapshot() {
            let _ = writeln!(
                out,
                "  {:#010x} {:<32} size={:<6} count={:<4} camera={} {}",
                snap.tag,
                snap.name,
                snap.size,
                snap.count,
                snap.camera_id
                    .map_or_else(|| "-".to_string(), |id| id.to_string()),
                if snap.borrowed { "(borrowed)" } else { "" },
            );
        }
        out
    }
}

/// Step-wise traversal of a buffer's valid entries.
///
/// The sequence is finite and not restartable without an explicit
/// [`begin`](EntryCursor::begin).
pub struct EntryCursor {
    snaps: Vec<EntrySnapshot>,
    pos: usize,
}

impl EntryCursor {
    /// Rewind to the first entry.
    pub fn begin(&mut self) {
        self.pos = 0;
    }

    /// Whether the cursor has moved past the last entry.
    pub fn has_done(&self) -> bool {
        self.pos >= self.snaps.len()
    }

    /// Advance to the next entry.
    pub fn next_entry(&mut self) -> Result<()> {
        if self.has_done() {
            return Err(Error::NoMore);
        }
        self.pos += 1;
        Ok(())
    }

    /// The entry under the cursor.
    pub fn current(&self) -> Result<&EntrySnapshot> {
        self.snaps.get(self.pos).ok_or(Error::NoMore)
    }
}
