//! Per-tag content entries.
//!
//! A [`ContentEntry`] describes the current value of one tag: where the
//! bytes live (inline, in a region, reserved for a pending allocation, or
//! nowhere), how many bytes were written, the element count, and the
//! camera scope. Entries acquired through a zero-copy merge additionally
//! carry a weak back-reference to the buffer that physically owns the
//! bytes; only the owning buffer's link list keeps that buffer alive.

use crate::buffer::MetaBuffer;
use std::sync::Weak;

/// Values up to this many bytes are stored inline in the entry itself
/// and never touch a region.
pub const INLINE_CAPACITY: usize = 64;

/// Alignment factor for packing payloads into a region.
pub const PAYLOAD_ALIGN: u32 = 8;

/// Round `size` up to the payload alignment.
#[inline]
pub const fn align_up(size: u32) -> u32 {
    (size + PAYLOAD_ALIGN - 1) & !(PAYLOAD_ALIGN - 1)
}

/// Where an entry's bytes live.
#[derive(Debug, Clone)]
pub enum EntryLocation {
    /// Small value embedded directly in the entry.
    Inline([u8; INLINE_CAPACITY]),
    /// Value stored in the owning buffer's region list.
    Region {
        /// Index into the owning buffer's region list.
        region: u32,
        /// Byte offset inside that region.
        offset: u32,
    },
    /// Offset assigned, bytes not yet resolved into a region. Used by the
    /// two-phase copy/allocate protocol between sizing and allocation.
    Reserved {
        /// Byte offset inside the future region.
        offset: u32,
    },
    /// No value present. Unset entries are skipped by iteration, export
    /// and count operations.
    Unset,
}

/// One tag's current value descriptor.
#[derive(Debug, Clone)]
pub struct ContentEntry {
    /// Stable numeric tag identifier.
    pub tag: u32,
    /// Dense index from the tag registry.
    pub tag_index: u32,
    /// Where the bytes live.
    pub location: EntryLocation,
    /// Bytes actually written. An entry with `size == 0` has been
    /// allocated but never written and is not yet valid.
    pub size: u32,
    /// Element count of the written value.
    pub count: u32,
    /// Static cap from the tag registry.
    pub max_size: u32,
    /// Camera that produced this value, if camera-scoped.
    pub camera_id: Option<u32>,
    /// Buffer that physically owns the bytes, set only for entries
    /// acquired via merge. `None` means this buffer owns the bytes
    /// outright. The weak handle never keeps the owner alive on its own.
    pub parent: Option<Weak<MetaBuffer>>,
}

impl ContentEntry {
    /// Create an unset entry slot for `tag`.
    pub fn unset(tag: u32, tag_index: u32, max_size: u32) -> Self {
        Self {
            tag,
            tag_index,
            location: EntryLocation::Unset,
            size: 0,
            count: 0,
            max_size,
            camera_id: None,
            parent: None,
        }
    }

    /// A valid entry has been written: `size > 0` and a resolved location.
    pub fn is_valid(&self) -> bool {
        self.size > 0
            && !matches!(
                self.location,
                EntryLocation::Unset | EntryLocation::Reserved { .. }
            )
    }

    /// Whether the bytes live in another buffer (acquired via merge).
    pub fn is_borrowed(&self) -> bool {
        self.parent.is_some()
    }

    /// Whether storage has been assigned (inline slot or region offset),
    /// written or not.
    pub fn has_storage(&self) -> bool {
        matches!(
            self.location,
            EntryLocation::Inline(_) | EntryLocation::Region { .. }
        )
    }

    /// Inline payload view, if the entry stores its value inline.
    pub fn inline_bytes(&self) -> Option<&[u8]> {
        match &self.location {
            EntryLocation::Inline(bytes) => Some(&bytes[..self.size as usize]),
            _ => None,
        }
    }

    /// Mark the entry unset and drop any borrow back-reference. The
    /// storage location itself is forgotten; region bytes are reclaimed
    /// by the owning buffer, not here.
    pub fn reset(&mut self) {
        self.location = EntryLocation::Unset;
        self.size = 0;
        self.count = 0;
        self.camera_id = None;
        self.parent = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 8);
        assert_eq!(align_up(8), 8);
        assert_eq!(align_up(9), 16);
        assert_eq!(align_up(4096), 4096);
    }

    #[test]
    fn test_unset_entry_is_not_valid() {
        let entry = ContentEntry::unset(0x100, 0, 8);
        assert!(!entry.is_valid());
        assert!(!entry.is_borrowed());
        assert!(!entry.has_storage());
    }

    #[test]
    fn test_allocated_but_unwritten_entry_is_not_valid() {
        let mut entry = ContentEntry::unset(0x100, 0, 8);
        entry.location = EntryLocation::Inline([0; INLINE_CAPACITY]);
        assert!(entry.has_storage());
        assert!(!entry.is_valid(), "size == 0 must not count as valid");
    }

    #[test]
    fn test_written_inline_entry_round_trip() {
        let mut entry = ContentEntry::unset(0x100, 0, 8);
        let mut bytes = [0u8; INLINE_CAPACITY];
        bytes[..4].copy_from_slice(&[9, 8, 7, 6]);
        entry.location = EntryLocation::Inline(bytes);
        entry.size = 4;
        entry.count = 1;

        assert!(entry.is_valid());
        assert_eq!(entry.inline_bytes().unwrap(), &[9, 8, 7, 6]);
    }

    #[test]
    fn test_reset_clears_value_and_scope() {
        let mut entry = ContentEntry::unset(0x100, 0, 8);
        entry.location = EntryLocation::Region {
            region: 0,
            offset: 16,
        };
        entry.size = 8;
        entry.count = 2;
        entry.camera_id = Some(1);

        entry.reset();
        assert!(!entry.is_valid());
        assert!(matches!(entry.location, EntryLocation::Unset));
        assert_eq!(entry.count, 0);
        assert_eq!(entry.camera_id, None);
    }
}
