//! Hash-indexed content map.

use super::ContentMap;
use crate::entry::ContentEntry;
use crate::error::Result;
use std::collections::HashMap;

/// Content map backed by a hash table keyed on the tag id.
///
/// Grows on demand and stores only tags that were actually touched, so
/// sparse buffers (vendor blobs, debug taps) stay small. Lookup is O(1)
/// average; iteration order is implementation-defined.
#[derive(Default)]
pub struct HashedContentMap {
    entries: HashMap<u32, ContentEntry>,
}

impl HashedContentMap {
    /// Create an empty map.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ContentMap for HashedContentMap {
    fn find(&self, tag: u32) -> Option<&ContentEntry> {
        self.entries.get(&tag)
    }

    fn find_mut(&mut self, tag: u32) -> Option<&mut ContentEntry> {
        self.entries.get_mut(&tag)
    }

    fn ensure_slot(
        &mut self,
        tag: u32,
        tag_index: u32,
        max_size: u32,
    ) -> Result<&mut ContentEntry> {
        let slot = self
            .entries
            .entry(tag)
            .or_insert_with(|| ContentEntry::unset(tag, tag_index, max_size));
        slot.tag_index = tag_index;
        slot.max_size = max_size;
        Ok(slot)
    }

    fn reset(&mut self) {
        // Dropping the entries also drops their parent back-references.
        self.entries.clear();
    }

    fn count(&self) -> usize {
        self.entries.values().filter(|e| e.is_valid()).count()
    }

    fn valid_entries(&self) -> Box<dyn Iterator<Item = &ContentEntry> + '_> {
        Box::new(self.entries.values().filter(|e| e.is_valid()))
    }

    fn for_each_valid_mut(&mut self, f: &mut dyn FnMut(&mut ContentEntry)) {
        for entry in self.entries.values_mut().filter(|e| e.is_valid()) {
            f(entry);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntryLocation, INLINE_CAPACITY};

    fn write(map: &mut HashedContentMap, tag: u32, payload: &[u8]) {
        let slot = map.ensure_slot(tag, 0, 64).unwrap();
        let mut inline = [0u8; INLINE_CAPACITY];
        inline[..payload.len()].copy_from_slice(payload);
        slot.location = EntryLocation::Inline(inline);
        slot.size = payload.len() as u32;
        slot.count = 1;
    }

    #[test]
    fn test_never_inserted_tag_is_absent() {
        let map = HashedContentMap::new();
        assert!(map.find(0x1).is_none());
        assert_eq!(map.count(), 0);
    }

    #[test]
    fn test_insert_and_find() {
        let mut map = HashedContentMap::new();
        write(&mut map, 0x1, &[7, 7]);

        let entry = map.find(0x1).unwrap();
        assert!(entry.is_valid());
        assert_eq!(entry.inline_bytes().unwrap(), &[7, 7]);
    }

    #[test]
    fn test_insert_existing_updates_in_place() {
        let mut map = HashedContentMap::new();
        write(&mut map, 0x1, &[1]);
        write(&mut map, 0x1, &[2, 3]);

        assert_eq!(map.count(), 1);
        assert_eq!(map.find(0x1).unwrap().size, 2);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut map = HashedContentMap::new();
        write(&mut map, 0x1, &[1]);
        write(&mut map, 0x2, &[2]);

        map.reset();
        assert_eq!(map.count(), 0);
        assert!(map.find(0x1).is_none());

        map.reset();
        assert_eq!(map.count(), 0);
    }
}
