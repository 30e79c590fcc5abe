//! Dense-indexed content map.

use super::ContentMap;
use crate::entry::ContentEntry;
use crate::error::{Error, Result};
use crate::registry::TagRegistry;
use std::sync::Arc;

/// Content map with one pre-sized slot per known tag.
///
/// The registry's dense index addresses slots directly, so `find` is a
/// single bounds-checked array access and every known tag always has a
/// slot (possibly Unset). Memory cost is proportional to the tag
/// population, not to the number of written tags; this is the variant
/// used by per-frame result buffers where most tags get written anyway.
pub struct DenseContentMap {
    registry: Arc<dyn TagRegistry>,
    slots: Vec<ContentEntry>,
}

impl DenseContentMap {
    /// Create a map pre-sized to the registry's total tag count.
    pub fn new(registry: Arc<dyn TagRegistry>) -> Self {
        let total = registry.total_known_tag_count() as usize;
        let slots = (0..total)
            .map(|index| ContentEntry::unset(0, index as u32, 0))
            .collect();
        Self { registry, slots }
    }

    fn index_of(&self, tag: u32) -> Option<usize> {
        let index = self.registry.dense_index(tag).ok()? as usize;
        (index < self.slots.len()).then_some(index)
    }
}

impl ContentMap for DenseContentMap {
    fn find(&self, tag: u32) -> Option<&ContentEntry> {
        self.index_of(tag).map(|index| &self.slots[index])
    }

    fn find_mut(&mut self, tag: u32) -> Option<&mut ContentEntry> {
        self.index_of(tag).map(|index| &mut self.slots[index])
    }

    fn ensure_slot(
        &mut self,
        tag: u32,
        tag_index: u32,
        max_size: u32,
    ) -> Result<&mut ContentEntry> {
        let index = tag_index as usize;
        if index >= self.slots.len() {
            return Err(Error::OutOfBounds(tag));
        }
        let slot = &mut self.slots[index];
        slot.tag = tag;
        slot.tag_index = tag_index;
        slot.max_size = max_size;
        Ok(slot)
    }

    fn reset(&mut self) {
        for slot in &mut self.slots {
            slot.reset();
        }
    }

    fn count(&self) -> usize {
        self.slots.iter().filter(|e| e.is_valid()).count()
    }

    fn valid_entries(&self) -> Box<dyn Iterator<Item = &ContentEntry> + '_> {
        // Slot order is dense-index order, so this is ascending tag index.
        Box::new(self.slots.iter().filter(|e| e.is_valid()))
    }

    fn for_each_valid_mut(&mut self, f: &mut dyn FnMut(&mut ContentEntry)) {
        for slot in self.slots.iter_mut().filter(|e| e.is_valid()) {
            f(slot);
        }
    }
}
