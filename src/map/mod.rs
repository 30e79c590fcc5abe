//! Tag → entry maps.
//!
//! Two interchangeable implementations sit behind the [`ContentMap`]
//! contract: [`DenseContentMap`] pre-sizes one slot per known tag and
//! indexes directly by dense index, [`HashedContentMap`] grows on demand
//! and performs keyed lookups. [`ContentStore`] wraps the two concrete
//! types and dispatches by `match`, keeping per-tag access monomorphic;
//! the merge and two-phase copy algorithms are implemented once, on the
//! store, so both variants share identical semantics.

mod dense;
mod hashed;

pub use dense::DenseContentMap;
pub use hashed::HashedContentMap;

use crate::buffer::MetaBuffer;
use crate::entry::{align_up, ContentEntry, EntryLocation, INLINE_CAPACITY};
use crate::error::{Error, Result};
use crate::region::MemoryRegion;
use std::sync::{Arc, Weak};

/// Which map implementation a buffer uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapKind {
    /// One pre-sized slot per known tag, direct dense-index access.
    Dense,
    /// Hash map keyed by tag, grows on demand.
    Hashed,
}

/// Bytes of one source entry, resolved by the owning buffer for the
/// two-phase copy protocol.
pub enum SourceBytes {
    /// Pointer into the source buffer's own storage. Valid while the
    /// source's map read lock is held across both copy phases.
    Raw {
        /// Start of the payload.
        ptr: *const u8,
        /// Payload length in bytes.
        len: usize,
    },
    /// Payload resolved through a borrow parent, copied out eagerly.
    Owned(Vec<u8>),
}

impl SourceBytes {
    fn len(&self) -> usize {
        match self {
            SourceBytes::Raw { len, .. } => *len,
            SourceBytes::Owned(bytes) => bytes.len(),
        }
    }

    /// View the payload.
    ///
    /// # Safety
    ///
    /// For the `Raw` variant the caller must still hold the source map
    /// read lock that made the pointer valid.
    unsafe fn as_slice(&self) -> &[u8] {
        match self {
            // SAFETY: caller upholds the lock requirement.
            SourceBytes::Raw { ptr, len } => unsafe {
                std::slice::from_raw_parts(*ptr, *len)
            },
            SourceBytes::Owned(bytes) => bytes,
        }
    }
}

/// One entry whose bytes await the single batched region allocation.
pub struct ReservedCopy {
    /// Tag whose destination entry is in the `Reserved` state.
    pub tag: u32,
    /// Offset assigned inside the future region.
    pub offset: u32,
    /// Source payload to copy in phase two.
    pub(crate) bytes: SourceBytes,
}

/// Contract shared by the dense and hashed map variants.
///
/// Only the per-slot primitives live here; the merge/copy algorithms are
/// written once on [`ContentStore`] in terms of these.
pub trait ContentMap {
    /// Look up the entry slot for `tag`.
    ///
    /// The dense variant resolves a slot for every known tag (possibly
    /// Unset); the hashed variant returns `None` for tags never inserted.
    fn find(&self, tag: u32) -> Option<&ContentEntry>;

    /// Mutable variant of [`find`](ContentMap::find).
    fn find_mut(&mut self, tag: u32) -> Option<&mut ContentEntry>;

    /// Resolve or create the slot for `tag`, filling in its static
    /// metadata on first use. Inserting an existing tag updates in
    /// place, never duplicates.
    fn ensure_slot(
        &mut self,
        tag: u32,
        tag_index: u32,
        max_size: u32,
    ) -> Result<&mut ContentEntry>;

    /// Mark every entry Unset and clear parent back-references. Regions
    /// are not released here; that is the owning buffer's job.
    fn reset(&mut self);

    /// Number of currently valid entries.
    fn count(&self) -> usize;

    /// Iterate valid entries: ascending tag-index order for the dense
    /// variant, implementation-defined for the hashed one.
    fn valid_entries(&self) -> Box<dyn Iterator<Item = &ContentEntry> + '_>;

    /// Mutable iteration over valid entries.
    fn for_each_valid_mut(&mut self, f: &mut dyn FnMut(&mut ContentEntry));
}

/// Storage selected at buffer construction time.
pub enum ContentStore {
    /// Dense-indexed variant.
    Dense(DenseContentMap),
    /// Hash-indexed variant.
    Hashed(HashedContentMap),
}

impl ContentStore {
    /// Which variant this store is.
    pub fn kind(&self) -> MapKind {
        match self {
            ContentStore::Dense(_) => MapKind::Dense,
            ContentStore::Hashed(_) => MapKind::Hashed,
        }
    }

    fn inner(&self) -> &dyn ContentMap {
        match self {
            ContentStore::Dense(map) => map,
            ContentStore::Hashed(map) => map,
        }
    }

    fn inner_mut(&mut self) -> &mut dyn ContentMap {
        match self {
            ContentStore::Dense(map) => map,
            ContentStore::Hashed(map) => map,
        }
    }

    /// See [`ContentMap::find`].
    pub fn find(&self, tag: u32) -> Option<&ContentEntry> {
        self.inner().find(tag)
    }

    /// See [`ContentMap::find_mut`].
    pub fn find_mut(&mut self, tag: u32) -> Option<&mut ContentEntry> {
        self.inner_mut().find_mut(tag)
    }

    /// See [`ContentMap::ensure_slot`].
    pub fn ensure_slot(
        &mut self,
        tag: u32,
        tag_index: u32,
        max_size: u32,
    ) -> Result<&mut ContentEntry> {
        self.inner_mut().ensure_slot(tag, tag_index, max_size)
    }

    /// See [`ContentMap::reset`].
    pub fn reset(&mut self) {
        self.inner_mut().reset();
    }

    /// See [`ContentMap::count`].
    pub fn count(&self) -> usize {
        self.inner().count()
    }

    /// See [`ContentMap::valid_entries`].
    pub fn valid_entries(&self) -> Box<dyn Iterator<Item = &ContentEntry> + '_> {
        self.inner().valid_entries()
    }

    /// See [`ContentMap::for_each_valid_mut`].
    pub fn for_each_valid_mut(&mut self, f: &mut dyn FnMut(&mut ContentEntry)) {
        self.inner_mut().for_each_valid_mut(f);
    }

    /// Whether `tag` currently holds a valid value.
    pub fn is_valid(&self, tag: u32) -> bool {
        self.find(tag).is_some_and(|e| e.is_valid())
    }

    /// Zero-copy union: copy every valid source entry's *metadata* into
    /// this map and record `source_buffer` as the byte owner. No bytes
    /// move. With `disjoint_only`, tags already valid here are left
    /// untouched.
    pub fn merge(
        &mut self,
        source: &ContentStore,
        source_buffer: &Weak<MetaBuffer>,
        disjoint_only: bool,
    ) -> Result<()> {
        for src in source.valid_entries() {
            if disjoint_only && self.is_valid(src.tag) {
                continue;
            }
            let slot = self
                .inner_mut()
                .ensure_slot(src.tag, src.tag_index, src.max_size)?;
            slot.location = src.location.clone();
            slot.size = src.size;
            slot.count = src.count;
            slot.camera_id = src.camera_id;
            slot.parent = Some(source_buffer.clone());
        }
        Ok(())
    }

    /// As [`merge`](ContentStore::merge), but entries whose substitute
    /// resolver returns a replacement are borrowed from that replacement
    /// buffer instead of `source`. Used by the camera-switch merge.
    pub(crate) fn merge_with_substitution(
        &mut self,
        source: &ContentStore,
        source_buffer: &Weak<MetaBuffer>,
        substitute: &dyn Fn(&ContentEntry) -> Option<(ContentEntry, Weak<MetaBuffer>)>,
    ) -> Result<()> {
        for src in source.valid_entries() {
            if self.is_valid(src.tag) {
                continue;
            }
            let (entry, owner) = match substitute(src) {
                Some((replacement, owner)) => (replacement, owner),
                None => (src.clone(), source_buffer.clone()),
            };
            let slot = self
                .inner_mut()
                .ensure_slot(entry.tag, entry.tag_index, entry.max_size)?;
            slot.location = entry.location;
            slot.size = entry.size;
            slot.count = entry.count;
            slot.camera_id = entry.camera_id;
            slot.parent = Some(owner);
        }
        Ok(())
    }

    /// Phase one of the physical copy protocol.
    ///
    /// For every eligible source entry: inline-sized payloads are copied
    /// immediately; payloads for which this map already owns sufficient
    /// region storage are copied in place into `own_regions`; everything
    /// else is marked `Reserved` at an aligned offset into a future
    /// single allocation. Returns the total bytes that allocation needs
    /// plus the list of pending copies for
    /// [`set_unfilled_tag_region`](ContentStore::set_unfilled_tag_region).
    ///
    /// `resolve` produces the source payload; entries whose borrow parent
    /// has died resolve to `None` and are skipped.
    pub(crate) fn copy_valid_and_reserve_unfilled(
        &mut self,
        source: &ContentStore,
        resolve: &dyn Fn(&ContentEntry) -> Option<SourceBytes>,
        own_regions: &[Arc<MemoryRegion>],
        disjoint_only: bool,
    ) -> Result<(u32, Vec<ReservedCopy>)> {
        let mut total = 0u32;
        let mut pending = Vec::new();

        for src in source.valid_entries() {
            if disjoint_only && self.is_valid(src.tag) {
                continue;
            }
            let Some(bytes) = resolve(src) else {
                tracing::warn!(tag = src.tag, "copy source vanished, skipping tag");
                continue;
            };
            let len = bytes.len();
            let slot = self
                .inner_mut()
                .ensure_slot(src.tag, src.tag_index, src.max_size)?;

            if len <= INLINE_CAPACITY {
                let mut inline = [0u8; INLINE_CAPACITY];
                // SAFETY: the caller holds the source map read lock for
                // the duration of the copy.
                inline[..len].copy_from_slice(unsafe { bytes.as_slice() });
                slot.location = EntryLocation::Inline(inline);
            } else if let EntryLocation::Region { region, offset } = &slot.location {
                let (region, offset) = (*region, *offset);
                // The destination already owns storage for this tag from
                // a previous allocation; copy in place when it fits.
                let reusable = own_regions
                    .get(region as usize)
                    .filter(|r| r.is_allocated() && slot.max_size as usize >= len)
                    .cloned();
                match reusable {
                    Some(r) => {
                        // SAFETY: the caller holds this map's write lock.
                        let storage = unsafe { r.as_mut_slice() }.ok_or_else(|| {
                            Error::InvalidState("region lost its storage".into())
                        })?;
                        let start = offset as usize;
                        storage[start..start + len]
                            // SAFETY: source lock held, see above.
                            .copy_from_slice(unsafe { bytes.as_slice() });
                    }
                    None => {
                        slot.location = EntryLocation::Reserved { offset: total };
                        pending.push(ReservedCopy {
                            tag: src.tag,
                            offset: total,
                            bytes,
                        });
                        total += align_up(len as u32);
                    }
                }
            } else {
                slot.location = EntryLocation::Reserved { offset: total };
                pending.push(ReservedCopy {
                    tag: src.tag,
                    offset: total,
                    bytes,
                });
                total += align_up(len as u32);
            }

            let slot = self
                .inner_mut()
                .find_mut(src.tag)
                .expect("slot created above");
            slot.size = len as u32;
            slot.count = src.count;
            slot.camera_id = src.camera_id;
            slot.parent = None;
        }

        Ok((total, pending))
    }

    /// Phase two: resolve every reserved entry into the freshly allocated
    /// region, copying its payload to `base + offset`.
    pub(crate) fn set_unfilled_tag_region(
        &mut self,
        pending: &[ReservedCopy],
        region: &MemoryRegion,
        region_index: u32,
    ) -> Result<()> {
        // SAFETY: the caller holds this map's write lock; the region was
        // allocated for this copy and nothing else references it yet.
        let storage = unsafe { region.as_mut_slice() }
            .ok_or_else(|| Error::InvalidState("batch region is unallocated".into()))?;

        for item in pending {
            let len = item.bytes.len();
            let start = item.offset as usize;
            // SAFETY: source lock held across both phases.
            storage[start..start + len].copy_from_slice(unsafe { item.bytes.as_slice() });

            let slot = self
                .inner_mut()
                .find_mut(item.tag)
                .ok_or(Error::NoSuchTag(item.tag))?;
            slot.location = EntryLocation::Region {
                region: region_index,
                offset: item.offset,
            };
        }
        Ok(())
    }
}

impl std::fmt::Debug for ContentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentStore")
            .field("kind", &self.kind())
            .field("count", &self.count())
            .finish()
    }
}
