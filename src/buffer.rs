//! Reference-counted, mergeable per-frame metadata buffers.
//!
//! A [`MetaBuffer`] carries one pipeline stage's computed results
//! (exposure, white balance, lens state, …) to downstream stages and
//! framework consumers. Small values live inline in their entries; large
//! values are packed into out-of-line [`MemoryRegion`] arenas, one
//! batched allocation per `allocate_tags` call rather than one per tag.
//!
//! # Ownership
//!
//! - A buffer that **copies** from a source owns all resulting bytes
//!   outright; no back-reference is created.
//! - A buffer that **merges** from a source borrows the bytes: each
//!   entry records a weak `parent` handle and the buffer records an
//!   owning link plus one merge-reference on the source, so the source
//!   cannot be reclaimed while still observed.
//! - Total references = external + internal + merge. An invalidate
//!   requested while references are outstanding is deferred until the
//!   release that drives the total to zero.
//!
//! # Locking
//!
//! Three independent locks per buffer, each held briefly:
//! region-list mutex (slot bookkeeping only; the byte allocation itself
//! runs unlocked), map rwlock (reads: get/iterate/export, writes:
//! set/merge/copy/reset), and the bookkeeping mutex (refcounts, clients,
//! links). When two buffers' map locks are needed at once they are
//! acquired in buffer-id order.

use crate::entry::{align_up, ContentEntry, EntryLocation, INLINE_CAPACITY};
use crate::error::{Error, Result};
use crate::map::{ContentStore, DenseContentMap, HashedContentMap, MapKind, SourceBytes};
use crate::region::MemoryRegion;
use crate::registry::TagRegistry;
use smallvec::SmallVec;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

/// Upper bound on the number of regions one buffer may own.
pub const MAX_REGIONS: usize = 16;

/// Depth bound for the combination-subtree search over the link graph.
/// Also the safety valve against accidental link cycles.
pub const MAX_SEARCH_DEPTH: usize = 10;

/// Global counter for generating unique buffer ids.
static BUFFER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

fn next_buffer_id() -> u64 {
    BUFFER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// An owned snapshot of one tag's value, as returned by
/// [`MetaBuffer::get_tag`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagValue {
    /// The payload bytes at the time of the read.
    pub bytes: Vec<u8>,
    /// Element count of the value.
    pub count: u32,
    /// Camera that produced the value, if camera-scoped.
    pub camera_id: Option<u32>,
}

/// Per-client reference counters.
#[derive(Debug)]
struct ClientRef {
    id: u64,
    external: u32,
    internal: u32,
}

/// Reference counts, client list and dependency links. Guarded by its
/// own mutex so reference changes stay observable independent of any
/// in-flight data read.
struct BookKeeping {
    external: u32,
    internal: u32,
    merge_refs: u32,
    clients: Vec<ClientRef>,
    /// "This buffer merged data from target and therefore holds one
    /// merge-reference on it." A `None` slot is free and reusable.
    links: SmallVec<[Option<Arc<MetaBuffer>>; 4]>,
    invalidate_pending: bool,
    destroyed: bool,
}

impl BookKeeping {
    fn new() -> Self {
        Self {
            external: 0,
            internal: 0,
            merge_refs: 0,
            clients: Vec::new(),
            links: SmallVec::new(),
            invalidate_pending: false,
            destroyed: false,
        }
    }

    fn total(&self) -> u32 {
        self.external + self.internal + self.merge_refs
    }
}

/// Multi-camera combination state.
#[derive(Default)]
struct CameraState {
    /// Camera this buffer's values belong to, stamped into entries on
    /// every write.
    camera_id: Option<u32>,
    /// Set when this buffer is the root of a combination subtree.
    combined: bool,
    /// Root of the combination subtree this buffer belongs to.
    subtree_root: Option<Weak<MetaBuffer>>,
    /// Camera id → per-camera source buffer, held weakly; the owning
    /// links keep the buffers alive.
    camera_map: Vec<(u32, Weak<MetaBuffer>)>,
}

/// A reference-counted, mergeable key/value property container for one
/// frame's metadata.
///
/// Buffers are created through a [`BufferFactory`](crate::factory::BufferFactory)
/// and shared as `Arc<MetaBuffer>`. All operations are synchronous and
/// internally synchronized; `&self` methods are safe to call from any
/// thread.
pub struct MetaBuffer {
    id: u64,
    registry: Arc<dyn TagRegistry>,
    special_tag: u32,
    self_weak: Weak<MetaBuffer>,
    regions: Mutex<SmallVec<[Arc<MemoryRegion>; 4]>>,
    map: RwLock<ContentStore>,
    book: Mutex<BookKeeping>,
    camera: Mutex<CameraState>,
}

impl MetaBuffer {
    pub(crate) fn new(
        registry: Arc<dyn TagRegistry>,
        special_tag: u32,
        kind: MapKind,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| {
            let store = match kind {
                MapKind::Dense => {
                    ContentStore::Dense(DenseContentMap::new(registry.clone()))
                }
                MapKind::Hashed => ContentStore::Hashed(HashedContentMap::new()),
            };
            Self {
                id: next_buffer_id(),
                registry,
                special_tag,
                self_weak: weak.clone(),
                regions: Mutex::new(SmallVec::new()),
                map: RwLock::new(store),
                book: Mutex::new(BookKeeping::new()),
                camera: Mutex::new(CameraState::default()),
            }
        })
    }

    /// Unique id of this buffer.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Which map implementation this buffer uses.
    pub fn map_kind(&self) -> MapKind {
        self.map.read().unwrap().kind()
    }

    /// The tag registry this buffer consults.
    pub(crate) fn registry(&self) -> &Arc<dyn TagRegistry> {
        &self.registry
    }

    /// The externally assigned special-properties tag id.
    pub fn special_tag(&self) -> u32 {
        self.special_tag
    }

    /// Camera this buffer currently writes on behalf of.
    pub fn camera_id(&self) -> Option<u32> {
        self.camera.lock().unwrap().camera_id
    }

    /// Number of currently valid entries.
    pub fn entry_count(&self) -> usize {
        self.map.read().unwrap().count()
    }

    /// Number of region slots this buffer currently owns.
    pub fn region_count(&self) -> usize {
        self.regions.lock().unwrap().len()
    }

    /// `(external, internal, merge)` reference counts.
    pub fn references(&self) -> (u32, u32, u32) {
        let book = self.book.lock().unwrap();
        (book.external, book.internal, book.merge_refs)
    }

    /// Sum of all reference counts.
    pub fn total_references(&self) -> u32 {
        self.book.lock().unwrap().total()
    }

    /// Read guard over the content store, for sibling modules that walk
    /// entries (iteration, export).
    pub(crate) fn map_read(&self) -> std::sync::RwLockReadGuard<'_, ContentStore> {
        self.map.read().unwrap()
    }

    /// Clone of the region list, for sibling modules resolving local
    /// entry bytes under the map read lock.
    pub(crate) fn regions_snapshot(&self) -> SmallVec<[Arc<MemoryRegion>; 4]> {
        self.regions.lock().unwrap().clone()
    }

    /// Number of live dependency links.
    pub fn link_count(&self) -> usize {
        self.book
            .lock()
            .unwrap()
            .links
            .iter()
            .filter(|l| l.is_some())
            .count()
    }

    // ------------------------------------------------------------------
    // Allocation protocol
    // ------------------------------------------------------------------

    /// Register storage for `tags` ahead of writing them.
    ///
    /// Tags already present keep their storage. Inline-sized tags get an
    /// inline slot; everything else is packed, at aligned offsets, into
    /// exactly one new region regardless of how many tags need it.
    /// Failure leaves previously committed entries untouched.
    pub fn allocate_tags(&self, tags: &[u32]) -> Result<()> {
        if tags.is_empty() {
            return Err(Error::InvalidArgument("tag list is empty".into()));
        }

        // Resolve static metadata up front so registry failures cannot
        // interleave with map mutation.
        let mut planned = Vec::with_capacity(tags.len());
        let mut seen = HashSet::new();
        for &tag in tags {
            if seen.insert(tag) {
                let tag_index = self.registry.dense_index(tag)?;
                let max_size = self.registry.max_size(tag)?;
                planned.push((tag, tag_index, max_size));
            }
        }

        let mut map = self.map.write().unwrap();

        let mut inline = Vec::new();
        let mut unresolved = Vec::new();
        for &(tag, tag_index, max_size) in &planned {
            if map.find(tag).is_some_and(|e| e.has_storage() && !e.is_borrowed()) {
                continue;
            }
            if max_size as usize <= INLINE_CAPACITY {
                inline.push((tag, tag_index, max_size));
            } else {
                unresolved.push((tag, tag_index, max_size));
            }
        }

        let batch = if unresolved.is_empty() {
            None
        } else {
            let total: u32 = unresolved.iter().map(|&(_, _, max)| align_up(max)).sum();
            Some(self.reserve_region_and_allocate(total)?)
        };

        for (tag, tag_index, max_size) in inline {
            let slot = map.ensure_slot(tag, tag_index, max_size)?;
            slot.location = EntryLocation::Inline([0; INLINE_CAPACITY]);
            slot.size = 0;
            slot.count = 0;
            slot.camera_id = None;
            slot.parent = None;
        }
        if let Some((_, region_index)) = batch {
            let mut offset = 0u32;
            for (tag, tag_index, max_size) in unresolved {
                let slot = map.ensure_slot(tag, tag_index, max_size)?;
                slot.location = EntryLocation::Region {
                    region: region_index,
                    offset,
                };
                slot.size = 0;
                slot.count = 0;
                slot.camera_id = None;
                slot.parent = None;
                offset += align_up(max_size);
            }
        }
        Ok(())
    }

    /// Reserve a region slot and allocate its storage.
    ///
    /// The region-list lock covers only the free-slot scan (or append)
    /// and the claim; the byte allocation runs after the lock is
    /// released, so concurrent producers can allocate different slots in
    /// parallel.
    fn reserve_region_and_allocate(&self, size: u32) -> Result<(Arc<MemoryRegion>, u32)> {
        let (region, index) = {
            let mut regions = self.regions.lock().unwrap();
            let recycled = regions
                .iter()
                .enumerate()
                .find(|(_, r)| r.claim())
                .map(|(i, r)| (r.clone(), i as u32));
            match recycled {
                Some(found) => found,
                None => {
                    if regions.len() >= MAX_REGIONS {
                        return Err(Error::OutOfMemory(format!(
                            "buffer {} exceeded {MAX_REGIONS} region slots",
                            self.id
                        )));
                    }
                    let region = Arc::new(MemoryRegion::new());
                    region.claim();
                    regions.push(region.clone());
                    (region, (regions.len() - 1) as u32)
                }
            }
        };

        if let Err(err) = region.allocate(size) {
            region.release_claim();
            return Err(err);
        }
        Ok((region, index))
    }

    // ------------------------------------------------------------------
    // Tag access
    // ------------------------------------------------------------------

    /// Write a tag value, allocating storage on first use.
    ///
    /// Overwrites prior content for the tag and stamps the buffer's
    /// current camera id into the entry.
    pub fn set_tag(&self, tag: u32, payload: &[u8], count: u32) -> Result<()> {
        if payload.is_empty() {
            return Err(Error::InvalidArgument("payload is empty".into()));
        }
        if count == 0 {
            return Err(Error::InvalidArgument("count must be > 0".into()));
        }
        let max_size = self.registry.max_size(tag)?;
        if payload.len() > max_size as usize {
            return Err(Error::InvalidArgument(format!(
                "payload of {} bytes exceeds max size {} for tag {:#x}",
                payload.len(),
                max_size,
                tag
            )));
        }
        let tag_index = self.registry.dense_index(tag)?;
        let camera_id = self.camera.lock().unwrap().camera_id;

        let mut map = self.map.write().unwrap();

        let needs_storage = !map
            .find(tag)
            .is_some_and(|e| e.has_storage() && !e.is_borrowed());
        if needs_storage {
            if max_size as usize <= INLINE_CAPACITY {
                let slot = map.ensure_slot(tag, tag_index, max_size)?;
                slot.location = EntryLocation::Inline([0; INLINE_CAPACITY]);
                slot.parent = None;
            } else {
                let (_, region_index) =
                    self.reserve_region_and_allocate(align_up(max_size))?;
                let slot = map.ensure_slot(tag, tag_index, max_size)?;
                slot.location = EntryLocation::Region {
                    region: region_index,
                    offset: 0,
                };
                slot.parent = None;
            }
        }

        let regions = self.regions.lock().unwrap().clone();
        let slot = map.find_mut(tag).ok_or(Error::NoSuchTag(tag))?;
        match &mut slot.location {
            EntryLocation::Inline(bytes) => {
                bytes[..payload.len()].copy_from_slice(payload);
            }
            EntryLocation::Region { region, offset } => {
                let region = regions
                    .get(*region as usize)
                    .ok_or_else(|| Error::InvalidState("entry points past region list".into()))?;
                // SAFETY: the map write lock is held.
                let storage = unsafe { region.as_mut_slice() }
                    .ok_or_else(|| Error::InvalidState("entry region is unallocated".into()))?;
                let start = *offset as usize;
                storage[start..start + payload.len()].copy_from_slice(payload);
            }
            _ => {
                return Err(Error::InvalidState(format!(
                    "tag {tag:#x} has no resolved storage"
                )))
            }
        }
        slot.size = payload.len() as u32;
        slot.count = count;
        slot.camera_id = camera_id;
        slot.parent = None;
        Ok(())
    }

    /// Read a tag's current value.
    ///
    /// Entries acquired via merge resolve through the buffer that owns
    /// the bytes, so the returned value tracks the source's current
    /// content until the source is released.
    pub fn get_tag(&self, tag: u32) -> Result<TagValue> {
        let parent = {
            let map = self.map.read().unwrap();
            let entry = map
                .find(tag)
                .filter(|e| e.is_valid())
                .ok_or(Error::NoSuchTag(tag))?;
            match &entry.parent {
                Some(weak) => weak.upgrade().ok_or(Error::NoSuchTag(tag))?,
                None => {
                    let regions = self.regions.lock().unwrap();
                    return Ok(TagValue {
                        bytes: read_local_bytes(entry, &regions)?,
                        count: entry.count,
                        camera_id: entry.camera_id,
                    });
                }
            }
        };
        // Borrowed entry: resolve through the owner with no lock held
        // here, so owner lookups never nest map locks.
        parent.get_tag(tag)
    }

    /// Run `f` over a tag's payload without copying it out.
    ///
    /// The closure runs under the owning buffer's map read lock; keep it
    /// short and do not call back into the buffer from inside it.
    pub fn with_tag<R>(&self, tag: u32, f: impl FnOnce(&[u8], u32) -> R) -> Result<R> {
        let parent = {
            let map = self.map.read().unwrap();
            let entry = map
                .find(tag)
                .filter(|e| e.is_valid())
                .ok_or(Error::NoSuchTag(tag))?;
            match &entry.parent {
                Some(weak) => weak.upgrade().ok_or(Error::NoSuchTag(tag))?,
                None => {
                    let regions = self.regions.lock().unwrap();
                    let bytes = local_byte_view(entry, &regions)?;
                    return Ok(f(bytes, entry.count));
                }
            }
        };
        parent.with_tag(tag, f)
    }

    /// Logically unset a tag. Storage is retained and reclaimed only on
    /// buffer reset or destruction.
    pub fn remove_tag(&self, tag: u32) -> Result<()> {
        let mut map = self.map.write().unwrap();
        let entry = map
            .find_mut(tag)
            .filter(|e| e.is_valid())
            .ok_or(Error::NoSuchTag(tag))?;
        entry.reset();
        Ok(())
    }

    /// Read a tag scoped to a specific camera.
    ///
    /// Camera-agnostic entries are returned directly. Camera-scoped ones
    /// are resolved through the combination subtree: a breadth-first
    /// search over the link graph, bounded to [`MAX_SEARCH_DEPTH`],
    /// locates the combination root, and the lookup is delegated to that
    /// camera's own buffer. No root within the bound is reported as
    /// [`Error::NoSuchTag`], not retried.
    pub fn get_tag_for_camera(&self, tag: u32, camera_id: u32) -> Result<TagValue> {
        let scope = {
            let map = self.map.read().unwrap();
            map.find(tag).filter(|e| e.is_valid()).map(|e| e.camera_id)
        };
        match scope {
            Some(None) => return self.get_tag(tag),
            Some(Some(id)) if id == camera_id => return self.get_tag(tag),
            _ => {}
        }

        let root = self
            .find_combination_root()
            .ok_or(Error::NoSuchTag(tag))?;
        let per_camera = root
            .camera_buffer(camera_id)
            .ok_or(Error::NoSuchTag(tag))?;
        per_camera.get_tag(tag)
    }

    // ------------------------------------------------------------------
    // Merge & copy
    // ------------------------------------------------------------------

    /// Zero-copy union of `source` into this buffer.
    ///
    /// Entry metadata is copied, the bytes stay where they are, and this
    /// buffer records a link plus one merge-reference on `source`.
    /// Re-merging the same source is idempotent at the entry level but
    /// adds another link and merge-reference each time.
    pub fn merge(&self, source: &Arc<MetaBuffer>, disjoint: bool) -> Result<()> {
        if source.id == self.id {
            return Err(Error::InvalidArgument(
                "cannot merge a buffer into itself".into(),
            ));
        }
        {
            let (mut dst, src) = self.lock_pair(source);
            if dst.kind() != src.kind() {
                return Err(Error::NotImplemented(
                    "cannot merge across map implementations".into(),
                ));
            }
            dst.merge(&src, &source.self_weak, disjoint)?;
        }
        self.link_to(source);
        source.add_merge_reference();
        Ok(())
    }

    /// As [`merge`](MetaBuffer::merge), but entries recorded against the
    /// old master camera are substituted with the new master camera's
    /// values, found via the source's combination subtree. Used when the
    /// designated primary camera of a rig changes between requests.
    pub fn merge_with_camera_switch(
        &self,
        source: &Arc<MetaBuffer>,
        old_master: u32,
        new_master: u32,
    ) -> Result<()> {
        if source.id == self.id {
            return Err(Error::InvalidArgument(
                "cannot merge a buffer into itself".into(),
            ));
        }

        let new_master_buffer = source
            .find_combination_root()
            .and_then(|root| root.camera_buffer(new_master))
            .filter(|nm| nm.id != self.id);
        // Snapshot the replacement entries before touching our own
        // locks; the weak parent handles keep reads current afterwards.
        let substitutes: HashMap<u32, ContentEntry> = match &new_master_buffer {
            Some(nm) => nm
                .map
                .read()
                .unwrap()
                .valid_entries()
                .map(|e| (e.tag, e.clone()))
                .collect(),
            None => HashMap::new(),
        };
        let nm_weak = new_master_buffer
            .as_ref()
            .map(|b| b.self_weak.clone())
            .unwrap_or_default();

        let substituted = std::cell::Cell::new(false);
        {
            let (mut dst, src) = self.lock_pair(source);
            if dst.kind() != src.kind() {
                return Err(Error::NotImplemented(
                    "cannot merge across map implementations".into(),
                ));
            }
            dst.merge_with_substitution(&src, &source.self_weak, &|entry| {
                if entry.camera_id == Some(old_master) {
                    if let Some(replacement) = substitutes.get(&entry.tag) {
                        substituted.set(true);
                        return Some((replacement.clone(), nm_weak.clone()));
                    }
                }
                None
            })?;
        }

        self.link_to(source);
        source.add_merge_reference();
        if substituted.get() {
            if let Some(nm) = &new_master_buffer {
                self.link_to(nm);
                nm.add_merge_reference();
            }
        }
        Ok(())
    }

    /// Physically duplicate `source`'s valid entries into this buffer.
    ///
    /// Uses the two-phase protocol: inline-sized payloads are copied
    /// immediately, everything else is sized first and serviced by a
    /// single batched region allocation. The result owns all its bytes;
    /// no link to `source` is created and this buffer can outlive it
    /// unconditionally.
    pub fn copy_from(&self, source: &Arc<MetaBuffer>, disjoint: bool) -> Result<()> {
        if source.id == self.id {
            return Err(Error::InvalidArgument(
                "cannot copy a buffer into itself".into(),
            ));
        }

        let (mut dst, src) = self.lock_pair(source);
        if dst.kind() != src.kind() {
            return Err(Error::NotImplemented(
                "cannot copy across map implementations".into(),
            ));
        }

        let src_regions: Vec<Arc<MemoryRegion>> =
            source.regions.lock().unwrap().iter().cloned().collect();
        let own_regions: Vec<Arc<MemoryRegion>> =
            self.regions.lock().unwrap().iter().cloned().collect();

        // Resolve borrowed source entries up front: their bytes live in
        // third buffers whose locks must not be taken while we hold two
        // map locks, except when the owner is this destination itself.
        let mut borrowed = HashMap::new();
        for entry in src.valid_entries() {
            let Some(weak) = &entry.parent else { continue };
            let Some(owner) = weak.upgrade() else { continue };
            let value = if owner.id == self.id {
                dst.find(entry.tag)
                    .filter(|e| e.is_valid())
                    .and_then(|e| read_local_bytes(e, &own_regions).ok())
            } else {
                owner.get_tag(entry.tag).ok().map(|v| v.bytes)
            };
            if let Some(bytes) = value {
                borrowed.insert(entry.tag, bytes);
            }
        }

        let resolve = |entry: &ContentEntry| -> Option<SourceBytes> {
            if entry.parent.is_some() {
                return borrowed.get(&entry.tag).map(|b| SourceBytes::Owned(b.clone()));
            }
            match &entry.location {
                EntryLocation::Inline(bytes) => Some(SourceBytes::Raw {
                    ptr: bytes.as_ptr(),
                    len: entry.size as usize,
                }),
                EntryLocation::Region { region, offset } => {
                    let region = src_regions.get(*region as usize)?;
                    // SAFETY: the source map read lock is held for the
                    // whole copy, so the pointer stays valid across both
                    // phases.
                    let slice = unsafe { region.as_slice() }?;
                    let start = *offset as usize;
                    let end = start + entry.size as usize;
                    (end <= slice.len()).then(|| SourceBytes::Raw {
                        ptr: slice[start..end].as_ptr(),
                        len: entry.size as usize,
                    })
                }
                _ => None,
            }
        };

        let (total, pending) =
            dst.copy_valid_and_reserve_unfilled(&src, &resolve, &own_regions, disjoint)?;
        if total > 0 {
            let (region, region_index) = self.reserve_region_and_allocate(total)?;
            dst.set_unfilled_tag_region(&pending, &region, region_index)?;
        }
        Ok(())
    }

    /// Combine per-camera source buffers into this aggregate.
    ///
    /// Each `(camera_id, buffer)` pair is linked with one
    /// merge-reference, its entries are stamped with the camera id, and
    /// it is registered in the camera map. The primary camera's map is
    /// then merged disjointly into this buffer, and this buffer becomes
    /// the root of the combination subtree.
    pub fn combine_multi_camera(
        &self,
        cameras: &[(u32, Arc<MetaBuffer>)],
        primary: u32,
    ) -> Result<()> {
        if self.camera.lock().unwrap().combined {
            return Err(Error::InvalidState(
                "buffer is already a multi-camera combination".into(),
            ));
        }
        if cameras.is_empty() {
            return Err(Error::InvalidArgument("no camera buffers supplied".into()));
        }
        let primary_buffer = cameras
            .iter()
            .find(|(id, _)| *id == primary)
            .map(|(_, b)| b.clone())
            .ok_or_else(|| {
                Error::InvalidArgument(format!(
                    "primary camera {primary} is not among the supplied buffers"
                ))
            })?;
        if cameras.iter().any(|(_, b)| b.id == self.id) {
            return Err(Error::InvalidArgument(
                "aggregate cannot be one of its own camera sources".into(),
            ));
        }
        if self.map_kind() != primary_buffer.map_kind() {
            return Err(Error::NotImplemented(
                "cannot merge across map implementations".into(),
            ));
        }

        for (camera_id, buffer) in cameras {
            buffer.camera.lock().unwrap().camera_id = Some(*camera_id);
            buffer
                .map
                .write()
                .unwrap()
                .for_each_valid_mut(&mut |entry| entry.camera_id = Some(*camera_id));
            self.link_to(buffer);
            buffer.add_merge_reference();
        }

        {
            let mut camera = self.camera.lock().unwrap();
            camera.combined = true;
            camera.subtree_root = Some(self.self_weak.clone());
            camera.camera_map = cameras
                .iter()
                .map(|(id, b)| (*id, b.self_weak.clone()))
                .collect();
        }

        {
            let (mut dst, src) = self.lock_pair(&primary_buffer);
            dst.merge(&src, &primary_buffer.self_weak, true)?;
        }
        Ok(())
    }

    /// Whether this buffer is the root of a combination subtree.
    pub fn is_combination_root(&self) -> bool {
        self.camera.lock().unwrap().combined
    }

    /// Per-camera source buffer of a combination root.
    pub fn camera_buffer(&self, camera_id: u32) -> Option<Arc<MetaBuffer>> {
        let camera = self.camera.lock().unwrap();
        camera
            .camera_map
            .iter()
            .find(|(id, _)| *id == camera_id)
            .and_then(|(_, weak)| weak.upgrade())
    }

    /// Locate the combination root reachable from this buffer.
    ///
    /// Breadth-first search over the link graph, bounded to
    /// [`MAX_SEARCH_DEPTH`] hops.
    pub fn find_combination_root(&self) -> Option<Arc<MetaBuffer>> {
        // Fast path: combination members know their root directly.
        let known = self
            .camera
            .lock()
            .unwrap()
            .subtree_root
            .as_ref()
            .and_then(Weak::upgrade);
        if let Some(root) = known {
            return Some(root);
        }

        let start = self.self_weak.upgrade()?;
        let mut visited = HashSet::from([start.id]);
        let mut queue = VecDeque::from([(start, 0usize)]);
        while let Some((node, depth)) = queue.pop_front() {
            if node.is_combination_root() {
                return Some(node);
            }
            if depth >= MAX_SEARCH_DEPTH {
                continue;
            }
            for target in node.linked_buffers() {
                if visited.insert(target.id) {
                    queue.push_back((target, depth + 1));
                }
            }
        }
        None
    }

    /// Record an owning dependency link on `target`, reusing a freed
    /// (`None`) slot before growing the link list.
    fn link_to(&self, target: &Arc<MetaBuffer>) {
        let mut book = self.book.lock().unwrap();
        let slot = target.clone();
        match book.links.iter_mut().find(|l| l.is_none()) {
            Some(free) => *free = Some(slot),
            None => book.links.push(Some(slot)),
        }
    }

    fn linked_buffers(&self) -> Vec<Arc<MetaBuffer>> {
        self.book
            .lock()
            .unwrap()
            .links
            .iter()
            .filter_map(|l| l.clone())
            .collect()
    }

    /// Acquire this buffer's map for writing and `other`'s for reading,
    /// in buffer-id order so concurrent cross-merges cannot deadlock.
    fn lock_pair<'a>(
        &'a self,
        other: &'a MetaBuffer,
    ) -> (
        std::sync::RwLockWriteGuard<'a, ContentStore>,
        std::sync::RwLockReadGuard<'a, ContentStore>,
    ) {
        if self.id < other.id {
            let dst = self.map.write().unwrap();
            let src = other.map.read().unwrap();
            (dst, src)
        } else {
            let src = other.map.read().unwrap();
            let dst = self.map.write().unwrap();
            (dst, src)
        }
    }

    // ------------------------------------------------------------------
    // Reference counting & lifecycle
    // ------------------------------------------------------------------

    /// Add one reference for `client_id`. External references come from
    /// framework consumers, internal ones from pipeline stages.
    pub fn add_reference(&self, client_id: u64, external: bool) {
        let mut guard = self.book.lock().unwrap();
        let book = &mut *guard;
        let pos = match book.clients.iter().position(|c| c.id == client_id) {
            Some(pos) => pos,
            None => {
                book.clients.push(ClientRef {
                    id: client_id,
                    external: 0,
                    internal: 0,
                });
                book.clients.len() - 1
            }
        };
        if external {
            book.clients[pos].external += 1;
            book.external += 1;
        } else {
            book.clients[pos].internal += 1;
            book.internal += 1;
        }
    }

    /// Release one reference for `client_id`.
    ///
    /// The release that drives the total to zero with an invalidate
    /// pending performs the deferred reset. Releasing without a matching
    /// reference is a caller bug: it is logged and reported, never a
    /// panic.
    pub fn release(&self, client_id: u64, external: bool) -> Result<()> {
        let need_reset = {
            let mut guard = self.book.lock().unwrap();
            let book = &mut *guard;
            let Some(pos) = book.clients.iter().position(|c| c.id == client_id) else {
                tracing::warn!(
                    buffer = self.id,
                    client = client_id,
                    "release without a matching reference"
                );
                return Err(Error::InvalidState(format!(
                    "client {client_id} holds no reference on buffer {}",
                    self.id
                )));
            };
            let client = &mut book.clients[pos];
            let counter = if external {
                &mut client.external
            } else {
                &mut client.internal
            };
            if *counter == 0 {
                tracing::warn!(
                    buffer = self.id,
                    client = client_id,
                    external,
                    "reference count underflow"
                );
                return Err(Error::InvalidState(format!(
                    "client {client_id} underflowed its reference count"
                )));
            }
            *counter -= 1;
            if client.external == 0 && client.internal == 0 {
                book.clients.swap_remove(pos);
            }
            if external {
                book.external -= 1;
            } else {
                book.internal -= 1;
            }
            book.total() == 0 && std::mem::take(&mut book.invalidate_pending)
        };
        if need_reset {
            self.reset();
        }
        Ok(())
    }

    /// One more dependent buffer borrows data from this one.
    pub(crate) fn add_merge_reference(&self) {
        self.book.lock().unwrap().merge_refs += 1;
    }

    /// A dependent buffer dropped its borrow of this one.
    pub fn release_merge_reference(&self) -> Result<()> {
        let need_reset = {
            let mut book = self.book.lock().unwrap();
            if book.merge_refs == 0 {
                tracing::warn!(buffer = self.id, "merge reference underflow");
                return Err(Error::InvalidState(format!(
                    "buffer {} has no merge references to release",
                    self.id
                )));
            }
            book.merge_refs -= 1;
            book.total() == 0 && std::mem::take(&mut book.invalidate_pending)
        };
        if need_reset {
            self.reset();
        }
        Ok(())
    }

    /// Request reclamation of this buffer's own storage.
    ///
    /// With `force`, or with zero total references, the reset happens
    /// immediately; otherwise it is deferred to the release that reaches
    /// zero.
    pub fn invalidate(&self, force: bool) {
        let need_reset = if force {
            true
        } else {
            let mut book = self.book.lock().unwrap();
            if book.total() == 0 {
                true
            } else {
                book.invalidate_pending = true;
                false
            }
        };
        if need_reset {
            self.reset();
        }
    }

    /// Whether an invalidate is waiting on outstanding references.
    pub fn invalidate_pending(&self) -> bool {
        self.book.lock().unwrap().invalidate_pending
    }

    /// Clear the map, drop all links (releasing their merge-references,
    /// which may cascade into dependency resets), release owned regions
    /// and forget the camera combination state. Starts a new generation;
    /// no history is kept. Idempotent.
    pub fn reset(&self) {
        let links: Vec<Arc<MetaBuffer>> = {
            let mut book = self.book.lock().unwrap();
            book.invalidate_pending = false;
            book.links.drain(..).flatten().collect()
        };
        self.map.write().unwrap().reset();
        self.regions.lock().unwrap().clear();
        *self.camera.lock().unwrap() = CameraState::default();
        for target in links {
            // Underflow here means bookkeeping is already corrupt; the
            // warning has been logged by the callee.
            let _ = target.release_merge_reference();
        }
        tracing::debug!(buffer = self.id, "buffer reset");
    }

    /// Tear the buffer down.
    ///
    /// Refused with [`Error::Busy`] while references are outstanding,
    /// unless forced. A destroyed buffer keeps rejecting nothing; it is
    /// the caller's contract not to reuse it.
    pub fn destroy(&self, force: bool) -> Result<()> {
        {
            let mut book = self.book.lock().unwrap();
            if book.total() > 0 && !force {
                return Err(Error::Busy(format!(
                    "buffer {} has {} outstanding references",
                    self.id,
                    book.total()
                )));
            }
            book.destroyed = true;
        }
        self.reset();
        Ok(())
    }

    /// Whether the buffer has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.book.lock().unwrap().destroyed
    }
}

impl std::fmt::Debug for MetaBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (external, internal, merge) = self.references();
        f.debug_struct("MetaBuffer")
            .field("id", &self.id)
            .field("kind", &self.map_kind())
            .field("entries", &self.entry_count())
            .field("refs", &(external, internal, merge))
            .finish()
    }
}

/// Copy a locally stored entry's payload out. The caller must hold the
/// owning buffer's map lock.
pub(crate) fn read_local_bytes(
    entry: &ContentEntry,
    regions: &[Arc<MemoryRegion>],
) -> Result<Vec<u8>> {
    local_byte_view(entry, regions).map(|bytes| bytes.to_vec())
}

/// Borrowed view of a locally stored entry's payload. The caller must
/// hold the owning buffer's map lock for the lifetime of the view.
fn local_byte_view<'a>(
    entry: &'a ContentEntry,
    regions: &'a [Arc<MemoryRegion>],
) -> Result<&'a [u8]> {
    match &entry.location {
        EntryLocation::Inline(bytes) => Ok(&bytes[..entry.size as usize]),
        EntryLocation::Region { region, offset } => {
            let region = regions
                .get(*region as usize)
                .ok_or_else(|| Error::InvalidState("entry points past region list".into()))?;
            // SAFETY: caller holds the owning buffer's map lock.
            let slice = unsafe { region.as_slice() }
                .ok_or_else(|| Error::InvalidState("entry region is unallocated".into()))?;
            let start = *offset as usize;
            let end = start + entry.size as usize;
            if end > slice.len() {
                return Err(Error::InvalidState(
                    "entry extends past its region".into(),
                ));
            }
            Ok(&slice[start..end])
        }
        _ => Err(Error::NoSuchTag(entry.tag)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{StaticTagRegistry, TagDescriptor, Visibility};

    fn registry_with_region_tags(count: u32) -> Arc<dyn TagRegistry> {
        let descriptors = (0..count)
            .map(|i| TagDescriptor {
                tag: 0x1000 + i,
                max_size: 512,
                visibility: Visibility::ALL,
                internal: false,
                name: "stats.block",
            })
            .collect();
        Arc::new(StaticTagRegistry::new(descriptors).unwrap())
    }

    fn buffer_with(registry: Arc<dyn TagRegistry>) -> Arc<MetaBuffer> {
        MetaBuffer::new(registry, 0xffff_0000, MapKind::Dense)
    }

    #[test]
    fn test_region_slot_capacity_is_enforced() {
        let buffer = buffer_with(registry_with_region_tags(MAX_REGIONS as u32 + 1));

        // Each region-sized tag written on its own claims one slot.
        for i in 0..MAX_REGIONS as u32 {
            buffer.set_tag(0x1000 + i, &[1; 512], 1).unwrap();
        }
        assert_eq!(buffer.region_count(), MAX_REGIONS);

        let result = buffer.set_tag(0x1000 + MAX_REGIONS as u32, &[1; 512], 1);
        assert!(matches!(result, Err(Error::OutOfMemory(_))));

        // Committed entries survive the failure.
        assert!(buffer.get_tag(0x1000).is_ok());
    }

    #[test]
    fn test_batched_allocation_uses_one_slot() {
        let buffer = buffer_with(registry_with_region_tags(8));
        let tags: Vec<u32> = (0..8).map(|i| 0x1000 + i).collect();
        buffer.allocate_tags(&tags).unwrap();
        assert_eq!(buffer.region_count(), 1);
    }

    #[test]
    fn test_duplicate_tags_in_allocate_request() {
        let buffer = buffer_with(registry_with_region_tags(2));
        buffer.allocate_tags(&[0x1000, 0x1000, 0x1001]).unwrap();
        assert_eq!(buffer.region_count(), 1);
        buffer.set_tag(0x1000, &[3; 512], 1).unwrap();
        assert_eq!(buffer.get_tag(0x1000).unwrap().bytes, vec![3; 512]);
    }

    #[test]
    fn test_buffer_ids_are_process_unique() {
        let registry = registry_with_region_tags(1);
        let a = buffer_with(registry.clone());
        let b = buffer_with(registry);
        assert_ne!(a.id(), b.id());
        assert!(b.id() > a.id());
    }

    #[test]
    fn test_debug_format_names_the_buffer() {
        let buffer = buffer_with(registry_with_region_tags(1));
        let rendered = format!("{buffer:?}");
        assert!(rendered.contains("MetaBuffer"));
        assert!(rendered.contains(&buffer.id().to_string()));
    }
}
