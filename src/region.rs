//! Out-of-line byte arenas for large tag payloads.
//!
//! A [`MemoryRegion`] is one slot in a buffer's growable region list. It
//! owns a single heap allocation that is sized exactly once; values too
//! large for inline storage are packed into regions at aligned offsets.
//!
//! # Lifecycle
//!
//! ```text
//! Free ──claim()──▶ Claimed ──allocate(size)──▶ Allocated
//! ```
//!
//! `claim` runs under the owning buffer's region-list lock and reserves
//! the slot; `allocate` performs the actual heap allocation *outside*
//! that lock, so concurrent producers never serialize on the allocator.
//! A region is either unallocated (zero size, no storage) or fully
//! allocated; there is no partial state.

use crate::error::{Error, Result};
use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::cell::UnsafeCell;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU8, AtomicU32, Ordering};

const STATE_FREE: u8 = 0;
const STATE_CLAIMED: u8 = 1;
const STATE_ALLOCATED: u8 = 2;

/// Alignment of region storage. Large enough for any plain-old-data
/// payload written through `set_tag`.
const REGION_ALIGN: usize = 8;

/// A single growable-list slot owning one byte arena.
pub struct MemoryRegion {
    state: AtomicU8,
    size: AtomicU32,
    base: UnsafeCell<Option<NonNull<u8>>>,
}

// SAFETY: `base` is written exactly once, by the thread that holds the
// Claimed state, and published with a Release store of STATE_ALLOCATED.
// All readers check the state with Acquire first. Byte-level access is
// synchronized by the owning buffer's map lock.
unsafe impl Send for MemoryRegion {}
unsafe impl Sync for MemoryRegion {}

impl MemoryRegion {
    /// Create an unallocated region slot.
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_FREE),
            size: AtomicU32::new(0),
            base: UnsafeCell::new(None),
        }
    }

    /// Reserve this slot for an upcoming allocation.
    ///
    /// Returns `false` if the slot is already claimed or allocated. Must
    /// only be called while holding the owning buffer's region-list lock;
    /// the claim is what lets the byte allocation itself run unlocked.
    pub fn claim(&self) -> bool {
        self.state
            .compare_exchange(
                STATE_FREE,
                STATE_CLAIMED,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    /// Allocate the region's storage.
    ///
    /// Transitions Claimed → Allocated exactly once. Re-allocating an
    /// already-allocated region is not a supported transition; callers
    /// create a new region instead.
    pub fn allocate(&self, size: u32) -> Result<()> {
        if size == 0 {
            return Err(Error::InvalidArgument(
                "region size must be > 0".into(),
            ));
        }
        let state = self.state.load(Ordering::Acquire);
        if state == STATE_ALLOCATED {
            return Err(Error::InvalidState(
                "region is already allocated".into(),
            ));
        }

        let layout = Layout::from_size_align(size as usize, REGION_ALIGN)
            .map_err(|e| Error::OutOfMemory(e.to_string()))?;
        // SAFETY: layout has non-zero size (checked above).
        let raw = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(raw)
            .ok_or_else(|| Error::OutOfMemory(format!("region allocation of {size} bytes failed")))?;

        // SAFETY: only the claiming thread reaches this store; readers
        // observe `base` strictly after the Release store below.
        unsafe { *self.base.get() = Some(base) };
        self.size.store(size, Ordering::Release);
        self.state.store(STATE_ALLOCATED, Ordering::Release);
        Ok(())
    }

    /// Return a claimed slot to the free state after a failed
    /// allocation, so the slot can be recycled.
    pub fn release_claim(&self) {
        let _ = self.state.compare_exchange(
            STATE_CLAIMED,
            STATE_FREE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// True only while the slot is unclaimed and unallocated. Used to
    /// recycle a free slot before growing the region list.
    pub fn is_free(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_FREE
    }

    /// True once storage has been allocated.
    pub fn is_allocated(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_ALLOCATED
    }

    /// Allocated size in bytes (zero while unallocated).
    pub fn size(&self) -> u32 {
        if self.is_allocated() {
            self.size.load(Ordering::Acquire)
        } else {
            0
        }
    }

    fn base_ptr(&self) -> Option<NonNull<u8>> {
        if self.is_allocated() {
            // SAFETY: base was published before STATE_ALLOCATED and is
            // never rewritten afterwards.
            unsafe { *self.base.get() }
        } else {
            None
        }
    }

    /// Get the region's storage as a byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure no mutable references exist to this memory;
    /// in practice this means holding the owning buffer's map lock.
    pub unsafe fn as_slice(&self) -> Option<&[u8]> {
        self.base_ptr().map(|base| {
            // SAFETY: caller guarantees no writers; size is fixed.
            unsafe {
                std::slice::from_raw_parts(base.as_ptr(), self.size.load(Ordering::Acquire) as usize)
            }
        })
    }

    /// Get the region's storage as a mutable byte slice.
    ///
    /// # Safety
    ///
    /// The caller must ensure exclusive access, normally by holding the
    /// owning buffer's map write lock. This returns a mutable reference
    /// from `&self` because the region handle is shared between entries
    /// while the bytes it covers are partitioned by entry offsets.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> Option<&mut [u8]> {
        self.base_ptr().map(|base| {
            // SAFETY: caller guarantees exclusive access.
            unsafe {
                std::slice::from_raw_parts_mut(
                    base.as_ptr(),
                    self.size.load(Ordering::Acquire) as usize,
                )
            }
        })
    }
}

impl Default for MemoryRegion {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for MemoryRegion {
    fn drop(&mut self) {
        if let Some(base) = *self.base.get_mut() {
            let size = self.size.load(Ordering::Acquire) as usize;
            if size > 0 {
                // SAFETY: base was allocated with this exact layout.
                unsafe {
                    dealloc(
                        base.as_ptr(),
                        Layout::from_size_align_unchecked(size, REGION_ALIGN),
                    )
                };
            }
        }
    }
}

impl std::fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("allocated", &self.is_allocated())
            .field("size", &self.size())
            .finish()
    }
}
