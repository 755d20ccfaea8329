//! `IoVec` — the reference-counted byte arena.
//!
//! One arena backs many in-flight packet views. The channel allocates an
//! arena, reads socket bytes into it, and hands out views; the arena stays
//! alive until the last view drops. Sharing is `Arc<IoVec>`, which gives the
//! required ordering for free: clone is a relaxed increment, the final drop
//! is a release decrement plus an acquire fence before the memory is freed.
//!
//! # Thread safety
//!
//! The buffer is reachable as raw memory, not as a `&mut [u8]`, so aliasing
//! rules are upheld by protocol rather than by the borrow checker:
//!
//! - On the ingress path only the owning channel's reactor thread writes,
//!   and only at offsets past every byte a view can see.
//! - On the egress path the producing thread writes all payload bytes
//!   *before* publishing the slot into the ring; the release/acquire pair on
//!   the ring indices makes them visible to the reactor.
//!
//! Violating either rule is a logic bug, not a memory-safety hazard the
//! compiler can catch; the accessors assert what they can and the rest is
//! protocol.

use std::alloc::{alloc, alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A shared, reference-counted arena handle.
pub type SharedIoVec = Arc<IoVec>;

/// A contiguous byte arena with an opaque 64-bit metadata tag.
pub struct IoVec {
    buf: NonNull<u8>,
    size: usize,
    /// Set once right after allocation, usually to the owning channel id.
    metadata: AtomicU64,
}

// Safety: the raw buffer is plain bytes; cross-thread access is governed by
// the publication protocol described in the module docs.
unsafe impl Send for IoVec {}
unsafe impl Sync for IoVec {}

impl IoVec {
    /// Allocate an arena of `size` bytes. `size` must be nonzero.
    pub fn new(size: usize) -> Self {
        Self::alloc_with(size, false)
    }

    /// Allocate a zero-filled arena of `size` bytes.
    pub fn new_zeroed(size: usize) -> Self {
        Self::alloc_with(size, true)
    }

    fn alloc_with(size: usize, zeroed: bool) -> Self {
        assert!(size > 0, "zero-size arena");
        let layout = Layout::array::<u8>(size).expect("arena layout overflow");
        let raw = unsafe {
            if zeroed {
                alloc_zeroed(layout)
            } else {
                alloc(layout)
            }
        };
        let buf = match NonNull::new(raw) {
            Some(p) => p,
            None => handle_alloc_error(layout),
        };
        Self {
            buf,
            size,
            metadata: AtomicU64::new(0),
        }
    }

    /// Allocation length in bytes. Always nonzero.
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    #[inline]
    pub fn metadata(&self) -> u64 {
        self.metadata.load(Ordering::Relaxed)
    }

    /// Tag the arena. Meant to be called once, right after allocation.
    #[inline]
    pub fn set_metadata(&self, metadata: u64) {
        self.metadata.store(metadata, Ordering::Relaxed);
    }

    /// Raw base pointer. Offset arithmetic is the caller's problem; every
    /// safe accessor in this crate bounds-checks against `size()`.
    #[inline]
    pub fn as_ptr(&self) -> *mut u8 {
        self.buf.as_ptr()
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// # Safety
    ///
    /// `offset + len` must be within `size()`, and no thread may be writing
    /// the same range for the lifetime of the slice (see module docs).
    #[inline]
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        debug_assert!(offset + len <= self.size);
        std::slice::from_raw_parts(self.buf.as_ptr().add(offset), len)
    }

    /// Copy `len` bytes from `src[from..]` to `dst[to..]`.
    ///
    /// `src` and `dst` may be the same arena and the ranges may overlap;
    /// this is the only primitive that relocates bytes inside an arena.
    pub fn memmove(dst: &IoVec, to: usize, src: &IoVec, from: usize, len: usize) {
        assert!(to + len <= dst.size, "memmove past destination arena");
        assert!(from + len <= src.size, "memmove past source arena");
        unsafe {
            std::ptr::copy(src.buf.as_ptr().add(from), dst.buf.as_ptr().add(to), len);
        }
    }
}

impl Drop for IoVec {
    fn drop(&mut self) {
        // Layout was validated at allocation time.
        let layout = Layout::array::<u8>(self.size).expect("arena layout overflow");
        unsafe { dealloc(self.buf.as_ptr(), layout) };
    }
}

impl std::fmt::Debug for IoVec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoVec")
            .field("size", &self.size)
            .field("metadata", &self.metadata())
            .finish()
    }
}

/// Allocate a fresh shared arena.
pub fn make_shared_io_vec(size: usize) -> SharedIoVec {
    Arc::new(IoVec::new(size))
}
