//! On-heap chunk encoding: boundary tags, the free-node overlay and the
//! handle types that keep chunk pointers and payload pointers apart.
//!
//! A chunk is a 16-byte-aligned byte range fenced by two identical size
//! words:
//!
//! ```text
//!   [ header | payload ........................ | footer ]
//!     8 B      size - 16 B                        8 B
//! ```
//!
//! The low bit of a fence is the used flag; the remaining bits are the full
//! chunk size. While a chunk is free, the first two payload words hold the
//! prev/next links of the free list. The footer lets a neighbour walk
//! backwards without any secondary index.

use std::ptr::NonNull;

// The fence encoding and the overhead constants assume 64-bit words.
const _: () = assert!(size_of::<usize>() == 8 && size_of::<*mut u8>() == 8);

/// Machine word in bytes.
pub const WORD: usize = size_of::<usize>();
/// One boundary tag.
pub const FENCE_SIZE: usize = size_of::<Fence>();
/// Header plus footer.
pub const FENCE_OVERHEAD: usize = 2 * FENCE_SIZE;
/// Payload alignment. Chunk sizes and chunk starts keep this granularity.
pub const ALIGN: usize = 2 * WORD;
/// On-heap footprint of a free node: header fence plus the two list links.
pub const NODE_SIZE: usize = size_of::<FreeNode>();
/// Smallest chunk that can re-host a free node once released.
pub const MIN_CHUNK: usize = NODE_SIZE + FENCE_SIZE;

const _: () = assert!(MIN_CHUNK % ALIGN == 0);

// ── Fences ────────────────────────────────────────────────────────────

/// A boundary tag: one word carrying the chunk size with the used flag in
/// the low bit. Sizes are multiples of [`ALIGN`], so the flag bit is spare.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fence(usize);

impl Fence {
    /// Heap-extremity marker: used bit set, masked size zero. Sentinels are
    /// never split, never fused and never handed to callers.
    pub const SENTINEL: Fence = Fence(1);

    #[inline(always)]
    pub fn free(size: usize) -> Self {
        debug_assert!(size.is_multiple_of(ALIGN));
        Fence(size)
    }

    #[inline(always)]
    pub fn used(size: usize) -> Self {
        debug_assert!(size.is_multiple_of(ALIGN));
        Fence(size | 1)
    }

    /// Chunk size with the flag bit masked off.
    #[inline(always)]
    pub fn size(self) -> usize {
        self.0 & !1
    }

    #[inline(always)]
    pub fn is_used(self) -> bool {
        self.0 & 1 != 0
    }

    #[inline(always)]
    pub fn is_sentinel(self) -> bool {
        self.0 == Self::SENTINEL.0
    }
}

// ── Free-node overlay ─────────────────────────────────────────────────

/// Overlay of a free chunk's first three words: the header fence followed
/// by the list links threaded through the payload area. The links are raw
/// views into heap bytes; the heap arena owns the storage, never the list.
#[repr(C)]
#[derive(Debug)]
pub struct FreeNode {
    pub fence: Fence,
    pub prev: *mut FreeNode,
    pub next: *mut FreeNode,
}

// ── Chunk handle ──────────────────────────────────────────────────────

/// Handle to a chunk, addressed by its header word.
///
/// Payload pointers and chunk handles convert only through
/// [`Chunk::from_payload`] and [`Chunk::payload`], so the two cannot be
/// mixed up in the placement code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk(NonNull<u8>);

impl Chunk {
    /// # Safety
    /// `start` must point at the header word of a chunk inside the heap.
    #[inline(always)]
    pub unsafe fn from_raw(start: *mut u8) -> Self {
        debug_assert!(!start.is_null());
        // SAFETY: non-null by contract
        Chunk(unsafe { NonNull::new_unchecked(start) })
    }

    /// # Safety
    /// `payload` must have been produced by [`Chunk::payload`].
    #[inline(always)]
    pub unsafe fn from_payload(payload: NonNull<u8>) -> Self {
        // SAFETY: a payload sits one fence past its header
        unsafe { Self::from_raw(payload.as_ptr().sub(FENCE_SIZE)) }
    }

    /// # Safety
    /// `node` must overlay a chunk inside the heap.
    #[inline(always)]
    pub unsafe fn from_node(node: *mut FreeNode) -> Self {
        // SAFETY: the node overlay starts at the header word
        unsafe { Self::from_raw(node.cast()) }
    }

    #[inline(always)]
    pub fn payload(self) -> NonNull<u8> {
        // SAFETY: chunks are at least MIN_CHUNK bytes, so the payload is in
        // bounds and non-null
        unsafe { NonNull::new_unchecked(self.0.as_ptr().add(FENCE_SIZE)) }
    }

    #[inline(always)]
    pub fn node(self) -> *mut FreeNode {
        self.0.as_ptr().cast()
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// # Safety
    /// The chunk's header word must be initialized.
    #[inline(always)]
    pub unsafe fn header(self) -> Fence {
        // SAFETY: header word is in bounds by the type's contract
        unsafe { *(self.0.as_ptr() as *const Fence) }
    }

    /// # Safety
    /// The chunk's header word must be initialized.
    #[inline(always)]
    pub unsafe fn size(self) -> usize {
        // SAFETY: see `header`
        unsafe { self.header().size() }
    }

    /// # Safety
    /// Header and footer must both be initialized.
    #[inline(always)]
    pub unsafe fn footer(self) -> Fence {
        // SAFETY: the footer is the last word of the chunk
        unsafe { *(self.0.as_ptr().add(self.size() - FENCE_SIZE) as *const Fence) }
    }

    /// Fence word immediately below the header: the lower neighbour's
    /// footer, or the run's low sentinel.
    ///
    /// # Safety
    /// The chunk must sit inside a fenced run, so the word below exists.
    #[inline(always)]
    pub unsafe fn below(self) -> Fence {
        // SAFETY: guaranteed in bounds by the run's low sentinel
        unsafe { *(self.0.as_ptr().sub(FENCE_SIZE) as *const Fence) }
    }

    /// Lower neighbour, reached through its footer.
    ///
    /// # Safety
    /// The fence below must belong to a real chunk (not a sentinel).
    #[inline(always)]
    pub unsafe fn prev_chunk(self) -> Chunk {
        // SAFETY: the footer's size spans exactly the neighbour chunk
        unsafe { Self::from_raw(self.0.as_ptr().sub(self.below().size())) }
    }

    /// Upper neighbour's header position. On the last chunk of a run this
    /// lands on the high sentinel.
    ///
    /// # Safety
    /// The chunk's header must be initialized.
    #[inline(always)]
    pub unsafe fn next_chunk(self) -> Chunk {
        // SAFETY: chunks tile the run, so start + size is the next header
        unsafe { Self::from_raw(self.0.as_ptr().add(self.size())) }
    }

    /// Handle to the chunk starting `bytes` into this one. Used to carve a
    /// split remainder.
    ///
    /// # Safety
    /// `bytes` must be aligned and strictly inside the chunk.
    #[inline(always)]
    pub unsafe fn offset(self, bytes: usize) -> Chunk {
        debug_assert!(bytes.is_multiple_of(ALIGN));
        // SAFETY: in bounds by contract
        unsafe { Self::from_raw(self.0.as_ptr().add(bytes)) }
    }

    /// Write both fences as free. Leaves the payload words alone; the free
    /// list wires the links on insertion.
    ///
    /// # Safety
    /// The chunk must own `size` writable bytes.
    #[inline(always)]
    pub unsafe fn set_free(self, size: usize) {
        let fence = Fence::free(size);
        // SAFETY: both fence words are inside the chunk
        unsafe {
            *(self.0.as_ptr() as *mut Fence) = fence;
            *(self.0.as_ptr().add(size - FENCE_SIZE) as *mut Fence) = fence;
        }
    }

    /// Write both fences as used.
    ///
    /// # Safety
    /// The chunk must own `size` writable bytes.
    #[inline(always)]
    pub unsafe fn set_used(self, size: usize) {
        let fence = Fence::used(size);
        // SAFETY: both fence words are inside the chunk
        unsafe {
            *(self.0.as_ptr() as *mut Fence) = fence;
            *(self.0.as_ptr().add(size - FENCE_SIZE) as *mut Fence) = fence;
        }
    }
}

// ── Rounding ──────────────────────────────────────────────────────────

/// Round `n` up to a multiple of `to`. `None` on overflow.
#[inline]
pub fn round_up(n: usize, to: usize) -> Option<usize> {
    debug_assert!(to > 0);
    let rem = n % to;
    if rem == 0 { Some(n) } else { n.checked_add(to - rem) }
}

/// Chunk size able to host an `n`-byte payload: never below [`MIN_CHUNK`],
/// aligned, fenced. `None` when the size word would overflow, which also
/// rejects payloads above `usize::MAX / 2`.
#[inline]
pub fn chunk_size_for(n: usize) -> Option<usize> {
    let payload = n.max(NODE_SIZE - FENCE_SIZE);
    round_up(payload.checked_add(FENCE_OVERHEAD)?, ALIGN)
}

// ── Tests ─────────────────────────────────────────────────────────────
