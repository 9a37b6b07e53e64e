//! Boundary-tagged first-fit heap.
//!
//! One contiguous run of chunks per stretch of break, fenced at both ends by
//! sentinel tags, grown page-by-page through a [`Segment`]. Free chunks sit
//! on a doubly linked list kept in ascending address order and threaded
//! through the free payloads themselves. Placement is first fit with the
//! remainder carved off the high end; release fuses the chunk with free
//! neighbours in both directions, so fragmentation stays bounded by what the
//! caller actually holds.
//!
//! Every public entry point runs in its entirety under one mutex. The only
//! place a holder can block is the segment growing under it, which is rare
//! and page-granular by design.

use std::ptr::{self, NonNull, null_mut};
use std::sync::atomic::{AtomicU8, Ordering};

use parking_lot::Mutex;
use thiserror::Error;

use crate::chunk::{
    ALIGN, Chunk, FENCE_OVERHEAD, FENCE_SIZE, Fence, FreeNode, MIN_CHUNK, chunk_size_for, round_up,
};
use crate::system::{ProgramBreak, Segment};

// ── Errors ────────────────────────────────────────────────────────────

/// Why an allocation entry point could not hand out memory.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The segment refused to grow the heap.
    #[error("out of memory: the growth primitive refused to extend the heap")]
    OutOfMemory,
    /// The request does not fit the size word.
    #[error("allocation size overflows the size word")]
    SizeOverflow,
}

// ── Settings ──────────────────────────────────────────────────────────

/// Tuning knobs for a [`Heap`].
#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Pages requested from the segment per growth, at minimum.
    pub min_grow_pages: usize,
    /// Remainders below this many bytes stay attached to the outgoing chunk
    /// instead of being split off. Must be an aligned value of at least
    /// [`MIN_CHUNK`].
    pub split_threshold: usize,
}

impl HeapSettings {
    pub const DEFAULT: HeapSettings = HeapSettings {
        min_grow_pages: 1,
        split_threshold: MIN_CHUNK,
    };

    #[inline]
    fn validate(&self) -> Result<(), &'static str> {
        if self.min_grow_pages == 0 {
            return Err("min_grow_pages must be > 0");
        }
        if self.split_threshold < MIN_CHUNK {
            return Err("split_threshold below the smallest viable chunk");
        }
        if !self.split_threshold.is_multiple_of(ALIGN) {
            return Err("split_threshold must keep chunk alignment");
        }
        Ok(())
    }
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self::DEFAULT
    }
}

// ── Free list ─────────────────────────────────────────────────────────

/// Doubly linked list of free chunks in strictly ascending address order.
/// A view over heap bytes; the heap arena owns the storage.
#[derive(Debug)]
struct FreeList {
    head: *mut FreeNode,
}

impl FreeList {
    const fn new() -> Self {
        Self { head: null_mut() }
    }

    /// Splice `node` in at its address position and wire all four links.
    ///
    /// # Safety
    /// `node` must overlay a free chunk that is not already listed.
    unsafe fn insert(&mut self, node: *mut FreeNode) {
        // SAFETY: nodes overlay live free chunks for the whole walk
        unsafe {
            if self.head.is_null() || node < self.head {
                (*node).prev = null_mut();
                (*node).next = self.head;
                if !self.head.is_null() {
                    (*self.head).prev = node;
                }
                self.head = node;
                return;
            }
            let mut front = self.head;
            while !(*front).next.is_null() && (*front).next < node {
                front = (*front).next;
            }
            (*node).prev = front;
            (*node).next = (*front).next;
            if !(*node).next.is_null() {
                (*(*node).next).prev = node;
            }
            (*front).next = node;
        }
    }

    /// Splice a listed node out through its own links.
    ///
    /// # Safety
    /// `node` must be on this list.
    unsafe fn remove(&mut self, node: *mut FreeNode) {
        // SAFETY: listed nodes carry consistent links
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            if prev.is_null() {
                debug_assert_eq!(self.head, node);
                self.head = next;
            } else {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }
            (*node).prev = null_mut();
            (*node).next = null_mut();
        }
    }

    /// Put `fresh` in the exact list position of `node`. Used when a split
    /// remainder takes over the found chunk's slot; the remainder lies
    /// inside the old chunk, so the address order is preserved.
    ///
    /// # Safety
    /// `node` must be on this list and `fresh` must overlay a free chunk
    /// between `node` and its successor.
    unsafe fn replace(&mut self, node: *mut FreeNode, fresh: *mut FreeNode) {
        // SAFETY: listed nodes carry consistent links
        unsafe {
            let prev = (*node).prev;
            let next = (*node).next;
            debug_assert!(fresh > node && (next.is_null() || fresh < next));
            (*fresh).prev = prev;
            (*fresh).next = next;
            if prev.is_null() {
                debug_assert_eq!(self.head, node);
                self.head = fresh;
            } else {
                (*prev).next = fresh;
            }
            if !next.is_null() {
                (*next).prev = fresh;
            }
        }
    }

    /// First chunk from the low end whose size covers `size`. Null on
    /// exhaustion.
    ///
    /// # Safety
    /// The list must only hold nodes overlaying live free chunks.
    unsafe fn find_first_fit(&self, size: usize) -> *mut FreeNode {
        let mut front = self.head;
        // SAFETY: see contract
        unsafe {
            while !front.is_null() {
                if (*front).fence.size() >= size {
                    return front;
                }
                front = (*front).next;
            }
        }
        null_mut()
    }
}

// ── Heap state ────────────────────────────────────────────────────────

/// Everything behind the mutex: the segment, the growth bookkeeping and the
/// free list. `page_size == 0` means the heap has never grown.
#[derive(Debug)]
struct HeapState<S> {
    segment: S,
    settings: HeapSettings,
    /// Cached OS page size; zero until the first growth.
    page_size: usize,
    /// First chunk header of each fenced run, in growth order. One run in
    /// the common case; a new run starts whenever the segment comes back
    /// discontiguous with the previous growth.
    runs: Vec<*mut u8>,
    /// Where the next contiguous growth is expected to land.
    break_end: *mut u8,
    /// Total bytes ever delivered by the segment.
    grown: usize,
    list: FreeList,
}

// SAFETY: the raw heap pointers are only touched under the mutex in `Heap`
unsafe impl<S: Send> Send for HeapState<S> {}

impl<S: Segment> HeapState<S> {
    /// Grow the heap enough for a `req`-byte chunk, fence the new space and
    /// return it as one free chunk (not yet listed). `None` when the
    /// segment refuses or the request overflows page rounding.
    fn expand(&mut self, req: usize) -> Option<Chunk> {
        if self.page_size == 0 {
            self.page_size = self.segment.page_size();
        }
        let wanted = req.checked_add(FENCE_OVERHEAD)?;
        let len = round_up(wanted, self.page_size)?
            .max(self.settings.min_grow_pages.checked_mul(self.page_size)?);

        let base = match self.segment.grow(len) {
            Some(base) => base.as_ptr(),
            None => {
                log::warn!("segment refused to grow by {len} bytes");
                return None;
            }
        };
        if base != self.break_end && !(base as usize).is_multiple_of(ALIGN) {
            // A foreign break user left the break misaligned; a run started
            // here could not hand out aligned payloads, so refuse it.
            log::warn!("segment delivered a misaligned run at {base:?}");
            return None;
        }
        self.grown += len;
        log::debug!(
            "heap grown by {len} bytes at {base:?} (page size {})",
            self.page_size
        );

        // SAFETY: [base, base + len) was just delivered by the segment
        unsafe {
            let chunk;
            let size;
            if base == self.break_end {
                // Contiguous: the old high sentinel word becomes the new
                // chunk's header and the top gets a fresh sentinel.
                debug_assert!((*(base.sub(FENCE_SIZE) as *const Fence)).is_sentinel());
                chunk = Chunk::from_raw(base.sub(FENCE_SIZE));
                size = len;
            } else {
                // First growth, or another break user moved the break:
                // fence a brand-new run.
                *(base as *mut Fence) = Fence::SENTINEL;
                chunk = Chunk::from_raw(base.add(FENCE_SIZE));
                size = len - FENCE_OVERHEAD;
                self.runs.push(chunk.addr() as *mut u8);
            }
            *(base.add(len - FENCE_SIZE) as *mut Fence) = Fence::SENTINEL;
            self.break_end = base.add(len);
            chunk.set_free(size);
            Some(chunk)
        }
    }

    /// The placement engine's allocation path: first fit, grow on miss,
    /// split the found chunk.
    fn allocate_chunk(&mut self, req: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: list nodes overlay live free chunks
        let mut node = unsafe { self.list.find_first_fit(req) };
        if node.is_null() {
            let chunk = self.expand(req).ok_or(AllocError::OutOfMemory)?;
            // SAFETY: the fresh chunk is free and unlisted
            unsafe { self.list.insert(chunk.node()) };
            node = chunk.node();
        }
        // SAFETY: node overlays a free chunk of at least `req` bytes
        Ok(unsafe { self.place(node, req) })
    }

    /// Carve `req` bytes out of the free chunk under `node` and mark the
    /// outgoing chunk used. A viable high-end remainder takes the found
    /// chunk's place in the list; anything smaller rides along with the
    /// allocation.
    ///
    /// # Safety
    /// `node` must be listed and its chunk must hold at least `req` bytes.
    unsafe fn place(&mut self, node: *mut FreeNode, req: usize) -> NonNull<u8> {
        // SAFETY: upheld by the caller plus the list invariants
        unsafe {
            let chunk = Chunk::from_node(node);
            let total = chunk.size();
            debug_assert!(total >= req);
            if total - req >= self.settings.split_threshold {
                let rest = chunk.offset(req);
                rest.set_free(total - req);
                self.list.replace(node, rest.node());
                chunk.set_used(req);
            } else {
                self.list.remove(node);
                chunk.set_used(total);
            }
            chunk.payload()
        }
    }

    /// The placement engine's release path: re-fence as free, list, fuse
    /// both ways.
    ///
    /// # Safety
    /// `payload` must come from `place` and must not be on the list.
    unsafe fn release_chunk(&mut self, payload: NonNull<u8>) {
        // SAFETY: upheld by the caller
        unsafe {
            let chunk = Chunk::from_payload(payload);
            debug_assert!(chunk.header().is_used());
            chunk.set_free(chunk.size());
            self.list.insert(chunk.node());
            let chunk = self.fuse_up(chunk);
            self.fuse_down(chunk);
        }
    }

    /// Merge `chunk` into a free lower neighbour, found through the fence
    /// word below the header. Used neighbours and sentinels stop the
    /// fusion.
    ///
    /// # Safety
    /// `chunk` must be free and listed.
    unsafe fn fuse_up(&mut self, chunk: Chunk) -> Chunk {
        // SAFETY: the run's sentinels keep every probe in bounds
        unsafe {
            let below = chunk.below();
            if below.is_used() {
                return chunk;
            }
            let prev = chunk.prev_chunk();
            self.list.remove(chunk.node());
            prev.set_free(prev.size() + chunk.size());
            prev
        }
    }

    /// Merge a free upper neighbour into `chunk`.
    ///
    /// # Safety
    /// `chunk` must be free and listed.
    unsafe fn fuse_down(&mut self, chunk: Chunk) -> Chunk {
        // SAFETY: the run's sentinels keep every probe in bounds
        unsafe {
            let next = chunk.next_chunk();
            if next.header().is_used() {
                return chunk;
            }
            self.list.remove(next.node());
            chunk.set_free(chunk.size() + next.size());
            chunk
        }
    }

    /// Forward fence traversal over every chunk between the sentinels of
    /// every run.
    fn walk(&self) -> HeapStats {
        let mut stats = HeapStats {
            grown_bytes: self.grown,
            ..HeapStats::default()
        };
        for &start in &self.runs {
            // SAFETY: runs tile delivered memory and end in a sentinel
            unsafe {
                let mut cursor = Chunk::from_raw(start);
                loop {
                    let header = cursor.header();
                    if header.is_sentinel() {
                        break;
                    }
                    let size = header.size();
                    debug_assert_eq!(
                        header,
                        cursor.footer(),
                        "fences disagree at {:#x}",
                        cursor.addr()
                    );
                    stats.chunks += 1;
                    if header.is_used() {
                        stats.used_chunks += 1;
                        stats.used_bytes += size;
                    } else {
                        stats.free_chunks += 1;
                        stats.free_bytes += size;
                        stats.largest_free = stats.largest_free.max(size);
                    }
                    cursor = cursor.next_chunk();
                }
            }
        }
        stats
    }
}

// ── Heap ──────────────────────────────────────────────────────────────

/// Point-in-time heap accounting, taken under the heap mutex. Sizes count
/// whole chunks, fences included.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    /// Total bytes ever delivered by the segment.
    pub grown_bytes: usize,
    pub chunks: usize,
    pub used_chunks: usize,
    pub free_chunks: usize,
    pub used_bytes: usize,
    pub free_bytes: usize,
    pub largest_free: usize,
}

/// A boundary-tagged, first-fit heap over a growth [`Segment`].
///
/// Construction touches nothing; the segment is first consulted when the
/// first allocation arrives. All entry points are serialized by one mutex,
/// so a `Heap` is freely shared across threads.
#[derive(Debug)]
pub struct Heap<S: Segment = ProgramBreak> {
    state: Mutex<HeapState<S>>,
}

impl<S: Segment> Heap<S> {
    /// Heap with default settings. Usable in statics.
    pub const fn new(segment: S) -> Self {
        Self {
            state: Mutex::new(HeapState {
                segment,
                settings: HeapSettings::DEFAULT,
                page_size: 0,
                runs: Vec::new(),
                break_end: null_mut(),
                grown: 0,
                list: FreeList::new(),
            }),
        }
    }

    /// Heap with explicit settings. Panics on invalid settings.
    pub fn with_settings(segment: S, settings: HeapSettings) -> Self {
        settings.validate().expect("invalid heap settings");
        let heap = Self::new(segment);
        heap.state.lock().settings = settings;
        heap
    }

    /// Reserve `size` bytes and return the payload address.
    ///
    /// The payload is 16-byte aligned and stays put until released or moved
    /// by [`Heap::resize`]. Zero-sized requests are served from the
    /// smallest viable chunk.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let req = chunk_size_for(size).ok_or(AllocError::SizeOverflow)?;
        self.state.lock().allocate_chunk(req)
    }

    /// Return `payload` to the pool and fuse it with free neighbours.
    ///
    /// # Safety
    /// `payload` must come from an allocation entry point of this heap and
    /// must not have been released already.
    pub unsafe fn release(&self, payload: NonNull<u8>) {
        let mut state = self.state.lock();
        // SAFETY: caller contract
        unsafe { state.release_chunk(payload) };
    }

    /// Reserve `count * elem_size` bytes, zero-filled.
    ///
    /// Products whose bit widths could overflow the size word are rejected
    /// before the heap is consulted.
    pub fn allocate_zeroed(&self, count: usize, elem_size: usize) -> Result<NonNull<u8>, AllocError> {
        if bit_length(count) + bit_length(elem_size) > usize::BITS {
            return Err(AllocError::SizeOverflow);
        }
        let total = count * elem_size;
        let payload = self.allocate(total)?;
        // SAFETY: the chunk behind `payload` holds at least `total` bytes
        unsafe { payload.as_ptr().write_bytes(0, total) };
        Ok(payload)
    }

    /// Usable payload bytes in the chunk behind `payload`: its full size
    /// minus both fences.
    ///
    /// # Safety
    /// Same contract as [`Heap::release`].
    pub unsafe fn capacity(&self, payload: NonNull<u8>) -> usize {
        let _state = self.state.lock();
        // SAFETY: caller contract; used chunks keep their fences intact
        unsafe { Chunk::from_payload(payload).size() - FENCE_OVERHEAD }
    }

    /// Grow or shrink `payload` to `size` bytes.
    ///
    /// Returns the original pointer whenever the chunk already has the
    /// capacity. Otherwise the payload moves: `size` fresh bytes are
    /// reserved, the old bytes are copied over and the old chunk is
    /// released. On failure the original stays intact.
    ///
    /// # Safety
    /// Same contract as [`Heap::release`].
    pub unsafe fn resize(&self, payload: NonNull<u8>, size: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: caller contract
        let old = unsafe { self.capacity(payload) };
        if old >= size {
            return Ok(payload);
        }
        let fresh = self.allocate(size)?;
        // SAFETY: distinct chunks; the old payload holds `old` bytes and
        // the fresh one holds at least `size > old`
        unsafe {
            ptr::copy_nonoverlapping(payload.as_ptr(), fresh.as_ptr(), old);
            self.release(payload);
        }
        Ok(fresh)
    }

    /// Snapshot of the heap accounting.
    pub fn stats(&self) -> HeapStats {
        self.state.lock().walk()
    }
}

/// Bits needed to write `n`, i.e. the position of its highest set bit.
#[inline(always)]
fn bit_length(n: usize) -> u32 {
    usize::BITS - n.leading_zeros()
}

// ── Process-wide heap ─────────────────────────────────────────────────

/// The heap behind the classical entry points, grown through the real
/// program break. Lazily initialized by the first allocation, never torn
/// down.
pub static HEAP: Heap = Heap::new(ProgramBreak);

const ERR_NONE: u8 = 0;
const ERR_OOM: u8 = 1;
const ERR_OVERFLOW: u8 = 2;

/// Failure indicator for the classical entry points. Set on failure, never
/// cleared on success, like `errno`.
static LAST_ERROR: AtomicU8 = AtomicU8::new(ERR_NONE);

#[cold]
fn record(err: AllocError) {
    let code = match err {
        AllocError::OutOfMemory => ERR_OOM,
        AllocError::SizeOverflow => ERR_OVERFLOW,
    };
    LAST_ERROR.store(code, Ordering::Relaxed);
}

/// The most recent failure recorded by a classical entry point.
pub fn last_error() -> Option<AllocError> {
    match LAST_ERROR.load(Ordering::Relaxed) {
        ERR_OOM => Some(AllocError::OutOfMemory),
        ERR_OVERFLOW => Some(AllocError::SizeOverflow),
        _ => None,
    }
}

/// Classical `malloc`: a 16-byte-aligned payload, or null with the failure
/// recorded for [`last_error`].
pub fn allocate(size: usize) -> *mut u8 {
    match HEAP.allocate(size) {
        Ok(payload) => payload.as_ptr(),
        Err(err) => {
            record(err);
            null_mut()
        }
    }
}

/// Classical `free`: null is a no-op.
///
/// # Safety
/// A non-null `ptr` must come from these entry points and must not have
/// been released already.
pub unsafe fn release(ptr: *mut u8) {
    if let Some(payload) = NonNull::new(ptr) {
        // SAFETY: caller contract
        unsafe { HEAP.release(payload) };
    }
}

/// Classical `calloc`: a zero-filled payload of `count * elem_size` bytes,
/// or null on overflow or exhaustion.
pub fn zero_allocate(count: usize, elem_size: usize) -> *mut u8 {
    match HEAP.allocate_zeroed(count, elem_size) {
        Ok(payload) => payload.as_ptr(),
        Err(err) => {
            record(err);
            null_mut()
        }
    }
}

/// Classical `realloc` with the conventional contract: a null `ptr` grows
/// from nothing, a zero `size` releases and returns null, and on failure
/// the original payload stays intact behind a null return.
///
/// # Safety
/// Same contract as [`release`].
pub unsafe fn resize(ptr: *mut u8, size: usize) -> *mut u8 {
    let Some(payload) = NonNull::new(ptr) else {
        return allocate(size);
    };
    if size == 0 {
        // SAFETY: caller contract
        unsafe { HEAP.release(payload) };
        return null_mut();
    }
    // SAFETY: caller contract
    match unsafe { HEAP.resize(payload, size) } {
        Ok(fresh) => fresh.as_ptr(),
        Err(err) => {
            record(err);
            null_mut()
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
