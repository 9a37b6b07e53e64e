//! A boundary-tagged, first-fit heap allocator over a page-granular growth
//! primitive, with the classical `allocate` / `release` / `zero_allocate` /
//! `resize` entry points on top. See [`heap`](crate::Heap) for the design.

mod chunk;
mod heap;
mod system;

pub use chunk::{ALIGN, FENCE_OVERHEAD, MIN_CHUNK};
pub use heap::{
    AllocError, HEAP, Heap, HeapSettings, HeapStats, allocate, last_error, release, resize,
    zero_allocate,
};
pub use system::{FixedSegment, OS_PAGE_SIZE, ProgramBreak, Segment, map_memory, unmap_memory};
