#![no_std]

//! A boundary-tag heap allocator with segregated free lists.
//!
//! The heap lives in a single contiguous region that only ever grows at its
//! high end, `sbrk`-style. Blocks carry their bookkeeping in-band: a packed
//! header word (size plus ALLOC and PREV_ALLOC bits), a footer mirrored from
//! the header on free blocks only, and free-list links hidden in the payload
//! bytes of free blocks as 32-bit offsets from the heap's anchor. Freed
//! blocks are merged eagerly with free neighbours and indexed into one of 18
//! size-classed lists; placement runs a bounded best-fit over those lists
//! and splits what it finds when the leftover is worth keeping.
//!
//! ## Layout of the crate
//!
//! - [`block`]: the tag word and the pointer arithmetic between blocks.
//! - [`seglist`]: the segregated free-list index.
//! - [`heap`]: the engine, covering placement, splitting, coalescing,
//!   growth, and a full consistency checker.
//! - [`allocators`]: the [`HeapSource`] region providers and the
//!   spin-locked [`UnixAllocator`] for use as `#[global_allocator]`.
//!
//! ## Example
//!
//! ```rust,ignore
//! use tag_allocator::UnixAllocator;
//!
//! #[global_allocator]
//! static ALLOCATOR: UnixAllocator = UnixAllocator::new();
//! ```

pub mod allocators;
pub mod block;
pub mod heap;
pub mod seglist;
#[cfg(not(feature = "use_libc"))]
pub mod unix;

pub use allocators::{ArrayHeap, GenericAllocator, HeapSource, UnixAllocator};
pub use heap::{Heap, Stats, Validity};
