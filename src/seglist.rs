//! Segregated free lists: one doubly-linked list of free blocks per size
//! class, with links threaded through the blocks' own payload words.
//!
//! Each class `i` below the last covers blocks with `size <= CLASS_LIMITS[i]`
//! (and above the previous limit); the final class catches everything larger.
//! Inserts prepend, so each list is in recency order, and both insert and
//! unlink are O(1) thanks to the in-band back links.

use core::ptr::NonNull;

use log::trace;
use static_assertions::const_assert;
use static_assertions::const_assert_eq;

use crate::block::{BlockPtr, MIN_BLOCK};

/// Upper size bounds of the segregated classes, in bytes. Blocks larger than
/// the last limit land in the overflow class.
pub const CLASS_LIMITS: [usize; 17] = [
    32, 48, 64, 128, 256, 512, 1024, 2048, 4096, 8192, 16384, 32768, 65536, 131072, 262144,
    524288, 1048576,
];

/// Number of free lists: one per limit plus the overflow class.
pub const CLASS_COUNT: usize = CLASS_LIMITS.len() + 1;

const_assert_eq!(CLASS_COUNT, 18);
// Even the smallest legal block must have a class to live in.
const_assert!(MIN_BLOCK <= CLASS_LIMITS[0]);

/// The class a block of `size` bytes belongs to.
pub fn class_of(size: usize) -> usize {
    CLASS_LIMITS
        .iter()
        .position(|&limit| size <= limit)
        .unwrap_or(CLASS_LIMITS.len())
}

/// The segregated free-list index.
///
/// Holds one head offset per class; 0 means the class is empty. The heads
/// are offsets from the heap anchor (`base`), like the links themselves, so
/// the whole index is position-independent within the heap.
pub struct SegList {
    base: NonNull<u8>,
    heads: [u32; CLASS_COUNT],
}

impl SegList {
    pub fn new(base: NonNull<u8>) -> SegList {
        SegList {
            base,
            heads: [0; CLASS_COUNT],
        }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    /// The most recently inserted block of `class`, if any.
    ///
    /// # Safety
    ///
    /// The heads must only ever hold offsets of live free blocks; callers
    /// must not have corrupted the heap the offsets point into.
    pub unsafe fn head(&self, class: usize) -> Option<BlockPtr> {
        BlockPtr::from_offset(self.base, self.heads[class])
    }

    /// Prepend a free block to the list for its size class.
    ///
    /// # Safety
    ///
    /// `block` must be a well-formed free block (header written, ALLOC bit
    /// clear) that is not currently in any list.
    pub unsafe fn insert(&mut self, block: BlockPtr) {
        let class = class_of(block.size());
        trace!(
            "insert {:?} size {} into class {}",
            block.payload(),
            block.size(),
            class
        );

        let head = self.head(class);
        block.set_prev_free(self.base, None);
        block.set_next_free(self.base, head);
        if let Some(old_head) = head {
            old_head.set_prev_free(self.base, Some(block));
        }
        self.heads[class] = block.offset_from(self.base);
    }

    /// Unlink a free block from its list.
    ///
    /// # Safety
    ///
    /// `block` must currently be linked into the list for its size class.
    /// Unlinking a block with a null back link that is not the list head is
    /// heap corruption; it traps in debug builds.
    pub unsafe fn remove(&mut self, block: BlockPtr) {
        let class = class_of(block.size());
        let prev = block.prev_free(self.base);
        let next = block.next_free(self.base);
        trace!(
            "remove {:?} size {} from class {}",
            block.payload(),
            block.size(),
            class
        );

        match prev {
            None => {
                debug_assert_eq!(self.heads[class], block.offset_from(self.base));
                self.heads[class] = next.map_or(0, |b| b.offset_from(self.base));
                if let Some(next) = next {
                    next.set_prev_free(self.base, None);
                }
            }
            Some(prev) => {
                prev.set_next_free(self.base, next);
                if let Some(next) = next {
                    next.set_prev_free(self.base, Some(prev));
                }
            }
        }
    }

}
