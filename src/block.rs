//! The on-heap block format: a packed tag word and the pointer arithmetic
//! that navigates between neighbouring blocks.
//!
//! Every block starts with a single 32-bit header word packing its size
//! together with two status bits. Free blocks additionally carry a copy of
//! the header in their last word (the footer), which is what lets a block
//! find its left neighbour without any out-of-band index. Allocated blocks
//! skip the footer entirely; their right neighbour's `PREV_ALLOC` header bit
//! stands in for it.
//!
//! A free block also repurposes its first two payload words as doubly-linked
//! list links. Links are stored as 32-bit byte offsets from the heap anchor
//! rather than full pointers, so that both of them fit inside the payload of
//! a minimum-sized block.

use core::ptr::NonNull;

use static_assertions::const_assert;
use static_assertions::const_assert_eq;

/// One header, footer, or link word.
pub const WSIZE: usize = 4;
/// Payload alignment, and the granularity of all block sizes.
pub const DSIZE: usize = 8;
/// Smallest representable block: header, two link words, footer.
pub const MIN_BLOCK: usize = 2 * DSIZE;
/// Alignment of every payload pointer handed to callers.
pub const ALIGNMENT: usize = DSIZE;

const_assert_eq!(MIN_BLOCK, WSIZE + 2 * WSIZE + WSIZE);
const_assert!(ALIGNMENT.is_power_of_two());

const ALLOC_BIT: u32 = 0x1;
const PREV_ALLOC_BIT: u32 = 0x2;
const SIZE_MASK: u32 = !0x7;

/// The largest block size the tag word can represent.
pub const MAX_BLOCK: usize = SIZE_MASK as usize;

/// A packed header/footer word: bits `[31:3]` hold the block size (always a
/// multiple of 8), bit 0 the ALLOC flag, bit 1 the PREV_ALLOC flag.
///
/// The constructor is the only way to produce a `Tag`, so a tag with a
/// misaligned size cannot exist by construction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Tag(u32);

impl Tag {
    pub fn new(size: usize, allocated: bool, prev_allocated: bool) -> Tag {
        debug_assert!(size % DSIZE == 0, "block sizes are double-word multiples");
        debug_assert!(size <= MAX_BLOCK);
        let mut word = size as u32 & SIZE_MASK;
        if allocated {
            word |= ALLOC_BIT;
        }
        if prev_allocated {
            word |= PREV_ALLOC_BIT;
        }
        Tag(word)
    }

    /// The epilogue word: a zero-sized allocated fence.
    pub fn epilogue(prev_allocated: bool) -> Tag {
        Tag::new(0, true, prev_allocated)
    }

    pub fn size(self) -> usize {
        (self.0 & SIZE_MASK) as usize
    }

    pub fn is_allocated(self) -> bool {
        self.0 & ALLOC_BIT != 0
    }

    pub fn prev_allocated(self) -> bool {
        self.0 & PREV_ALLOC_BIT != 0
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

/// A pointer to a block, addressed by its payload (the byte just after the
/// header word).
///
/// This is the direct analogue of the `bp` convention: all arithmetic is
/// relative to the payload, with the header one word below it. Every
/// accessor is unsafe because nothing ties the pointer to a live, correctly
/// framed heap; the `Heap` is responsible for only constructing `BlockPtr`s
/// that point at real blocks.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct BlockPtr {
    payload: NonNull<u8>,
}

impl BlockPtr {
    /// Wrap a payload pointer.
    ///
    /// # Safety
    ///
    /// `payload` must point one word past a valid header word inside a
    /// managed heap region.
    pub unsafe fn from_payload(payload: NonNull<u8>) -> BlockPtr {
        debug_assert!(payload.as_ptr() as usize % ALIGNMENT == 0);
        BlockPtr { payload }
    }

    pub fn payload(self) -> NonNull<u8> {
        self.payload
    }

    fn header_ptr(self) -> *mut u32 {
        // The header sits one word below the payload; payloads are 8-aligned,
        // so the header word is 4-aligned.
        unsafe { self.payload.as_ptr().sub(WSIZE) as *mut u32 }
    }

    pub unsafe fn header(self) -> Tag {
        Tag(self.header_ptr().read())
    }

    pub unsafe fn set_header(self, tag: Tag) {
        self.header_ptr().write(tag.raw());
    }

    /// Write the footer word for this block's current size.
    ///
    /// Only meaningful for free blocks; allocated blocks do not maintain a
    /// footer and their last word belongs to the payload.
    pub unsafe fn set_footer(self, tag: Tag) {
        let footer = self.payload.as_ptr().add(tag.size() - DSIZE) as *mut u32;
        footer.write(tag.raw());
    }

    /// Read the footer word back. Only meaningful for free blocks.
    pub unsafe fn footer(self) -> Tag {
        let ptr = self.payload.as_ptr().add(self.size() - DSIZE) as *mut u32;
        Tag(ptr.read())
    }

    pub unsafe fn size(self) -> usize {
        self.header().size()
    }

    pub unsafe fn is_allocated(self) -> bool {
        self.header().is_allocated()
    }

    pub unsafe fn prev_allocated(self) -> bool {
        self.header().prev_allocated()
    }

    /// Flip the PREV_ALLOC bit on this block's header, leaving the size and
    /// ALLOC bits untouched.
    pub unsafe fn set_prev_allocated(self, prev_allocated: bool) {
        let ptr = self.header_ptr();
        let word = ptr.read();
        if prev_allocated {
            ptr.write(word | PREV_ALLOC_BIT);
        } else {
            ptr.write(word & !PREV_ALLOC_BIT);
        }
    }

    /// The block immediately after this one in heap order. On the last real
    /// block this lands on the epilogue, whose size reads as zero.
    pub unsafe fn next(self) -> BlockPtr {
        let ptr = self.payload.as_ptr().add(self.size());
        BlockPtr {
            payload: NonNull::new_unchecked(ptr),
        }
    }

    /// The block immediately before this one in heap order.
    ///
    /// # Safety
    ///
    /// Valid only while the previous block is free: the size is read from the
    /// previous block's footer, and an allocated neighbour's footer bytes are
    /// payload. Check `prev_allocated()` first.
    pub unsafe fn prev(self) -> BlockPtr {
        let footer = self.payload.as_ptr().sub(DSIZE) as *mut u32;
        let prev_size = Tag(footer.read()).size();
        let ptr = self.payload.as_ptr().sub(prev_size);
        BlockPtr {
            payload: NonNull::new_unchecked(ptr),
        }
    }

    /// This block's link-slot offset from the heap anchor.
    ///
    /// Real payloads always sit above the anchor, so the offset is nonzero
    /// and 0 can stand for "no block".
    pub unsafe fn offset_from(self, base: NonNull<u8>) -> u32 {
        let off = self.payload.as_ptr() as usize - base.as_ptr() as usize;
        debug_assert!(off != 0 && off <= u32::MAX as usize);
        off as u32
    }

    /// Reconstruct a block from a stored link offset; 0 decodes to `None`.
    pub unsafe fn from_offset(base: NonNull<u8>, offset: u32) -> Option<BlockPtr> {
        if offset == 0 {
            return None;
        }
        let ptr = base.as_ptr().add(offset as usize);
        Some(BlockPtr {
            payload: NonNull::new_unchecked(ptr),
        })
    }

    // The two payload words of a free block hold its list links: the first
    // word is the previous free block, the second the next. Both are offsets
    // from the heap anchor.

    fn prev_link_ptr(self) -> *mut u32 {
        self.payload.as_ptr() as *mut u32
    }

    fn next_link_ptr(self) -> *mut u32 {
        unsafe { self.payload.as_ptr().add(WSIZE) as *mut u32 }
    }

    pub unsafe fn prev_free(self, base: NonNull<u8>) -> Option<BlockPtr> {
        BlockPtr::from_offset(base, self.prev_link_ptr().read())
    }

    pub unsafe fn next_free(self, base: NonNull<u8>) -> Option<BlockPtr> {
        BlockPtr::from_offset(base, self.next_link_ptr().read())
    }

    pub unsafe fn set_prev_free(self, base: NonNull<u8>, prev: Option<BlockPtr>) {
        let off = prev.map_or(0, |b| b.offset_from(base));
        self.prev_link_ptr().write(off);
    }

    pub unsafe fn set_next_free(self, base: NonNull<u8>, next: Option<BlockPtr>) {
        let off = next.map_or(0, |b| b.offset_from(base));
        self.next_link_ptr().write(off);
    }
}

/// Round a byte count up to the next multiple of `DSIZE`.
pub fn round_up(bytes: usize) -> usize {
    (bytes + DSIZE - 1) & !(DSIZE - 1)
}
