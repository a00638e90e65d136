//! The heap engine: placement, splitting, coalescing, and growth.
//!
//! A [`Heap`] owns one contiguous region obtained from a [`HeapSource`] and
//! carves it into boundary-tagged blocks. The region only ever grows, at its
//! high end; freed blocks are recycled through the segregated index in
//! [`crate::seglist`] rather than returned to the source.
//!
//! The region is framed by two sentinels. At the low end sits the prologue,
//! an allocated minimum-size block that guarantees every real block has a
//! left neighbour with a defined ALLOC state. At the high end sits the
//! epilogue, a zero-sized allocated header word that stops forward walks and
//! marks where the next extension will graft on.

use core::cmp;
use core::fmt;
use core::ptr::{self, null_mut, NonNull};

use log::{debug, warn};

use crate::allocators::HeapSource;
use crate::block::{round_up, BlockPtr, Tag, ALIGNMENT, DSIZE, MAX_BLOCK, MIN_BLOCK, WSIZE};
use crate::seglist::{class_of, SegList, CLASS_COUNT};

/// Smallest extension requested from the source on a placement miss.
pub const CHUNK_SIZE: usize = 4096;

/// Placement examines at most this many fitting blocks before settling for
/// the best seen so far.
pub const MAX_FIT: usize = 6;

/// Bytes consumed by the initial frame: one pad word, the prologue block,
/// and the epilogue word.
const INIT_FRAME: usize = 6 * WSIZE;

/// The block size an allocation request of `request` payload bytes occupies:
/// one header word of overhead, rounded up to the double-word granularity,
/// never below the minimum block.
pub fn block_size(request: usize) -> usize {
    match request.checked_add(WSIZE + DSIZE - 1) {
        Some(n) => cmp::max(MIN_BLOCK, n & !(DSIZE - 1)),
        None => usize::MAX,
    }
}

/// Violation counts from a full heap check. All zeroes means the heap is
/// consistent.
#[derive(Default, Debug)]
pub struct Validity {
    /// Blocks whose size is not a positive double-word multiple.
    pub bad_sizes: usize,
    /// Payload pointers that are not double-word aligned.
    pub misaligned_payloads: usize,
    /// Pairs of adjacent blocks that are both free; the coalescer should
    /// have merged them.
    pub adjacent_free_pairs: usize,
    /// Headers whose PREV_ALLOC bit disagrees with the left neighbour's
    /// ALLOC bit.
    pub prev_alloc_mismatches: usize,
    /// Free blocks whose footer is not a copy of their header.
    pub footer_mismatches: usize,
    /// Disagreements between the heap walk and the free-list index: listed
    /// blocks that are allocated or in the wrong class, broken back links,
    /// or a population mismatch.
    pub list_mismatches: usize,
    /// Damaged prologue or epilogue sentinels.
    pub bad_fences: usize,
}

impl Validity {
    pub fn is_valid(&self) -> bool {
        self.bad_sizes == 0
            && self.misaligned_payloads == 0
            && self.adjacent_free_pairs == 0
            && self.prev_alloc_mismatches == 0
            && self.footer_mismatches == 0
            && self.list_mismatches == 0
            && self.bad_fences == 0
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

#[derive(Default, Debug)]
pub struct Stats {
    /// Real blocks between the sentinels.
    pub blocks: usize,
    pub free_blocks: usize,
    /// Bytes in allocated blocks, headers included.
    pub allocated_bytes: usize,
    /// Bytes in free blocks.
    pub free_bytes: usize,
    /// Total region size, sentinels included.
    pub heap_bytes: usize,
}

// The mutable heart of a heap: the anchor, the fences, and the free index.
// Created on first use, and never torn down; the region outlives everything.
struct HeapState {
    lo: NonNull<u8>,
    // The anchor all 32-bit link offsets are relative to (prologue end).
    base: NonNull<u8>,
    // The epilogue, viewed as a zero-sized block: its header word is the
    // last word of the region, and its payload is where the region would
    // grow next.
    epilogue: BlockPtr,
    free: SegList,
}

// HeapState is a bundle of raw pointers into a region that the owning Heap
// keeps alive; moving it between threads moves the whole heap with it.
unsafe impl Send for HeapState {}

impl HeapState {
    /// Carve the initial frame out of a fresh source.
    fn bootstrap<S: HeapSource>(source: &mut S) -> Result<HeapState, S::Err> {
        let lo = unsafe { source.extend(INIT_FRAME)? };
        unsafe {
            let words = lo.as_ptr() as *mut u32;
            let prologue = Tag::new(MIN_BLOCK, true, false);
            words.write(0); // pad, so payloads land on double-word boundaries
            words.add(1).write(prologue.raw());
            words.add(2).write(0); // prologue link slots stay null
            words.add(3).write(0);
            words.add(4).write(prologue.raw());
            words.add(5).write(Tag::epilogue(true).raw());

            let base = NonNull::new_unchecked(lo.as_ptr().add(MIN_BLOCK));
            let epilogue =
                BlockPtr::from_payload(NonNull::new_unchecked(lo.as_ptr().add(INIT_FRAME)));
            Ok(HeapState {
                lo,
                base,
                epilogue,
                free: SegList::new(base),
            })
        }
    }

    // The first real block, directly after the initial frame.
    unsafe fn first_block(&self) -> BlockPtr {
        BlockPtr::from_payload(NonNull::new_unchecked(self.lo.as_ptr().add(INIT_FRAME)))
    }

    /// Bounded best fit over the segregated index.
    ///
    /// Starts at the class the request maps to and walks upward. Tracks the
    /// smallest fitting block seen; gives up the hunt for a better one after
    /// `MAX_FIT` fits, or at the end of the first class that produced any
    /// fit (later classes only hold larger blocks).
    unsafe fn find_fit(&self, size: usize) -> Option<BlockPtr> {
        let mut best: Option<BlockPtr> = None;
        let mut best_size = 0;
        let mut fits = 0;

        for class in class_of(size)..CLASS_COUNT {
            let mut cursor = self.free.head(class);
            while let Some(block) = cursor {
                cursor = block.next_free(self.free.base());
                let found = block.size();
                if found < size {
                    continue;
                }
                if best.is_none() || found < best_size {
                    best = Some(block);
                    best_size = found;
                }
                fits += 1;
                if fits == MAX_FIT {
                    return best;
                }
            }
            if best.is_some() {
                return best;
            }
        }
        best
    }

    /// Turn the free block `block` into an allocated block of `size` bytes,
    /// splitting off the tail when enough remains for a standalone block.
    unsafe fn build(&mut self, block: BlockPtr, size: usize) {
        self.free.remove(block);
        let blksize = block.size();
        let prev_allocated = block.prev_allocated();

        if blksize - size > MIN_BLOCK {
            // Allocated blocks carry no footer; the header alone suffices.
            block.set_header(Tag::new(size, true, prev_allocated));
            let rest = block.next();
            let rest_tag = Tag::new(blksize - size, false, true);
            rest.set_header(rest_tag);
            rest.set_footer(rest_tag);
            self.coalesce(rest);
        } else {
            // Too little left over to split; the caller gets the slack.
            block.set_header(Tag::new(blksize, true, prev_allocated));
            block.next().set_prev_allocated(true);
        }
    }

    /// Merge a newly freed block with whichever neighbours are free and
    /// insert the survivor into the index.
    ///
    /// `block` must already be framed as free (header and footer written)
    /// but not yet listed.
    unsafe fn coalesce(&mut self, block: BlockPtr) -> BlockPtr {
        let prev_free = !block.prev_allocated();
        let next = block.next();
        let next_free = !next.is_allocated();

        let merged = match (prev_free, next_free) {
            (false, false) => {
                next.set_prev_allocated(false);
                block
            }
            (false, true) => {
                self.free.remove(next);
                let tag = Tag::new(block.size() + next.size(), false, true);
                block.set_header(tag);
                block.set_footer(tag);
                block
            }
            (true, false) => {
                let prev = block.prev();
                self.free.remove(prev);
                let tag = Tag::new(prev.size() + block.size(), false, prev.prev_allocated());
                prev.set_header(tag);
                prev.set_footer(tag);
                next.set_prev_allocated(false);
                prev
            }
            (true, true) => {
                let prev = block.prev();
                self.free.remove(prev);
                self.free.remove(next);
                let tag = Tag::new(
                    prev.size() + block.size() + next.size(),
                    false,
                    prev.prev_allocated(),
                );
                prev.set_header(tag);
                prev.set_footer(tag);
                prev
            }
        };

        self.free.insert(merged);
        merged
    }

    /// Flip an allocated block to free and hand it to the coalescer.
    unsafe fn release(&mut self, block: BlockPtr) {
        let header = block.header();
        let tag = Tag::new(header.size(), false, header.prev_allocated());
        block.set_header(tag);
        block.set_footer(tag);
        self.coalesce(block);
    }

    /// Grow the region by at least `bytes` and frame the new space as one
    /// free block.
    ///
    /// The old epilogue word becomes the new block's header (keeping its
    /// PREV_ALLOC bit), and a fresh epilogue is written at the new high end.
    /// The new block is coalesced, so it merges with a free old tail.
    unsafe fn extend<S: HeapSource>(&mut self, source: &mut S, bytes: usize) -> Option<BlockPtr> {
        let bytes = round_up(bytes);
        let ptr = match source.extend(bytes) {
            Ok(ptr) => ptr,
            Err(_) => return None,
        };
        let block = self.epilogue;
        debug_assert_eq!(ptr.as_ptr(), block.payload().as_ptr());

        let tag = Tag::new(bytes, false, block.prev_allocated());
        block.set_header(tag);
        block.set_footer(tag);
        self.epilogue = block.next();
        self.epilogue.set_header(Tag::epilogue(false));

        Some(self.coalesce(block))
    }

    unsafe fn check(&self) -> (Validity, Stats) {
        let mut validity = Validity::default();
        let mut stats = Stats::default();
        stats.heap_bytes = self.epilogue.payload().as_ptr() as usize - self.lo.as_ptr() as usize;

        let prologue =
            BlockPtr::from_payload(NonNull::new_unchecked(self.lo.as_ptr().add(DSIZE)));
        if prologue.header() != Tag::new(MIN_BLOCK, true, false) {
            validity.bad_fences += 1;
        }

        let mut prev_allocated = true;
        let mut prev_was_free = false;
        let mut block = self.first_block();
        while block.size() != 0 {
            let header = block.header();
            let size = header.size();
            if size % DSIZE != 0 || size < MIN_BLOCK {
                // A garbage size makes further navigation meaningless.
                validity.bad_sizes += 1;
                break;
            }
            if block.payload().as_ptr() as usize % ALIGNMENT != 0 {
                validity.misaligned_payloads += 1;
            }
            if header.prev_allocated() != prev_allocated {
                validity.prev_alloc_mismatches += 1;
            }
            if header.is_allocated() {
                stats.allocated_bytes += size;
            } else {
                stats.free_blocks += 1;
                stats.free_bytes += size;
                if prev_was_free {
                    validity.adjacent_free_pairs += 1;
                }
                if block.footer().raw() != header.raw() {
                    validity.footer_mismatches += 1;
                }
            }
            stats.blocks += 1;
            prev_allocated = header.is_allocated();
            prev_was_free = !header.is_allocated();
            block = block.next();
        }

        if block != self.epilogue {
            validity.bad_fences += 1;
        }
        let epilogue = self.epilogue.header();
        if !epilogue.is_allocated() || epilogue.size() != 0 {
            validity.bad_fences += 1;
        }
        if epilogue.prev_allocated() != prev_allocated {
            validity.prev_alloc_mismatches += 1;
        }

        // Sweep the index against the walk: every listed block free, in its
        // own class, back-linked consistently, and none missing.
        let mut listed = 0;
        for class in 0..CLASS_COUNT {
            let mut prev: Option<BlockPtr> = None;
            let mut cursor = self.free.head(class);
            while let Some(block) = cursor {
                listed += 1;
                if block.is_allocated() || class_of(block.size()) != class {
                    validity.list_mismatches += 1;
                }
                if block.prev_free(self.free.base()) != prev {
                    validity.list_mismatches += 1;
                }
                prev = Some(block);
                cursor = block.next_free(self.free.base());
                if listed > stats.blocks + CLASS_COUNT {
                    // A cycle; bail out instead of spinning.
                    validity.list_mismatches += 1;
                    return (validity, stats);
                }
            }
        }
        if listed != stats.free_blocks {
            validity.list_mismatches += 1;
        }

        (validity, stats)
    }
}

/// A growable boundary-tag heap over a [`HeapSource`].
///
/// All bookkeeping lives inside the managed region itself; the `Heap` value
/// holds only the source and a handful of pointers into it. The heap
/// initializes itself lazily on first use, so constructing one is free and
/// `const`.
///
/// The heap is single-threaded: nothing here locks, and callers sharing one
/// across threads must serialize access themselves (see
/// [`crate::allocators::GenericAllocator`] for the packaged way to do that).
pub struct Heap<S> {
    pub source: S,
    state: Option<HeapState>,
}

impl<S: HeapSource + Default> Default for Heap<S> {
    fn default() -> Heap<S> {
        Heap::new(S::default())
    }
}

impl<S: HeapSource> Heap<S> {
    pub const fn new(source: S) -> Heap<S> {
        Heap {
            source,
            state: None,
        }
    }

    /// Set up the initial frame. Idempotent; a failure leaves the heap
    /// untouched and retryable.
    pub fn init(&mut self) -> Result<(), S::Err> {
        if self.state.is_none() {
            self.state = Some(HeapState::bootstrap(&mut self.source)?);
        }
        Ok(())
    }

    /// Allocate `size` payload bytes.
    ///
    /// Returns a double-word aligned pointer to at least `size` usable
    /// bytes, or null when `size` is zero, too large to frame, or the
    /// source refuses to grow.
    ///
    /// # Safety
    ///
    /// The heap's region must not have been corrupted through the returned
    /// pointers (out-of-bounds writes clobber neighbouring tags).
    pub unsafe fn allocate(&mut self, size: usize) -> *mut u8 {
        if size == 0 {
            return null_mut();
        }
        let needed = block_size(size);
        if needed > MAX_BLOCK {
            return null_mut();
        }
        if self.init().is_err() {
            return null_mut();
        }
        let Heap { source, state } = self;
        let state = match state.as_mut() {
            Some(state) => state,
            None => return null_mut(),
        };

        let block = match state.find_fit(needed) {
            Some(block) => block,
            None => match state.extend(source, cmp::max(needed, CHUNK_SIZE)) {
                Some(block) => block,
                None => {
                    debug!("allocate({}): source refused to grow", size);
                    return null_mut();
                }
            },
        };
        state.build(block, needed);
        debug!(
            "allocate({}) -> {:?} in a {}-byte block",
            size,
            block.payload(),
            block.size()
        );
        block.payload().as_ptr()
    }

    /// Return a block to the heap. `ptr` must have come from this heap's
    /// allocation entry points; null is a no-op.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live pointer previously returned by this
    /// heap and not yet deallocated.
    pub unsafe fn deallocate(&mut self, ptr: *mut u8) {
        let ptr = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return,
        };
        let state = match self.state.as_mut() {
            Some(state) => state,
            None => return,
        };
        debug!("deallocate({:?})", ptr);
        state.release(BlockPtr::from_payload(ptr));
    }

    /// Resize an allocation, moving it.
    ///
    /// `size == 0` frees `ptr` and returns null; a null `ptr` is a plain
    /// allocation. On failure the old block is left untouched and null is
    /// returned.
    ///
    /// # Safety
    ///
    /// As for [`Heap::allocate`] and [`Heap::deallocate`].
    pub unsafe fn reallocate(&mut self, ptr: *mut u8, size: usize) -> *mut u8 {
        if size == 0 {
            self.deallocate(ptr);
            return null_mut();
        }
        let old = match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => return self.allocate(size),
        };
        let new_ptr = self.allocate(size);
        if new_ptr.is_null() {
            return null_mut();
        }

        let old_block = BlockPtr::from_payload(old);
        let new_block = BlockPtr::from_payload(NonNull::new_unchecked(new_ptr));
        // Payload capacity is the block size minus the header word.
        let copy = cmp::min(old_block.size(), new_block.size()) - WSIZE;
        ptr::copy_nonoverlapping(old.as_ptr(), new_ptr, copy);
        self.deallocate(old.as_ptr());
        new_ptr
    }

    /// Allocate `count * size` bytes, zero-filled. Fails (null) on overflow
    /// of the product, like the allocation itself.
    ///
    /// # Safety
    ///
    /// As for [`Heap::allocate`].
    pub unsafe fn zero_allocate(&mut self, count: usize, size: usize) -> *mut u8 {
        let bytes = match count.checked_mul(size) {
            Some(bytes) => bytes,
            None => return null_mut(),
        };
        let ptr = self.allocate(bytes);
        if !ptr.is_null() {
            ptr::write_bytes(ptr, 0, bytes);
        }
        ptr
    }

    /// Walk the whole heap and cross-check it against the free-list index.
    pub fn check(&self) -> (Validity, Stats) {
        match self.state {
            Some(ref state) => unsafe { state.check() },
            None => (Validity::default(), Stats::default()),
        }
    }

    /// Diagnostic hook: run [`Heap::check`], log complaints, and return
    /// whether the heap is consistent. With `verbose`, also log the block
    /// map and stats.
    pub fn check_heap(&self, verbose: bool) -> bool {
        let (validity, stats) = self.check();
        if verbose {
            debug!("heap map: {}", self);
            debug!("heap stats: {:?}", stats);
        }
        if !validity.is_valid() {
            warn!("heap inconsistency: {:?}", validity);
        }
        validity.is_valid()
    }
}

impl<S> fmt::Display for Heap<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.state {
            Some(ref state) => state,
            None => return write!(f, "Heap(uninitialized)"),
        };
        write!(f, "Heap(")?;
        let mut start = true;
        unsafe {
            let mut block = state.first_block();
            while block.size() != 0 {
                if !start {
                    write!(f, ", ")?;
                } else {
                    start = false;
                }
                let tag = block.header();
                write!(
                    f,
                    "{}({:?}, {})",
                    if tag.is_allocated() { "Alloc" } else { "Free" },
                    block.payload(),
                    tag.size()
                )?;
                block = block.next();
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::allocators::ArrayHeap;

    use test_log::test;

    fn assert_valid(heap: &Heap<ArrayHeap>) -> Stats {
        let (validity, stats) = heap.check();
        log::info!("heap: {}", heap);
        assert!(validity.is_valid(), "invalid heap: {:?}", validity);
        stats
    }

    unsafe fn block_of(ptr: *mut u8) -> BlockPtr {
        BlockPtr::from_payload(NonNull::new_unchecked(ptr))
    }

    #[test]
    fn first_allocation_frames_the_heap() {
        let mut heap = Heap::new(ArrayHeap::default());

        let p = unsafe { heap.allocate(1) };
        assert!(!p.is_null());
        assert_eq!(p as usize % ALIGNMENT, 0);

        let stats = assert_valid(&heap);
        // One minimum block for the request, the rest of the chunk free.
        assert_eq!(stats.blocks, 2);
        assert_eq!(stats.allocated_bytes, MIN_BLOCK);
        assert_eq!(stats.free_blocks, 1);
        assert_eq!(stats.free_bytes, CHUNK_SIZE - MIN_BLOCK);
        assert_eq!(stats.heap_bytes, CHUNK_SIZE + INIT_FRAME);
    }

    #[test]
    fn split_then_coalesce_in_both_directions() {
        let mut heap = Heap::new(ArrayHeap::default());

        unsafe {
            let first = heap.allocate(32);
            let middle = heap.allocate(32);
            let last = heap.allocate(32);
            assert_valid(&heap);
            // 32 payload bytes plus the header word round to a 40-byte block.
            assert_eq!(block_of(first).size(), 40);

            heap.deallocate(middle);
            let stats = assert_valid(&heap);
            let middle_block = block_of(middle);
            assert_eq!(middle_block.size(), 40);
            assert!(!middle_block.is_allocated());
            // The freed middle plus the tail of the first chunk.
            assert_eq!(stats.free_blocks, 2);

            heap.deallocate(first);
            let stats = assert_valid(&heap);
            // First and middle merge; the tail stays separate behind `last`.
            assert_eq!(stats.free_blocks, 2);
            assert_eq!(block_of(first).size(), 80);

            heap.deallocate(last);
            let stats = assert_valid(&heap);
            // Everything from the first block through the tail is one block.
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.free_bytes, CHUNK_SIZE);
            assert_eq!(stats.allocated_bytes, 0);
        }
    }

    #[test]
    fn requests_route_through_their_size_class() {
        let mut heap = Heap::new(ArrayHeap::default());

        unsafe {
            let a = heap.allocate(100);
            let _guard1 = heap.allocate(8);
            let b = heap.allocate(5000);
            let _guard2 = heap.allocate(8);
            assert_eq!(block_of(a).size(), 104);
            assert_eq!(block_of(b).size(), 5008);

            heap.deallocate(a);
            heap.deallocate(b);
            assert_valid(&heap);

            // Exact-size blocks wait in their classes; equal requests come
            // straight back to them rather than splitting the big tail.
            let a2 = heap.allocate(100);
            assert_eq!(a2, a);
            assert_eq!(block_of(a2).size(), 104);

            let b2 = heap.allocate(5000);
            assert_eq!(b2, b);
            assert_eq!(block_of(b2).size(), 5008);
            assert_valid(&heap);
        }
    }

    // Frame a run of exact-size free blocks, separated by allocated guards
    // so they cannot coalesce. `payloads` are request sizes; each occupies
    // `payload + 4` rounded bytes.
    unsafe fn free_run(heap: &mut Heap<ArrayHeap>, payloads: &[usize]) {
        let mut targets = [null_mut(); 16];
        assert!(payloads.len() <= targets.len());
        for (slot, &payload) in targets.iter_mut().zip(payloads) {
            *slot = heap.allocate(payload);
            heap.allocate(8); // guard
        }
        for &target in targets.iter().take(payloads.len()) {
            heap.deallocate(target);
        }
    }

    #[test]
    fn best_fit_prefers_the_tightest_block() {
        let mut heap = Heap::new(ArrayHeap::default());

        unsafe {
            // Block sizes 48, 64, 32, 40, 56, 72, 96, 40.
            free_run(&mut heap, &[44, 60, 28, 36, 52, 68, 92, 36]);
            assert_valid(&heap);

            // A 40-byte block fits a 36-byte request exactly; the 48 in the
            // same class loses.
            let p = heap.allocate(36);
            assert_eq!(block_of(p).size(), 40);

            // A 50-byte request adjusts to 56; the 64 loses to the 56.
            let q = heap.allocate(50);
            assert_eq!(block_of(q).size(), 56);
            assert_valid(&heap);
        }
    }

    #[test]
    fn fit_hunt_stops_after_max_fit_candidates() {
        let mut heap = Heap::new(ArrayHeap::default());

        unsafe {
            // Seven fitting blocks in one class, list order descending, so
            // the true best sits seventh: the hunt stops one short of it.
            free_run(&mut heap, &[76, 84, 92, 100, 108, 116, 124]);
            assert_valid(&heap);

            let p = heap.allocate(76); // needs an 80-byte block
            assert_eq!(block_of(p).size(), 88);
            assert_valid(&heap);
        }
    }

    #[test]
    fn reallocate_preserves_the_payload_prefix() {
        let mut heap = Heap::new(ArrayHeap::default());

        unsafe {
            let p = heap.allocate(24);
            ptr::write_bytes(p, 0xAB, 24);

            let q = heap.reallocate(p, 1024);
            assert!(!q.is_null());
            let contents = core::slice::from_raw_parts(q, 24);
            assert!(contents.iter().all(|&b| b == 0xAB));
            assert_valid(&heap);
        }
    }

    #[test]
    fn reallocate_edge_cases() {
        let mut heap = Heap::new(ArrayHeap::default());

        unsafe {
            // Null pointer: plain allocation.
            let p = heap.reallocate(null_mut(), 48);
            assert!(!p.is_null());

            // Zero size: free and return null.
            let q = heap.reallocate(p, 0);
            assert!(q.is_null());
            let stats = assert_valid(&heap);
            assert_eq!(stats.allocated_bytes, 0);
        }
    }

    #[test]
    fn zero_allocate_zeroes_and_checks_overflow() {
        let mut heap = Heap::new(ArrayHeap::default());

        unsafe {
            // Dirty a region first so the zeroing is observable.
            let p = heap.allocate(64);
            ptr::write_bytes(p, 0xFF, 64);
            heap.deallocate(p);

            let q = heap.zero_allocate(8, 8);
            assert!(!q.is_null());
            let contents = core::slice::from_raw_parts(q, 64);
            assert!(contents.iter().all(|&b| b == 0));

            assert!(heap.zero_allocate(usize::MAX, 16).is_null());
            assert_valid(&heap);
        }
    }

    #[test]
    fn trivial_requests() {
        let mut heap = Heap::new(ArrayHeap::default());

        unsafe {
            assert!(heap.allocate(0).is_null());
            // Freeing null, even before the heap exists, is a no-op.
            heap.deallocate(null_mut());
            assert!(heap.zero_allocate(0, 32).is_null());
            // An unframeable request fails cleanly.
            assert!(heap.allocate(usize::MAX - 64).is_null());
        }
        let (validity, stats) = heap.check();
        assert!(validity.is_valid());
        assert_eq!(stats.heap_bytes, 0);
    }

    #[test]
    fn free_then_equal_alloc_reuses_the_block() {
        let mut heap = Heap::new(ArrayHeap::default());

        unsafe {
            let p = heap.allocate(40);
            heap.deallocate(p);
            let q = heap.allocate(40);
            assert_eq!(p, q);
            assert_valid(&heap);
        }
    }

    #[test]
    fn alignment_and_capacity_hold_across_sizes() {
        let mut heap = Heap::new(ArrayHeap::default());

        unsafe {
            for size in 1..100usize {
                let p = heap.allocate(size);
                assert!(!p.is_null());
                assert_eq!(p as usize % ALIGNMENT, 0);
                assert!(block_of(p).size() - WSIZE >= size);
                ptr::write_bytes(p, size as u8, size);
                if size % 3 == 0 {
                    heap.deallocate(p);
                }
            }
            assert_valid(&heap);
        }
    }

    #[test]
    fn exhaustion_returns_null_and_leaves_the_heap_usable() {
        let mut heap = Heap::new(ArrayHeap::with_limit(64 * 1024));
        let mut held = [null_mut(); 128];
        let mut count = 0;

        unsafe {
            loop {
                let p = heap.allocate(1024);
                if p.is_null() {
                    break;
                }
                ptr::write_bytes(p, count as u8, 1024);
                held[count] = p;
                count += 1;
            }
            // The refusal left everything consistent.
            assert_valid(&heap);
            assert!(count >= 50);

            // Earlier allocations are intact and still freeable.
            for (i, &p) in held.iter().take(count).enumerate() {
                let contents = core::slice::from_raw_parts(p, 1024);
                assert!(contents.iter().all(|&b| b == i as u8));
            }
            for &p in held.iter().take(count) {
                heap.deallocate(p);
            }
            let stats = assert_valid(&heap);
            assert_eq!(stats.free_blocks, 1);
            assert_eq!(stats.allocated_bytes, 0);
        }
    }
}
