//! Allocator packaging, both generic and Unix-specific.
//!
//! ## Basic Types
//!
//! ### [`HeapSource`](trait.HeapSource.html)
//!
//! `HeapSource` is the trait interface to whatever provides the contiguous,
//! growable region the heap lives in: the program break on Unix, or a plain
//! array for tests.
//!
//! ### [`UnixAllocator`](struct.UnixAllocator.html)
//!
//! A `UnixAllocator` wraps the core [`Heap`](crate::heap::Heap) with a spin
//! lock to make it thread-safe, allowing it to be used as the global
//! allocator. It grows the region through the program break: with the
//! `use_libc` feature via `libc::sbrk`, otherwise with a direct `brk`
//! syscall.
//!
//! ### [`ArrayHeap`](struct.ArrayHeap.html)
//!
//! `ArrayHeap` is a static array that can pretend to be a growable region,
//! with an adjustable limit for provoking out-of-memory behaviour. It is
//! mainly useful for testing.

use core::alloc::{GlobalAlloc, Layout};
use core::mem::MaybeUninit;
use core::ptr::{null_mut, NonNull};
use core::sync::atomic::{AtomicU8, Ordering};

#[cfg(feature = "use_libc")]
use errno::Errno;
use spin::{Mutex, MutexGuard};

use crate::block::ALIGNMENT;
use crate::heap::{Heap, Stats, Validity};
#[cfg(not(feature = "use_libc"))]
use crate::unix::{self, BrkError};

/// The provider of the heap's underlying region.
///
/// Implementations model a single contiguous span of address space that
/// grows monotonically at its high end, `sbrk`-style.
pub trait HeapSource {
    type Err;

    /// Grow the region by exactly `size` bytes at its high end and return a
    /// pointer to the first new byte.
    ///
    /// # Safety
    ///
    /// This deals in raw, unowned memory. For the heap on top to function:
    ///
    /// - `size` must be a multiple of 8, and the first extension's return
    ///   must be 8-aligned (every later one then is, by construction).
    /// - Each successful call must return exactly the old high end: the
    ///   region stays contiguous, and nothing else may grow it in between.
    /// - The memory must stay valid, and at a stable address, for as long
    ///   as the source lives; a source backed by inline storage must not be
    ///   moved once it has been extended.
    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err>;

    /// Low end of the region; null (or empty) before the first extension.
    fn lo(&self) -> *const u8;

    /// High end of the region, one past the last valid byte.
    fn hi(&self) -> *const u8;
}

/// LibcHeapSource grows the region by moving the program break with
/// `libc::sbrk`.
#[cfg(feature = "use_libc")]
pub struct LibcHeapSource {
    lo: *mut u8,
    hi: *mut u8,
    // Just for tracking, not really needed
    pub growths: usize,
}

#[cfg(feature = "use_libc")]
impl Default for LibcHeapSource {
    fn default() -> Self {
        LibcHeapSource {
            lo: null_mut(),
            hi: null_mut(),
            growths: 0,
        }
    }
}

#[cfg(feature = "use_libc")]
impl HeapSource for LibcHeapSource {
    type Err = Errno;

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        if self.hi.is_null() {
            // First call: nudge the break up to an 8-byte boundary so every
            // extension after this one starts aligned.
            let brk = libc::sbrk(0) as *mut u8;
            let pad = brk.align_offset(ALIGNMENT);
            if pad > 0 && libc::sbrk(pad as libc::intptr_t) as isize == -1 {
                return Err(errno::errno());
            }
            self.lo = brk.add(pad);
            self.hi = self.lo;
        }

        let ptr = libc::sbrk(size as libc::intptr_t);
        if ptr as isize == -1 {
            return Err(errno::errno());
        }
        let ptr = ptr as *mut u8;
        debug_assert_eq!(ptr, self.hi, "someone else moved the break");

        self.hi = self.hi.add(size);
        self.growths += 1;
        Ok(NonNull::new_unchecked(ptr))
    }

    fn lo(&self) -> *const u8 {
        self.lo
    }

    fn hi(&self) -> *const u8 {
        self.hi
    }
}

/// SyscallHeapSource grows the region by moving the program break with a
/// direct `brk` syscall.
#[cfg(not(feature = "use_libc"))]
pub struct SyscallHeapSource {
    lo: *mut u8,
    hi: *mut u8,
    // Just for tracking, not really needed
    pub growths: usize,
}

#[cfg(not(feature = "use_libc"))]
impl Default for SyscallHeapSource {
    fn default() -> Self {
        SyscallHeapSource {
            lo: null_mut(),
            hi: null_mut(),
            growths: 0,
        }
    }
}

#[cfg(not(feature = "use_libc"))]
impl HeapSource for SyscallHeapSource {
    type Err = BrkError;

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, BrkError> {
        if self.hi.is_null() {
            // A null argument queries the current break without moving it.
            let brk = unix::brk(null_mut());
            if brk.is_null() {
                return Err(BrkError);
            }
            let pad = brk.align_offset(ALIGNMENT);
            self.lo = brk.add(pad);
            self.hi = self.lo;
        }

        let target = self.hi.add(size);
        let got = unix::brk(target);
        if (got as usize) < target as usize {
            // The break did not move far enough: refused.
            return Err(BrkError);
        }

        let ptr = self.hi;
        self.hi = target;
        self.growths += 1;
        Ok(NonNull::new_unchecked(ptr))
    }

    fn lo(&self) -> *const u8 {
        self.lo
    }

    fn hi(&self) -> *const u8 {
        self.hi
    }
}

/// A thread-safe allocator, using a spin lock around a [`Heap`].
///
/// Thread-safety is required for an allocator to be used as a global
/// allocator, so that was easy to add with a spin lock. The heap itself
/// stays single-threaded; this wrapper is the external serialization it
/// asks its callers for.
pub struct GenericAllocator<S: HeapSource> {
    // Values:
    // - 0: Untouched
    // - 1: Initialization in progress
    // - 2: Initialized
    init: AtomicU8,
    raw: MaybeUninit<Mutex<Heap<S>>>,
}

// SAFETY: all access to `raw` is serialized through the `init` state
// machine and the inner `Mutex`, so the raw pointers held by `S` are never
// accessed concurrently even though they are not `Sync`/`Send` themselves.
unsafe impl<S: HeapSource> Sync for GenericAllocator<S> {}
unsafe impl<S: HeapSource> Send for GenericAllocator<S> {}

impl<S: HeapSource + Default> Default for GenericAllocator<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: HeapSource> GenericAllocator<S> {
    pub const fn new() -> Self {
        GenericAllocator {
            init: AtomicU8::new(0),
            raw: MaybeUninit::uninit(),
        }
    }
}

impl<S: HeapSource + Default> GenericAllocator<S> {
    /// Get a reference to the underlying heap.
    ///
    /// # Safety
    ///
    /// This is unsafe because it blocks allocation while the mutex guard is
    /// in place.
    pub unsafe fn get_raw(&self) -> MutexGuard<Heap<S>> {
        // The plan:
        // - Check if initialization hasn't started (0)
        // - If initializing hasn't yet started (0):
        //   - Mark it as initializing (1), then initialize, then mark it as fully initialized (2)
        // - If it has started but not completed (1):
        //   - Enter a spin loop until it is fully initialized (2)
        // - If it finished initializing (2):
        //   - Continue
        //
        // The ordering here is SeqCst because that's the safest, if not the
        // most efficient. This could probably be downgraded, but would require
        // some analysis and understanding to do so.
        let state = self
            .init
            .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst);

        match state {
            Err(2) => {
                // This is fully initialized, no need to do anything
            }
            Ok(0) => {
                // We haven't initialized, so we do that now.
                let raw_loc: *const Mutex<Heap<S>> = self.raw.as_ptr();
                let raw_mut: *mut Mutex<Heap<S>> = raw_loc as *mut Mutex<Heap<S>>;
                raw_mut.write(Mutex::new(Heap::default()));
                let mx: &mut Mutex<Heap<S>> = raw_mut.as_mut().unwrap();

                // Let other threads know that the mutex and heap are now
                // initialized, and they are free to use the mutex to access
                // the heap
                self.init.store(2, Ordering::SeqCst);
                return mx.lock();
            }
            Err(1) => {
                // Some other thread is currently initializing. We wait for it.

                // Spin while we wait for the state to become 2
                loop {
                    // Hint to the processor that we're in a spin loop
                    core::hint::spin_loop();

                    match self.init.load(Ordering::SeqCst) {
                        1 => continue,
                        2 => break,
                        state => panic!("Unexpected state {}", state),
                    }
                }
            }
            Ok(v) => panic!("Unexpected OK state loaded: {}", v),
            Err(v) => panic!("Unexpected Err state loaded: {}", v),
        }

        let ptr = self.raw.as_ptr().as_ref().unwrap();

        ptr.lock()
    }

    /// Check the heap's consistency and size, under the lock.
    pub fn stats(&self) -> (Validity, Stats) {
        unsafe { self.get_raw().check() }
    }
}

/// The ready-made process allocator: a spin-locked heap over the program
/// break.
#[derive(Default)]
pub struct UnixAllocator {
    #[cfg(not(feature = "use_libc"))]
    alloc: GenericAllocator<SyscallHeapSource>,

    #[cfg(feature = "use_libc")]
    alloc: GenericAllocator<LibcHeapSource>,
}

impl UnixAllocator {
    pub const fn new() -> Self {
        UnixAllocator {
            alloc: GenericAllocator::new(),
        }
    }

    pub fn stats(&self) -> (Validity, Stats) {
        self.alloc.stats()
    }
}

unsafe impl GlobalAlloc for UnixAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        // The heap hands out double-word aligned payloads and nothing more.
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.alloc.get_raw().allocate(layout.size())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        // The block's own header remembers its size; the layout is not
        // needed to free it.
        self.alloc.get_raw().deallocate(ptr)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.alloc.get_raw().reallocate(ptr, new_size)
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() > ALIGNMENT {
            return null_mut();
        }
        self.alloc.get_raw().zero_allocate(layout.size(), 1)
    }
}

const ARRAY_HEAP_CAPACITY: usize = 256 * 1024;

#[repr(align(8))]
struct ArrayStorage([u8; ARRAY_HEAP_CAPACITY]);

/// A fixed array pretending to be a growable region.
///
/// The `limit` caps how far the region may grow, which makes out-of-memory
/// paths easy to provoke in tests.
pub struct ArrayHeap {
    pub limit: usize,
    pub size: usize,
    storage: ArrayStorage,
}

impl Default for ArrayHeap {
    fn default() -> Self {
        ArrayHeap::with_limit(ARRAY_HEAP_CAPACITY)
    }
}

impl ArrayHeap {
    pub fn with_limit(limit: usize) -> ArrayHeap {
        ArrayHeap {
            limit: limit.min(ARRAY_HEAP_CAPACITY),
            size: 0,
            storage: ArrayStorage([0; ARRAY_HEAP_CAPACITY]),
        }
    }
}

/// The array ran out of room to pretend with.
#[derive(Debug)]
pub struct ArrayHeapOverflowError;

impl HeapSource for ArrayHeap {
    type Err = ArrayHeapOverflowError;

    unsafe fn extend(&mut self, size: usize) -> Result<NonNull<u8>, Self::Err> {
        if self.size + size > self.limit {
            return Err(ArrayHeapOverflowError);
        }
        let ptr = self.storage.0.as_mut_ptr().add(self.size);
        self.size += size;
        Ok(NonNull::new_unchecked(ptr))
    }

    fn lo(&self) -> *const u8 {
        self.storage.0.as_ptr()
    }

    fn hi(&self) -> *const u8 {
        self.storage.0.as_ptr().wrapping_add(self.size)
    }
}
