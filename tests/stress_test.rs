use core::ptr::null_mut;

use tag_allocator::{ArrayHeap, Heap};

use rand::distributions::Distribution;
use rand::seq::SliceRandom;
use rand::{RngCore, SeedableRng};
use test_log::test;

// Bytes the initial frame consumes: pad word, prologue, epilogue.
const FRAME_OVERHEAD: usize = 24;

fn validate(heap: &Heap<ArrayHeap>) {
    let (validity, stats) = heap.check();
    log::debug!("Validity: {:?}, Stats: {:?}", validity, stats);
    assert!(validity.is_valid(), "invalid heap: {:?}", validity);

    // Every byte of the region is accounted for by exactly one block.
    if stats.heap_bytes > 0 {
        assert_eq!(
            stats.allocated_bytes + stats.free_bytes + FRAME_OVERHEAD,
            stats.heap_bytes
        );
    }
}

#[test]
fn test_stress() {
    let mut heap = Heap::new(ArrayHeap::default());

    // A table of live allocations: pointer, requested size, fill byte.
    // A null pointer means the slot is empty.
    let mut pointers: [(*mut u8, usize, u8); 128] = [(null_mut(), 0, 0); 128];

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);
    let range = rand::distributions::Uniform::new_inclusive(1usize, 32);

    for _ in 0..1024 * 10 {
        let chosen = pointers.choose_mut(&mut rng).unwrap();
        let &mut (ptr, size, fill) = chosen;

        if ptr.is_null() {
            // Allocate, and stamp the payload so corruption shows up later.
            let new_size = range.sample(&mut rng) * range.sample(&mut rng);
            let fill = rng.next_u32() as u8;
            let new_ptr = unsafe { heap.allocate(new_size) };
            assert!(!new_ptr.is_null());
            unsafe { core::ptr::write_bytes(new_ptr, fill, new_size) };
            *chosen = (new_ptr, new_size, fill);
        } else {
            // The stamp must have survived everything since.
            let contents = unsafe { core::slice::from_raw_parts(ptr, size) };
            assert!(contents.iter().all(|&b| b == fill));

            if rng.next_u32() % 4 == 0 {
                // Resize instead of freeing; the common prefix must survive
                // the move.
                let new_size = range.sample(&mut rng) * range.sample(&mut rng);
                let new_ptr = unsafe { heap.reallocate(ptr, new_size) };
                assert!(!new_ptr.is_null());
                let kept = size.min(new_size);
                let contents = unsafe { core::slice::from_raw_parts(new_ptr, kept) };
                assert!(contents.iter().all(|&b| b == fill));
                unsafe { core::ptr::write_bytes(new_ptr, fill, new_size) };
                *chosen = (new_ptr, new_size, fill);
            } else {
                unsafe { heap.deallocate(ptr) };
                *chosen = (null_mut(), 0, 0);
            }
        }

        // And validate that everything is ok
        validate(&heap);
    }

    // Drain the table; the heap should collapse back to a single free block.
    for chosen in pointers.iter_mut() {
        let &mut (ptr, size, fill) = chosen;
        if ptr.is_null() {
            continue;
        }
        let contents = unsafe { core::slice::from_raw_parts(ptr, size) };
        assert!(contents.iter().all(|&b| b == fill));
        unsafe { heap.deallocate(ptr) };
        *chosen = (null_mut(), 0, 0);
    }

    validate(&heap);
    let (_, stats) = heap.check();
    assert_eq!(stats.allocated_bytes, 0);
    assert_eq!(stats.free_blocks, 1);
}
