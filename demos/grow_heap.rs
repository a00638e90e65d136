//! This is a very minimal example to show using a HeapSource directly.

#[cfg(feature = "use_libc")]
use tag_allocator::allocators::LibcHeapSource;
#[cfg(not(feature = "use_libc"))]
use tag_allocator::allocators::SyscallHeapSource;
use tag_allocator::HeapSource;

fn main() {
    #[cfg(feature = "use_libc")]
    let mut source = LibcHeapSource::default();
    #[cfg(not(feature = "use_libc"))]
    let mut source = SyscallHeapSource::default();

    let p = unsafe { source.extend(64) };
    match p {
        Ok(ptr) => {
            println!("Extended by 64 bytes at {:p}", ptr);
            println!("Region now spans {:p}..{:p}", source.lo(), source.hi());
        }
        Err(err) => println!("The break would not move: {:?}", err),
    }
}
