use tag_allocator::UnixAllocator;

#[global_allocator]
static A: UnixAllocator = UnixAllocator::new();

fn main() {
    env_logger::init();
    println!("Hello, World!");

    let s: String = "abc".to_owned();
    println!("Got a string {}", s);

    let mut v = vec![0, 1, 2, 3];
    for n in 10..2048 {
        v.push(n);
    }
    println!("Got a vec {}", v.len());

    let (validity, stats) = A.stats();
    println!("Heap valid: {}; stats: {:?}", validity.is_valid(), stats);
}
