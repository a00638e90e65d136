//! A program that installs the allocator globally, churns through a large
//! number of randomly sized objects, and checks heap validity along the way.

use tag_allocator::UnixAllocator;

use rand::distributions::{Distribution, Uniform};
use rand::{Rng, RngCore, SeedableRng};

// This is the magic line that creates the allocator and uses it globally.
#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

// Total number of allocate/free steps.
const STEPS: usize = 64 * 1024;
// Log_2 of the largest object to allocate.
const LOG2_MAX_SIZE: usize = 18;

struct Churn {
    live: Vec<Vec<u8>>,
    log2_max_size: usize,
}

impl Churn {
    fn new(log2_max_size: usize) -> Self {
        Churn {
            live: Vec::new(),
            log2_max_size: log2_max_size.max(8),
        }
    }

    fn create<R: Rng>(&mut self, rng: &mut R) {
        let exp = Uniform::new_inclusive(3usize, self.log2_max_size).sample(rng);
        let len = Uniform::new_inclusive(1usize, 1 << exp).sample(rng);
        let fill = rng.next_u32() as u8;
        self.live.push(vec![fill; len]);
    }

    fn resize<R: Rng>(&mut self, rng: &mut R) {
        if self.live.is_empty() {
            return;
        }
        let ix = Uniform::new(0, self.live.len()).sample(rng);
        let obj = &mut self.live[ix];
        let fill = obj.first().copied().unwrap_or(0);
        let exp = Uniform::new_inclusive(3usize, self.log2_max_size).sample(rng);
        obj.resize(Uniform::new_inclusive(1usize, 1 << exp).sample(rng), fill);
        // Growing must not have disturbed the existing bytes.
        assert!(obj.iter().all(|&b| b == fill));
    }

    fn destroy<R: Rng>(&mut self, rng: &mut R) {
        if self.live.is_empty() {
            return;
        }
        let ix = Uniform::new(0, self.live.len()).sample(rng);
        let obj = self.live.swap_remove(ix);
        let fill = obj.first().copied().unwrap_or(0);
        assert!(obj.iter().all(|&b| b == fill));
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.contains(&"--help".to_owned()) {
        println!("USAGE: {} [STEPS] [LOG2_MAX_SIZE]", args[0]);
        return;
    }
    let steps: usize = args.get(1).and_then(|s| s.parse().ok()).unwrap_or(STEPS);
    let log2_max_size: usize = args
        .get(2)
        .and_then(|s| s.parse().ok())
        .unwrap_or(LOG2_MAX_SIZE);

    env_logger::init();
    println!("Running global-allocator churn.\n\nParameters:");
    println!("    {} steps", steps);
    println!("    2^{} max object size", log2_max_size);

    let seed: u64 = rand::thread_rng().next_u64();
    log::info!("Using seed {}", seed);
    let mut rng = rand::rngs::StdRng::seed_from_u64(seed);

    let mut churn = Churn::new(log2_max_size);

    for i in 1..=steps {
        match rng.next_u32() % 4 {
            0 => churn.destroy(&mut rng),
            1 => churn.resize(&mut rng),
            _ => churn.create(&mut rng),
        }

        let (validity, stats) = ALLOCATOR.stats();
        if i % 1024 == 0 {
            println!("Step {} / {}", i, steps);
            let total: usize = churn.live.iter().map(|v| v.len()).sum();
            println!("    Live objects: {}, size: {}", churn.live.len(), total);
            println!("    Allocator stats: {:?}", stats);
        }
        assert!(validity.is_valid());
    }

    while !churn.live.is_empty() {
        churn.destroy(&mut rng);
    }

    let (validity, stats) = ALLOCATOR.stats();
    println!("\nFinished.");
    println!("    Stats:    {:?}", stats);
    assert!(validity.is_valid());
}
