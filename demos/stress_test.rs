//! Runs the allocator as the global allocator: builds up and tears down a
//! population of random vectors in alternating phases, checking the heap
//! after every step.
//!
//! USAGE: stress_test [STEPS] [POPULATION] [LOG2_MAX_LEN]

use segregated_allocator::UnixAllocator;

use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};

#[global_allocator]
static ALLOCATOR: UnixAllocator = UnixAllocator::new();

const STEPS: usize = 64 * 1024;
// Typical number of live objects
const POPULATION: usize = 1024;
// Objects hold up to 2^LOG2_MAX_LEN elements
const LOG2_MAX_LEN: u32 = 12;

// Every object holds 0, 1, 2, ... so corruption shows up as a gap.
fn intact(obj: &[u64]) -> bool {
    obj.iter().zip(0..).all(|(&v, i)| v == i)
}

struct Population {
    objects: Vec<Vec<u64>>,
    lengths: Uniform<u32>,
}

impl Population {
    fn new(log2_max_len: u32) -> Self {
        Population {
            objects: Vec::new(),
            lengths: Uniform::new_inclusive(0, log2_max_len.max(1)),
        }
    }

    // Length is 2^k plus some jitter, so every size class gets traffic.
    fn spawn(&mut self, rng: &mut StdRng) {
        let order = self.lengths.sample(rng);
        let len = (1u64 << order) + rng.gen_range(0, 8);
        self.objects.push((0..len).collect());
    }

    fn kill(&mut self, rng: &mut StdRng) {
        if self.objects.is_empty() {
            return;
        }
        let obj = self.objects.swap_remove(rng.gen_range(0, self.objects.len()));
        assert!(intact(&obj), "object of {} elements was corrupted", obj.len());
    }

    // Grows or shrinks one object in place, going through realloc.
    fn reshape(&mut self, rng: &mut StdRng) {
        if self.objects.is_empty() {
            return;
        }
        let ix = rng.gen_range(0, self.objects.len());
        let obj = &mut self.objects[ix];
        if rng.gen() {
            let len = obj.len() as u64;
            obj.extend(len..len + rng.gen_range(1, 512));
        } else {
            obj.truncate(obj.len() / 2);
            obj.shrink_to_fit();
        }
        assert!(intact(obj));
    }
}

fn arg<T: std::str::FromStr>(args: &[String], index: usize, default: T) -> T {
    args.get(index).and_then(|s| s.parse().ok()).unwrap_or(default)
}

fn main() {
    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help") {
        println!("USAGE: {} [STEPS] [POPULATION] [LOG2_MAX_LEN]", args[0]);
        return;
    }
    let steps = arg(&args, 1, STEPS);
    let population = arg(&args, 2, POPULATION).max(1);
    let log2_max_len = arg(&args, 3, LOG2_MAX_LEN);

    // The allocator logs under its own lock, and env_logger allocates, so
    // anything more verbose than `error` would deadlock here.
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Error)
        .init();

    let seed = rand::thread_rng().next_u64();
    println!(
        "{} steps, ~{} live objects, up to 2^{} elements each, seed {}",
        steps, population, log2_max_len, seed
    );
    let mut rng = StdRng::seed_from_u64(seed);
    let mut objects = Population::new(log2_max_len);

    // Fill up towards a random target, then drain towards another.
    let mut filling = true;
    let mut target = population;
    for step in 1..=steps {
        let live = objects.objects.len();
        if filling && live >= target {
            filling = false;
            target = rng.gen_range(0, population);
        } else if !filling && live <= target {
            filling = true;
            target = rng.gen_range(population, 2 * population + 1);
        }

        match rng.gen_range(0, 16) {
            0 => objects.reshape(&mut rng),
            _ if filling => objects.spawn(&mut rng),
            _ => objects.kill(&mut rng),
        }

        let report = ALLOCATOR.check();
        assert!(report.is_valid(), "step {}: {:?}", step, report.validity);
        if step % 4096 == 0 {
            println!(
                "step {:>6}: {:>5} objects, {} blocks allocated, {} bytes free",
                step,
                objects.objects.len(),
                report.stats.allocated_blocks,
                report.stats.free_bytes
            );
        }
    }

    while !objects.objects.is_empty() {
        objects.kill(&mut rng);
    }
    let report = ALLOCATOR.check();
    println!("Finished: {:?}", report.stats);
    assert!(report.is_valid());
}
