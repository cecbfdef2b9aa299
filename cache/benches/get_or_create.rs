use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use fabric_cache::{Cache, ConstructionMode, ExpiringCache};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

const CAPACITY: usize = 1_024;
const KEY_SPACE: u64 = 4_096;
const OPS_PER_THREAD: usize = 10_000;

// Each thread walks its own shuffled copy of the key space, so threads
// collide on keys without moving in lockstep.
fn workloads(threads: usize) -> Vec<Vec<u64>> {
  let mut rng = StdRng::from_seed([0; 32]);
  (0..threads)
    .map(|_| {
      let mut keys: Vec<u64> = (0..OPS_PER_THREAD as u64).map(|i| i % KEY_SPACE).collect();
      keys.shuffle(&mut rng);
      keys
    })
    .collect()
}

// Stands in for an expensive constructor.
fn build_value(key: &u64) -> Result<u64, ()> {
  let mut acc = *key;
  for _ in 0..64 {
    acc = black_box(acc.wrapping_mul(6364136223846793005).wrapping_add(1));
  }
  Ok(acc)
}

fn run_threads<F>(workloads: &[Vec<u64>], op: F) -> Duration
where
  F: Fn(u64) + Sync,
{
  let barrier = Barrier::new(workloads.len());
  let start = Instant::now();
  thread::scope(|s| {
    for keys in workloads {
      let barrier = &barrier;
      let op = &op;
      s.spawn(move || {
        barrier.wait();
        for key in keys {
          op(*key);
        }
      });
    }
  });
  start.elapsed()
}

fn bench_modes(c: &mut Criterion) {
  let mut group = c.benchmark_group("GetOrCreate");

  for threads in [1usize, 4, 8] {
    let keys = workloads(threads);
    group.throughput(Throughput::Elements((threads * OPS_PER_THREAD) as u64));

    for mode in ConstructionMode::ALL {
      group.bench_with_input(
        BenchmarkId::new(mode.as_str(), threads),
        &keys,
        |b, keys| {
          b.iter_custom(|iters| {
            let mut total = Duration::ZERO;
            for _ in 0..iters {
              let cache: Arc<Cache<u64, u64>> = Arc::new(Cache::new(CAPACITY, mode));
              total += run_threads(keys, |key| {
                black_box(cache.get_or_create(key, build_value).ok());
              });
            }
            total
          })
        },
      );
    }
  }
  group.finish();
}

fn bench_expiring(c: &mut Criterion) {
  let mut group = c.benchmark_group("ExpiringGetOrCreate");
  let keys = workloads(4);
  group.throughput(Throughput::Elements((4 * OPS_PER_THREAD) as u64));

  for mode in ConstructionMode::ALL {
    group.bench_with_input(BenchmarkId::from_parameter(mode), &keys, |b, keys| {
      b.iter_custom(|iters| {
        let mut total = Duration::ZERO;
        for _ in 0..iters {
          let cache: ExpiringCache<u64, u64> =
            match ExpiringCache::new(CAPACITY, mode, Duration::from_millis(5)) {
              Ok(cache) => cache,
              Err(err) => panic!("invalid bench config: {err}"),
            };
          total += run_threads(keys, |key| {
            black_box(cache.get_or_create(key, build_value).ok());
          });
        }
        total
      })
    });
  }
  group.finish();
}

criterion_group!(benches, bench_modes, bench_expiring);
criterion_main!(benches);
