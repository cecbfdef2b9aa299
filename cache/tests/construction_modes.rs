mod common;

use common::{Calls, TestError};
use fabric_cache::{Cache, CacheBuilder, ConstructionMode};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier};
use std::thread;
use std::time::Duration;

fn shared_cache(capacity: usize, mode: ConstructionMode) -> Arc<Cache<u32, u32>> {
  Arc::new(Cache::new(capacity, mode))
}

#[test]
fn test_get_or_create_hit_and_miss_in_every_mode() {
  for mode in ConstructionMode::ALL {
    let cache = shared_cache(4, mode);
    let calls = Calls::default();

    let (first, evicted) = cache
      .get_or_create(1, |k| {
        calls.bump();
        Ok::<_, TestError>(k + 100)
      })
      .unwrap();
    assert_eq!(*first, 101, "{mode}");
    assert!(!evicted);

    let (second, _) = cache
      .get_or_create(1, |_| {
        calls.bump();
        Ok::<_, TestError>(0)
      })
      .unwrap();
    assert!(Arc::ptr_eq(&first, &second), "{mode}");
    assert_eq!(calls.get(), 1, "{mode}");

    let metrics = cache.metrics();
    assert_eq!((metrics.hits, metrics.misses), (1, 1), "{mode}");
    assert_eq!(metrics.config.mode, Some(mode));
  }
}

#[test]
fn test_get_or_create_reports_eviction() {
  for mode in ConstructionMode::ALL {
    let cache = shared_cache(1, mode);
    let (_, evicted) = cache.get_or_create(1, |k| Ok::<_, TestError>(*k)).unwrap();
    assert!(!evicted);
    let (_, evicted) = cache.get_or_create(2, |k| Ok::<_, TestError>(*k)).unwrap();
    assert!(evicted, "{mode}");
    assert_eq!(cache.keys(), vec![2]);
  }
}

#[test]
fn test_errors_are_returned_and_never_cached() {
  for mode in ConstructionMode::ALL {
    let cache = shared_cache(4, mode);

    let err = cache
      .get_or_create(1, |_| Err::<u32, _>(TestError("boom")))
      .unwrap_err();
    assert_eq!(*err, TestError("boom"), "{mode}");
    assert!(!cache.contains(&1), "{mode}");

    let (value, _) = cache.get_or_create(1, |_| Ok::<_, TestError>(7)).unwrap();
    assert_eq!(*value, 7);

    let metrics = cache.metrics();
    assert_eq!(metrics.errors, 1, "{mode}");
    assert_eq!(metrics.added, 1, "{mode}");
  }
}

#[test]
fn test_decoupled_constructs_once_under_contention() {
  let cache = shared_cache(16, ConstructionMode::Decoupled);
  let calls = Calls::default();
  let num_threads = 8;
  let barrier = Arc::new(Barrier::new(num_threads));

  let handles: Vec<_> = (0..num_threads)
    .map(|_| {
      let cache = cache.clone();
      let calls = calls.clone();
      let barrier = barrier.clone();
      thread::spawn(move || {
        barrier.wait();
        let (value, _) = cache
          .get_or_create(42, |k| {
            calls.bump();
            thread::sleep(Duration::from_millis(50));
            Ok::<_, TestError>(k * 2)
          })
          .unwrap();
        *value
      })
    })
    .collect();

  for handle in handles {
    assert_eq!(handle.join().unwrap(), 84);
  }
  assert_eq!(calls.get(), 1);

  let metrics = cache.metrics();
  assert_eq!(metrics.misses, 1);
  assert_eq!(metrics.hits, num_threads as u64 - 1);
  assert_eq!(metrics.added, 1);
}

#[test]
fn test_decoupled_waiters_share_the_error() {
  let cache = shared_cache(16, ConstructionMode::Decoupled);
  let calls = Calls::default();
  let (started_tx, started_rx) = mpsc::channel();

  let builder = {
    let cache = cache.clone();
    let calls = calls.clone();
    thread::spawn(move || {
      cache.get_or_create(5, |_| {
        calls.bump();
        started_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(150));
        Err::<u32, _>(TestError("unreachable backend"))
      })
    })
  };

  started_rx.recv().unwrap();
  let waiters: Vec<_> = (0..3)
    .map(|_| {
      let cache = cache.clone();
      let calls = calls.clone();
      thread::spawn(move || {
        cache.get_or_create(5, |_| {
          calls.bump();
          Ok::<_, TestError>(1)
        })
      })
    })
    .collect();

  let builder_err = builder.join().unwrap().unwrap_err();
  for waiter in waiters {
    let err = waiter.join().unwrap().unwrap_err();
    assert!(Arc::ptr_eq(&err, &builder_err));
  }

  assert_eq!(calls.get(), 1);
  assert!(!cache.contains(&5));
  assert_eq!(cache.metrics().errors, 1);
}

/// Starts a decoupled construction of key 5 that fails with `TestError`
/// after a delay, then queues a second caller with a different error type
/// behind it. Returns once the first caller has failed and the second one is
/// inside its constructor.
fn fail_then_rebuild<F>(
  cache: &Arc<Cache<u32, u32>>,
  rebuild: F,
) -> thread::JoinHandle<Result<(Arc<u32>, bool), Arc<&'static str>>>
where
  F: FnOnce() -> Result<u32, &'static str> + Send + 'static,
{
  let (failing_tx, failing_rx) = mpsc::channel();
  let failing = {
    let cache = cache.clone();
    thread::spawn(move || {
      cache.get_or_create(5, |_| {
        failing_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
        Err::<u32, _>(TestError("first attempt"))
      })
    })
  };
  failing_rx.recv().unwrap();

  let (rebuild_tx, rebuild_rx) = mpsc::channel();
  let rebuilding = {
    let cache = cache.clone();
    thread::spawn(move || {
      cache.get_or_create(5, |_| {
        rebuild_tx.send(()).unwrap();
        thread::sleep(Duration::from_millis(100));
        rebuild()
      })
    })
  };

  let err = failing.join().unwrap().unwrap_err();
  assert_eq!(*err, TestError("first attempt"));
  rebuild_rx.recv().unwrap();
  rebuilding
}

#[test]
fn test_decoupled_caller_after_failure_sees_rebuilt_value() {
  let cache = shared_cache(16, ConstructionMode::Decoupled);
  let rebuilding = fail_then_rebuild(&cache, || Ok(7));

  // Arrives after the failure, while the value is being rebuilt.
  let calls = Calls::default();
  let (value, _) = cache
    .get_or_create(5, |_| {
      calls.bump();
      Ok::<_, TestError>(0)
    })
    .unwrap();

  assert_eq!(*value, 7);
  assert_eq!(calls.get(), 0);
  assert_eq!(*rebuilding.join().unwrap().unwrap().0, 7);
  assert_eq!(*cache.peek(&5).unwrap(), 7);
}

#[test]
fn test_decoupled_caller_after_failure_constructs_again() {
  let cache = shared_cache(16, ConstructionMode::Decoupled);
  let rebuilding = fail_then_rebuild(&cache, || Err("second attempt"));

  let (value, _) = cache.get_or_create(5, |_| Ok::<_, TestError>(9)).unwrap();

  assert_eq!(*value, 9);
  assert_eq!(*rebuilding.join().unwrap().unwrap_err(), "second attempt");
  assert_eq!(*cache.peek(&5).unwrap(), 9);
  assert_eq!(cache.metrics().errors, 2);
}

#[test]
fn test_decoupled_does_not_block_other_keys() {
  let cache = shared_cache(16, ConstructionMode::Decoupled);
  let (started_tx, started_rx) = mpsc::channel();
  let release = Arc::new(AtomicBool::new(false));

  let slow = {
    let cache = cache.clone();
    let release = release.clone();
    thread::spawn(move || {
      cache
        .get_or_create(1, |_| {
          started_tx.send(()).unwrap();
          while !release.load(Ordering::SeqCst) {
            thread::sleep(Duration::from_millis(5));
          }
          Ok::<_, TestError>(1)
        })
        .unwrap();
    })
  };

  started_rx.recv().unwrap();
  // Key 1 is still being built; key 2 goes through regardless.
  let (value, _) = cache.get_or_create(2, |_| Ok::<_, TestError>(2)).unwrap();
  assert_eq!(*value, 2);
  assert!(cache.contains(&2));

  release.store(true, Ordering::SeqCst);
  slow.join().unwrap();
  assert!(cache.contains(&1));
}

#[test]
fn test_blocking_serializes_all_keys() {
  let cache = shared_cache(16, ConstructionMode::Blocking);
  let (started_tx, started_rx) = mpsc::channel();
  let finished = Arc::new(AtomicBool::new(false));

  let slow = {
    let cache = cache.clone();
    let finished = finished.clone();
    thread::spawn(move || {
      cache
        .get_or_create(1, |_| {
          started_tx.send(()).unwrap();
          thread::sleep(Duration::from_millis(150));
          finished.store(true, Ordering::SeqCst);
          Ok::<_, TestError>(1)
        })
        .unwrap();
    })
  };

  started_rx.recv().unwrap();
  // The cache lock is held by the slow constructor, so even a different key
  // waits for it.
  let (value, _) = cache
    .get_or_create(2, |_| {
      assert!(finished.load(Ordering::SeqCst));
      Ok::<_, TestError>(2)
    })
    .unwrap();
  assert_eq!(*value, 2);
  slow.join().unwrap();
}

#[test]
fn test_concurrent_allows_duplicate_construction() {
  let cache = shared_cache(16, ConstructionMode::Concurrent);
  let calls = Calls::default();
  let num_threads = 4;
  let barrier = Arc::new(Barrier::new(num_threads));
  let next = Arc::new(AtomicUsize::new(0));

  let handles: Vec<_> = (0..num_threads)
    .map(|_| {
      let cache = cache.clone();
      let calls = calls.clone();
      let barrier = barrier.clone();
      let next = next.clone();
      thread::spawn(move || {
        cache
          .get_or_create(9, |_| {
            calls.bump();
            // Every caller is inside its constructor before anyone inserts.
            barrier.wait();
            Ok::<_, TestError>(next.fetch_add(1, Ordering::SeqCst) as u32)
          })
          .unwrap()
          .0
      })
    })
    .collect();

  let values: Vec<u32> = handles.into_iter().map(|h| *h.join().unwrap()).collect();
  assert_eq!(calls.get(), num_threads);

  // Each caller keeps the value it built; the cache holds exactly one of them.
  let mut sorted = values.clone();
  sorted.sort_unstable();
  assert_eq!(sorted, vec![0, 1, 2, 3]);
  assert_eq!(cache.len(), 1);
  let cached = *cache.peek(&9).unwrap();
  assert!(values.contains(&cached));

  let metrics = cache.metrics();
  assert_eq!(metrics.misses, num_threads as u64);
  assert_eq!(metrics.current_items(), 1);
}

#[test]
fn test_stale_predicate_rebuilds_entry() {
  for mode in ConstructionMode::ALL {
    let cache: Cache<&str, u32> = CacheBuilder::new().capacity(4).mode(mode).build();
    cache.add("config", 1);

    let (fresh, _) = cache
      .get_or_create_with("config", |_| Ok::<_, TestError>(99), |v| *v > 5)
      .unwrap();
    assert_eq!(*fresh, 1, "{mode}");

    let (rebuilt, _) = cache
      .get_or_create_with("config", |_| Ok::<_, TestError>(2), |v| *v < 2)
      .unwrap();
    assert_eq!(*rebuilt, 2, "{mode}");
    assert_eq!(*cache.peek(&"config").unwrap(), 2);
    assert_eq!(cache.len(), 1);
  }
}

#[test]
fn test_failed_rebuild_discards_stale_entry() {
  let cache: Cache<&str, u32> = Cache::new(4, ConstructionMode::Decoupled);
  cache.add("config", 1);

  let err = cache
    .get_or_create_with("config", |_| Err::<u32, _>(TestError("bad")), |_| true)
    .unwrap_err();
  assert_eq!(*err, TestError("bad"));
  assert!(!cache.contains(&"config"));
  assert_eq!(cache.metrics().current_items(), 0);
}

#[test]
fn test_metrics_balance_after_mixed_workload() {
  for mode in ConstructionMode::ALL {
    let cache = shared_cache(8, mode);
    let barrier = Arc::new(Barrier::new(4));

    let handles: Vec<_> = (0..4u32)
      .map(|t| {
        let cache = cache.clone();
        let barrier = barrier.clone();
        thread::spawn(move || {
          barrier.wait();
          for i in 0..200u32 {
            let key = (i * 7 + t) % 24;
            if i % 11 == 0 {
              cache.remove(&key);
            } else {
              let _ = cache.get_or_create(key, |k| {
                if k % 13 == 0 {
                  Err(TestError("unlucky"))
                } else {
                  Ok(k * 3)
                }
              });
            }
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }

    let metrics = cache.metrics();
    assert!(cache.len() <= 8, "{mode}");
    assert_eq!(metrics.current_items(), cache.len() as u64, "{mode}");
    assert!(metrics.errors > 0, "{mode}");
  }
}
