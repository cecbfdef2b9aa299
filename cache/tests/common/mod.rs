#![allow(dead_code)]

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};

use fabric_cache::{EvictionListener, EvictionReason, Resource};

/// Error returned by the failing constructors in these tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestError(pub &'static str);

impl fmt::Display for TestError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "test error: {}", self.0)
  }
}

impl std::error::Error for TestError {}

/// Counts how many times a constructor ran.
#[derive(Clone, Default)]
pub struct Calls(Arc<AtomicUsize>);

impl Calls {
  pub fn bump(&self) {
    self.0.fetch_add(1, Ordering::SeqCst);
  }

  pub fn get(&self) -> usize {
    self.0.load(Ordering::SeqCst)
  }
}

/// A resource that records how often it was closed.
#[derive(Debug)]
pub struct TestResource {
  pub name: String,
  closes: Arc<AtomicUsize>,
}

impl TestResource {
  pub fn open(name: impl Into<String>, closes: &Arc<AtomicUsize>) -> Self {
    Self {
      name: name.into(),
      closes: closes.clone(),
    }
  }
}

impl Resource for TestResource {
  type Error = TestError;

  fn close(&self) -> Result<(), TestError> {
    self.closes.fetch_add(1, Ordering::SeqCst);
    Ok(())
  }
}

/// Tracks one close counter per resource name.
#[derive(Default)]
pub struct CloseLog {
  counters: parking_lot::Mutex<std::collections::HashMap<String, Arc<AtomicUsize>>>,
}

impl CloseLog {
  pub fn counter(&self, name: &str) -> Arc<AtomicUsize> {
    self
      .counters
      .lock()
      .entry(name.to_string())
      .or_default()
      .clone()
  }

  pub fn closes(&self, name: &str) -> usize {
    self.counter(name).load(Ordering::SeqCst)
  }

  pub fn open(&self, name: &str) -> TestResource {
    TestResource::open(name, &self.counter(name))
  }
}

// Use std::sync::mpsc for listener tests. Notifications are synchronous, so
// they are already queued when the triggering call returns.
pub struct ChannelListener<K, V> {
  sender: parking_lot::Mutex<mpsc::Sender<(K, Arc<V>, EvictionReason)>>,
}

impl<K, V> ChannelListener<K, V> {
  pub fn new() -> (Self, mpsc::Receiver<(K, Arc<V>, EvictionReason)>) {
    let (sender, receiver) = mpsc::channel();
    (
      Self {
        sender: parking_lot::Mutex::new(sender),
      },
      receiver,
    )
  }
}

impl<K, V> EvictionListener<K, V> for ChannelListener<K, V>
where
  K: Send,
  V: Send + Sync,
{
  fn on_evict(&self, key: K, value: Arc<V>, reason: EvictionReason) {
    let _ = self.sender.lock().send((key, value, reason));
  }
}
