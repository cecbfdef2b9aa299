use std::collections::HashMap;
use std::hash::{BuildHasher, Hash};
use std::sync::Arc;

use generational_arena::{Arena, Index};

#[derive(Debug)]
struct Node<K, V> {
  key: K,
  value: Arc<V>,
  next: Option<Index>,
  prev: Option<Index>,
}

// A recency-ordered map. Not thread-safe on its own; every cache wraps it in
// its cache-wide lock.
#[derive(Debug)]
pub(crate) struct LruList<K, V, H = ahash::RandomState> {
  // Arena stores all nodes contiguously.
  nodes: Arena<Node<K, V>>,
  // O(1) lookup of a key to its node index in the arena.
  lookup: HashMap<K, Index, H>,
  // Head is the most-recently-used item.
  head: Option<Index>,
  // Tail is the least-recently-used item.
  tail: Option<Index>,
}

impl<K, V, H> LruList<K, V, H>
where
  K: Eq + Hash + Clone,
  H: BuildHasher,
{
  pub(crate) fn with_hasher(hasher: H) -> Self {
    Self {
      nodes: Arena::new(),
      lookup: HashMap::with_hasher(hasher),
      head: None,
      tail: None,
    }
  }

  // Unlinks a node from the list without removing it from the arena or map.
  fn unlink(&mut self, index: Index) {
    let node = &self.nodes[index];
    let prev_node_idx = node.prev;
    let next_node_idx = node.next;

    if let Some(prev_idx) = prev_node_idx {
      self.nodes[prev_idx].next = next_node_idx;
    } else {
      self.head = next_node_idx;
    }

    if let Some(next_idx) = next_node_idx {
      self.nodes[next_idx].prev = prev_node_idx;
    } else {
      self.tail = prev_node_idx;
    }
  }

  // Links a node that is already in the arena in as the new head.
  fn push_front_node(&mut self, index: Index) {
    let old_head_idx = self.head;
    self.nodes[index].next = old_head_idx;
    self.nodes[index].prev = None;
    self.head = Some(index);

    if let Some(old_head) = old_head_idx {
      self.nodes[old_head].prev = Some(index);
    }

    if self.tail.is_none() {
      self.tail = Some(index);
    }
  }

  fn move_index_to_front(&mut self, index: Index) {
    if self.head != Some(index) {
      self.unlink(index);
      self.push_front_node(index);
    }
  }

  pub(crate) fn len(&self) -> usize {
    self.lookup.len()
  }

  pub(crate) fn contains(&self, key: &K) -> bool {
    self.lookup.contains_key(key)
  }

  /// Returns the value without touching its recency.
  pub(crate) fn peek(&self, key: &K) -> Option<&Arc<V>> {
    self
      .lookup
      .get(key)
      .map(|&index| &self.nodes[index].value)
  }

  /// Returns the value and marks it most recently used.
  pub(crate) fn get(&mut self, key: &K) -> Option<&Arc<V>> {
    let index = *self.lookup.get(key)?;
    self.move_index_to_front(index);
    Some(&self.nodes[index].value)
  }

  /// Inserts or replaces `key`, making it the most recently used entry.
  /// Returns the replaced value, if any.
  pub(crate) fn push_front(&mut self, key: K, value: Arc<V>) -> Option<Arc<V>> {
    if let Some(&index) = self.lookup.get(&key) {
      let old = std::mem::replace(&mut self.nodes[index].value, value);
      self.move_index_to_front(index);
      Some(old)
    } else {
      let index = self.nodes.insert(Node {
        key: key.clone(),
        value,
        next: None,
        prev: None,
      });
      self.lookup.insert(key, index);
      self.push_front_node(index);
      None
    }
  }

  /// Returns the least recently used entry without removing it.
  pub(crate) fn peek_back(&self) -> Option<(&K, &Arc<V>)> {
    self.tail.map(|index| {
      let node = &self.nodes[index];
      (&node.key, &node.value)
    })
  }

  pub(crate) fn pop_back(&mut self) -> Option<(K, Arc<V>)> {
    let tail_index = self.tail?;
    let key = self.nodes[tail_index].key.clone();
    self.remove(&key).map(|value| (key, value))
  }

  pub(crate) fn remove(&mut self, key: &K) -> Option<Arc<V>> {
    let index = self.lookup.remove(key)?;
    self.unlink(index);
    self.nodes.remove(index).map(|node| node.value)
  }

  /// Removes every entry matching `predicate`, oldest first.
  pub(crate) fn remove_where<F>(&mut self, mut predicate: F) -> Vec<(K, Arc<V>)>
  where
    F: FnMut(&K, &Arc<V>) -> bool,
  {
    let mut removed = Vec::new();
    let mut current = self.tail;
    while let Some(index) = current {
      let node = &self.nodes[index];
      current = node.prev;
      if predicate(&node.key, &node.value) {
        let key = node.key.clone();
        if let Some(value) = self.remove(&key) {
          removed.push((key, value));
        }
      }
    }
    removed
  }

  /// Empties the list, returning its entries oldest first.
  pub(crate) fn drain(&mut self) -> Vec<(K, Arc<V>)> {
    let mut drained = Vec::with_capacity(self.len());
    while let Some(entry) = self.pop_back() {
      drained.push(entry);
    }
    drained
  }

  /// Keys ordered from least to most recently used.
  pub(crate) fn keys(&self) -> Vec<K> {
    let mut keys = Vec::with_capacity(self.len());
    let mut current = self.tail;
    while let Some(index) = current {
      keys.push(self.nodes[index].key.clone());
      current = self.nodes[index].prev;
    }
    keys
  }
}
