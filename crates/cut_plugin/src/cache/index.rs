//! Slot-arena bookkeeping shared by both cache tiers.
//!
//! Slots are stable indices into a fixed arena; the reverse map goes
//! from `(model, node)` to the slot holding its payload. Refcounts are
//! holder sets keyed by `(context, view)`: the same node acquired by k
//! distinct views counts k times, while re-acquisition by the same view
//! is idempotent. Only entries with an empty holder set are evictable.

use std::collections::{HashMap, HashSet};

use crate::types::{ContextId, ModelId, NodeId, SlotId, ViewId};

/// One bound slot.
#[derive(Debug)]
pub struct SlotEntry {
  pub model_id: ModelId,
  pub node_id: NodeId,
  /// Eviction rank, most significant component. Lower evicts first;
  /// prefetched payloads carry negative priorities.
  pub priority: i64,
  /// Clock value of the last acquisition; tie-breaks eviction.
  pub last_use: u64,
  holders: HashSet<(ContextId, ViewId)>,
}

impl SlotEntry {
  pub fn refcount(&self) -> usize {
    self.holders.len()
  }
}

/// Fixed-capacity slot index.
pub struct SlotIndex {
  slots: Vec<Option<SlotEntry>>,
  map: HashMap<(ModelId, NodeId), SlotId>,
  free: Vec<SlotId>,
  clock: u64,
}

impl SlotIndex {
  pub fn new(num_slots: u64) -> Self {
    Self {
      slots: (0..num_slots).map(|_| None).collect(),
      map: HashMap::new(),
      // Pop from the back; low slot ids hand out first.
      free: (0..num_slots).rev().collect(),
      clock: 0,
    }
  }

  #[inline]
  pub fn capacity(&self) -> u64 {
    self.slots.len() as u64
  }

  /// Slots neither bound nor reserved by a caller.
  #[inline]
  pub fn num_free(&self) -> u64 {
    self.free.len() as u64
  }

  /// Bound (resident) entries.
  #[inline]
  pub fn num_bound(&self) -> u64 {
    self.map.len() as u64
  }

  /// Reserve a free slot, if any. The slot stays out of the free list
  /// until it is bound or handed back via [`SlotIndex::release_free_slot`].
  pub fn take_free_slot(&mut self) -> Option<SlotId> {
    self.free.pop()
  }

  /// Return a reserved-but-unbound slot to the free list.
  pub fn release_free_slot(&mut self, slot_id: SlotId) {
    debug_assert!(self.slots[slot_id as usize].is_none(), "slot {slot_id} still bound");
    self.free.push(slot_id);
  }

  /// Drop the refcount-0 entry with the lowest `(priority, last_use)`
  /// rank and hand its slot to the caller. `None` when every bound
  /// entry is still referenced.
  pub fn evict_unreferenced(&mut self) -> Option<SlotId> {
    let victim = self
      .slots
      .iter()
      .enumerate()
      .filter_map(|(slot, entry)| entry.as_ref().map(|e| (slot, e)))
      .filter(|(_, e)| e.holders.is_empty())
      .min_by_key(|(_, e)| (e.priority, e.last_use))
      .map(|(slot, _)| slot as SlotId)?;

    let entry = self.slots[victim as usize].take().expect("victim is bound");
    self.map.remove(&(entry.model_id, entry.node_id));
    Some(victim)
  }

  /// Bind a node to a reserved slot, making it resident.
  ///
  /// # Panics
  /// If the slot is occupied or the node is already bound elsewhere.
  pub fn bind(&mut self, slot_id: SlotId, model_id: ModelId, node_id: NodeId, priority: i64) {
    assert!(
      self.slots[slot_id as usize].is_none(),
      "slot {slot_id} already bound"
    );
    let previous = self.map.insert((model_id, node_id), slot_id);
    assert!(
      previous.is_none(),
      "node ({model_id}, {node_id}) bound to two slots"
    );
    self.slots[slot_id as usize] = Some(SlotEntry {
      model_id,
      node_id,
      priority,
      last_use: self.clock,
      holders: HashSet::new(),
    });
  }

  /// Remove a bound entry and return its slot (not yet freed).
  pub fn unbind(&mut self, model_id: ModelId, node_id: NodeId) -> Option<SlotId> {
    let slot_id = self.map.remove(&(model_id, node_id))?;
    let entry = self.slots[slot_id as usize].take().expect("map and slots agree");
    debug_assert!(entry.holders.is_empty(), "unbinding a referenced entry");
    Some(slot_id)
  }

  #[inline]
  pub fn contains(&self, model_id: ModelId, node_id: NodeId) -> bool {
    self.map.contains_key(&(model_id, node_id))
  }

  #[inline]
  pub fn slot_of(&self, model_id: ModelId, node_id: NodeId) -> Option<SlotId> {
    self.map.get(&(model_id, node_id)).copied()
  }

  /// Register `(context, view)` as a holder. Idempotent per holder.
  pub fn acquire(&mut self, context_id: ContextId, view_id: ViewId, model_id: ModelId, node_id: NodeId) {
    let slot_id = self.map[&(model_id, node_id)];
    self.clock += 1;
    let entry = self.slots[slot_id as usize].as_mut().expect("bound slot");
    entry.holders.insert((context_id, view_id));
    entry.last_use = self.clock;
  }

  /// Drop one holder; returns the remaining refcount. Releasing a
  /// non-resident node or a holder that never acquired is a no-op.
  pub fn release(&mut self, context_id: ContextId, view_id: ViewId, model_id: ModelId, node_id: NodeId) -> usize {
    let Some(&slot_id) = self.map.get(&(model_id, node_id)) else {
      return 0;
    };
    let entry = self.slots[slot_id as usize].as_mut().expect("bound slot");
    entry.holders.remove(&(context_id, view_id));
    entry.refcount()
  }

  pub fn refcount(&self, model_id: ModelId, node_id: NodeId) -> usize {
    self
      .map
      .get(&(model_id, node_id))
      .map(|&slot| self.slots[slot as usize].as_ref().expect("bound slot").refcount())
      .unwrap_or(0)
  }

  /// Bound entries, for diagnostics and invariant checks.
  pub fn entries(&self) -> impl Iterator<Item = (SlotId, &SlotEntry)> {
    self
      .slots
      .iter()
      .enumerate()
      .filter_map(|(slot, entry)| entry.as_ref().map(|e| (slot as SlotId, e)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn bound_index(nodes: &[(ModelId, NodeId, i64)]) -> SlotIndex {
    let mut index = SlotIndex::new(nodes.len() as u64 + 2);
    for &(model, node, priority) in nodes {
      let slot = index.take_free_slot().unwrap();
      index.bind(slot, model, node, priority);
    }
    index
  }

  #[test]
  fn bind_and_lookup() {
    let index = bound_index(&[(0, 5, 0)]);
    assert!(index.contains(0, 5));
    assert_eq!(index.slot_of(0, 5), Some(0));
    assert_eq!(index.num_bound(), 1);
    assert_eq!(index.num_free(), 2);
  }

  #[test]
  fn refcount_counts_distinct_views() {
    let mut index = bound_index(&[(0, 1, 0)]);
    index.acquire(0, 0, 0, 1);
    index.acquire(0, 1, 0, 1);
    index.acquire(0, 1, 0, 1); // same view again: idempotent
    assert_eq!(index.refcount(0, 1), 2);

    assert_eq!(index.release(0, 0, 0, 1), 1);
    assert_eq!(index.release(0, 1, 0, 1), 0);
  }

  #[test]
  fn eviction_skips_referenced_entries() {
    let mut index = bound_index(&[(0, 1, 0), (0, 2, 0)]);
    index.acquire(0, 0, 0, 1);
    index.acquire(0, 0, 0, 2);
    assert_eq!(index.evict_unreferenced(), None);

    index.release(0, 0, 0, 1);
    index.evict_unreferenced().unwrap();
    assert!(!index.contains(0, 1));
    assert!(index.contains(0, 2));
  }

  #[test]
  fn eviction_prefers_lowest_priority_then_stalest() {
    let mut index = bound_index(&[(0, 1, 5), (0, 2, -3), (0, 3, 5)]);
    // node 2 has the lowest priority.
    index.evict_unreferenced().unwrap();
    assert!(!index.contains(0, 2));

    // Equal priorities: the less recently used entry goes first.
    index.acquire(0, 0, 0, 3);
    index.release(0, 0, 0, 3);
    index.evict_unreferenced().unwrap();
    assert!(!index.contains(0, 1));
    assert!(index.contains(0, 3));
  }

  #[test]
  fn unbind_returns_slot_for_reuse() {
    let mut index = bound_index(&[(0, 7, 0)]);
    let slot = index.unbind(0, 7).unwrap();
    index.release_free_slot(slot);
    assert_eq!(index.num_bound(), 0);
    assert_eq!(index.num_free(), 3);
  }

  #[test]
  fn release_of_unknown_node_is_noop() {
    let mut index = SlotIndex::new(1);
    assert_eq!(index.release(0, 0, 9, 9), 0);
  }
}
