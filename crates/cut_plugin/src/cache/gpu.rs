//! Device-resident cache.
//!
//! Mirrors the host cache's slot bookkeeping but holds no bytes: a slot
//! here stands for a region of device memory whose content travels
//! through the upload staging region later in the frame. Registration
//! therefore makes an entry resident immediately for accounting
//! purposes and appends it to the per-frame transfer list, consuming
//! one unit of the upload budget.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::cache::index::SlotIndex;
use crate::types::{ContextId, ModelId, NodeId, SlotId, ViewId};

/// Per-context device cache.
pub struct GpuCache {
  inner: Mutex<GpuState>,
}

/// Cache state; obtained via [`GpuCache::lock`].
pub struct GpuState {
  index: SlotIndex,
  /// Per-model nodes registered this frame, awaiting upload.
  transfer_list: Vec<HashSet<NodeId>>,
  /// Remaining registrations allowed this frame.
  transfer_budget: u64,
  /// Staging-region entries produced so far this frame.
  transfer_slots_written: u64,
}

impl GpuCache {
  pub fn new(num_slots: u64, num_models: u32) -> Self {
    debug!(num_slots, "allocating gpu cache");
    Self {
      inner: Mutex::new(GpuState {
        index: SlotIndex::new(num_slots),
        transfer_list: vec![HashSet::new(); num_models as usize],
        transfer_budget: 0,
        transfer_slots_written: 0,
      }),
    }
  }

  /// Serialize access to the whole cache.
  pub fn lock(&self) -> MutexGuard<'_, GpuState> {
    self.inner.lock().unwrap()
  }
}

impl GpuState {
  #[inline]
  pub fn num_slots(&self) -> u64 {
    self.index.capacity()
  }

  #[inline]
  pub fn num_free_slots(&self) -> u64 {
    self.index.num_free()
  }

  #[inline]
  pub fn num_resident(&self) -> u64 {
    self.index.num_bound()
  }

  #[inline]
  pub fn is_node_resident(&self, model_id: ModelId, node_id: NodeId) -> bool {
    self.index.contains(model_id, node_id)
  }

  /// Allocate a device slot for `(model, node)` and queue its upload.
  ///
  /// Fails when the upload budget is exhausted or no slot can be
  /// reclaimed. Already-resident nodes succeed without consuming
  /// budget.
  pub fn register_node(&mut self, model_id: ModelId, node_id: NodeId) -> bool {
    if self.index.contains(model_id, node_id) {
      return true;
    }
    if self.transfer_budget == 0 {
      return false;
    }

    let slot_id = match self.index.take_free_slot().or_else(|| self.index.evict_unreferenced()) {
      Some(slot) => slot,
      None => return false,
    };

    self.index.bind(slot_id, model_id, node_id, 0);
    self.transfer_list[model_id as usize].insert(node_id);
    self.transfer_budget -= 1;
    true
  }

  pub fn acquire_node(&mut self, context_id: ContextId, view_id: ViewId, model_id: ModelId, node_id: NodeId) {
    assert!(
      self.index.contains(model_id, node_id),
      "acquire of non-resident node ({model_id}, {node_id}) in gpu cache"
    );
    self.index.acquire(context_id, view_id, model_id, node_id);
  }

  pub fn release_node(&mut self, context_id: ContextId, view_id: ViewId, model_id: ModelId, node_id: NodeId) {
    self.index.release(context_id, view_id, model_id, node_id);
  }

  /// Release a holder and, when that leaves the node unreferenced and
  /// it was registered this very frame, take it back out of the
  /// transfer list and free its slot (its bytes never reached the
  /// device). Returns whether such a cancellation happened.
  pub fn release_node_invalidate(
    &mut self,
    context_id: ContextId,
    view_id: ViewId,
    model_id: ModelId,
    node_id: NodeId,
  ) -> bool {
    let remaining = self.index.release(context_id, view_id, model_id, node_id);
    if remaining > 0 {
      return false;
    }
    if !self.transfer_list[model_id as usize].remove(&node_id) {
      return false;
    }
    if let Some(slot_id) = self.index.unbind(model_id, node_id) {
      self.index.release_free_slot(slot_id);
    }
    true
  }

  pub fn refcount(&self, model_id: ModelId, node_id: NodeId) -> usize {
    self.index.refcount(model_id, node_id)
  }

  /// Device slot assigned to a resident node: the value the renderer
  /// uses to address the payload on-device.
  ///
  /// # Panics
  /// If the node is not resident.
  pub fn slot_id(&self, model_id: ModelId, node_id: NodeId) -> SlotId {
    self
      .index
      .slot_of(model_id, node_id)
      .unwrap_or_else(|| panic!("slot_id for non-resident node ({model_id}, {node_id})"))
  }

  pub fn transfer_list(&self) -> &[HashSet<NodeId>] {
    &self.transfer_list
  }

  pub fn reset_transfer_list(&mut self) {
    for per_model in &mut self.transfer_list {
      per_model.clear();
    }
  }

  /// Nodes queued for upload this frame.
  pub fn transfer_list_len(&self) -> usize {
    self.transfer_list.iter().map(HashSet::len).sum()
  }

  #[inline]
  pub fn transfer_budget(&self) -> u64 {
    self.transfer_budget
  }

  pub fn set_transfer_budget(&mut self, budget: u64) {
    self.transfer_budget = budget;
  }

  #[inline]
  pub fn transfer_slots_written(&self) -> u64 {
    self.transfer_slots_written
  }

  pub fn set_transfer_slots_written(&mut self, written: u64) {
    self.transfer_slots_written = written;
  }

  /// Resident entries as `(model, node, refcount)`, for invariant checks.
  pub fn resident_entries(&self) -> Vec<(ModelId, NodeId, usize)> {
    self
      .index
      .entries()
      .map(|(_, entry)| (entry.model_id, entry.node_id, entry.refcount()))
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cache_with_budget(slots: u64, budget: u64) -> GpuCache {
    let cache = GpuCache::new(slots, 1);
    cache.lock().set_transfer_budget(budget);
    cache
  }

  #[test]
  fn register_consumes_budget_and_queues_transfer() {
    let cache = cache_with_budget(4, 2);
    let mut state = cache.lock();

    assert!(state.register_node(0, 1));
    assert!(state.register_node(0, 2));
    assert_eq!(state.transfer_budget(), 0);
    assert_eq!(state.transfer_list_len(), 2);

    // Budget exhausted.
    assert!(!state.register_node(0, 3));
  }

  #[test]
  fn reregistering_resident_node_is_free() {
    let cache = cache_with_budget(4, 1);
    let mut state = cache.lock();
    assert!(state.register_node(0, 1));
    assert!(state.register_node(0, 1));
    assert_eq!(state.transfer_budget(), 0);
    assert_eq!(state.transfer_list_len(), 1);
  }

  #[test]
  fn zero_budget_blocks_all_registration() {
    let cache = cache_with_budget(4, 0);
    let mut state = cache.lock();
    assert!(!state.register_node(0, 1));
    assert_eq!(state.transfer_list_len(), 0);
    assert_eq!(state.num_resident(), 0);
  }

  #[test]
  fn full_cache_evicts_unreferenced_entry() {
    let cache = cache_with_budget(2, 10);
    let mut state = cache.lock();
    state.register_node(0, 1);
    state.register_node(0, 2);
    state.acquire_node(0, 0, 0, 1);

    assert!(state.register_node(0, 3));
    assert!(!state.is_node_resident(0, 2));
    assert!(state.is_node_resident(0, 1));

    // Remaining entry referenced, nothing evictable.
    state.acquire_node(0, 0, 0, 3);
    assert!(!state.register_node(0, 4));
  }

  #[test]
  fn invalidate_cancels_same_frame_registration() {
    let cache = cache_with_budget(2, 10);
    let mut state = cache.lock();
    state.register_node(0, 1);
    state.acquire_node(0, 0, 0, 1);

    let free_before = state.num_free_slots();
    assert!(state.release_node_invalidate(0, 0, 0, 1));
    assert!(!state.is_node_resident(0, 1));
    assert_eq!(state.transfer_list_len(), 0);
    assert_eq!(state.num_free_slots(), free_before + 1);
  }

  #[test]
  fn invalidate_keeps_prior_frame_residents() {
    let cache = cache_with_budget(2, 10);
    let mut state = cache.lock();
    state.register_node(0, 1);
    state.acquire_node(0, 0, 0, 1);
    // New frame: transfer list cleared, node 1 now lives on-device.
    state.reset_transfer_list();

    assert!(!state.release_node_invalidate(0, 0, 0, 1));
    assert!(state.is_node_resident(0, 1));
    assert_eq!(state.refcount(0, 1), 0);
  }

  #[test]
  fn invalidate_with_other_holders_is_plain_release() {
    let cache = cache_with_budget(2, 10);
    let mut state = cache.lock();
    state.register_node(0, 1);
    state.acquire_node(0, 0, 0, 1);
    state.acquire_node(0, 1, 0, 1);

    assert!(!state.release_node_invalidate(0, 0, 0, 1));
    assert!(state.is_node_resident(0, 1));
    assert_eq!(state.refcount(0, 1), 1);
    assert_eq!(state.transfer_list_len(), 1);
  }
}
