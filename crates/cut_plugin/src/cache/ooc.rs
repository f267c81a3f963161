//! Out-of-core host cache.
//!
//! Fixed arena of payload slots backed by asynchronous disk loads.
//! `register_node` reserves a slot and schedules the read; the entry
//! becomes resident only when `refresh()` observes the completion and
//! copies the bytes into the arena. The coordinator holds the cache
//! lock around groups of related mutations; the whole cache is one
//! critical section, there is no per-slot locking.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::cache::index::SlotIndex;
use crate::cache::loader::{LoadError, NodeLoader};
use crate::model::ModelStore;
use crate::types::{ContextId, ModelId, NodeId, SlotId, ViewId};

/// Host-side cache; shared by every context of a run.
pub struct OocCache {
  inner: Mutex<OocState>,
}

/// Cache state; obtained via [`OocCache::lock`].
pub struct OocState {
  slot_size: usize,
  index: SlotIndex,
  /// Payload arena, `capacity * slot_size` bytes.
  data: Vec<u8>,
  /// Reserved slots whose read has not completed: `(model, node)` to
  /// `(slot, priority)`.
  pending: HashMap<(ModelId, NodeId), (SlotId, i64)>,
  loader: NodeLoader,
}

impl OocCache {
  /// Allocate `num_slots` payload slots and open every model's data
  /// file.
  pub fn new(num_slots: u64, models: &ModelStore) -> Result<Self, LoadError> {
    let slot_size = models.slot_size();
    debug!(num_slots, slot_size, "allocating host cache");
    Ok(Self {
      inner: Mutex::new(OocState {
        slot_size,
        index: SlotIndex::new(num_slots),
        data: vec![0u8; num_slots as usize * slot_size],
        pending: HashMap::new(),
        loader: NodeLoader::new(models)?,
      }),
    })
  }

  /// Serialize access to the whole cache.
  pub fn lock(&self) -> MutexGuard<'_, OocState> {
    self.inner.lock().unwrap()
  }
}

impl OocState {
  #[inline]
  pub fn num_slots(&self) -> u64 {
    self.index.capacity()
  }

  /// Slots with neither a resident entry nor a pending load.
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

  /// Reserve a slot for `(model, node)` and schedule its disk read.
  ///
  /// Returns `true` when the node is resident, already pending, or was
  /// newly scheduled; `false` when no slot could be reserved (every
  /// slot is referenced). The caller backs off and retries after
  /// freeing space.
  pub fn register_node(&mut self, model_id: ModelId, node_id: NodeId, priority: i64) -> bool {
    if self.index.contains(model_id, node_id) || self.pending.contains_key(&(model_id, node_id)) {
      return true;
    }

    let slot_id = match self.index.take_free_slot().or_else(|| self.index.evict_unreferenced()) {
      Some(slot) => slot,
      None => return false,
    };

    self.pending.insert((model_id, node_id), (slot_id, priority));
    self.loader.schedule(model_id, node_id, slot_id);
    true
  }

  /// Promote completed loads to resident. Failed reads return their
  /// reservation to the free pool; the next frame may retry.
  pub fn refresh(&mut self) {
    for completion in self.loader.poll() {
      let key = (completion.model_id, completion.node_id);
      let Some((slot_id, priority)) = self.pending.remove(&key) else {
        // Stale completion for a reservation the cache no longer tracks.
        continue;
      };
      debug_assert_eq!(slot_id, completion.slot_id);

      match completion.payload {
        Ok(payload) => {
          let offset = slot_id as usize * self.slot_size;
          self.data[offset..offset + self.slot_size].copy_from_slice(&payload);
          self.index.bind(slot_id, completion.model_id, completion.node_id, priority);
        }
        Err(error) => {
          warn!(
            model_id = completion.model_id,
            node_id = completion.node_id,
            %error,
            "discarding failed node load"
          );
          self.index.release_free_slot(slot_id);
        }
      }
    }
  }

  /// Register `(context, view)` as a holder of a resident node.
  pub fn acquire_node(&mut self, context_id: ContextId, view_id: ViewId, model_id: ModelId, node_id: NodeId) {
    assert!(
      self.index.contains(model_id, node_id),
      "acquire of non-resident node ({model_id}, {node_id}) in host cache"
    );
    self.index.acquire(context_id, view_id, model_id, node_id);
  }

  /// Drop one holder of a node.
  pub fn release_node(&mut self, context_id: ContextId, view_id: ViewId, model_id: ModelId, node_id: NodeId) {
    self.index.release(context_id, view_id, model_id, node_id);
  }

  pub fn refcount(&self, model_id: ModelId, node_id: NodeId) -> usize {
    self.index.refcount(model_id, node_id)
  }

  /// Payload bytes of a resident node, for staging-region copies.
  ///
  /// # Panics
  /// If the node is not resident.
  pub fn node_data(&self, model_id: ModelId, node_id: NodeId) -> &[u8] {
    let slot_id = self
      .index
      .slot_of(model_id, node_id)
      .unwrap_or_else(|| panic!("node_data for non-resident node ({model_id}, {node_id})"));
    let offset = slot_id as usize * self.slot_size;
    &self.data[offset..offset + self.slot_size]
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
#[path = "ooc_test.rs"]
mod ooc_test;
