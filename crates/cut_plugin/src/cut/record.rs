//! Per-context shared record between renderer and coordinator.
//!
//! The renderer writes camera snapshots, model transforms, error
//! thresholds and the rendered-last-frame set; the coordinator reads
//! those at frame start and writes back the finalized cuts, the
//! transfer descriptors and the staging-buffer tag. All traffic for one
//! context goes through that record's single lock, so a renderer
//! sampling the record between two dispatches always sees a consistent
//! (cuts, transfer list, buffer) tuple.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use glam::DMat4;

use crate::camera::CameraSnapshot;
use crate::types::{ContextId, ModelId, NodeId, SlotId, ViewId};

/// Which staging region the current transfer descriptors target.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BufferTag {
  #[default]
  A,
  B,
}

impl BufferTag {
  pub fn other(self) -> Self {
    match self {
      BufferTag::A => BufferTag::B,
      BufferTag::B => BufferTag::A,
    }
  }
}

/// One staging-to-device copy the renderer must perform:
/// staging entry `src_slot` goes into device slot `dst_slot`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotUpdateDesc {
  pub src_slot: u64,
  pub dst_slot: SlotId,
}

/// One drawable cut entry: the node and the device slot holding it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct NodeSlotAggregate {
  pub node_id: NodeId,
  pub slot_id: SlotId,
}

/// Shared per-context state. Access via [`CutDatabase::record`].
#[derive(Default)]
pub struct CutRecord {
  cameras: HashMap<ViewId, CameraSnapshot>,
  transforms: HashMap<ModelId, DMat4>,
  thresholds: HashMap<ModelId, f64>,
  rendered: HashSet<ModelId>,
  cuts: HashMap<(ViewId, ModelId), Vec<NodeSlotAggregate>>,
  transfer_descs: Vec<SlotUpdateDesc>,
  buffer: BufferTag,
  front_modified: bool,
  swap_required: bool,
}

impl CutRecord {
  // --- renderer-facing writes -----------------------------------------

  /// View ids are dense: the coordinator derives the active view count
  /// from the number of cameras and iterates `0..count`.
  pub fn set_camera(&mut self, view_id: ViewId, camera: CameraSnapshot) {
    self.cameras.insert(view_id, camera);
  }

  pub fn remove_camera(&mut self, view_id: ViewId) {
    self.cameras.remove(&view_id);
  }

  pub fn set_transform(&mut self, model_id: ModelId, transform: DMat4) {
    self.transforms.insert(model_id, transform);
  }

  pub fn set_threshold(&mut self, model_id: ModelId, threshold: f64) {
    self.thresholds.insert(model_id, threshold);
  }

  /// Mark a model as drawn this frame; consumed by the next prepare.
  pub fn mark_rendered(&mut self, model_id: ModelId) {
    self.rendered.insert(model_id);
  }

  // --- coordinator-facing reads (frame start) -------------------------

  pub fn cameras(&self) -> &HashMap<ViewId, CameraSnapshot> {
    &self.cameras
  }

  pub fn transforms(&self) -> &HashMap<ModelId, DMat4> {
    &self.transforms
  }

  pub fn thresholds(&self) -> &HashMap<ModelId, f64> {
    &self.thresholds
  }

  /// Drain the rendered-last-frame set.
  pub fn take_rendered(&mut self) -> HashSet<ModelId> {
    std::mem::take(&mut self.rendered)
  }

  // --- coordinator-facing writes (commit) -----------------------------

  pub fn set_cut(&mut self, view_id: ViewId, model_id: ModelId, cut: Vec<NodeSlotAggregate>) {
    self.cuts.insert((view_id, model_id), cut);
  }

  pub fn set_updated_set(&mut self, descs: Vec<SlotUpdateDesc>) {
    self.transfer_descs = descs;
  }

  pub fn set_front_modified(&mut self, modified: bool) {
    self.front_modified = modified;
  }

  pub fn set_swap_required(&mut self, required: bool) {
    self.swap_required = required;
  }

  pub fn set_buffer(&mut self, buffer: BufferTag) {
    self.buffer = buffer;
  }

  // --- renderer-facing reads (frame consume) --------------------------

  pub fn cut(&self, view_id: ViewId, model_id: ModelId) -> &[NodeSlotAggregate] {
    self.cuts.get(&(view_id, model_id)).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn transfer_descs(&self) -> &[SlotUpdateDesc] {
    &self.transfer_descs
  }

  pub fn buffer(&self) -> BufferTag {
    self.buffer
  }

  pub fn is_front_modified(&self) -> bool {
    self.front_modified
  }

  pub fn is_swap_required(&self) -> bool {
    self.swap_required
  }
}

/// All per-context records of a run. Instance-owned; handed to each
/// coordinator and to the renderer as an `Arc`.
pub struct CutDatabase {
  records: Vec<Mutex<CutRecord>>,
}

impl CutDatabase {
  pub fn new(num_contexts: u32) -> Self {
    Self {
      records: (0..num_contexts).map(|_| Mutex::new(CutRecord::default())).collect(),
    }
  }

  /// Lock one context's record.
  pub fn record(&self, context_id: ContextId) -> MutexGuard<'_, CutRecord> {
    self.records[context_id as usize].lock().unwrap()
  }

  pub fn num_contexts(&self) -> u32 {
    self.records.len() as u32
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use glam::DMat4;

  fn camera() -> CameraSnapshot {
    CameraSnapshot {
      view: DMat4::IDENTITY,
      projection: DMat4::IDENTITY,
      near_plane: 0.1,
      height_divided_by_top_minus_bottom: 1.0,
    }
  }

  #[test]
  fn rendered_set_drains_on_take() {
    let db = CutDatabase::new(1);
    {
      let mut record = db.record(0);
      record.mark_rendered(0);
      record.mark_rendered(2);
    }
    let mut record = db.record(0);
    assert_eq!(record.take_rendered().len(), 2);
    assert!(record.take_rendered().is_empty());
  }

  #[test]
  fn commit_fields_round_trip() {
    let db = CutDatabase::new(1);
    let mut record = db.record(0);
    record.set_camera(0, camera());
    record.set_transform(0, DMat4::IDENTITY);
    record.set_threshold(0, 2.0);

    record.set_cut(0, 0, vec![NodeSlotAggregate { node_id: 4, slot_id: 2 }]);
    record.set_updated_set(vec![SlotUpdateDesc { src_slot: 0, dst_slot: 2 }]);
    record.set_buffer(BufferTag::B);
    record.set_front_modified(true);
    record.set_swap_required(true);

    assert_eq!(record.cut(0, 0), &[NodeSlotAggregate { node_id: 4, slot_id: 2 }]);
    assert_eq!(record.transfer_descs().len(), 1);
    assert_eq!(record.buffer(), BufferTag::B);
    assert!(record.is_front_modified());
    assert!(record.is_swap_required());
    // Unset (view, model) pairs read as empty cuts.
    assert!(record.cut(3, 3).is_empty());
  }

  #[test]
  fn buffer_tag_toggles() {
    assert_eq!(BufferTag::A.other(), BufferTag::B);
    assert_eq!(BufferTag::B.other(), BufferTag::A);
  }
}
