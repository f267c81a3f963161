//! Model metadata and implicit BVH navigation.
//!
//! The hierarchy is never materialized: nodes are dense ids and
//! parent/child relationships are index arithmetic on the per-model
//! fan-out. Per-node metadata (centroid, average primitive extent,
//! bounding box) comes from the offline preprocessing stage; payload
//! bytes stay on disk until the host cache pulls them in.

use std::path::PathBuf;

use glam::DVec3;
use smallvec::SmallVec;

use crate::types::{ModelId, NodeId, INVALID_NODE_ID};

/// Child-id collection sized for the common fan-outs (2..8) without
/// heap traffic.
pub type NodeIdGroup = SmallVec<[NodeId; 8]>;

/// Axis-aligned bounding box in model space.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
  pub min: DVec3,
  pub max: DVec3,
}

impl Aabb {
  pub fn new(min: DVec3, max: DVec3) -> Self {
    Self { min, max }
  }

  /// Corner maximizing the dot product with `direction`; used by the
  /// frustum plane test.
  #[inline]
  pub fn positive_corner(&self, direction: DVec3) -> DVec3 {
    DVec3::new(
      if direction.x >= 0.0 { self.max.x } else { self.min.x },
      if direction.y >= 0.0 { self.max.y } else { self.min.y },
      if direction.z >= 0.0 { self.max.z } else { self.min.z },
    )
  }
}

/// Per-model BVH metadata plus the handle to its node-data file.
///
/// Node `n`'s payload starts at byte offset `n * slot_size` in
/// `data_path`; the slot size is uniform across a run and owned by
/// [`ModelStore`].
pub struct Bvh {
  fan_factor: u32,
  num_nodes: u64,
  centroids: Vec<DVec3>,
  avg_primitive_extents: Vec<f64>,
  bounding_boxes: Vec<Aabb>,
  data_path: PathBuf,
}

impl Bvh {
  /// Assemble a model from preprocessed per-node arrays.
  ///
  /// # Panics
  /// If the metadata arrays disagree in length or the fan-out is < 2.
  pub fn new(
    fan_factor: u32,
    centroids: Vec<DVec3>,
    avg_primitive_extents: Vec<f64>,
    bounding_boxes: Vec<Aabb>,
    data_path: PathBuf,
  ) -> Self {
    assert!(fan_factor >= 2, "fan-out must be at least 2, got {fan_factor}");
    assert_eq!(centroids.len(), avg_primitive_extents.len());
    assert_eq!(centroids.len(), bounding_boxes.len());
    Self {
      fan_factor,
      num_nodes: centroids.len() as u64,
      centroids,
      avg_primitive_extents,
      bounding_boxes,
      data_path,
    }
  }

  #[inline]
  pub fn fan_factor(&self) -> u32 {
    self.fan_factor
  }

  #[inline]
  pub fn num_nodes(&self) -> u64 {
    self.num_nodes
  }

  #[inline]
  pub fn centroid(&self, node_id: NodeId) -> DVec3 {
    self.centroids[node_id as usize]
  }

  #[inline]
  pub fn avg_primitive_extent(&self, node_id: NodeId) -> f64 {
    self.avg_primitive_extents[node_id as usize]
  }

  #[inline]
  pub fn bounding_box(&self, node_id: NodeId) -> Aabb {
    self.bounding_boxes[node_id as usize]
  }

  #[inline]
  pub fn data_path(&self) -> &PathBuf {
    &self.data_path
  }

  /// Parent of `node_id`, or the invalid sentinel for the root.
  pub fn parent_id(&self, node_id: NodeId) -> NodeId {
    if node_id == 0 || node_id == INVALID_NODE_ID {
      return INVALID_NODE_ID;
    }
    (node_id - 1) / self.fan_factor as u64
  }

  /// All children of `node_id`, in id order. Ids past the end of the
  /// tree come back as the invalid sentinel so callers can reject
  /// splits of leaves uniformly.
  pub fn children(&self, node_id: NodeId) -> NodeIdGroup {
    let fan = self.fan_factor as u64;
    (1..=fan)
      .map(|k| {
        let child = node_id * fan + k;
        if child < self.num_nodes {
          child
        } else {
          INVALID_NODE_ID
        }
      })
      .collect()
  }

  /// The full sibling group containing `node_id` (itself included),
  /// i.e. all children of its parent. Empty for the root.
  pub fn siblings(&self, node_id: NodeId) -> NodeIdGroup {
    let parent = self.parent_id(node_id);
    if parent == INVALID_NODE_ID {
      return NodeIdGroup::new();
    }
    self.children(parent)
  }

  /// Whether every child of `node_id` exists in the tree.
  pub fn has_full_fan(&self, node_id: NodeId) -> bool {
    node_id * self.fan_factor as u64 + (self.fan_factor as u64) < self.num_nodes
  }
}

/// All models of a run plus the uniform payload slot size.
pub struct ModelStore {
  models: Vec<Bvh>,
  slot_size: usize,
}

impl ModelStore {
  /// # Panics
  /// If `slot_size` is zero or no models are given.
  pub fn new(models: Vec<Bvh>, slot_size: usize) -> Self {
    assert!(slot_size > 0, "slot size must be positive");
    assert!(!models.is_empty(), "a run needs at least one model");
    Self { models, slot_size }
  }

  #[inline]
  pub fn num_models(&self) -> u32 {
    self.models.len() as u32
  }

  #[inline]
  pub fn model(&self, model_id: ModelId) -> &Bvh {
    &self.models[model_id as usize]
  }

  #[inline]
  pub fn slot_size(&self) -> usize {
    self.slot_size
  }

  pub fn iter(&self) -> impl Iterator<Item = (ModelId, &Bvh)> {
    self.models.iter().enumerate().map(|(i, m)| (i as ModelId, m))
  }
}
