//! Per-view camera snapshots, model-space frustum culling and the
//! screen-space node error estimate.
//!
//! The error estimate projects a node's average primitive extent onto
//! the screen through the near plane: a node whose primitives land on
//! more pixels than the model's threshold allows must split, one whose
//! whole sibling group lands under the lower threshold may collapse.

use glam::{DMat4, DVec3, DVec4};

use crate::model::{Aabb, Bvh};
use crate::types::NodeId;

/// Immutable per-view camera state captured at frame start.
#[derive(Clone, Copy, Debug)]
pub struct CameraSnapshot {
  pub view: DMat4,
  pub projection: DMat4,
  /// Distance to the near clipping plane.
  pub near_plane: f64,
  /// `viewport_height / (frustum_top - frustum_bottom)`; converts the
  /// projected extent into pixels.
  pub height_divided_by_top_minus_bottom: f64,
}

impl CameraSnapshot {
  /// Frustum in the coordinate space of `model_matrix`, so AABB tests
  /// run against untransformed model-space bounds.
  pub fn frustum_for_model(&self, model_matrix: &DMat4) -> Frustum {
    Frustum::from_matrix(self.projection * self.view * *model_matrix)
  }
}

/// Six clip planes with inward-facing normals.
#[derive(Clone, Copy, Debug)]
pub struct Frustum {
  planes: [DVec4; 6],
}

impl Frustum {
  /// Extract planes from a combined projection matrix (row
  /// combinations of `m`): left, right, bottom, top, near, far.
  pub fn from_matrix(m: DMat4) -> Self {
    let r0 = m.row(0);
    let r1 = m.row(1);
    let r2 = m.row(2);
    let r3 = m.row(3);
    Self {
      planes: [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r3 + r2, r3 - r2],
    }
  }

  /// False only when the box is entirely outside at least one plane;
  /// boxes straddling a plane count as visible.
  pub fn intersects_aabb(&self, aabb: &Aabb) -> bool {
    for plane in &self.planes {
      let normal = DVec3::new(plane.x, plane.y, plane.z);
      let corner = aabb.positive_corner(normal);
      if normal.dot(corner) + plane.w < 0.0 {
        return false;
      }
    }
    true
  }
}

/// Screen-space error of one node under one camera and model transform.
///
/// `|2r * (near / -z_view) * height/(top - bottom)|` where `r` is the
/// node's average primitive extent scaled by the model matrix and
/// `z_view` is the node centroid in view space. Nodes behind the camera
/// produce a negative `near / -z` ratio; the magnitude keeps the
/// ordering usable either way.
pub fn node_error(camera: &CameraSnapshot, model_matrix: &DMat4, bvh: &Bvh, node_id: NodeId) -> f64 {
  let radius_scaling = (*model_matrix * DVec4::new(1.0, 0.0, 0.0, 0.0))
    .truncate()
    .length();
  let representative_radius = bvh.avg_primitive_extent(node_id) * radius_scaling;

  let centroid = bvh.centroid(node_id);
  let view_position = camera.view * *model_matrix * centroid.extend(1.0);

  (2.0
    * representative_radius
    * (camera.near_plane / -view_position.z)
    * camera.height_divided_by_top_minus_bottom)
    .abs()
}
