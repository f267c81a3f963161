//! Synthetic dataset fabrication.
//!
//! The preprocessing pipeline that builds real BVH files is a separate
//! tool; the harness stands in for it with procedurally generated
//! hierarchies: a full fan-N tree, extents halving per level, centroids
//! spread laterally so camera motion actually changes visibility, and a
//! payload file whose node blocks carry recognizable byte patterns.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use glam::DVec3;

use cut_plugin::{Aabb, Bvh};

/// Number of nodes in a full fan-`fan` tree with `levels` levels.
pub fn full_tree_nodes(fan: u32, levels: u32) -> u64 {
  let fan = fan as u64;
  (fan.pow(levels) - 1) / (fan - 1)
}

/// Depth of `node` in a full fan-`fan` tree.
fn node_depth(fan: u32, node: u64) -> u32 {
  let mut depth = 0;
  let mut current = node;
  while current > 0 {
    current = (current - 1) / fan as u64;
    depth += 1;
  }
  depth
}

/// Fabricate one model: metadata plus its payload file on disk.
pub fn build_synthetic(
  name: &str,
  fan: u32,
  levels: u32,
  slot_size: usize,
  dir: &Path,
) -> Result<Bvh> {
  let num_nodes = full_tree_nodes(fan, levels);
  let data_path = dir.join(format!("{name}.lodpc"));

  let mut file = std::fs::File::create(&data_path)
    .with_context(|| format!("failed to create payload file {}", data_path.display()))?;
  let mut block = vec![0u8; slot_size];
  for node in 0..num_nodes {
    // Recognizable pattern: node id little-endian, repeated.
    for (i, byte) in block.iter_mut().enumerate() {
      *byte = (node >> ((i % 8) * 8)) as u8;
    }
    file.write_all(&block)?;
  }

  let mut centroids = Vec::with_capacity(num_nodes as usize);
  let mut extents = Vec::with_capacity(num_nodes as usize);
  let mut boxes = Vec::with_capacity(num_nodes as usize);

  for node in 0..num_nodes {
    let depth = node_depth(fan, node);
    // Cheap integer hash for lateral spread; deeper nodes cluster
    // tighter around the trunk.
    let hash = node.wrapping_mul(0x9E37_79B9_7F4A_7C15);
    let spread = 8.0 / (depth as f64 + 1.0);
    let x = ((hash >> 16) & 0xFFFF) as f64 / 65535.0 * spread - spread / 2.0;
    let y = ((hash >> 32) & 0xFFFF) as f64 / 65535.0 * spread - spread / 2.0;
    let centroid = DVec3::new(x, y, -4.0);

    let extent = 24.0 / f64::powi(2.0, depth as i32);
    let half = DVec3::splat(extent.max(0.25));
    centroids.push(centroid);
    extents.push(extent);
    boxes.push(Aabb::new(centroid - half, centroid + half));
  }

  Ok(Bvh::new(fan, centroids, extents, boxes, data_path))
}
