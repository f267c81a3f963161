use super::*;
use crate::cache::OocCache;
use crate::config::CachePolicy;
use crate::cut::index::is_ancestor_consistent;
use crate::model::{Aabb, ModelStore};
use glam::DVec3;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

const SLOT: usize = 4096;

/// Build a fan-2 model whose node errors are directly programmable:
/// every centroid sits at view-space depth 1, so with `near = 0.1` and
/// `height/(top-bottom) = 1` the error of node `n` is `0.2 * extents[n]`.
fn programmable_model(name: &str, extents: &[f64]) -> (Arc<ModelStore>, PathBuf) {
  let num_nodes = extents.len();
  let path = std::env::temp_dir().join(format!("cut_plugin_pool_{}_{}.dat", std::process::id(), name));
  let mut file = std::fs::File::create(&path).unwrap();
  for node in 0..num_nodes {
    file.write_all(&vec![node as u8; SLOT]).unwrap();
  }

  let centroids = vec![DVec3::new(0.0, 0.0, -1.0); num_nodes];
  let boxes = vec![
    Aabb::new(DVec3::new(-0.5, -0.5, -1.5), DVec3::new(0.5, 0.5, -0.5));
    num_nodes
  ];
  let bvh = Bvh::new(2, centroids, extents.to_vec(), boxes, path.clone());
  (Arc::new(ModelStore::new(vec![bvh], SLOT)), path)
}

fn test_camera() -> CameraSnapshot {
  CameraSnapshot {
    view: DMat4::IDENTITY,
    projection: DMat4::perspective_rh(std::f64::consts::FRAC_PI_2, 1.0, 0.1, 100.0),
    near_plane: 0.1,
    height_divided_by_top_minus_bottom: 1.0,
  }
}

struct Rig {
  pool: CutUpdatePool,
  cut_db: Arc<CutDatabase>,
  ooc: Arc<OocCache>,
  staging: Arc<StagingBuffers>,
  models: Arc<ModelStore>,
  upload_budget: u64,
  data_path: PathBuf,
}

impl Drop for Rig {
  fn drop(&mut self) {
    std::fs::remove_file(&self.data_path).ok();
  }
}

impl Rig {
  fn new(
    name: &str,
    extents: &[f64],
    host_slots: u64,
    gpu_slots: u64,
    upload_slots: u64,
    threshold: f64,
    num_views: usize,
    config: CoreConfig,
  ) -> Self {
    let (models, data_path) = programmable_model(name, extents);
    let ooc = Arc::new(OocCache::new(host_slots, &models).unwrap());
    let cut_db = Arc::new(CutDatabase::new(1));
    {
      let mut record = cut_db.record(0);
      for view_id in 0..num_views as u32 {
        record.set_camera(view_id, test_camera());
      }
      record.set_transform(0, DMat4::IDENTITY);
      record.set_threshold(0, threshold);
    }
    let policy = CachePolicy {
      host_cache_slots: host_slots,
      gpu_cache_slots: gpu_slots,
      upload_budget_slots: upload_slots,
    };
    let staging = Arc::new(StagingBuffers::new(upload_slots, SLOT));
    let pool = CutUpdatePool::new(
      0,
      Arc::clone(&models),
      Arc::clone(&ooc),
      Arc::clone(&cut_db),
      policy,
      config,
    );
    Self {
      pool,
      cut_db,
      ooc,
      staging,
      models,
      upload_budget: upload_slots,
      data_path,
    }
  }

  /// Run one frame to completion; `mark_rendered` plays the renderer's
  /// part in the freshness protocol.
  fn frame(&self, mark_rendered: bool) {
    if mark_rendered {
      self.cut_db.record(0).mark_rendered(0);
    }
    self.pool.dispatch(Arc::clone(&self.staging));
    for _ in 0..5000 {
      if !self.pool.is_running() {
        return;
      }
      std::thread::sleep(Duration::from_millis(1));
    }
    panic!("frame never completed");
  }

  fn cut_nodes(&self, view_id: ViewId) -> BTreeSet<NodeId> {
    self
      .cut_db
      .record(0)
      .cut(view_id, 0)
      .iter()
      .map(|aggregate| aggregate.node_id)
      .collect()
  }

  /// Drive frames until the view-0 cut equals `expected`, or fail.
  fn frames_until_cut(&self, expected: &BTreeSet<NodeId>, max_frames: usize) {
    for _ in 0..max_frames {
      self.frame(true);
      if &self.cut_nodes(0) == expected {
        return;
      }
      std::thread::sleep(Duration::from_millis(2));
    }
    panic!(
      "cut never reached {:?}; last was {:?}",
      expected,
      self.cut_nodes(0)
    );
  }

  fn assert_frame_invariants(&self) {
    let record = self.cut_db.record(0);
    let ooc = self.ooc.lock();
    let gpu = self.pool.gpu_cache().lock();

    assert!(record.transfer_descs().len() as u64 <= self.upload_budget);
    assert!(ooc.num_resident() <= ooc.num_slots());
    assert!(gpu.num_resident() <= gpu.num_slots());

    for view_id in 0..4 {
      let cut: BTreeSet<NodeId> = record.cut(view_id, 0).iter().map(|a| a.node_id).collect();
      assert!(
        is_ancestor_consistent(self.models.model(0), &cut),
        "view {view_id} cut {cut:?} holds an ancestor/descendant pair"
      );
      for &node_id in &cut {
        assert!(ooc.is_node_resident(0, node_id), "cut node {node_id} not host-resident");
        assert!(gpu.is_node_resident(0, node_id), "cut node {node_id} not device-resident");
        assert!(ooc.refcount(0, node_id) >= 1);
        assert!(gpu.refcount(0, node_id) >= 1);
      }
    }
  }
}

/// Errors: node 0 → 2.0, nodes 1-2 → 0.6, nodes 3-6 → 0.5.
fn scenario_extents() -> Vec<f64> {
  vec![10.0, 3.0, 3.0, 2.5, 2.5, 2.5, 2.5]
}

// =========================================================================
// Scenario A: initial split of the root
// =========================================================================

#[test]
fn initial_split_produces_children_and_transfers() {
  let rig = Rig::new(
    "initial_split",
    &scenario_extents(),
    8,
    4,
    4,
    0.5,
    1,
    CoreConfig::default(),
  );

  let expected: BTreeSet<NodeId> = [1, 2].into_iter().collect();
  rig.frames_until_cut(&expected, 50);

  // The frame that produced {1, 2} uploaded exactly those two payloads.
  let record = rig.cut_db.record(0);
  let descs = record.transfer_descs();
  assert_eq!(descs.len(), 2);
  assert_eq!(rig.pool.gpu_cache().lock().transfer_slots_written(), 2);
  assert_eq!(rig.pool.last_frame_stats().nodes_transferred, 2);
  assert!(record.is_swap_required());

  // Staging holds byte-exact payloads at the described entries.
  let gpu = rig.pool.gpu_cache().lock();
  let staging = rig.staging.buffer(record.buffer()).lock().unwrap();
  for node_id in [1u64, 2] {
    let dst = gpu.slot_id(0, node_id);
    let desc = descs.iter().find(|d| d.dst_slot == dst).expect("desc for node");
    let offset = desc.src_slot as usize * SLOT;
    assert_eq!(&staging[offset..offset + SLOT], &vec![node_id as u8; SLOT][..]);
  }
}

// =========================================================================
// Scenario B: collapse on freshness timeout
// =========================================================================

#[test]
fn stale_model_collapses_and_keeps_payloads() {
  let config = CoreConfig {
    max_model_timeout: 2,
    ..CoreConfig::default()
  };
  let rig = Rig::new("stale_collapse", &scenario_extents(), 8, 4, 4, 0.5, 1, config);

  let refined: BTreeSet<NodeId> = [1, 2].into_iter().collect();
  rig.frames_until_cut(&refined, 50);

  // Stop rendering the model; after the timeout the engine gives the
  // detail back.
  let collapsed: BTreeSet<NodeId> = [0].into_iter().collect();
  for _ in 0..10 {
    rig.frame(false);
    if rig.cut_nodes(0) == collapsed {
      break;
    }
  }
  assert_eq!(rig.cut_nodes(0), collapsed);

  // Children released but their device payloads stay for reuse.
  let gpu = rig.pool.gpu_cache().lock();
  for node_id in [1u64, 2] {
    assert!(gpu.is_node_resident(0, node_id));
    assert_eq!(gpu.refcount(0, node_id), 0);
  }
  assert!(gpu.refcount(0, 0) >= 1);
}

// =========================================================================
// Scenario C: upload budget admits only the most urgent split
// =========================================================================

#[test]
fn upload_budget_prefers_higher_error_split() {
  // Depth-3 tree. Errors: node 1 → 3.0, node 2 → 1.0, depth-2 nodes
  // 0.8, depth-3 nodes 0.5.
  let mut extents = vec![20.0, 15.0, 5.0];
  extents.extend(std::iter::repeat(4.0).take(4));
  extents.extend(std::iter::repeat(2.5).take(8));
  let rig = Rig::new("budget_reject", &extents, 16, 7, 2, 0.5, 1, CoreConfig::default());

  // Both children of the root want to split; the per-frame upload
  // budget of two nodes serves only the more urgent one.
  let expected: BTreeSet<NodeId> = [2, 3, 4].into_iter().collect();
  rig.frames_until_cut(&expected, 50);

  assert_eq!(rig.cut_db.record(0).transfer_descs().len(), 2);
  let stats = rig.pool.last_frame_stats();
  assert!(stats.splits_rejected >= 1, "losing split must be rejected, got {stats:?}");
  rig.assert_frame_invariants();
}

// =========================================================================
// Scenario E: root bootstrap across two frames
// =========================================================================

#[test]
fn bootstrap_skips_first_frame_then_yields_root_cut() {
  let rig = Rig::new("bootstrap", &scenario_extents(), 8, 4, 4, 0.1, 1, CoreConfig::default());

  // Frame 1: roots are still loading; nothing is committed.
  rig.frame(true);
  {
    let record = rig.cut_db.record(0);
    assert!(!record.is_swap_required());
    assert!(record.cut(0, 0).is_empty());
  }

  // Once the payload arrives a one-node cut appears.
  let expected: BTreeSet<NodeId> = [0].into_iter().collect();
  for _ in 0..50 {
    std::thread::sleep(Duration::from_millis(2));
    rig.frame(true);
    if rig.cut_nodes(0) == expected {
      break;
    }
  }
  assert_eq!(rig.cut_nodes(0), expected);
  assert!(rig.cut_db.record(0).is_swap_required());
}

// =========================================================================
// Scenario F: shutdown mid-frame
// =========================================================================

#[test]
fn shutdown_during_dispatch_neither_hangs_nor_commits_garbage() {
  let rig = Rig::new("shutdown", &scenario_extents(), 8, 4, 4, 0.5, 1, CoreConfig::default());
  let cut_db = Arc::clone(&rig.cut_db);

  rig.pool.dispatch(Arc::clone(&rig.staging));
  // Tear down while the frame is (most likely) still in flight. Drop
  // must wake every waiter and join cleanly.
  drop(rig);

  // Fresh start means the aborted frame was still bootstrapping; the
  // record must be untouched.
  let record = cut_db.record(0);
  assert!(!record.is_swap_required());
  assert!(record.cut(0, 0).is_empty());
}

// =========================================================================
// Boundary: split impossible when the device cannot hold the fan
// =========================================================================

#[test]
fn root_cut_survives_when_device_cannot_fit_children() {
  // Two device slots: root plus one. A fan of two never fits.
  let rig = Rig::new("no_fit", &scenario_extents(), 8, 2, 4, 0.5, 1, CoreConfig::default());

  let root_only: BTreeSet<NodeId> = [0].into_iter().collect();
  rig.frames_until_cut(&root_only, 50);

  for _ in 0..6 {
    rig.frame(true);
    assert_eq!(rig.cut_nodes(0), root_only);
  }
  assert!(rig.pool.last_frame_stats().splits_rejected >= 1);
}

// =========================================================================
// Multi-view refcounts
// =========================================================================

#[test]
fn two_views_hold_two_references() {
  let rig = Rig::new("two_views", &scenario_extents(), 8, 6, 4, 0.5, 2, CoreConfig::default());

  let expected: BTreeSet<NodeId> = [1, 2].into_iter().collect();
  for _ in 0..50 {
    rig.frame(true);
    if rig.cut_nodes(0) == expected && rig.cut_nodes(1) == expected {
      break;
    }
    std::thread::sleep(Duration::from_millis(2));
  }
  assert_eq!(rig.cut_nodes(0), expected);
  assert_eq!(rig.cut_nodes(1), expected);

  let gpu = rig.pool.gpu_cache().lock();
  for node_id in [1u64, 2] {
    assert_eq!(gpu.refcount(0, node_id), 2, "each view holds node {node_id}");
  }
}

// =========================================================================
// Scenario D + soak: invariants under cancellation pressure
// =========================================================================

#[test]
fn cancellation_pressure_never_breaks_ancestor_consistency() {
  // Depth-4 tree with errors halving per level; tight device cache so
  // urgent splits must cancel less-urgent work.
  let mut extents = Vec::new();
  for node in 0..31u64 {
    let depth = (node + 1).ilog2();
    extents.push(12.0 / f64::powi(2.0, depth as i32));
  }
  let config = CoreConfig {
    experimental_cancellation: true,
    split_again: true,
    prefetch_enabled: true,
    must_collapse_outside_frustum: true,
    ..CoreConfig::default()
  };
  let rig = Rig::new("soak", &extents, 24, 10, 4, 0.5, 1, config);

  // Deterministic camera path: depth sweeps change urgency, lateral
  // sweeps move subtrees out of the frustum.
  let offsets = [
    DVec3::ZERO,
    DVec3::new(0.0, 0.0, -0.5),
    DVec3::new(0.0, 0.0, 0.4),
    DVec3::new(2.5, 0.0, 0.0),
    DVec3::new(-2.5, 0.0, 0.0),
    DVec3::new(0.0, 0.0, 0.6),
    DVec3::new(1.5, 0.0, -0.3),
  ];

  for frame in 0..60 {
    let offset = offsets[frame % offsets.len()];
    {
      let mut record = rig.cut_db.record(0);
      let mut camera = test_camera();
      camera.view = DMat4::from_translation(-offset);
      record.set_camera(0, camera);
    }
    rig.frame(true);
    rig.assert_frame_invariants();
  }
}

// =========================================================================
// Determinism: worker count does not change the fixed point
// =========================================================================

#[test]
fn stable_cut_is_independent_of_worker_count() {
  fn stable_cut(name: &str, num_threads: usize) -> (BTreeSet<NodeId>, BTreeSet<NodeId>) {
    let mut extents = vec![20.0, 6.0, 3.0];
    extents.extend(std::iter::repeat(2.6).take(4));
    extents.extend(std::iter::repeat(1.0).take(8));
    let config = CoreConfig {
      num_threads,
      ..CoreConfig::default()
    };
    let rig = Rig::new(name, &extents, 16, 12, 8, 0.5, 2, config);

    let mut last = BTreeSet::new();
    let mut unchanged = 0;
    for _ in 0..80 {
      rig.frame(true);
      let cut = rig.cut_nodes(0);
      if cut == last && !cut.is_empty() {
        unchanged += 1;
        if unchanged >= 5 {
          break;
        }
      } else {
        unchanged = 0;
        last = cut;
      }
      std::thread::sleep(Duration::from_millis(2));
    }
    (rig.cut_nodes(0), rig.cut_nodes(1))
  }

  let few = stable_cut("determinism_2", 2);
  let many = stable_cut("determinism_8", 8);
  assert!(!few.0.is_empty());
  assert_eq!(few, many);
}
