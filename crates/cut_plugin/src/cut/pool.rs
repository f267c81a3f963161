//! Cut-update coordinator.
//!
//! Owns the worker pool and runs one frame per dispatch:
//!
//! ```text
//! dispatch()            worker threads
//! ┌──────────────┐
//! │ push Master  │──►┌─────────────────────────────────────────┐
//! └──────────────┘   │ prepare: snapshot record, reset budgets, │
//!                    │          bootstrap roots                 │
//!                    │ swap staging buffer tag                  │
//!                    │ fan out V×M Analysis tasks ──► workers   │
//!                    │ wait barrier, sort queues                │
//!                    │ run single Update task    ──► one worker │
//!                    │ wait barrier                             │
//!                    │ commit cuts + transfer list to record    │
//!                    └─────────────────────────────────────────┘
//! ```
//!
//! Analysis classifies every previous-cut node against its camera and
//! produces actions; the update drains `MustSplit` in descending error
//! order under cache and upload-budget constraints, collapsing or (in
//! experimental mode) cancelling lower-priority work to make room.
//! Whatever survives becomes the new cut; freshly registered device
//! slots are copied from the host cache into the active staging region
//! and described to the renderer as `(staging index, device slot)`
//! pairs.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use glam::DMat4;
use tracing::{debug, info};
use web_time::Instant;

use crate::cache::gpu::{GpuCache, GpuState};
use crate::cache::ooc::{OocCache, OocState};
use crate::camera::{self, CameraSnapshot, Frustum};
use crate::config::{CachePolicy, CoreConfig};
use crate::constants::{
  DEFAULT_ERROR_THRESHOLD, MAX_ERROR_THRESHOLD, MIN_ERROR_THRESHOLD, PREFETCH_FREE_SLOT_DIVISOR,
  CANCELLED_SPLIT_KEEP_FACTOR, ROOT_BOOTSTRAP_ERROR, ROOT_LOAD_PRIORITY, THRESHOLD_HYSTERESIS,
};
use crate::cut::index::CutIndex;
use crate::cut::queue::{Job, JobQueue};
use crate::cut::record::{BufferTag, CutDatabase, NodeSlotAggregate, SlotUpdateDesc};
use crate::model::{Bvh, ModelStore, NodeIdGroup};
use crate::semaphore::Semaphore;
use crate::stats::FrameStats;
use crate::types::{Action, ActionKind, ContextId, ModelId, NodeId, ViewId, INVALID_NODE_ID};

/// Double-buffered upload staging regions handed to the coordinator
/// each frame. The coordinator fills one; the renderer consumes the
/// one named by the record's buffer tag.
pub struct StagingBuffers {
  buffer_a: Mutex<Vec<u8>>,
  buffer_b: Mutex<Vec<u8>>,
}

impl StagingBuffers {
  /// Allocate both regions sized for a full upload budget.
  pub fn new(upload_budget_slots: u64, slot_size: usize) -> Self {
    let bytes = upload_budget_slots as usize * slot_size;
    Self {
      buffer_a: Mutex::new(vec![0u8; bytes]),
      buffer_b: Mutex::new(vec![0u8; bytes]),
    }
  }

  /// The region a tag refers to.
  pub fn buffer(&self, tag: BufferTag) -> &Mutex<Vec<u8>> {
    match tag {
      BufferTag::A => &self.buffer_a,
      BufferTag::B => &self.buffer_b,
    }
  }
}

/// Immutable camera/transform context for one analysis task.
struct AnalysisContext {
  camera: CameraSnapshot,
  model_matrix: DMat4,
  frustum: Frustum,
  min_error_threshold: f64,
  max_error_threshold: f64,
  freshness_timeout: bool,
}

/// Frame-start snapshot used by the single-threaded update phase.
struct UpdateContext {
  cameras: HashMap<ViewId, CameraSnapshot>,
  transforms: HashMap<ModelId, DMat4>,
  thresholds: HashMap<ModelId, f64>,
  model_freshness: HashMap<ModelId, u64>,
  counter: u64,
}

impl UpdateContext {
  fn node_error(&self, models: &ModelStore, view_id: ViewId, model_id: ModelId, node_id: NodeId) -> f64 {
    let camera = &self.cameras[&view_id];
    let model_matrix = self.transforms.get(&model_id).copied().unwrap_or(DMat4::IDENTITY);
    camera::node_error(camera, &model_matrix, models.model(model_id), node_id)
  }

  fn threshold(&self, model_id: ModelId) -> f64 {
    self
      .thresholds
      .get(&model_id)
      .copied()
      .unwrap_or(DEFAULT_ERROR_THRESHOLD)
  }

  fn is_stale(&self, model_id: ModelId, max_model_timeout: u64) -> bool {
    let freshness = self.model_freshness.get(&model_id).copied().unwrap_or(0);
    self.counter.saturating_sub(freshness) > max_model_timeout
  }
}

/// Mutable coordinator state behind one lock.
struct PoolState {
  shutdown: bool,
  master_dispatched: bool,
  staging: Option<Arc<StagingBuffers>>,
  current_buffer: BufferTag,
  cameras: HashMap<ViewId, CameraSnapshot>,
  transforms: HashMap<ModelId, DMat4>,
  thresholds: HashMap<ModelId, f64>,
  model_freshness: HashMap<ModelId, u64>,
  cut_update_counter: u64,
  last_frame_elapsed: Duration,
  last_frame_time: Option<Instant>,
  render_list: HashMap<(ViewId, ModelId), Vec<NodeSlotAggregate>>,
  transfer_descs: Vec<SlotUpdateDesc>,
  stats: FrameStats,
}

struct PoolShared {
  context_id: ContextId,
  config: CoreConfig,
  upload_budget_slots: u64,
  render_budget_slots: u64,
  models: Arc<ModelStore>,
  ooc_cache: Arc<OocCache>,
  gpu_cache: GpuCache,
  cut_db: Arc<CutDatabase>,
  index: Mutex<CutIndex>,
  job_queue: JobQueue,
  work_sem: Semaphore,
  master_sem: Semaphore,
  state: Mutex<PoolState>,
}

/// Per-context cut-update engine. Construction spawns the worker pool;
/// drop shuts it down and joins every thread.
pub struct CutUpdatePool {
  shared: Arc<PoolShared>,
  workers: Vec<JoinHandle<()>>,
}

impl CutUpdatePool {
  /// Build a coordinator for one context.
  ///
  /// The host cache is shared across contexts; the GPU cache and
  /// action index are created here, sized by `policy`.
  ///
  /// # Panics
  /// If `policy.gpu_cache_slots` is zero or fewer than two worker
  /// threads are configured (the master occupies one while it waits
  /// for the others).
  pub fn new(
    context_id: ContextId,
    models: Arc<ModelStore>,
    ooc_cache: Arc<OocCache>,
    cut_db: Arc<CutDatabase>,
    policy: CachePolicy,
    config: CoreConfig,
  ) -> Self {
    assert!(policy.gpu_cache_slots > 0, "gpu cache needs at least one slot");
    assert!(
      config.num_threads >= 2,
      "cut-update pool needs at least two workers, got {}",
      config.num_threads
    );

    info!(
      context_id,
      num_models = models.num_models(),
      gpu_slots = policy.gpu_cache_slots,
      upload_slots = policy.upload_budget_slots,
      "starting cut-update pool"
    );

    let shared = Arc::new(PoolShared {
      context_id,
      config,
      upload_budget_slots: policy.upload_budget_slots,
      render_budget_slots: policy.gpu_cache_slots,
      gpu_cache: GpuCache::new(policy.gpu_cache_slots, models.num_models()),
      index: Mutex::new(CutIndex::new(Arc::clone(&models))),
      models,
      ooc_cache,
      cut_db,
      job_queue: JobQueue::new(),
      work_sem: Semaphore::new(),
      master_sem: Semaphore::new(),
      state: Mutex::new(PoolState {
        shutdown: false,
        master_dispatched: false,
        staging: None,
        current_buffer: BufferTag::A,
        cameras: HashMap::new(),
        transforms: HashMap::new(),
        thresholds: HashMap::new(),
        model_freshness: HashMap::new(),
        cut_update_counter: 0,
        last_frame_elapsed: Duration::ZERO,
        last_frame_time: None,
        render_list: HashMap::new(),
        transfer_descs: Vec::new(),
        stats: FrameStats::default(),
      }),
    });

    let workers = (0..config.num_threads)
      .map(|_| {
        let shared = Arc::clone(&shared);
        std::thread::spawn(move || worker_loop(shared))
      })
      .collect();

    Self { shared, workers }
  }

  /// Start one frame. A no-op while a previous frame is still running.
  pub fn dispatch(&self, staging: Arc<StagingBuffers>) {
    let mut state = self.shared.state.lock().unwrap();

    if self.shared.config.repeat_mode {
      if let Some(started) = state.last_frame_time {
        state.last_frame_elapsed = started.elapsed();
      }
      state.last_frame_time = Some(Instant::now());
    }

    if state.master_dispatched {
      return;
    }
    state.staging = Some(staging);
    state.master_dispatched = true;
    drop(state);

    self.shared.job_queue.push_job(Job::Master);
    self.shared.work_sem.signal(1);
  }

  /// Whether a dispatched frame has not yet committed.
  pub fn is_running(&self) -> bool {
    self.shared.state.lock().unwrap().master_dispatched
  }

  /// Counters from the most recently committed frame.
  pub fn last_frame_stats(&self) -> FrameStats {
    self.shared.state.lock().unwrap().stats
  }

  /// The context's device cache, for diagnostics and tests.
  pub fn gpu_cache(&self) -> &GpuCache {
    &self.shared.gpu_cache
  }
}

impl Drop for CutUpdatePool {
  fn drop(&mut self) {
    {
      let mut state = self.shared.state.lock().unwrap();
      state.shutdown = true;
    }
    self.shared.work_sem.shutdown();
    self.shared.master_sem.shutdown();

    for worker in self.workers.drain(..) {
      let _ = worker.join();
    }
    info!(context_id = self.shared.context_id, "cut-update pool stopped");
  }
}

fn worker_loop(shared: Arc<PoolShared>) {
  loop {
    shared.work_sem.wait();
    if shared.is_shutdown() {
      break;
    }
    match shared.job_queue.pop_job() {
      Some(Job::Master) => shared.cut_master(),
      Some(Job::Analysis { view_id, model_id }) => shared.cut_analysis(view_id, model_id),
      Some(Job::Update) => shared.cut_update(),
      // Lost a signal race; go back to waiting.
      None => {}
    }
  }
}

impl PoolShared {
  fn is_shutdown(&self) -> bool {
    self.state.lock().unwrap().shutdown
  }

  fn state(&self) -> MutexGuard<'_, PoolState> {
    self.state.lock().unwrap()
  }

  // --- frame master ---------------------------------------------------

  fn cut_master(&self) {
    if !self.prepare() {
      self.state().master_dispatched = false;
      return;
    }

    {
      let ooc = self.ooc_cache.lock();
      let gpu = self.gpu_cache.lock();
      debug!(
        host_free = ooc.num_free_slots(),
        host_slots = ooc.num_slots(),
        gpu_free = gpu.num_free_slots(),
        gpu_slots = gpu.num_slots(),
        "cache occupancy at frame start"
      );
    }

    // Swap and use the other staging region.
    {
      let mut state = self.state();
      state.current_buffer = state.current_buffer.other();
    }

    let frame_budget = self.state().last_frame_elapsed / 2;
    let loop_start = Instant::now();
    let mut num_updates = 0u32;

    loop {
      let (num_views, num_models) = {
        let index = self.index.lock().unwrap();
        (index.num_views(), index.num_models())
      };
      let total_tasks = num_views as usize * num_models as usize;

      self.index.lock().unwrap().swap_cuts();

      debug_assert_eq!(self.work_sem.num_signals(), 0);
      debug_assert_eq!(self.master_sem.num_signals(), 0);

      // Analysis fan-out: every (view, model) pair in parallel.
      self.master_sem.set_bounds(total_tasks, total_tasks);
      self.work_sem.set_bounds(1, total_tasks.max(1));
      for view_id in 0..num_views {
        for model_id in 0..num_models {
          self.job_queue.push_job(Job::Analysis { view_id, model_id });
        }
      }
      self.work_sem.signal(total_tasks);

      self.master_sem.wait();
      if self.is_shutdown() {
        return;
      }

      self.index.lock().unwrap().sort();

      // Single-threaded update.
      self.master_sem.set_bounds(1, 1);
      self.work_sem.set_bounds(1, 1);
      self.job_queue.push_job(Job::Update);
      self.work_sem.signal(1);

      self.master_sem.wait();
      if self.is_shutdown() {
        return;
      }

      num_updates += 1;
      if !self.config.repeat_mode
        || num_updates >= self.config.max_updates_per_frame
        || loop_start.elapsed() >= frame_budget
      {
        break;
      }
    }

    self.commit();
  }

  fn commit(&self) {
    let mut record = self.cut_db.record(self.context_id);
    let mut state = self.state();
    let budget_left = self.gpu_cache.lock().transfer_budget();

    let render_list = std::mem::take(&mut state.render_list);
    for ((view_id, model_id), aggregates) in render_list {
      record.set_cut(view_id, model_id, aggregates);
    }
    record.set_updated_set(std::mem::take(&mut state.transfer_descs));
    record.set_front_modified(budget_left < self.upload_budget_slots);
    record.set_swap_required(true);
    record.set_buffer(state.current_buffer);

    debug!(
      context_id = self.context_id,
      splits = state.stats.splits_approved,
      collapses = state.stats.collapses_applied,
      transferred = state.stats.nodes_transferred,
      "frame committed"
    );

    state.master_dispatched = false;
  }

  /// Snapshot the record and make sure every root is resident and
  /// acquired. Returns false when the frame must be skipped (roots
  /// still loading); the renderer keeps drawing the previous cut.
  fn prepare(&self) -> bool {
    let num_models = self.models.num_models();

    {
      let mut record = self.cut_db.record(self.context_id);
      let mut state = self.state();

      state.cameras = record.cameras().clone();
      state.transforms = record.transforms().clone();
      state.thresholds = record
        .thresholds()
        .iter()
        .map(|(&model_id, &t)| (model_id, t.clamp(MIN_ERROR_THRESHOLD, MAX_ERROR_THRESHOLD)))
        .collect();
      for model_id in 0..num_models {
        state.thresholds.entry(model_id).or_insert(DEFAULT_ERROR_THRESHOLD);
        state.transforms.entry(model_id).or_insert(DMat4::IDENTITY);
      }

      state.cut_update_counter += 1;
      let counter = state.cut_update_counter;
      for model_id in record.take_rendered() {
        state.model_freshness.insert(model_id, counter);
      }

      state.render_list.clear();
      state.transfer_descs.clear();
      state.stats = FrameStats::default();
    }

    {
      let mut gpu = self.gpu_cache.lock();
      gpu.reset_transfer_list();
      gpu.set_transfer_budget(self.upload_budget_slots);
      gpu.set_transfer_slots_written(0);
    }

    let num_views = self.state().cameras.len() as u32;
    let mut index = self.index.lock().unwrap();
    index.update_policy(num_views);

    // Root-residency bootstrap.
    let mut all_cuts_populated = true;
    for model_id in 0..num_models {
      for view_id in 0..num_views {
        if index.is_current_cut_empty(view_id, model_id) {
          all_cuts_populated = false;
        }
      }
    }
    if all_cuts_populated {
      return true;
    }

    let mut ooc = self.ooc_cache.lock();
    ooc.refresh();

    let mut missing_root = false;
    for model_id in 0..num_models {
      if !ooc.is_node_resident(model_id, 0) {
        ooc.register_node(model_id, 0, ROOT_LOAD_PRIORITY);
        missing_root = true;
      }
    }
    if missing_root {
      return false;
    }

    let mut gpu = self.gpu_cache.lock();
    for model_id in 0..num_models {
      if !gpu.is_node_resident(model_id, 0) && !gpu.register_node(model_id, 0) {
        // Device slot unavailable this frame; retry next dispatch.
        return false;
      }
      for view_id in 0..num_views {
        if index.is_current_cut_empty(view_id, model_id) {
          assert!(ooc.is_node_resident(model_id, 0));
          assert!(gpu.is_node_resident(model_id, 0));
          ooc.acquire_node(self.context_id, view_id, model_id, 0);
          gpu.acquire_node(self.context_id, view_id, model_id, 0);
          index.push_action(
            Action::new(ActionKind::Keep, view_id, model_id, 0, ROOT_BOOTSTRAP_ERROR),
            false,
          );
        }
      }
    }

    true
  }

  // --- analysis -------------------------------------------------------

  fn cut_analysis(&self, view_id: ViewId, model_id: ModelId) {
    let Some(actx) = self.analysis_context(view_id, model_id) else {
      self.master_sem.signal(1);
      return;
    };
    let bvh = self.models.model(model_id);

    let old_cut: BTreeSet<NodeId> = {
      let mut index = self.index.lock().unwrap();
      let previous = index.previous_cut(view_id, model_id);
      index.reset_cut(view_id, model_id);
      previous
    };
    let ordered: Vec<NodeId> = old_cut.iter().copied().collect();
    let fan = bvh.fan_factor() as usize;

    let mut actions = Vec::new();
    let mut i = 0;
    while i < ordered.len() {
      let node_id = ordered[i];
      debug_assert!(node_id < bvh.num_nodes());

      let mut all_siblings_in_cut = false;
      let mut no_sibling_in_frustum = true;
      let mut parent_id = 0;
      let mut parent_error = 0.0;
      let mut siblings = NodeIdGroup::new();

      if node_id > 0 {
        parent_id = bvh.parent_id(node_id);
        parent_error = self.analysis_error(&actx, bvh, parent_id);
        siblings = bvh.siblings(node_id);
        all_siblings_in_cut = all_nodes_in_cut(bvh, &siblings, &old_cut);
        no_sibling_in_frustum = !actx.frustum.intersects_aabb(&bvh.bounding_box(parent_id));
      }

      if !all_siblings_in_cut {
        let node_error = self.analysis_error(&actx, bvh, node_id);
        let node_in_frustum = actx.frustum.intersects_aabb(&bvh.bounding_box(node_id));

        if node_in_frustum && node_error > actx.max_error_threshold {
          let split = self.children_support_split(&actx, bvh, node_id);
          if !split || actx.freshness_timeout {
            actions.push(Action::new(ActionKind::Keep, view_id, model_id, node_id, parent_error));
          } else {
            actions.push(Action::new(ActionKind::MustSplit, view_id, model_id, node_id, node_error));
          }
        } else {
          actions.push(Action::new(ActionKind::Keep, view_id, model_id, node_id, parent_error));
        }
        i += 1;
        continue;
      }

      // The whole sibling group is in the cut.
      if no_sibling_in_frustum {
        let kind = if self.config.must_collapse_outside_frustum {
          ActionKind::MustCollapse
        } else {
          ActionKind::CollapseOnNeed
        };
        actions.push(Action::new(kind, view_id, model_id, parent_id, parent_error));
        i += fan;
        continue;
      }

      if actx.freshness_timeout {
        actions.push(Action::new(
          ActionKind::CollapseOnNeed,
          view_id,
          model_id,
          parent_id,
          parent_error,
        ));
        i += fan;
        continue;
      }

      let mut keep_all_siblings = true;
      let mut all_errors_below_min = true;
      let mut keep_sibling = Vec::with_capacity(fan);

      for &sibling_id in &siblings {
        let sibling_error = self.analysis_error(&actx, bvh, sibling_id);
        let sibling_in_frustum = actx.frustum.intersects_aabb(&bvh.bounding_box(sibling_id));

        if sibling_error > actx.max_error_threshold && sibling_in_frustum {
          if self.children_support_split(&actx, bvh, sibling_id) {
            actions.push(Action::new(
              ActionKind::MustSplit,
              view_id,
              model_id,
              sibling_id,
              sibling_error,
            ));
            keep_all_siblings = false;
            keep_sibling.push(false);
          } else {
            keep_sibling.push(true);
          }
        } else {
          keep_sibling.push(true);
        }

        if sibling_error >= actx.min_error_threshold {
          all_errors_below_min = false;
        }
      }

      if keep_all_siblings && all_errors_below_min {
        actions.push(Action::new(
          ActionKind::MustCollapse,
          view_id,
          model_id,
          parent_id,
          parent_error,
        ));
      } else if keep_all_siblings {
        actions.push(Action::new(
          ActionKind::MaybeCollapse,
          view_id,
          model_id,
          parent_id,
          parent_error,
        ));
      } else {
        for (j, &sibling_id) in siblings.iter().enumerate() {
          if keep_sibling[j] {
            actions.push(Action::new(ActionKind::Keep, view_id, model_id, sibling_id, parent_error));
          }
        }
      }

      i += fan;
    }

    {
      let mut index = self.index.lock().unwrap();
      for action in actions {
        index.push_action(action, false);
      }
    }

    self.master_sem.signal(1);
  }

  fn analysis_context(&self, view_id: ViewId, model_id: ModelId) -> Option<AnalysisContext> {
    let state = self.state();
    let camera = state.cameras.get(&view_id).copied()?;
    let model_matrix = state.transforms.get(&model_id).copied().unwrap_or(DMat4::IDENTITY);
    let threshold = state
      .thresholds
      .get(&model_id)
      .copied()
      .unwrap_or(DEFAULT_ERROR_THRESHOLD);
    let freshness = state.model_freshness.get(&model_id).copied().unwrap_or(0);
    let freshness_timeout =
      state.cut_update_counter.saturating_sub(freshness) > self.config.max_model_timeout;

    Some(AnalysisContext {
      frustum: camera.frustum_for_model(&model_matrix),
      camera,
      model_matrix,
      min_error_threshold: threshold - THRESHOLD_HYSTERESIS,
      max_error_threshold: threshold + THRESHOLD_HYSTERESIS,
      freshness_timeout,
    })
  }

  fn analysis_error(&self, actx: &AnalysisContext, bvh: &Bvh, node_id: NodeId) -> f64 {
    camera::node_error(&actx.camera, &actx.model_matrix, bvh, node_id)
  }

  /// A split is only worthwhile when every child exists and none is
  /// predicted to immediately want collapsing again.
  fn children_support_split(&self, actx: &AnalysisContext, bvh: &Bvh, node_id: NodeId) -> bool {
    for child_id in bvh.children(node_id) {
      if child_id == INVALID_NODE_ID {
        return false;
      }
      if self.analysis_error(actx, bvh, child_id) < actx.min_error_threshold {
        return false;
      }
    }
    true
  }

  // --- update ---------------------------------------------------------

  fn cut_update(&self) {
    let uctx = self.update_snapshot();
    let mut stats = FrameStats::default();
    let mut pending_prefetch: Vec<Action> = Vec::new();
    let mut deferred_rejects: Vec<Action> = Vec::new();

    let mut index = self.index.lock().unwrap();
    {
      let mut ooc = self.ooc_cache.lock();
      ooc.refresh();
      let mut gpu = self.gpu_cache.lock();

      let mut check_residency = true;
      let mut all_children_in_ooc = true;
      let mut all_children_in_gpu = true;

      while let Some(must_split) = index.front_action(ActionKind::MustSplit) {
        let bvh = self.models.model(must_split.model_id);
        let fan = bvh.fan_factor() as u64;

        if check_residency {
          let child_ids = bvh.children(must_split.node_id);
          all_children_in_ooc = true;
          all_children_in_gpu = true;
          for &child_id in &child_ids {
            if !ooc.is_node_resident(must_split.model_id, child_id) {
              all_children_in_ooc = false;
              if !all_children_in_gpu {
                break;
              }
            }
            if !gpu.is_node_resident(must_split.model_id, child_id) {
              all_children_in_gpu = false;
              if !all_children_in_ooc {
                break;
              }
            }
          }

          if all_children_in_ooc && all_children_in_gpu {
            index.pop_front_action(ActionKind::MustSplit);
            for &child_id in &child_ids {
              gpu.acquire_node(self.context_id, must_split.view_id, must_split.model_id, child_id);
              ooc.acquire_node(self.context_id, must_split.view_id, must_split.model_id, child_id);
            }
            if self.config.split_again {
              self.split_again(&mut index, &uctx, must_split);
            } else {
              index.approve_action(must_split);
            }
            stats.splits_approved += 1;
            continue;
          }
        }
        check_residency = false;

        let children_fit_in_ooc = ooc.num_free_slots() >= fan;
        let children_fit_in_gpu = gpu.num_free_slots() >= fan;

        if (children_fit_in_ooc && children_fit_in_gpu)
          || (all_children_in_ooc && children_fit_in_gpu)
        {
          let action = index.pop_front_action(ActionKind::MustSplit).expect("front exists");
          self.split_node(&mut index, &mut ooc, &mut gpu, &uctx, action, &mut stats, &mut pending_prefetch);
          check_residency = true;
          continue;
        }

        // Free space: forced collapses first, then on-need, then the
        // most tolerable maybe-collapse.
        if let Some(collapse) = index.pop_front_action(ActionKind::MustCollapse) {
          self.collapse_node(&mut index, &mut ooc, &mut gpu, collapse, &mut stats);
          continue;
        }
        if let Some(collapse) = index.pop_front_action(ActionKind::CollapseOnNeed) {
          self.collapse_node(&mut index, &mut ooc, &mut gpu, collapse, &mut stats);
          continue;
        }
        if let Some(back) = index.back_action(ActionKind::MaybeCollapse) {
          if must_split.error > back.error {
            let collapse = index.pop_back_action(ActionKind::MaybeCollapse).expect("back exists");
            self.collapse_node(&mut index, &mut ooc, &mut gpu, collapse, &mut stats);
            continue;
          }
        }

        if self.config.experimental_cancellation {
          if self.try_cancel_keep(&mut index, &mut ooc, &mut gpu, &must_split, &mut stats) {
            continue;
          }
          if self.try_cancel_lower_split(&mut index, &uctx, &must_split) {
            continue;
          }
        }

        // Out of options: the split is refused this frame.
        let action = index.pop_front_action(ActionKind::MustSplit).expect("front exists");
        index.reject_action(action);
        stats.splits_rejected += 1;
        check_residency = true;
      }

      // Remaining forced collapses always apply; they free slots.
      while let Some(collapse) = index.pop_front_action(ActionKind::MustCollapse) {
        self.collapse_node(&mut index, &mut ooc, &mut gpu, collapse, &mut stats);
      }

      // Stale models relinquish their detail even without pressure;
      // fresh on-need collapses are only taken when a split demanded
      // the room.
      while let Some(collapse) = index.pop_front_action(ActionKind::CollapseOnNeed) {
        if uctx.is_stale(collapse.model_id, self.config.max_model_timeout) {
          self.collapse_node(&mut index, &mut ooc, &mut gpu, collapse, &mut stats);
        } else {
          deferred_rejects.push(collapse);
        }
      }

      if self.config.prefetch_enabled {
        self.prefetch_routine(&mut ooc, &gpu, &uctx, std::mem::take(&mut pending_prefetch));
      }
    }

    for action in deferred_rejects {
      index.reject_action(action);
    }
    while let Some(collapse) = index.pop_front_action(ActionKind::MaybeCollapse) {
      index.reject_action(collapse);
    }
    while let Some(keep) = index.pop_front_action(ActionKind::Keep) {
      index.approve_action(keep);
      stats.keeps_approved += 1;
    }

    for kind in ActionKind::ALL {
      assert_eq!(index.num_actions(kind), 0, "queue {kind:?} not drained after update");
    }

    {
      let mut ooc = self.ooc_cache.lock();
      let mut gpu = self.gpu_cache.lock();
      self.compile_render_list(&index, &gpu);
      self.compile_transfer_list(&ooc, &mut gpu, &mut stats);
      // Promote loads that completed during the frame so the next
      // dispatch sees them.
      ooc.refresh();
    }

    {
      let mut state = self.state();
      state.stats.splits_approved += stats.splits_approved;
      state.stats.splits_rejected += stats.splits_rejected;
      state.stats.collapses_applied += stats.collapses_applied;
      state.stats.keeps_approved += stats.keeps_approved;
      state.stats.nodes_transferred += stats.nodes_transferred;
      state.stats.update_iterations += 1;
    }

    self.master_sem.signal(1);
  }

  fn update_snapshot(&self) -> UpdateContext {
    let state = self.state();
    UpdateContext {
      cameras: state.cameras.clone(),
      transforms: state.transforms.clone(),
      thresholds: state.thresholds.clone(),
      model_freshness: state.model_freshness.clone(),
      counter: state.cut_update_counter,
    }
  }

  /// Try to register and acquire every child of a split whose group
  /// was judged to fit. Rejection leaves registrations in flight for a
  /// later frame.
  #[allow(clippy::too_many_arguments)]
  fn split_node(
    &self,
    index: &mut CutIndex,
    ooc: &mut OocState,
    gpu: &mut GpuState,
    uctx: &UpdateContext,
    action: Action,
    stats: &mut FrameStats,
    pending_prefetch: &mut Vec<Action>,
  ) {
    let bvh = self.models.model(action.model_id);
    let child_ids = bvh.children(action.node_id);

    if action.node_id == INVALID_NODE_ID || child_ids[0] == INVALID_NODE_ID {
      index.reject_action(action);
      stats.splits_rejected += 1;
      return;
    }
    debug_assert!(child_ids[0] < bvh.num_nodes());

    // With the upload budget spent, nothing new can reach the device
    // this frame; do not schedule disk reads that cannot be consumed.
    if gpu.transfer_budget() == 0
      && child_ids
        .iter()
        .any(|&child_id| !gpu.is_node_resident(action.model_id, child_id))
    {
      index.reject_action(action);
      stats.splits_rejected += 1;
      return;
    }

    let fan = bvh.fan_factor() as u64;
    let mut all_children_available = true;
    let children_fit_in_ooc = ooc.num_free_slots() >= fan;
    let children_fit_in_gpu = gpu.transfer_budget() >= fan && gpu.num_free_slots() >= fan;

    for &child_id in &child_ids {
      if !ooc.is_node_resident(action.model_id, child_id) {
        if children_fit_in_ooc && ooc.num_free_slots() > 0 {
          ooc.register_node(action.model_id, child_id, action.error as i64);
        }
        all_children_available = false;
      }
    }

    if all_children_available {
      for &child_id in &child_ids {
        if gpu.is_node_resident(action.model_id, child_id) {
          continue;
        }
        if children_fit_in_gpu
          && gpu.transfer_budget() > 0
          && gpu.num_free_slots() > 0
          && gpu.register_node(action.model_id, child_id)
        {
          continue;
        }
        all_children_available = false;
      }
    }

    if all_children_available {
      for &child_id in &child_ids {
        gpu.acquire_node(self.context_id, action.view_id, action.model_id, child_id);
        ooc.acquire_node(self.context_id, action.view_id, action.model_id, child_id);
      }
      if self.config.prefetch_enabled {
        pending_prefetch.push(action);
      }
      if self.config.split_again {
        self.split_again(index, uctx, action);
      } else {
        index.approve_action(action);
      }
      stats.splits_approved += 1;
    } else {
      index.reject_action(action);
      stats.splits_rejected += 1;
    }
  }

  /// Release a sibling group and commit its parent.
  fn collapse_node(
    &self,
    index: &mut CutIndex,
    ooc: &mut OocState,
    gpu: &mut GpuState,
    action: Action,
    stats: &mut FrameStats,
  ) {
    if action.node_id < 1 || action.node_id == INVALID_NODE_ID {
      index.reject_action(action);
      return;
    }

    let bvh = self.models.model(action.model_id);
    for child_id in bvh.children(action.node_id) {
      if child_id == INVALID_NODE_ID {
        continue;
      }
      gpu.release_node(self.context_id, action.view_id, action.model_id, child_id);
      ooc.release_node(self.context_id, action.view_id, action.model_id, child_id);
    }
    index.approve_action(action);
    stats.collapses_applied += 1;
  }

  /// Re-classify the children of an approved split instead of
  /// committing it directly; pushes preserve queue order.
  fn split_again(&self, index: &mut CutIndex, uctx: &UpdateContext, action: Action) {
    let bvh = self.models.model(action.model_id);
    let threshold = uctx.threshold(action.model_id);
    let min_error_threshold = threshold - THRESHOLD_HYSTERESIS;
    let max_error_threshold = threshold + THRESHOLD_HYSTERESIS;

    for candidate_id in bvh.children(action.node_id) {
      if candidate_id == INVALID_NODE_ID {
        continue;
      }
      let candidate_error = uctx.node_error(&self.models, action.view_id, action.model_id, candidate_id);

      if candidate_error > max_error_threshold {
        let mut split = true;
        for child_id in bvh.children(candidate_id) {
          if child_id == INVALID_NODE_ID {
            split = false;
            break;
          }
          if uctx.node_error(&self.models, action.view_id, action.model_id, child_id) < min_error_threshold {
            split = false;
            break;
          }
        }
        let kind = if split { ActionKind::MustSplit } else { ActionKind::Keep };
        index.push_action(
          Action::new(kind, action.view_id, action.model_id, candidate_id, candidate_error),
          true,
        );
      } else {
        index.push_action(
          Action::new(ActionKind::Keep, action.view_id, action.model_id, candidate_id, candidate_error),
          true,
        );
      }
    }
  }

  /// Experimental: surrender the least-urgent keep's sibling group to
  /// free slots for a more urgent split. Never touches a group whose
  /// subtree contains the pending split target.
  fn try_cancel_keep(
    &self,
    index: &mut CutIndex,
    ooc: &mut OocState,
    gpu: &mut GpuState,
    must_split: &Action,
    stats: &mut FrameStats,
  ) -> bool {
    let Some(keep) = index.pop_back_action(ActionKind::Keep) else {
      return false;
    };

    if must_split.error > keep.error {
      let bvh = self.models.model(keep.model_id);
      let parent_id = bvh.parent_id(keep.node_id);

      if keep.node_id > 0 && parent_id > 0 && parent_id != INVALID_NODE_ID {
        let siblings = bvh.siblings(keep.node_id);
        let previous = index.previous_cut(keep.view_id, keep.model_id);

        if all_nodes_in_cut(bvh, &siblings, &previous) {
          let mut singularity = false;
          for &sibling_id in &siblings {
            if sibling_id == must_split.node_id {
              singularity = true;
              break;
            }
            if bvh.children(sibling_id).contains(&must_split.node_id) {
              singularity = true;
              break;
            }
          }

          // A group member (or one of its children) already committed
          // into the new cut cannot be taken back; cancelling around it
          // would put the parent above a committed descendant.
          if !singularity {
            let current = index.current_cut(keep.view_id, keep.model_id);
            singularity = siblings.iter().any(|&sibling_id| {
              sibling_id != INVALID_NODE_ID
                && (current.contains(&sibling_id)
                  || bvh
                    .children(sibling_id)
                    .iter()
                    .any(|child_id| current.contains(child_id)))
            });
          }

          if !singularity {
            for &sibling_id in &siblings {
              if sibling_id == INVALID_NODE_ID {
                continue;
              }
              index.cancel_action(keep.view_id, keep.model_id, sibling_id);
              gpu.release_node_invalidate(self.context_id, keep.view_id, keep.model_id, sibling_id);
              ooc.release_node(self.context_id, keep.view_id, keep.model_id, sibling_id);

              // A split of this sibling may already have queued work
              // for its children; take that back as well.
              for child_id in bvh.children(sibling_id) {
                if child_id == INVALID_NODE_ID {
                  continue;
                }
                index.cancel_action(keep.view_id, keep.model_id, child_id);
                gpu.release_node_invalidate(self.context_id, keep.view_id, keep.model_id, child_id);
                ooc.release_node(self.context_id, keep.view_id, keep.model_id, child_id);
              }
            }

            assert!(gpu.is_node_resident(keep.model_id, parent_id));
            assert!(ooc.is_node_resident(keep.model_id, parent_id));

            index.approve_action(Action::new(
              ActionKind::Keep,
              keep.view_id,
              keep.model_id,
              parent_id,
              keep.error,
            ));
            stats.keeps_approved += 1;
            return true;
          }
        }
      }
    }

    // Could not use it to free memory; commit it as-is.
    index.approve_action(keep);
    stats.keeps_approved += 1;
    false
  }

  /// Experimental: demote a lower-priority pending split back to a
  /// keep so its slots become available to the urgent one.
  fn try_cancel_lower_split(&self, index: &mut CutIndex, uctx: &UpdateContext, must_split: &Action) -> bool {
    // > 1: the front action must never cancel itself.
    if index.num_actions(ActionKind::MustSplit) <= 1 {
      return false;
    }
    let split = index.pop_back_action(ActionKind::MustSplit).expect("non-empty");

    if must_split.error > split.error {
      let bvh = self.models.model(split.model_id);
      let parent_id = bvh.parent_id(split.node_id);

      if split.node_id > 0 && parent_id > 0 && parent_id != INVALID_NODE_ID {
        let siblings = bvh.siblings(split.node_id);
        let previous = index.previous_cut(split.view_id, split.model_id);

        if all_nodes_in_cut(bvh, &siblings, &previous) {
          // Cancelling an ancestor of the pending split frees nothing.
          let mut singularity = split.node_id == must_split.node_id;
          if !singularity && bvh.children(split.node_id).contains(&must_split.node_id) {
            singularity = true;
          }

          if !singularity {
            let replacement_error =
              uctx.node_error(&self.models, split.view_id, split.model_id, split.node_id);
            index.push_action(
              Action::new(
                ActionKind::Keep,
                split.view_id,
                split.model_id,
                split.node_id,
                replacement_error * CANCELLED_SPLIT_KEEP_FACTOR,
              ),
              true,
            );
            return true;
          }
        }
      }
    }

    index.reject_action(split);
    false
  }

  /// Warm the host cache with descendants of strongly oversized
  /// approved splits, lowest generations first, while both caches keep
  /// comfortable headroom.
  fn prefetch_routine(
    &self,
    ooc: &mut OocState,
    gpu: &GpuState,
    uctx: &UpdateContext,
    pending: Vec<Action>,
  ) {
    let mut queue: VecDeque<(ModelId, NodeId)> = VecDeque::new();

    for action in pending {
      if action.node_id == INVALID_NODE_ID {
        continue;
      }
      let max_error_threshold = uctx.threshold(action.model_id) + THRESHOLD_HYSTERESIS;
      if action.error > max_error_threshold * self.config.prefetch_factor {
        for child_id in self.models.model(action.model_id).children(action.node_id) {
          if child_id != INVALID_NODE_ID {
            queue.push_back((action.model_id, child_id));
          }
        }
      }
    }

    let mut expansions = 0u32;
    while let Some((model_id, node_id)) = queue.pop_front() {
      expansions += 1;
      if expansions >= self.config.prefetch_budget {
        break;
      }
      if ooc.num_free_slots() <= ooc.num_slots() / PREFETCH_FREE_SLOT_DIVISOR
        || gpu.num_free_slots() <= gpu.num_slots() / PREFETCH_FREE_SLOT_DIVISOR
      {
        break;
      }

      let bvh = self.models.model(model_id);
      let fan = bvh.fan_factor() as u64;
      if ooc.num_free_slots() < fan || gpu.num_free_slots() < fan {
        break;
      }

      for child_id in bvh.children(node_id) {
        if child_id == INVALID_NODE_ID {
          continue;
        }
        if !ooc.is_node_resident(model_id, child_id) && ooc.num_free_slots() > 0 {
          ooc.register_node(model_id, child_id, -(expansions as i64));
        }
        queue.push_back((model_id, child_id));
      }
    }
  }

  // --- frame outputs --------------------------------------------------

  fn compile_render_list(&self, index: &CutIndex, gpu: &GpuState) {
    let mut state = self.state();
    state.render_list.clear();
    for view_id in 0..index.num_views() {
      for model_id in 0..index.num_models() {
        let aggregates: Vec<NodeSlotAggregate> = index
          .current_cut(view_id, model_id)
          .into_iter()
          .map(|node_id| NodeSlotAggregate {
            node_id,
            slot_id: gpu.slot_id(model_id, node_id),
          })
          .collect();
        state.render_list.insert((view_id, model_id), aggregates);
      }
    }
  }

  /// Copy each freshly registered payload from the host arena into the
  /// active staging region and describe the device-side placement.
  fn compile_transfer_list(&self, ooc: &OocState, gpu: &mut GpuState, stats: &mut FrameStats) {
    let slot_size = self.models.slot_size();
    let mut slot_count = gpu.transfer_slots_written();

    let (staging, tag) = {
      let state = self.state();
      (
        Arc::clone(state.staging.as_ref().expect("dispatch provides staging buffers")),
        state.current_buffer,
      )
    };
    let mut buffer = staging.buffer(tag).lock().unwrap();
    let mut descs = Vec::new();

    for model_id in 0..self.models.num_models() {
      // Stable order keeps transfer lists reproducible across runs.
      let mut node_ids: Vec<NodeId> = gpu.transfer_list()[model_id as usize].iter().copied().collect();
      node_ids.sort_unstable();

      for node_id in node_ids {
        let dst_slot = gpu.slot_id(model_id, node_id);
        assert!(
          dst_slot < self.render_budget_slots,
          "device slot {dst_slot} outside render budget"
        );

        let offset = slot_count as usize * slot_size;
        buffer[offset..offset + slot_size].copy_from_slice(ooc.node_data(model_id, node_id));
        descs.push(SlotUpdateDesc {
          src_slot: slot_count,
          dst_slot,
        });
        slot_count += 1;
        stats.nodes_transferred += 1;
      }
    }
    drop(buffer);

    gpu.reset_transfer_list();
    gpu.set_transfer_slots_written(slot_count);

    self.state().transfer_descs.extend(descs);
  }
}

/// Every id names a real node of `bvh` and sits in `cut`.
fn all_nodes_in_cut(bvh: &Bvh, node_ids: &NodeIdGroup, cut: &BTreeSet<NodeId>) -> bool {
  node_ids.iter().all(|&node_id| {
    node_id != INVALID_NODE_ID && node_id < bvh.num_nodes() && cut.contains(&node_id)
  })
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;
