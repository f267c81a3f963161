//! Per-(view, model) cut state and the classified action queues.
//!
//! Analysis appends unordered; one `sort()` at the analysis/update
//! boundary establishes queue order. The update phase consumes from
//! both ends (most urgent split from the front, most expendable keep
//! from the back) and may push re-classified children with an
//! order-preserving insertion instead of a re-sort.
//!
//! Queue order, front to back:
//! - `MustSplit`, `Keep`, `MustCollapse`, `CollapseOnNeed`: descending
//!   error, so the front is the most urgent and the back the least.
//! - `MaybeCollapse`: ascending error, so the back is the collapse that
//!   frees the most tolerable detail.
//!
//! All comparisons tie-break on `(view, model, node)` so queue contents
//! are a pure function of the action set, independent of worker
//! interleaving during analysis.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;

use crate::model::{Bvh, ModelStore, NodeIdGroup};
use crate::types::{Action, ActionKind, ModelId, NodeId, ViewId, INVALID_NODE_ID};

/// Previous and in-construction cut for one (view, model).
#[derive(Default)]
struct CutPair {
  previous: BTreeSet<NodeId>,
  current: BTreeSet<NodeId>,
}

/// Cut state plus the five global action queues of one context.
pub struct CutIndex {
  models: Arc<ModelStore>,
  num_views: u32,
  cuts: HashMap<(ViewId, ModelId), CutPair>,
  queues: [VecDeque<Action>; 5],
}

impl CutIndex {
  pub fn new(models: Arc<ModelStore>) -> Self {
    Self {
      models,
      num_views: 0,
      cuts: HashMap::new(),
      queues: Default::default(),
    }
  }

  #[inline]
  pub fn num_models(&self) -> u32 {
    self.models.num_models()
  }

  #[inline]
  pub fn num_views(&self) -> u32 {
    self.num_views
  }

  #[inline]
  pub fn fan_factor(&self, model_id: ModelId) -> u32 {
    self.models.model(model_id).fan_factor()
  }

  #[inline]
  pub fn num_nodes(&self, model_id: ModelId) -> u64 {
    self.models.model(model_id).num_nodes()
  }

  /// Resize the per-view tables to `num_views`. Cut state of retained
  /// views survives; views past the end are dropped.
  pub fn update_policy(&mut self, num_views: u32) {
    self.num_views = num_views;
    self.cuts.retain(|&(view_id, _), _| view_id < num_views);
    for view_id in 0..num_views {
      for model_id in 0..self.models.num_models() {
        self.cuts.entry((view_id, model_id)).or_default();
      }
    }
  }

  // --- cuts -----------------------------------------------------------

  /// Move every current cut into previous and clear the current ones.
  /// Called once at the start of frame analysis.
  pub fn swap_cuts(&mut self) {
    for pair in self.cuts.values_mut() {
      pair.previous = std::mem::take(&mut pair.current);
    }
  }

  /// Empty the current cut of one (view, model) before analysis
  /// repopulates it through approvals.
  pub fn reset_cut(&mut self, view_id: ViewId, model_id: ModelId) {
    self.cuts.entry((view_id, model_id)).or_default().current.clear();
  }

  pub fn previous_cut(&self, view_id: ViewId, model_id: ModelId) -> BTreeSet<NodeId> {
    self
      .cuts
      .get(&(view_id, model_id))
      .map(|pair| pair.previous.clone())
      .unwrap_or_default()
  }

  pub fn current_cut(&self, view_id: ViewId, model_id: ModelId) -> BTreeSet<NodeId> {
    self
      .cuts
      .get(&(view_id, model_id))
      .map(|pair| pair.current.clone())
      .unwrap_or_default()
  }

  pub fn is_current_cut_empty(&self, view_id: ViewId, model_id: ModelId) -> bool {
    self
      .cuts
      .get(&(view_id, model_id))
      .map(|pair| pair.current.is_empty())
      .unwrap_or(true)
  }

  // --- queues ---------------------------------------------------------

  /// Append an action. `from_update` preserves queue order by inserting
  /// at the sorted position; analysis-time pushes go to the back and
  /// rely on the boundary `sort()`.
  pub fn push_action(&mut self, action: Action, from_update: bool) {
    let kind = action.kind;
    let queue = &mut self.queues[kind.index()];
    if !from_update {
      queue.push_back(action);
      return;
    }
    let position = queue
      .iter()
      .position(|existing| queue_cmp(kind, &action, existing) == Ordering::Less)
      .unwrap_or(queue.len());
    queue.insert(position, action);
  }

  /// Establish queue order after all analyses completed.
  pub fn sort(&mut self) {
    for (index, queue) in self.queues.iter_mut().enumerate() {
      let kind = ActionKind::ALL[index];
      queue.make_contiguous().sort_by(|a, b| queue_cmp(kind, a, b));
    }
  }

  pub fn num_actions(&self, kind: ActionKind) -> usize {
    self.queues[kind.index()].len()
  }

  pub fn front_action(&self, kind: ActionKind) -> Option<Action> {
    self.queues[kind.index()].front().copied()
  }

  pub fn back_action(&self, kind: ActionKind) -> Option<Action> {
    self.queues[kind.index()].back().copied()
  }

  pub fn pop_front_action(&mut self, kind: ActionKind) -> Option<Action> {
    self.queues[kind.index()].pop_front()
  }

  pub fn pop_back_action(&mut self, kind: ActionKind) -> Option<Action> {
    self.queues[kind.index()].pop_back()
  }

  /// Remove every pending action for `(view, model, node)` across all
  /// queues.
  pub fn cancel_action(&mut self, view_id: ViewId, model_id: ModelId, node_id: NodeId) {
    for queue in &mut self.queues {
      queue.retain(|action| {
        !(action.view_id == view_id && action.model_id == model_id && action.node_id == node_id)
      });
    }
  }

  // --- commit ---------------------------------------------------------

  /// Commit an action's outcome into the current cut.
  ///
  /// Keeps and collapses contribute their own node; an approved split
  /// contributes its children.
  pub fn approve_action(&mut self, action: Action) {
    match action.kind {
      ActionKind::MustSplit => {
        for child_id in self.children_of(action.model_id, action.node_id) {
          if child_id != INVALID_NODE_ID {
            self.insert_into_current(action.view_id, action.model_id, child_id);
          }
        }
      }
      ActionKind::Keep
      | ActionKind::MustCollapse
      | ActionKind::CollapseOnNeed
      | ActionKind::MaybeCollapse => {
        self.insert_into_current(action.view_id, action.model_id, action.node_id);
      }
    }
  }

  /// Reinstate the previous-cut state for a refused action: the node
  /// itself for keeps and splits, the sibling group for collapses
  /// (whose node names the parent).
  pub fn reject_action(&mut self, action: Action) {
    match action.kind {
      ActionKind::Keep | ActionKind::MustSplit => {
        self.insert_into_current(action.view_id, action.model_id, action.node_id);
      }
      ActionKind::MustCollapse | ActionKind::CollapseOnNeed | ActionKind::MaybeCollapse => {
        for child_id in self.children_of(action.model_id, action.node_id) {
          if child_id != INVALID_NODE_ID {
            self.insert_into_current(action.view_id, action.model_id, child_id);
          }
        }
      }
    }
  }

  fn insert_into_current(&mut self, view_id: ViewId, model_id: ModelId, node_id: NodeId) {
    let pair = self.cuts.entry((view_id, model_id)).or_default();
    pair.current.insert(node_id);
    debug_assert!(
      is_ancestor_consistent(self.models.model(model_id), &pair.current),
      "cut for view {view_id} model {model_id} holds an ancestor/descendant pair after inserting node {node_id}"
    );
  }

  // --- navigation -----------------------------------------------------

  pub fn get_parent_id(&self, model_id: ModelId, node_id: NodeId) -> NodeId {
    self.models.model(model_id).parent_id(node_id)
  }

  pub fn get_all_children(&self, model_id: ModelId, node_id: NodeId) -> NodeIdGroup {
    self.children_of(model_id, node_id)
  }

  pub fn get_all_siblings(&self, model_id: ModelId, node_id: NodeId) -> NodeIdGroup {
    self.models.model(model_id).siblings(node_id)
  }

  fn children_of(&self, model_id: ModelId, node_id: NodeId) -> NodeIdGroup {
    self.models.model(model_id).children(node_id)
  }
}

/// Queue comparison for one kind; see the module docs for the order.
fn queue_cmp(kind: ActionKind, a: &Action, b: &Action) -> Ordering {
  let by_error = match kind {
    ActionKind::MaybeCollapse => a.error.partial_cmp(&b.error),
    _ => b.error.partial_cmp(&a.error),
  }
  .unwrap_or(Ordering::Equal);
  by_error.then_with(|| {
    (a.view_id, a.model_id, a.node_id).cmp(&(b.view_id, b.model_id, b.node_id))
  })
}

/// Whether `cut` is a frontier: no member is a proper ancestor of
/// another member.
pub fn is_ancestor_consistent(bvh: &Bvh, cut: &BTreeSet<NodeId>) -> bool {
  for &node_id in cut {
    let mut current = node_id;
    while current != 0 {
      current = bvh.parent_id(current);
      if cut.contains(&current) {
        return false;
      }
    }
  }
  true
}

#[cfg(test)]
#[path = "index_test.rs"]
mod index_test;
