//! Core identifier and action types.
//!
//! Ids are dense integers rather than newtypes: node ids participate in
//! implicit-tree arithmetic (`n * fan + 1 ...`) and slot ids index flat
//! arenas, so plain aliases with reserved invalid sentinels keep the hot
//! paths free of wrapper noise.

/// Index of a dataset (model) within a run.
pub type ModelId = u32;

/// Index of an active camera.
pub type ViewId = u32;

/// Index of a rendering context (one GPU).
pub type ContextId = u32;

/// Dense node index within a model's BVH. Root is 0; children of `n`
/// with fan-out `f` are `n*f + 1 ..= n*f + f`; parent is `(n - 1) / f`.
pub type NodeId = u64;

/// Index of a fixed-size payload slot inside a cache.
pub type SlotId = u64;

/// Reserved invalid sentinel for [`ModelId`].
pub const INVALID_MODEL_ID: ModelId = ModelId::MAX;

/// Reserved invalid sentinel for [`ViewId`].
pub const INVALID_VIEW_ID: ViewId = ViewId::MAX;

/// Reserved invalid sentinel for [`ContextId`].
pub const INVALID_CONTEXT_ID: ContextId = ContextId::MAX;

/// Reserved invalid sentinel for [`NodeId`].
pub const INVALID_NODE_ID: NodeId = NodeId::MAX;

/// Reserved invalid sentinel for [`SlotId`].
pub const INVALID_SLOT_ID: SlotId = SlotId::MAX;

/// Classification assigned to a cut node (or its parent) during
/// analysis. Each kind maps to one queue in the action index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ActionKind {
  /// Node stays in the cut unchanged.
  Keep,
  /// Node must be replaced by its children this frame if at all possible.
  MustSplit,
  /// Sibling group must be replaced by its parent; always frees slots.
  MustCollapse,
  /// Collapse is acceptable if the update loop needs the space.
  CollapseOnNeed,
  /// Collapse is tolerable; drained last, highest error first.
  MaybeCollapse,
}

impl ActionKind {
  /// All kinds, in queue-index order.
  pub const ALL: [ActionKind; 5] = [
    ActionKind::Keep,
    ActionKind::MustSplit,
    ActionKind::MustCollapse,
    ActionKind::CollapseOnNeed,
    ActionKind::MaybeCollapse,
  ];

  /// Stable queue index for this kind.
  #[inline]
  pub fn index(self) -> usize {
    match self {
      ActionKind::Keep => 0,
      ActionKind::MustSplit => 1,
      ActionKind::MustCollapse => 2,
      ActionKind::CollapseOnNeed => 3,
      ActionKind::MaybeCollapse => 4,
    }
  }
}

/// A proposed modification to one (view, model) cut.
///
/// For split/keep kinds `node_id` names the cut node itself; for the
/// collapse kinds it names the parent of the sibling group.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Action {
  pub kind: ActionKind,
  pub view_id: ViewId,
  pub model_id: ModelId,
  pub node_id: NodeId,
  /// View-dependent screen-space error driving queue order.
  pub error: f64,
}

impl Action {
  pub fn new(kind: ActionKind, view_id: ViewId, model_id: ModelId, node_id: NodeId, error: f64) -> Self {
    Self {
      kind,
      view_id,
      model_id,
      node_id,
      error,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn kind_indices_are_dense_and_stable() {
    for (i, kind) in ActionKind::ALL.iter().enumerate() {
      assert_eq!(kind.index(), i);
    }
  }

  #[test]
  fn sentinels_do_not_collide_with_small_ids() {
    assert_ne!(INVALID_NODE_ID, 0);
    assert_ne!(INVALID_MODEL_ID, 0);
    assert_ne!(INVALID_VIEW_ID, 0);
    assert_ne!(INVALID_SLOT_ID, 0);
  }
}
