//! Per-frame counters from the update loop.

/// What one dispatch did. Counters reset in prepare and accumulate
/// across repeat-mode iterations within the frame.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
  /// Splits committed into the new cut.
  pub splits_approved: usize,
  /// Splits abandoned (capacity, budget or pending loads).
  pub splits_rejected: usize,
  /// Sibling groups replaced by their parent.
  pub collapses_applied: usize,
  /// Keeps committed into the new cut.
  pub keeps_approved: usize,
  /// Payloads copied into the staging region.
  pub nodes_transferred: usize,
  /// Analysis+update iterations run (more than 1 only in repeat mode).
  pub update_iterations: usize,
}

impl FrameStats {
  /// Total cut mutations this frame.
  #[inline]
  pub fn total_transitions(&self) -> usize {
    self.splits_approved + self.collapses_applied
  }
}
