//! Cut state, per-frame action bookkeeping and the update coordinator.

pub mod index;
pub mod pool;
pub mod queue;
pub mod record;

pub use index::CutIndex;
pub use pool::{CutUpdatePool, StagingBuffers};
pub use queue::{Job, JobQueue};
pub use record::{BufferTag, CutDatabase, CutRecord, NodeSlotAggregate, SlotUpdateDesc};
