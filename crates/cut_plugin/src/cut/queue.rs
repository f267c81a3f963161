//! Tagged job queue feeding the cut-update worker pool.
//!
//! Capacity signaling lives in the work semaphore; the queue itself is
//! a plain locked deque. Workers that win a signal race but find the
//! queue empty simply go back to waiting.

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::types::{ModelId, ViewId};

/// One unit of coordinator work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Job {
  /// Run one full frame: prepare, fan out analysis, run update, commit.
  Master,
  /// Classify one (view, model) pair against its previous cut.
  Analysis { view_id: ViewId, model_id: ModelId },
  /// Drain the action queues under cache constraints.
  Update,
}

/// FIFO job queue shared by the master and all workers.
#[derive(Default)]
pub struct JobQueue {
  jobs: Mutex<VecDeque<Job>>,
}

impl JobQueue {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn push_job(&self, job: Job) {
    self.jobs.lock().unwrap().push_back(job);
  }

  pub fn pop_job(&self) -> Option<Job> {
    self.jobs.lock().unwrap().pop_front()
  }

  pub fn len(&self) -> usize {
    self.jobs.lock().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.jobs.lock().unwrap().is_empty()
  }
}
