//! Counting semaphore with adjustable signal bounds and shutdown.
//!
//! The coordinator reuses one primitive in two configurations:
//! - work signal: `min = 1`, `max = N`; any worker may consume one unit
//! - barrier: `min = max = N`; workers each signal once, the master
//!   waits once and consumes the whole batch
//!
//! Bounds are changed between phases via [`Semaphore::set_bounds`],
//! which performs both updates under one lock acquisition. `shutdown()`
//! wakes every waiter permanently; after shutdown `wait()` returns
//! without decrementing so worker loops can observe the flag and exit.

use std::sync::{Condvar, Mutex};

struct SemState {
  signal_count: usize,
  min_signal_count: usize,
  max_signal_count: usize,
  shutdown: bool,
}

/// Bounded counting semaphore. All methods are `&self`; the type is
/// shared by reference between the master and worker threads.
pub struct Semaphore {
  state: Mutex<SemState>,
  signal: Condvar,
}

impl Semaphore {
  /// New semaphore with `min = max = 1` and no pending signals.
  pub fn new() -> Self {
    Self {
      state: Mutex::new(SemState {
        signal_count: 0,
        min_signal_count: 1,
        max_signal_count: 1,
        shutdown: false,
      }),
      signal: Condvar::new(),
    }
  }

  /// Block until the signal count reaches the minimum, then consume
  /// that many signals. Returns immediately (without consuming) once
  /// the semaphore has been shut down.
  pub fn wait(&self) {
    let mut state = self.state.lock().unwrap();
    while state.signal_count < state.min_signal_count && !state.shutdown {
      state = self.signal.wait(state).unwrap();
    }
    if state.signal_count >= state.min_signal_count {
      state.signal_count -= state.min_signal_count;
    }
  }

  /// Add `count` signals, saturating at the maximum. A signal that
  /// would overflow the bound is dropped entirely, matching the
  /// batch-or-nothing accounting the barrier configuration relies on.
  pub fn signal(&self, count: usize) {
    {
      let mut state = self.state.lock().unwrap();
      if state.signal_count + count <= state.max_signal_count {
        state.signal_count += count;
      }
    }
    self.signal.notify_all();
  }

  /// Current pending signal count.
  pub fn num_signals(&self) -> usize {
    self.state.lock().unwrap().signal_count
  }

  /// Reconfigure both bounds atomically. Only called between phases,
  /// when no signals are pending.
  pub fn set_bounds(&self, min_signal_count: usize, max_signal_count: usize) {
    let mut state = self.state.lock().unwrap();
    state.min_signal_count = min_signal_count;
    state.max_signal_count = max_signal_count;
  }

  /// Permanently wake all current and future waiters.
  pub fn shutdown(&self) {
    {
      let mut state = self.state.lock().unwrap();
      state.shutdown = true;
    }
    self.signal.notify_all();
  }

  /// Whether `shutdown()` has been called.
  pub fn is_shutdown(&self) -> bool {
    self.state.lock().unwrap().shutdown
  }
}

impl Default for Semaphore {
  fn default() -> Self {
    Self::new()
  }
}
