//! cut_plugin - Framework/engine independent cut-update engine for
//! out-of-core point-cloud rendering.
//!
//! Massive datasets are preprocessed into bounding-volume hierarchies
//! whose node payloads vastly exceed GPU and host memory. Each frame
//! this crate maintains, per camera and model, a view-dependent *cut*
//! through the hierarchy: the frontier of nodes the renderer should
//! draw. The engine
//!
//! - classifies every cut node against the camera (split, keep or
//!   collapse) in parallel across worker threads,
//! - drains the classified actions under hard memory and per-frame
//!   upload budgets,
//! - coordinates a disk-backed host cache and a device-resident slot
//!   cache, and
//! - stages byte-exact payloads into a double-buffered upload region
//!   for the renderer to consume.
//!
//! Rendering itself, BVH construction and the windowing/input layer
//! are external collaborators; the engine's contract with them is the
//! per-context [`cut::CutDatabase`] record and the
//! [`cut::StagingBuffers`] handed to each dispatch.

pub mod constants;
pub mod types;

// Bounded signaling primitive for the worker pool
pub mod semaphore;
pub use semaphore::Semaphore;

// Model metadata and implicit BVH navigation
pub mod model;
pub use model::{Aabb, Bvh, ModelStore};

// Camera snapshots, frustum culling, screen-space error
pub mod camera;
pub use camera::{node_error, CameraSnapshot, Frustum};

// Runtime flags, cache policy, engine configuration file
pub mod config;
pub use config::{CachePolicy, ConfigError, CoreConfig, EngineConfig};

// Tiered payload caches
pub mod cache;
pub use cache::{GpuCache, LoadError, OocCache};

// Cut state, action queues, per-context record, coordinator
pub mod cut;
pub use cut::{
  BufferTag, CutDatabase, CutUpdatePool, NodeSlotAggregate, SlotUpdateDesc, StagingBuffers,
};

// Run input formats: resource lists and recorded sessions
pub mod io;
pub use io::{ResourceList, SessionRecorder};

// Per-frame counters
pub mod stats;
pub use stats::FrameStats;
