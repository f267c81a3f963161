//! Tuning constants for the cut-update engine.
//!
//! Error thresholds are clamped per model each frame so that a runaway
//! UI slider cannot starve or flood the caches. Bootstrap values mirror
//! the priorities the engine assigns to work it cannot afford to lose
//! (root nodes) versus work it merely hopes to need (prefetch).

/// Lower clamp bound for per-model error thresholds.
pub const MIN_ERROR_THRESHOLD: f64 = 0.1;

/// Upper clamp bound for per-model error thresholds.
pub const MAX_ERROR_THRESHOLD: f64 = 10.0;

/// Threshold applied when a model does not specify one.
pub const DEFAULT_ERROR_THRESHOLD: f64 = 2.5;

/// Half-width of the hysteresis band around the threshold.
/// `min = T - band`, `max = T + band`; keeps split/collapse from flapping.
pub const THRESHOLD_HYSTERESIS: f64 = 0.1;

/// Host-cache priority for root payloads registered during bootstrap.
pub const ROOT_LOAD_PRIORITY: i64 = 100;

/// Error attached to the bootstrap `Keep` of a freshly resident root.
/// Large enough that the keep survives any budget competition.
pub const ROOT_BOOTSTRAP_ERROR: f64 = 10_000.0;

/// Error inflation applied when a cancelled lower-priority split is
/// re-queued as a keep of the same node.
pub const CANCELLED_SPLIT_KEEP_FACTOR: f64 = 2.75;

/// Default number of cut-update worker threads.
pub const DEFAULT_NUM_THREADS: usize = 8;

/// Default cap on analysis+update iterations per frame in repeat mode.
pub const DEFAULT_MAX_UPDATES_PER_FRAME: u32 = 8;

/// Default frame-count timeout after which an unrendered model is
/// driven toward collapse.
pub const DEFAULT_MAX_MODEL_TIMEOUT: u64 = 1000;

/// Default multiplier on the upper threshold above which an approved
/// split also prefetches its descendants.
pub const DEFAULT_PREFETCH_FACTOR: f64 = 1.5;

/// Default bound on prefetch breadth-first expansions per frame.
pub const DEFAULT_PREFETCH_BUDGET: u32 = 64;

/// Fraction of slots that must stay free in both caches for prefetch
/// to keep running (denominator; 4 means "more than a quarter free").
pub const PREFETCH_FREE_SLOT_DIVISOR: u64 = 4;

/// Floor applied to the configured per-frame upload budget, in MB.
/// Applies only to file-loaded configurations; directly constructed
/// policies may go below it.
pub const MIN_UPLOAD_BUDGET_MB: u64 = 64;
