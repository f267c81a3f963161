//! Engine configuration.
//!
//! Three layers, smallest scope first:
//! - [`CoreConfig`]: runtime behavior toggles of the cut-update loop,
//!   plain data so tests can exercise every combination.
//! - [`CachePolicy`]: cache and upload budgets already converted to
//!   slot counts.
//! - [`EngineConfig`]: the TOML file handed to a run: window size,
//!   budgets in MB, resource list and optional measurement session.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::constants::{
  DEFAULT_MAX_MODEL_TIMEOUT, DEFAULT_MAX_UPDATES_PER_FRAME, DEFAULT_NUM_THREADS,
  DEFAULT_PREFETCH_BUDGET, DEFAULT_PREFETCH_FACTOR, MIN_UPLOAD_BUDGET_MB,
};

/// Startup configuration failures. These surface to the user and abort
/// the run; everything downstream of startup recovers locally instead.
#[derive(Debug, Error)]
pub enum ConfigError {
  #[error("failed to read config file {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("failed to parse config TOML: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("invalid configuration: {0}")]
  Invalid(String),
}

/// Runtime behavior toggles for the cut-update loop.
#[derive(Clone, Copy, Debug)]
pub struct CoreConfig {
  /// Emit `MustCollapse` (instead of `CollapseOnNeed`) for sibling
  /// groups entirely outside their parent's frustum.
  pub must_collapse_outside_frustum: bool,
  /// Allow the update loop to cancel lower-priority keeps/splits to
  /// make room for an urgent split.
  pub experimental_cancellation: bool,
  /// Prefetch descendants of strongly oversized approved splits.
  pub prefetch_enabled: bool,
  /// Re-classify children of an approved split in the same update pass.
  pub split_again: bool,
  /// Iterate analysis+update multiple times per frame while time allows.
  pub repeat_mode: bool,
  /// Hard cap on repeat-mode iterations.
  pub max_updates_per_frame: u32,
  /// Frames without rendering after which a model is driven to collapse.
  pub max_model_timeout: u64,
  /// Multiplier on the upper threshold gating prefetch.
  pub prefetch_factor: f64,
  /// Bound on prefetch expansions per frame.
  pub prefetch_budget: u32,
  /// Worker threads in the cut-update pool.
  pub num_threads: usize,
}

impl Default for CoreConfig {
  fn default() -> Self {
    Self {
      must_collapse_outside_frustum: true,
      experimental_cancellation: false,
      prefetch_enabled: false,
      split_again: false,
      repeat_mode: false,
      max_updates_per_frame: DEFAULT_MAX_UPDATES_PER_FRAME,
      max_model_timeout: DEFAULT_MAX_MODEL_TIMEOUT,
      prefetch_factor: DEFAULT_PREFETCH_FACTOR,
      prefetch_budget: DEFAULT_PREFETCH_BUDGET,
      num_threads: DEFAULT_NUM_THREADS,
    }
  }
}

/// Cache sizes and the per-frame upload cap, in payload slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CachePolicy {
  pub host_cache_slots: u64,
  pub gpu_cache_slots: u64,
  pub upload_budget_slots: u64,
}

impl CachePolicy {
  /// Convert raw MB budgets to slot counts. No floor is applied here;
  /// tests drive single-digit slot counts through this path.
  pub fn from_budgets_mb(main_mb: u64, video_mb: u64, upload_mb: u64, slot_size: usize) -> Self {
    let bytes_per_slot = slot_size as u64;
    Self {
      host_cache_slots: main_mb * 1024 * 1024 / bytes_per_slot,
      gpu_cache_slots: video_mb * 1024 * 1024 / bytes_per_slot,
      upload_budget_slots: upload_mb * 1024 * 1024 / bytes_per_slot,
    }
  }
}

fn default_window_dim() -> u32 {
  800
}

/// Run configuration as loaded from TOML.
#[derive(Clone, Debug, Deserialize)]
pub struct EngineConfig {
  /// Viewport width in pixels.
  #[serde(default = "default_window_dim")]
  pub window_width: u32,
  /// Viewport height in pixels.
  #[serde(default = "default_window_dim")]
  pub window_height: u32,
  /// Host-cache budget in MB.
  pub main_memory_budget_mb: u64,
  /// GPU-cache budget in MB.
  pub video_memory_budget_mb: u64,
  /// Per-frame upload cap in MB; floored at 64 MB when converted.
  pub max_upload_budget_mb: u64,
  /// Path to the model-list file.
  pub resource_file: PathBuf,
  /// Recorded camera session; non-empty switches to playback.
  #[serde(default)]
  pub measurement_file: Option<PathBuf>,
}

impl EngineConfig {
  /// Load and validate a configuration file.
  pub fn load(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    let config: EngineConfig = toml::from_str(&content)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<(), ConfigError> {
    if self.window_width == 0 || self.window_height == 0 {
      return Err(ConfigError::Invalid(format!(
        "window dimensions must be positive, got {}x{}",
        self.window_width, self.window_height
      )));
    }
    if self.main_memory_budget_mb == 0 {
      return Err(ConfigError::Invalid("main_memory_budget_mb must be positive".into()));
    }
    if self.video_memory_budget_mb == 0 {
      return Err(ConfigError::Invalid("video_memory_budget_mb must be positive".into()));
    }
    if self.max_upload_budget_mb == 0 {
      return Err(ConfigError::Invalid("max_upload_budget_mb must be positive".into()));
    }
    if self.resource_file.as_os_str().is_empty() {
      return Err(ConfigError::Invalid("resource_file must be set".into()));
    }
    Ok(())
  }

  /// Cache policy for a run with the given payload slot size.
  pub fn cache_policy(&self, slot_size: usize) -> CachePolicy {
    CachePolicy::from_budgets_mb(
      self.main_memory_budget_mb,
      self.video_memory_budget_mb,
      self.max_upload_budget_mb.max(MIN_UPLOAD_BUDGET_MB),
      slot_size,
    )
  }

  /// Whether a recorded session drives this run.
  pub fn is_measurement_run(&self) -> bool {
    self
      .measurement_file
      .as_ref()
      .is_some_and(|p| !p.as_os_str().is_empty())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;

  fn write_temp_config(name: &str, body: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("cut_plugin_cfg_{}_{}.toml", std::process::id(), name));
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(body.as_bytes()).unwrap();
    path
  }

  #[test]
  fn loads_complete_config() {
    let path = write_temp_config(
      "complete",
      r#"
window_width = 1920
window_height = 1080
main_memory_budget_mb = 4096
video_memory_budget_mb = 1024
max_upload_budget_mb = 100
resource_file = "models.rsc"
measurement_file = "flight.csn"
"#,
    );
    let config = EngineConfig::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    assert_eq!(config.window_width, 1920);
    assert_eq!(config.main_memory_budget_mb, 4096);
    assert!(config.is_measurement_run());
  }

  #[test]
  fn rejects_zero_budget() {
    let path = write_temp_config(
      "zero_budget",
      r#"
main_memory_budget_mb = 0
video_memory_budget_mb = 1024
max_upload_budget_mb = 100
resource_file = "models.rsc"
"#,
    );
    let result = EngineConfig::load(&path);
    std::fs::remove_file(&path).ok();
    assert!(matches!(result, Err(ConfigError::Invalid(_))));
  }

  #[test]
  fn upload_budget_is_floored_on_conversion() {
    let path = write_temp_config(
      "floor",
      r#"
main_memory_budget_mb = 1024
video_memory_budget_mb = 512
max_upload_budget_mb = 8
resource_file = "models.rsc"
"#,
    );
    let config = EngineConfig::load(&path).unwrap();
    std::fs::remove_file(&path).ok();

    let policy = config.cache_policy(4096);
    assert_eq!(policy.upload_budget_slots, 64 * 1024 * 1024 / 4096);
  }

  #[test]
  fn direct_policy_construction_is_not_floored() {
    let policy = CachePolicy::from_budgets_mb(1, 1, 1, 1024 * 1024);
    assert_eq!(policy.upload_budget_slots, 1);
  }

  #[test]
  fn slot_conversion_uses_slot_size() {
    let policy = CachePolicy::from_budgets_mb(4, 2, 64, 4096);
    assert_eq!(policy.host_cache_slots, 1024);
    assert_eq!(policy.gpu_cache_slots, 512);
  }
}
