//! Headless measurement and soak driver for the cut-update engine.
//!
//! Plays the renderer's role without a GPU: fabricates synthetic
//! datasets for the models listed in the resource file, feeds camera
//! snapshots from a recorded session (or a generated orbit) into the
//! shared record, dispatches one cut update per frame and consumes the
//! committed cuts and transfer lists the way a renderer would.

mod dataset;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use glam::{DMat4, DVec3};
use tracing::{debug, info};

use cut_plugin::io::{load_session, SessionRecorder};
use cut_plugin::{
  CameraSnapshot, CutDatabase, CutUpdatePool, EngineConfig, ModelStore, OocCache, ResourceList,
  StagingBuffers,
};

/// Headless driver for the cut-update engine.
#[derive(Parser, Debug)]
#[command(name = "cut_harness")]
#[command(about = "Drives cut updates over synthetic datasets and reports statistics")]
struct Args {
  /// Path to the engine configuration TOML.
  #[arg(short, long)]
  config: PathBuf,

  /// Frames to drive when no measurement session is configured.
  #[arg(long, default_value_t = 300)]
  frames: usize,

  /// Fan-out of the fabricated hierarchies.
  #[arg(long, default_value_t = 4)]
  fan: u32,

  /// Levels of the fabricated hierarchies.
  #[arg(long, default_value_t = 6)]
  levels: u32,

  /// Payload slot size in bytes.
  #[arg(long, default_value_t = 4096)]
  slot_size: usize,

  /// Record the driven camera path into this directory.
  #[arg(long)]
  record_session: Option<PathBuf>,
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .init();

  let args = Args::parse();
  let config = EngineConfig::load(&args.config)?;
  let resources = ResourceList::load(&config.resource_file)?;
  if resources.entries.is_empty() {
    bail!("resource file {} lists no models", config.resource_file.display());
  }

  let work_dir = std::env::temp_dir().join(format!("cut_harness_{}", std::process::id()));
  std::fs::create_dir_all(&work_dir).context("failed to create working directory")?;

  // Fabricate one synthetic dataset per resource entry; the entry's
  // file stem names it, its transform positions it.
  let mut models = Vec::new();
  for (i, entry) in resources.entries.iter().enumerate() {
    let stem = entry
      .path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| format!("model_{i}"));
    models.push(dataset::build_synthetic(&stem, args.fan, args.levels, args.slot_size, &work_dir)?);
  }
  let num_models = models.len() as u32;
  let models = Arc::new(ModelStore::new(models, args.slot_size));
  info!(
    num_models,
    nodes_per_model = dataset::full_tree_nodes(args.fan, args.levels),
    "fabricated datasets"
  );

  // Models the renderer pretends to draw; everything else goes stale
  // and collapses via the freshness timeout.
  let drawn: Vec<u32> = if !resources.visible.is_empty() {
    resources.visible.iter().map(|&i| i as u32).collect()
  } else {
    (0..num_models)
      .filter(|m| !resources.invisible.contains(&(*m as usize)))
      .collect()
  };

  let policy = config.cache_policy(args.slot_size);
  let ooc = Arc::new(OocCache::new(policy.host_cache_slots, &models)?);
  let cut_db = Arc::new(CutDatabase::new(1));
  let staging = Arc::new(StagingBuffers::new(policy.upload_budget_slots, args.slot_size));
  let pool = CutUpdatePool::new(
    0,
    Arc::clone(&models),
    ooc,
    Arc::clone(&cut_db),
    policy,
    Default::default(),
  );

  let session_views = if config.is_measurement_run() {
    let path = config.measurement_file.as_ref().expect("measurement run has a path");
    let views = load_session(path)?;
    info!(snapshots = views.len(), "playing back recorded session");
    Some(views)
  } else {
    None
  };
  let total_frames = session_views.as_ref().map(|v| v.len()).unwrap_or(args.frames);

  let near = 0.1;
  let fov_y = 60f64.to_radians();
  let aspect = config.window_width as f64 / config.window_height as f64;
  let projection = DMat4::perspective_rh(fov_y, aspect, near, 1000.0);
  // Pixel conversion factor for the error estimate.
  let height_divided_by_top_minus_bottom =
    config.window_height as f64 / (2.0 * near * (fov_y / 2.0).tan());

  let mut recorder = SessionRecorder::new();
  let mut peak_cut = 0usize;
  let mut total_transferred = 0usize;

  for frame in 0..total_frames {
    let view = match &session_views {
      Some(views) => views[frame],
      None => orbit_view(frame),
    };
    if args.record_session.is_some() {
      recorder.push(view);
    }

    {
      let mut record = cut_db.record(0);
      record.set_camera(
        0,
        CameraSnapshot {
          view,
          projection,
          near_plane: near,
          height_divided_by_top_minus_bottom,
        },
      );
      for (model_id, entry) in resources.entries.iter().enumerate() {
        record.set_transform(model_id as u32, entry.transform);
      }
      for &model_id in &drawn {
        record.mark_rendered(model_id);
      }
    }

    pool.dispatch(Arc::clone(&staging));
    wait_for_frame(&pool)?;

    // Consume the committed frame the way a renderer would.
    let (cut_size, transfers) = {
      let mut record = cut_db.record(0);
      let cut_size: usize = (0..num_models).map(|m| record.cut(0, m).len()).sum();
      let transfers = record.transfer_descs().len();
      if record.is_swap_required() {
        record.set_swap_required(false);
      }
      (cut_size, transfers)
    };
    peak_cut = peak_cut.max(cut_size);
    total_transferred += transfers;

    if frame % 30 == 0 {
      let stats = pool.last_frame_stats();
      debug!(frame, cut_size, transfers, ?stats, "frame complete");
    }
  }

  if let Some(dir) = &args.record_session {
    std::fs::create_dir_all(dir).context("failed to create session directory")?;
    let path = recorder.write_to_dir(dir)?;
    info!(path = %path.display(), snapshots = recorder.len(), "session recorded");
  }

  info!(
    frames = total_frames,
    peak_cut,
    total_transferred,
    "run complete"
  );
  std::fs::remove_dir_all(&work_dir).ok();
  Ok(())
}

/// Deterministic camera orbit around the synthetic scene.
fn orbit_view(frame: usize) -> DMat4 {
  let angle = frame as f64 * 0.02;
  let radius = 6.0 + 3.0 * (frame as f64 * 0.011).sin();
  let eye = DVec3::new(radius * angle.cos(), 1.5, radius * angle.sin() - 4.0);
  let center = DVec3::new(0.0, 0.0, -4.0);
  DMat4::look_at_rh(eye, center, DVec3::Y)
}

fn wait_for_frame(pool: &CutUpdatePool) -> Result<()> {
  for _ in 0..10_000 {
    if !pool.is_running() {
      return Ok(());
    }
    std::thread::sleep(Duration::from_millis(1));
  }
  bail!("cut update did not complete within ten seconds")
}
