//! Asynchronous node-payload loader.
//!
//! Reads are fire-and-forget jobs on rayon's pool; completions come
//! back over a crossbeam channel and are drained by the host cache's
//! `refresh()`. A failed read is delivered as an error completion so
//! the reservation can be returned to the free pool; disk trouble is
//! never fatal to a frame.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use crossbeam_channel::{unbounded, Receiver, Sender};
use thiserror::Error;
use tracing::warn;

use crate::model::ModelStore;
use crate::types::{ModelId, NodeId, SlotId};

#[derive(Debug, Error)]
pub enum LoadError {
  #[error("failed to open node-data file {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },
  #[error("read failed for node {node_id} of model {model_id}: {source}")]
  Read {
    model_id: ModelId,
    node_id: NodeId,
    #[source]
    source: std::io::Error,
  },
}

/// One finished (or failed) read.
pub struct LoadCompletion {
  pub model_id: ModelId,
  pub node_id: NodeId,
  pub slot_id: SlotId,
  pub payload: Result<Vec<u8>, LoadError>,
}

/// Shared handle to the per-model node-data files plus the completion
/// channel. Cloneable into read jobs.
pub struct NodeLoader {
  slot_size: usize,
  files: Vec<Arc<Mutex<File>>>,
  tx: Sender<LoadCompletion>,
  rx: Receiver<LoadCompletion>,
}

impl NodeLoader {
  /// Open every model's node-data file. Failure here is a startup
  /// error, not a per-frame one.
  pub fn new(models: &ModelStore) -> Result<Self, LoadError> {
    let mut files = Vec::with_capacity(models.num_models() as usize);
    for (_, model) in models.iter() {
      let file = File::open(model.data_path()).map_err(|source| LoadError::Open {
        path: model.data_path().clone(),
        source,
      })?;
      files.push(Arc::new(Mutex::new(file)));
    }
    let (tx, rx) = unbounded();
    Ok(Self {
      slot_size: models.slot_size(),
      files,
      tx,
      rx,
    })
  }

  /// Schedule a payload read for `(model, node)` destined for
  /// `slot_id`. Non-blocking; the result arrives via [`NodeLoader::poll`].
  pub fn schedule(&self, model_id: ModelId, node_id: NodeId, slot_id: SlotId) {
    let file = Arc::clone(&self.files[model_id as usize]);
    let tx = self.tx.clone();
    let slot_size = self.slot_size;

    rayon::spawn(move || {
      let payload = read_payload(&file, node_id, slot_size).map_err(|source| {
        warn!(model_id, node_id, error = %source, "node payload read failed");
        LoadError::Read {
          model_id,
          node_id,
          source,
        }
      });
      // Receiver dropped means the cache is shutting down.
      let _ = tx.send(LoadCompletion {
        model_id,
        node_id,
        slot_id,
        payload,
      });
    });
  }

  /// Drain all completions that have arrived so far.
  pub fn poll(&self) -> Vec<LoadCompletion> {
    self.rx.try_iter().collect()
  }
}

fn read_payload(file: &Mutex<File>, node_id: NodeId, slot_size: usize) -> std::io::Result<Vec<u8>> {
  let mut buffer = vec![0u8; slot_size];
  let mut file = file.lock().unwrap();
  file.seek(SeekFrom::Start(node_id * slot_size as u64))?;
  file.read_exact(&mut buffer)?;
  Ok(buffer)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{Aabb, Bvh};
  use glam::DVec3;
  use std::io::Write;
  use std::time::Duration;

  const SLOT: usize = 64;

  fn store_with_payload(name: &str, num_nodes: usize) -> (ModelStore, PathBuf) {
    let path = std::env::temp_dir().join(format!("cut_plugin_loader_{}_{}.dat", std::process::id(), name));
    let mut file = std::fs::File::create(&path).unwrap();
    for node in 0..num_nodes {
      file.write_all(&[node as u8; SLOT]).unwrap();
    }
    let bvh = Bvh::new(
      2,
      vec![DVec3::ZERO; num_nodes],
      vec![1.0; num_nodes],
      vec![Aabb::new(DVec3::NEG_ONE, DVec3::ONE); num_nodes],
      path.clone(),
    );
    (ModelStore::new(vec![bvh], SLOT), path)
  }

  fn poll_until_one(loader: &NodeLoader) -> LoadCompletion {
    for _ in 0..1000 {
      let mut done = loader.poll();
      if let Some(completion) = done.pop() {
        return completion;
      }
      std::thread::sleep(Duration::from_millis(1));
    }
    panic!("load never completed");
  }

  #[test]
  fn reads_node_payload_at_offset() {
    let (store, path) = store_with_payload("offsets", 4);
    let loader = NodeLoader::new(&store).unwrap();

    loader.schedule(0, 3, 7);
    let completion = poll_until_one(&loader);
    std::fs::remove_file(&path).ok();

    assert_eq!(completion.node_id, 3);
    assert_eq!(completion.slot_id, 7);
    assert_eq!(completion.payload.unwrap(), vec![3u8; SLOT]);
  }

  #[test]
  fn short_file_yields_error_completion() {
    let (store, path) = store_with_payload("short", 2);
    let loader = NodeLoader::new(&store).unwrap();

    // Node 5 lies past the end of the 2-node file.
    loader.schedule(0, 5, 0);
    let completion = poll_until_one(&loader);
    std::fs::remove_file(&path).ok();

    assert!(matches!(
      completion.payload,
      Err(LoadError::Read { model_id: 0, node_id: 5, .. })
    ));
  }

  #[test]
  fn missing_file_fails_at_construction() {
    let bvh = Bvh::new(
      2,
      vec![DVec3::ZERO],
      vec![1.0],
      vec![Aabb::new(DVec3::NEG_ONE, DVec3::ONE)],
      PathBuf::from("/nonexistent/cut_plugin.dat"),
    );
    let store = ModelStore::new(vec![bvh], SLOT);
    assert!(matches!(NodeLoader::new(&store), Err(LoadError::Open { .. })));
  }
}
