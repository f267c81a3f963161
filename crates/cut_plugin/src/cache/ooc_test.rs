use super::*;
use crate::model::{Aabb, Bvh};
use glam::DVec3;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

const SLOT: usize = 32;

fn store(name: &str, num_nodes: usize) -> (ModelStore, PathBuf) {
  let path = std::env::temp_dir().join(format!("cut_plugin_ooc_{}_{}.dat", std::process::id(), name));
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

fn wait_resident(cache: &OocCache, model_id: u32, node_id: u64) {
  for _ in 0..1000 {
    {
      let mut state = cache.lock();
      state.refresh();
      if state.is_node_resident(model_id, node_id) {
        return;
      }
    }
    std::thread::sleep(Duration::from_millis(1));
  }
  panic!("node ({model_id}, {node_id}) never became resident");
}

#[test]
fn register_then_refresh_makes_resident() {
  let (models, path) = store("resident", 7);
  let cache = OocCache::new(4, &models).unwrap();

  {
    let mut state = cache.lock();
    assert!(state.register_node(0, 3, 10));
    assert!(!state.is_node_resident(0, 3));
    // Reservation is visible in the free count immediately.
    assert_eq!(state.num_free_slots(), 3);
  }

  wait_resident(&cache, 0, 3);
  let state = cache.lock();
  assert_eq!(state.node_data(0, 3), &[3u8; SLOT]);
  std::fs::remove_file(&path).ok();
}

#[test]
fn register_is_idempotent_while_pending_or_resident() {
  let (models, path) = store("idempotent", 7);
  let cache = OocCache::new(4, &models).unwrap();

  {
    let mut state = cache.lock();
    assert!(state.register_node(0, 1, 0));
    assert!(state.register_node(0, 1, 0));
    assert_eq!(state.num_free_slots(), 3);
  }

  wait_resident(&cache, 0, 1);
  let mut state = cache.lock();
  assert!(state.register_node(0, 1, 0));
  assert_eq!(state.num_free_slots(), 3);
  std::fs::remove_file(&path).ok();
}

#[test]
fn acquire_release_round_trip_preserves_refcount() {
  let (models, path) = store("refcount", 7);
  let cache = OocCache::new(4, &models).unwrap();

  cache.lock().register_node(0, 0, 100);
  wait_resident(&cache, 0, 0);

  let mut state = cache.lock();
  assert_eq!(state.refcount(0, 0), 0);
  state.acquire_node(0, 0, 0, 0);
  state.acquire_node(0, 1, 0, 0);
  assert_eq!(state.refcount(0, 0), 2);
  state.release_node(0, 0, 0, 0);
  state.release_node(0, 1, 0, 0);
  assert_eq!(state.refcount(0, 0), 0);
  std::fs::remove_file(&path).ok();
}

#[test]
fn full_cache_evicts_only_unreferenced() {
  let (models, path) = store("eviction", 7);
  let cache = OocCache::new(2, &models).unwrap();

  for node in 0..2 {
    cache.lock().register_node(0, node, 0);
    wait_resident(&cache, 0, node);
  }

  {
    let mut state = cache.lock();
    state.acquire_node(0, 0, 0, 0);
    state.acquire_node(0, 0, 0, 1);
    // Everything referenced: registration must fail.
    assert!(!state.register_node(0, 2, 0));

    state.release_node(0, 0, 0, 0);
    // Node 0 is now evictable.
    assert!(state.register_node(0, 2, 0));
    assert!(!state.is_node_resident(0, 0));
  }

  wait_resident(&cache, 0, 2);
  let state = cache.lock();
  // The survivor's bytes are untouched by the replacement.
  assert_eq!(state.node_data(0, 1), &[1u8; SLOT]);
  assert_eq!(state.node_data(0, 2), &[2u8; SLOT]);
  std::fs::remove_file(&path).ok();
}

#[test]
fn failed_load_returns_reservation() {
  let (models, path) = store("failed", 2);
  let cache = OocCache::new(2, &models).unwrap();

  {
    let mut state = cache.lock();
    // Past the end of the data file: the read will fail.
    assert!(state.register_node(0, 60, 0));
    assert_eq!(state.num_free_slots(), 1);
  }

  for _ in 0..1000 {
    let mut state = cache.lock();
    state.refresh();
    if state.num_free_slots() == 2 {
      assert!(!state.is_node_resident(0, 60));
      std::fs::remove_file(&path).ok();
      return;
    }
    drop(state);
    std::thread::sleep(Duration::from_millis(1));
  }
  panic!("failed load never returned its reservation");
}

#[test]
fn occupancy_never_exceeds_capacity() {
  let (models, path) = store("capacity", 7);
  let cache = OocCache::new(3, &models).unwrap();

  for node in 0..7 {
    cache.lock().register_node(0, node, 0);
  }
  for _ in 0..100 {
    let mut state = cache.lock();
    state.refresh();
    assert!(state.num_resident() <= 3);
    drop(state);
    std::thread::sleep(Duration::from_millis(1));
  }
  std::fs::remove_file(&path).ok();
}
