//! Tiered payload caches.
//!
//! Both tiers share the same slot-arena bookkeeping ([`index::SlotIndex`]):
//! a fixed array of payload slots, a `(model, node) -> slot` map, holder
//! sets standing in for refcounts, and refcount-0 eviction ranked by
//! `(priority, staleness)`. The host tier adds asynchronous disk loads;
//! the device tier adds the per-frame transfer list and upload budget.

pub mod gpu;
pub mod index;
pub mod loader;
pub mod ooc;

pub use gpu::GpuCache;
pub use index::SlotIndex;
pub use loader::{LoadCompletion, LoadError, NodeLoader};
pub use ooc::OocCache;
