//! Node result cache.
//!
//! Memoizes successful executions of cacheable nodes under a key derived
//! from the node's identity, a hash of its config and a hash of its bound
//! context. Backend faults never abort a node: read errors are misses and
//! write errors are logged and dropped.

pub mod backend;
pub mod key;
pub mod manager;
pub mod policy;

pub use backend::{BoxCacheBackend, CacheBackend, CacheError};
pub use key::{build_cache_key, filter_context, stable_hash};
pub use manager::NodeCache;
pub use policy::{CachePolicy, CachePolicyTable};
