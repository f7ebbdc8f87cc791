//! Cache backends.

pub mod memory;

pub use memory::InMemoryCacheBackend;
