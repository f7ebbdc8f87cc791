//! Infrastructure implementations for nodeflow.
//!
//! Implements the ports declared in `nodeflow-core`:
//! - [`service::LiveNodeServices`] wires http and code nodes to a real
//!   `reqwest` client and a subprocess runner, and llm nodes to an optional
//!   [`BoxLlmProvider`](nodeflow_core::service::BoxLlmProvider)
//! - [`cache::InMemoryCacheBackend`] is the reference TTL cache backend
//! - [`config::load_engine_config`] reads `nodeflow.toml`

pub mod cache;
pub mod config;
pub mod service;
