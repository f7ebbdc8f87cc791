//! Capability traits ("ports") for the external work a node can delegate.
//!
//! Executors never talk to the network or spawn processes themselves; they
//! render their inputs and call through [`NodeServices`]. Live
//! implementations live in `nodeflow-infra`.

pub mod box_provider;
pub mod provider;
pub mod services;

pub use box_provider::BoxLlmProvider;
pub use provider::LlmProvider;
pub use services::{BoxFuture, NodeServices, UnavailableServices};
