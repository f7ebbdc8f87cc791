//! Shared domain types for nodeflow.
//!
//! This crate contains the node data model used across the workspace:
//! workflow and node definitions, per-type node configuration, node results,
//! run/node status, run snapshots, engine configuration and events.
//!
//! Zero infrastructure dependencies -- only serde, uuid, chrono, thiserror.

pub mod config;
pub mod event;
pub mod result;
pub mod run;
pub mod service;
pub mod workflow;
