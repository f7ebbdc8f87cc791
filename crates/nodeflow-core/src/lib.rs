//! Business logic for nodeflow.
//!
//! This crate holds the workflow engine and everything it consumes: the
//! template/context binding layer, one executor per node kind, the node
//! result cache, the DAG validator and the capability traits ("ports") that
//! `nodeflow-infra` implements. It depends only on `nodeflow-types` and
//! never on an HTTP client, subprocess or storage crate.

pub mod binding;
pub mod cache;
pub mod event;
pub mod node;
pub mod service;
pub mod workflow;
