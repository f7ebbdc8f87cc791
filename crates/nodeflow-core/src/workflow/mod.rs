//! Workflow engine core.
//!
//! - `definition` -- YAML/JSON parsing, structural validation, file loading
//! - `dag` -- reference checks, cycle detection, execution order and waves
//! - `topology` -- precomputed graph facts the scheduler consults
//! - `context` -- per-run append-only execution context
//! - `retry` -- retry delays and backoff
//! - `tracker` -- progress snapshots for external observers
//! - `engine` -- the single-writer scheduling loop

pub mod context;
pub mod dag;
pub mod definition;
pub mod engine;
pub mod retry;
pub mod topology;
pub mod tracker;

pub use definition::{WorkflowError, load_workflow_file, parse_workflow};
pub use engine::{EngineError, RunOptions, WorkflowEngine, WorkflowRunResult};
