//! CLI command definitions for the `nodeflow` binary.
//!
//! Uses clap derive macros for argument parsing.

pub mod input;
pub mod workflow;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run and inspect workflow DAGs.
#[derive(Parser)]
#[command(name = "nodeflow", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logs (-v info, -vv debug, -vvv trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Engine configuration file.
    #[arg(long, global = true, env = "NODEFLOW_CONFIG")]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true)]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Execute a workflow file.
    Run {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,

        /// Workflow input as key=value; the value is parsed as JSON when
        /// possible. Repeatable.
        #[arg(short, long = "input", value_name = "KEY=VALUE")]
        inputs: Vec<String>,

        /// YAML or JSON file holding an object of inputs. `--input` wins on
        /// conflicts.
        #[arg(long)]
        inputs_file: Option<PathBuf>,

        /// Whole-run time budget in seconds (overrides workflow and config).
        #[arg(long)]
        timeout: Option<u64>,

        /// Disable the node result cache for this run.
        #[arg(long)]
        no_cache: bool,

        /// Print node progress events to stderr.
        #[arg(long)]
        progress: bool,
    },

    /// Check a workflow file without running it.
    Validate {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,
    },

    /// Show the execution order and parallel waves of a workflow.
    Plan {
        /// Path to the workflow YAML or JSON file.
        file: PathBuf,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
