//! nodeflow CLI entry point.
//!
//! Binary name: `nodeflow`
//!
//! Parses CLI arguments, sets up tracing, loads the engine configuration and
//! dispatches to the command handlers.

mod cli;

use clap::Parser;
use clap_complete::generate;

use cli::workflow::{OutputMode, RunArgs};
use cli::{Cli, Commands};
use nodeflow_infra::config::{default_config_path, load_engine_config};
use nodeflow_observe::{TracingOptions, init_tracing, shutdown_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Shell completions don't need tracing or configuration
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "nodeflow", &mut std::io::stdout());
        return Ok(());
    }

    let mut tracing_options = TracingOptions::for_verbosity(cli.verbose, cli.quiet);
    tracing_options.json = cli.log_json;
    tracing_options.enable_otel = cli.otel;
    if let Err(e) = init_tracing(&tracing_options) {
        eprintln!("Warning: failed to initialise tracing: {e}");
    }

    let result = dispatch(cli).await;
    shutdown_tracing();
    result
}

async fn dispatch(cli: Cli) -> anyhow::Result<()> {
    let mode = OutputMode {
        json: cli.json,
        quiet: cli.quiet,
    };

    match cli.command {
        Commands::Run {
            file,
            inputs,
            inputs_file,
            timeout,
            no_cache,
            progress,
        } => {
            let config_path = cli.config.unwrap_or_else(default_config_path);
            let config = load_engine_config(&config_path).await;
            let args = RunArgs {
                file: &file,
                inputs: &inputs,
                inputs_file: inputs_file.as_deref(),
                timeout,
                no_cache,
                progress,
            };
            cli::workflow::handle_run(args, config, mode).await
        }

        Commands::Validate { file } => cli::workflow::handle_validate(&file, mode),

        Commands::Plan { file } => cli::workflow::handle_plan(&file, mode),

        Commands::Completions { .. } => Ok(()),
    }
}
