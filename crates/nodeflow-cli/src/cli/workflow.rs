//! Workflow subcommands: run, validate and plan.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use uuid::Uuid;

use nodeflow_core::cache::{BoxCacheBackend, NodeCache};
use nodeflow_core::workflow::dag;
use nodeflow_core::workflow::{
    RunOptions, WorkflowEngine, WorkflowError, WorkflowRunResult, load_workflow_file,
};
use nodeflow_infra::cache::InMemoryCacheBackend;
use nodeflow_infra::service::LiveNodeServices;
use nodeflow_types::config::EngineConfig;
use nodeflow_types::event::WorkflowEvent;
use nodeflow_types::run::{NodeStatus, RunStatus};
use nodeflow_types::workflow::WorkflowDefinition;

use super::input::collect_inputs;

/// Arguments of `nodeflow run`.
pub struct RunArgs<'a> {
    pub file: &'a Path,
    pub inputs: &'a [String],
    pub inputs_file: Option<&'a Path>,
    pub timeout: Option<u64>,
    pub no_cache: bool,
    pub progress: bool,
}

/// How results are printed.
#[derive(Debug, Clone, Copy)]
pub struct OutputMode {
    pub json: bool,
    pub quiet: bool,
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

pub async fn handle_run(args: RunArgs<'_>, config: EngineConfig, mode: OutputMode) -> Result<()> {
    let def = load_definition(args.file)?;
    let inputs = collect_inputs(args.inputs_file, args.inputs)?;

    let services = LiveNodeServices::new(&config).context("Failed to initialise node services")?;
    let mut engine = WorkflowEngine::new(config.clone(), Arc::new(services));
    if config.cache.enabled && !args.no_cache {
        let backend = BoxCacheBackend::new(InMemoryCacheBackend::new());
        engine = engine.with_cache(NodeCache::new(backend, &config.cache));
    }

    let run_id = Uuid::now_v7();
    let mut options = RunOptions::default()
        .with_process_env(&config.env_allowlist)
        .with_run_id(run_id);
    if let Some(secs) = args.timeout {
        options = options.with_timeout(Duration::from_secs(secs));
    }

    let printer = (args.progress && !mode.quiet).then(|| {
        let mut events = engine.events().subscribe_run(run_id);
        tokio::spawn(async move {
            while let Some(event) = events.next().await {
                print_event(&event);
            }
        })
    });

    let result = {
        let run = engine.run(&def, inputs, options);
        let mut run = std::pin::pin!(run);
        let mut interrupted = false;
        loop {
            tokio::select! {
                result = &mut run => break result,
                signal = tokio::signal::ctrl_c(), if !interrupted => {
                    interrupted = true;
                    if let Err(e) = signal {
                        tracing::warn!(error = %e, "failed to listen for Ctrl+C");
                        continue;
                    }
                    eprintln!("  {} cancelling run {run_id}", style("!").yellow().bold());
                    if let Err(e) = engine.cancel(run_id) {
                        tracing::debug!(error = %e, "cancel after completion");
                    }
                }
            }
        }
    }
    .map_err(|e| anyhow!("Failed to run workflow '{}': {e}", def.name))?;

    engine.remove_run(run_id);
    drop(engine);
    if let Some(printer) = printer {
        printer.await.ok();
    }

    if mode.json {
        println!("{}", serde_json::to_string_pretty(&result_json(&result))?);
    } else if !mode.quiet {
        display_result(&def, &result)?;
    }

    if !result.is_success() {
        bail!(
            "Workflow '{}' failed: {}",
            result.workflow_name,
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn result_json(result: &WorkflowRunResult) -> serde_json::Value {
    serde_json::json!({
        "run_id": result.run_id.to_string(),
        "workflow_name": result.workflow_name,
        "status": result.status.to_string(),
        "outputs": result.outputs,
        "nodes": result
            .node_statuses
            .iter()
            .map(|(name, status)| (name.clone(), serde_json::Value::String(status.to_string())))
            .collect::<serde_json::Map<_, _>>(),
        "errors": result.errors,
        "error": result.error,
        "started_at": result.started_at.to_rfc3339(),
        "completed_at": result.completed_at.to_rfc3339(),
        "duration_ms": result.duration_ms,
    })
}

fn display_result(def: &WorkflowDefinition, result: &WorkflowRunResult) -> Result<()> {
    let (mark, verb) = match result.status {
        RunStatus::Completed => (style("*").green().bold(), "completed"),
        _ => (style("x").red().bold(), "failed"),
    };
    println!();
    println!(
        "  {} Workflow '{}' {} in {}ms",
        mark,
        style(&result.workflow_name).cyan(),
        verb,
        result.duration_ms
    );
    println!("  Run ID: {}", result.run_id);
    if let Some(error) = &result.error {
        println!("  Error: {}", style(error).red());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Node").fg(Color::Cyan),
            Cell::new("Type"),
            Cell::new("Status"),
            Cell::new("Error"),
        ]);
    for node in &def.nodes {
        let status = result
            .node_statuses
            .get(&node.name)
            .copied()
            .unwrap_or_default();
        table.add_row(vec![
            Cell::new(&node.name),
            Cell::new(node.node_type.as_str()),
            format_status(status),
            Cell::new(result.errors.get(&node.name).map(String::as_str).unwrap_or("")),
        ]);
    }
    println!();
    println!("{table}");

    if !result.outputs.is_empty() {
        println!();
        println!("  {}", style("Outputs").bold());
        let rendered = serde_json::to_string_pretty(&result.outputs)?;
        for line in rendered.lines() {
            println!("  {line}");
        }
    }
    println!();
    Ok(())
}

fn print_event(event: &WorkflowEvent) {
    match event {
        WorkflowEvent::RunStarted {
            workflow_name,
            node_count,
            ..
        } => eprintln!(
            "  {} {} ({} nodes)",
            style(">").cyan().bold(),
            workflow_name,
            node_count
        ),
        WorkflowEvent::NodeStarted {
            node,
            node_type,
            item_index,
            ..
        } => match item_index {
            Some(i) => eprintln!("  {} {node} [{i}] ({node_type})", style("-").dim()),
            None => eprintln!("  {} {node} ({node_type})", style("-").dim()),
        },
        WorkflowEvent::NodeCompleted {
            node,
            duration_ms,
            cache_hit,
            ..
        } => {
            let cached = if *cache_hit { " cached" } else { "" };
            eprintln!(
                "  {} {node} {}",
                style("*").green(),
                style(format!("{duration_ms}ms{cached}")).dim()
            );
        }
        WorkflowEvent::NodeFailed {
            node,
            error,
            will_retry,
            ..
        } => {
            let suffix = if *will_retry { " (retrying)" } else { "" };
            eprintln!("  {} {node}: {error}{suffix}", style("x").red());
        }
        WorkflowEvent::NodeSkipped { node, reason, .. } => {
            eprintln!("  {} {node}: {}", style("~").yellow(), style(reason).dim());
        }
        WorkflowEvent::RunFinished {
            status,
            duration_ms,
            ..
        } => eprintln!(
            "  {} {status} after {duration_ms}ms",
            style("<").cyan().bold()
        ),
    }
}

// ---------------------------------------------------------------------------
// Validate
// ---------------------------------------------------------------------------

pub fn handle_validate(file: &Path, mode: OutputMode) -> Result<()> {
    let def = match load_definition(file) {
        Ok(def) => def,
        Err(err) => {
            if mode.json {
                let out = serde_json::json!({ "valid": false, "error": err.to_string() });
                println!("{}", serde_json::to_string_pretty(&out)?);
            }
            return Err(err);
        }
    };
    let plan = dag::validate(&def)?;

    if mode.json {
        let out = serde_json::json!({
            "valid": true,
            "name": def.name,
            "version": def.version,
            "nodes": def.nodes.len(),
            "waves": plan.waves.len(),
            "inputs": def.inputs.keys().collect::<Vec<_>>(),
            "outputs": def.outputs.keys().collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
    } else if !mode.quiet {
        println!();
        println!(
            "  {} Workflow '{}' is valid",
            style("*").green().bold(),
            style(&def.name).cyan()
        );
        println!("  Nodes: {}", def.nodes.len());
        println!("  Waves: {}", plan.waves.len());
        println!("  Inputs: {}", def.inputs.len());
        println!("  Outputs: {}", def.outputs.len());
        println!();
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

pub fn handle_plan(file: &Path, mode: OutputMode) -> Result<()> {
    let def = load_definition(file)?;
    let plan = dag::validate(&def)?;

    if mode.json {
        let out = serde_json::json!({
            "name": def.name,
            "order": plan.order,
            "waves": plan.waves,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }
    if mode.quiet {
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Wave").fg(Color::Cyan),
            Cell::new("Node"),
            Cell::new("Type"),
            Cell::new("Depends on"),
        ]);
    for (wave_index, wave) in plan.waves.iter().enumerate() {
        for name in wave {
            let Some(node) = def.node(name) else {
                continue;
            };
            table.add_row(vec![
                Cell::new(wave_index + 1),
                Cell::new(&node.name),
                Cell::new(node.node_type.as_str()),
                Cell::new(node.depends_on.join(", ")),
            ]);
        }
    }

    println!();
    println!(
        "  Plan for '{}' ({} nodes, {} waves)",
        style(&def.name).cyan(),
        def.nodes.len(),
        plan.waves.len()
    );
    println!();
    println!("{table}");
    println!();
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_definition(file: &Path) -> Result<WorkflowDefinition> {
    load_workflow_file(file).map_err(|e| match e {
        WorkflowError::ParseError(msg) => {
            anyhow!("Failed to parse workflow {}: {msg}", file.display())
        }
        WorkflowError::IoError(err) => anyhow!("Failed to read workflow {}: {err}", file.display()),
        other => anyhow!("Workflow validation failed: {other}"),
    })
}

fn format_status(status: NodeStatus) -> Cell {
    match status {
        NodeStatus::Pending => Cell::new("pending").fg(Color::Yellow),
        NodeStatus::Ready => Cell::new("ready").fg(Color::Yellow),
        NodeStatus::Running => Cell::new("running").fg(Color::Blue),
        NodeStatus::Completed => Cell::new("completed").fg(Color::Green),
        NodeStatus::Failed => Cell::new("failed").fg(Color::Red),
        NodeStatus::Skipped => Cell::new("skipped").fg(Color::DarkYellow),
    }
}
