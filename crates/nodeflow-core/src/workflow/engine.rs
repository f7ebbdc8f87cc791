//! Workflow engine: single-writer scheduling loop over a validated DAG.
//!
//! The loop owns the `ExecutionContext`. Node executions run as tokio tasks
//! in a `JoinSet` and only hand back owned results; the loop commits them,
//! promotes newly unblocked nodes and launches whatever is ready while a
//! concurrency permit is free.
//!
//! # Execution flow
//!
//! 1. Validate the definition, then the run inputs (defaults applied).
//! 2. Promote pending nodes: failed dependency -> failed, pruned or all
//!    dependencies skipped -> skipped, otherwise ready.
//! 3. Launch ready nodes; split/foreach results register an expansion that
//!    runs the subgraph once per item in a single task.
//! 4. Commit finished tasks, apply routing and strict-policy aborts.
//! 5. Stop when every node is terminal, the budget expires or the run is
//!    cancelled, then resolve the declared outputs.

use std::any::Any;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::pin::pin;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures_util::FutureExt;
use futures_util::future::join_all;
use nodeflow_types::config::EngineConfig;
use nodeflow_types::event::WorkflowEvent;
use nodeflow_types::result::NodeResult;
use nodeflow_types::run::{NodeStatus, RunSnapshot, RunStatus};
use nodeflow_types::workflow::{
    ErrorPolicy, NodeConfig, NodeDefinition, NodeType, WorkflowDefinition, split_reference,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{Id, JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::context::ExecutionContext;
use super::definition::WorkflowError;
use super::retry::RetryPolicy;
use super::topology::Topology;
use super::tracker::RunTracker;
use crate::binding::{BoundContext, Scope};
use crate::cache::NodeCache;
use crate::event::EventBus;
use crate::node::{Expansion, LlmDefaults, NodeInput, NodeOutcome, NodeRunner, type_name};
use crate::service::NodeServices;

/// Stand-in deadline for budgets too large to represent.
const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid inputs: {0}")]
    InvalidInputs(String),

    #[error(transparent)]
    Definition(#[from] WorkflowError),

    #[error("run {0} not found")]
    RunNotFound(Uuid),

    #[error("run {0} already exists")]
    DuplicateRun(Uuid),
}

/// Per-run knobs supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Fixed run id, so callers can query or cancel a run they are awaiting.
    pub run_id: Option<Uuid>,
    /// Values exposed to templates under `env`.
    pub env: Map<String, Value>,
    /// Overrides both the workflow and the engine time budget.
    pub timeout: Option<Duration>,
}

impl RunOptions {
    /// Inject process environment variables whose names start with one of
    /// `allowlist`. An empty allowlist injects every variable.
    pub fn with_process_env(mut self, allowlist: &[String]) -> Self {
        for (key, value) in std::env::vars() {
            if allowlist.is_empty() || allowlist.iter().any(|prefix| key.starts_with(prefix.as_str())) {
                self.env.insert(key, Value::String(value));
            }
        }
        self
    }

    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Final state of a run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkflowRunResult {
    pub run_id: Uuid,
    pub workflow_name: String,
    pub status: RunStatus,
    pub outputs: Map<String, Value>,
    pub node_statuses: BTreeMap<String, NodeStatus>,
    pub errors: BTreeMap<String, String>,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl WorkflowRunResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct RunHandle {
    tracker: Arc<RunTracker>,
    cancel: CancellationToken,
}

/// Runs workflows against a set of node services.
///
/// Finished runs stay registered so their snapshot can still be queried,
/// up to `EngineConfig::retained_runs`; older ones are evicted in finish
/// order. `remove_run` drops a run early.
pub struct WorkflowEngine {
    config: EngineConfig,
    runner: NodeRunner,
    cache: Option<NodeCache>,
    events: EventBus,
    runs: Arc<DashMap<Uuid, RunHandle>>,
    finished: Mutex<VecDeque<Uuid>>,
}

impl WorkflowEngine {
    pub fn new(config: EngineConfig, services: Arc<dyn NodeServices>) -> Self {
        let runner = NodeRunner::new(services, LlmDefaults::from(&config));
        Self {
            config,
            runner,
            cache: None,
            events: EventBus::default(),
            runs: Arc::new(DashMap::new()),
            finished: Mutex::new(VecDeque::new()),
        }
    }

    /// Memoize cacheable node results through `cache`.
    pub fn with_cache(mut self, cache: NodeCache) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_event_bus(mut self, events: EventBus) -> Self {
        self.events = events;
        self
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execute `def` to completion.
    ///
    /// Definition and input errors are returned before the run starts.
    /// Everything after that, node failures and timeouts included, is
    /// reported through the returned `WorkflowRunResult`.
    pub async fn run(
        &self,
        def: &WorkflowDefinition,
        inputs: Map<String, Value>,
        options: RunOptions,
    ) -> Result<WorkflowRunResult, EngineError> {
        let topology = Topology::build(def)?;
        let inputs = validate_inputs(def, inputs)?;

        let run_id = options.run_id.unwrap_or_else(Uuid::now_v7);
        let tracker = Arc::new(RunTracker::new(
            run_id,
            &def.name,
            topology.order.iter().map(String::as_str),
        ));
        let cancel = CancellationToken::new();
        match self.runs.entry(run_id) {
            Entry::Occupied(_) => return Err(EngineError::DuplicateRun(run_id)),
            Entry::Vacant(slot) => {
                slot.insert(RunHandle {
                    tracker: Arc::clone(&tracker),
                    cancel: cancel.clone(),
                });
            }
        }

        let budget = options
            .timeout
            .or(def.timeout_secs.map(Duration::from_secs))
            .unwrap_or(Duration::from_secs(self.config.workflow_timeout_secs));
        let permits = match self.config.max_concurrency {
            0 => Semaphore::MAX_PERMITS,
            n => n,
        };
        let env = TaskEnv {
            run_id,
            runner: self.runner.clone(),
            cache: self.cache.clone(),
            events: self.events.clone(),
            node_timeout: Duration::from_secs(self.config.node_timeout_secs),
            permits: Arc::new(Semaphore::new(permits)),
        };

        let ctx = ExecutionContext::new(run_id, &def.name, inputs, options.env);
        let run = RunLoop::new(def, &topology, ctx, tracker, env);
        let result = run.drive(budget, cancel).await;
        self.retire(run_id);
        Ok(result)
    }

    /// Record `run_id` as finished and evict the oldest finished runs past
    /// the retention limit.
    fn retire(&self, run_id: Uuid) {
        let limit = self.config.retained_runs;
        if limit == 0 {
            return;
        }
        let Ok(mut finished) = self.finished.lock() else {
            return;
        };
        finished.retain(|id| self.runs.contains_key(id));
        finished.push_back(run_id);
        while finished.len() > limit {
            if let Some(oldest) = finished.pop_front() {
                self.runs.remove(&oldest);
                tracing::debug!(run_id = %oldest, "evicted finished run");
            }
        }
    }

    pub fn snapshot(&self, run_id: Uuid) -> Option<RunSnapshot> {
        self.runs.get(&run_id).map(|h| h.tracker.snapshot())
    }

    /// Cancel a run. In-flight nodes fail with `cancelled: workflow cancelled`.
    pub fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let handle = self.runs.get(&run_id).ok_or(EngineError::RunNotFound(run_id))?;
        tracing::info!(run_id = %run_id, "cancelling run");
        handle.cancel.cancel();
        Ok(())
    }

    /// Ids of runs that have not reached a terminal state.
    pub fn active_runs(&self) -> Vec<Uuid> {
        self.runs
            .iter()
            .filter(|entry| !entry.tracker.snapshot().status.is_terminal())
            .map(|entry| *entry.key())
            .collect()
    }

    pub fn remove_run(&self, run_id: Uuid) -> Option<RunSnapshot> {
        self.runs.remove(&run_id).map(|(_, h)| h.tracker.snapshot())
    }
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine")
            .field("config", &self.config)
            .field("cache", &self.cache.is_some())
            .field("runs", &self.runs.len())
            .finish()
    }
}

/// Check supplied inputs against the declared ones and apply defaults.
/// Undeclared inputs pass through untouched.
fn validate_inputs(def: &WorkflowDefinition, mut inputs: Map<String, Value>) -> Result<Map<String, Value>, EngineError> {
    for (name, spec) in &def.inputs {
        match inputs.get(name).filter(|v| !v.is_null()) {
            Some(value) => {
                if !spec.input_type.accepts(value) {
                    return Err(EngineError::InvalidInputs(format!(
                        "input '{name}' expected {}, got {}",
                        spec.input_type.as_str(),
                        type_name(value)
                    )));
                }
            }
            None => match &spec.default {
                Some(default) => {
                    inputs.insert(name.clone(), default.clone());
                }
                None if spec.required => {
                    return Err(EngineError::InvalidInputs(format!("missing required input '{name}'")));
                }
                None => {}
            },
        }
    }
    Ok(inputs)
}

// ---------------------------------------------------------------------------
// Node execution (shared by the loop and fan-out items)
// ---------------------------------------------------------------------------

/// What a node task needs; cloned into every spawned task.
#[derive(Clone)]
struct TaskEnv {
    run_id: Uuid,
    runner: NodeRunner,
    cache: Option<NodeCache>,
    events: EventBus,
    node_timeout: Duration,
    permits: Arc<Semaphore>,
}

struct Executed {
    outcome: NodeOutcome,
    attempts: u32,
    cache_hit: bool,
    duration_ms: u64,
}

/// Cache lookup, then attempts with retry and timeout, then fallback.
async fn execute_node(env: &TaskEnv, input: NodeInput) -> Executed {
    let node = Arc::clone(&input.node);
    let started = Instant::now();
    let cache_context = input.bound.to_value();

    if let Some(cache) = &env.cache {
        if let Some(output) = cache.get_cached_result(&node, &cache_context).await {
            tracing::debug!(run_id = %env.run_id, node = %node.name, "served from cache");
            let result = NodeResult::success(output)
                .with_metadata("node_type", node.node_type.as_str())
                .with_metadata("cache_hit", true)
                .with_metadata("attempts", 0);
            return Executed {
                outcome: NodeOutcome::Finished(result),
                attempts: 0,
                cache_hit: true,
                duration_ms: elapsed_ms(started),
            };
        }
    }

    let policy = RetryPolicy::from_config(node.retry.as_ref());
    let budget = node.timeout_secs.map(Duration::from_secs).unwrap_or(env.node_timeout);
    let mut attempt = 0;
    let outcome = loop {
        attempt += 1;
        let outcome = run_attempt(&env.runner, input.clone(), budget).await;
        if outcome.is_success() || !policy.should_retry(attempt) {
            break outcome;
        }
        let error = outcome.result().error_message().to_string();
        let delay = policy.delay_for(attempt);
        tracing::warn!(
            run_id = %env.run_id,
            node = %node.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "node attempt failed, retrying"
        );
        env.events.publish(WorkflowEvent::NodeFailed {
            run_id: env.run_id,
            node: node.name.clone(),
            error,
            will_retry: true,
        });
        tokio::time::sleep(delay).await;
    };

    let outcome = match outcome {
        NodeOutcome::Finished(result) if !result.success => match &node.fallback {
            Some(fallback) => {
                tracing::warn!(
                    run_id = %env.run_id,
                    node = %node.name,
                    error = %result.error_message(),
                    "node failed, using fallback"
                );
                NodeOutcome::Finished(
                    NodeResult::success(fallback.clone())
                        .with_metadata("node_type", node.node_type.as_str())
                        .with_metadata("fallback_used", true)
                        .with_metadata("error", result.error_message()),
                )
            }
            None => NodeOutcome::Finished(result),
        },
        NodeOutcome::Finished(result) => {
            if let Some(cache) = &env.cache {
                cache.cache_result(&node, &cache_context, &result.output).await;
            }
            NodeOutcome::Finished(result)
        }
        other => other,
    };

    Executed {
        outcome: outcome.map_result(|r| r.with_metadata("attempts", attempt).with_metadata("cache_hit", false)),
        attempts: attempt,
        cache_hit: false,
        duration_ms: elapsed_ms(started),
    }
}

async fn run_attempt(runner: &NodeRunner, input: NodeInput, budget: Duration) -> NodeOutcome {
    let execution = AssertUnwindSafe(runner.execute(input)).catch_unwind();
    match tokio::time::timeout(budget, execution).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(panic)) => NodeOutcome::Finished(NodeResult::failure(format!(
            "node panicked: {}",
            panic_message(panic.as_ref())
        ))),
        Err(_) => NodeOutcome::Finished(NodeResult::failure(format!(
            "node timed out after {}s",
            budget.as_secs()
        ))),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

/// Targets of a branching node other than `selected`.
fn unselected_targets(node: &NodeDefinition, selected: Option<&str>) -> Vec<String> {
    match &node.config {
        NodeConfig::Conditional(route) | NodeConfig::Route(route) => route
            .targets()
            .into_iter()
            .filter(|t| Some(*t) != selected)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// Read-only parent state shared by every item of one expansion.
struct ExpansionPlan {
    expander: String,
    members: Vec<Arc<NodeDefinition>>,
    outputs: HashMap<String, Value>,
    inputs: Map<String, Value>,
    env: Map<String, Value>,
    /// Status of each subgraph dependency outside the subgraph.
    external: HashMap<String, NodeStatus>,
    /// Members pruned by a branch outside the subgraph.
    pruned: HashSet<String>,
    expansion: Expansion,
}

#[derive(Debug, Clone)]
enum ItemState {
    Completed(Value),
    Failed(String),
    Skipped,
}

impl ItemState {
    fn status(&self) -> NodeStatus {
        match self {
            ItemState::Completed(_) => NodeStatus::Completed,
            ItemState::Failed(_) => NodeStatus::Failed,
            ItemState::Skipped => NodeStatus::Skipped,
        }
    }
}

struct ExpansionReport {
    expander: String,
    /// Per item, member name -> state.
    items: Vec<HashMap<String, ItemState>>,
}

async fn run_expansion(env: TaskEnv, plan: ExpansionPlan) -> ExpansionReport {
    let expansion = &plan.expansion;
    tracing::debug!(
        run_id = %env.run_id,
        node = %plan.expander,
        items = expansion.items.len(),
        parallel = expansion.parallel,
        "running fan-out"
    );

    let items = if expansion.parallel {
        let limit = expansion
            .max_concurrency
            .filter(|n| *n > 0)
            .unwrap_or(Semaphore::MAX_PERMITS);
        let gate = Semaphore::new(limit);
        let gate = &gate;
        let env = &env;
        let plan = &plan;
        join_all(expansion.items.iter().enumerate().map(|(index, item)| async move {
            let _slot = gate.acquire().await.ok();
            run_item(env, plan, index, item).await
        }))
        .await
    } else {
        let mut records = Vec::with_capacity(expansion.items.len());
        for (index, item) in expansion.items.iter().enumerate() {
            records.push(run_item(&env, &plan, index, item).await);
        }
        records
    };

    ExpansionReport {
        expander: plan.expander.clone(),
        items,
    }
}

/// Run every subgraph member once for one item, in execution order.
async fn run_item(env: &TaskEnv, plan: &ExpansionPlan, index: usize, item: &Value) -> HashMap<String, ItemState> {
    let mut local: HashMap<String, Value> = HashMap::new();
    let mut states: HashMap<String, ItemState> = HashMap::new();
    let mut pruned: HashSet<String> = plan.pruned.clone();

    for member in &plan.members {
        if let Some(state) = member_gate(plan, member, &states, &pruned) {
            states.insert(member.name.clone(), state);
            continue;
        }

        let bound = {
            let scope = Scope::new(&plan.outputs, &plan.inputs, &plan.env).for_item(
                &local,
                &plan.expansion.item_name,
                item,
            );
            BoundContext::build(member, &scope)
        };

        let _permit = Arc::clone(&env.permits).acquire_owned().await.ok();
        env.events.publish(WorkflowEvent::NodeStarted {
            run_id: env.run_id,
            node: member.name.clone(),
            node_type: member.node_type.as_str().to_string(),
            item_index: Some(index),
        });
        let executed = execute_node(env, NodeInput::new(Arc::clone(member), bound)).await;

        let state = match executed.outcome {
            NodeOutcome::Routed { result, target } => {
                pruned.extend(unselected_targets(member, Some(target.as_str())));
                local.insert(member.name.clone(), result.output.clone());
                ItemState::Completed(result.output)
            }
            outcome => {
                let result = outcome.into_result();
                if result.success {
                    if member.node_type.is_branching() {
                        pruned.extend(unselected_targets(member, None));
                    }
                    local.insert(member.name.clone(), result.output.clone());
                    ItemState::Completed(result.output)
                } else {
                    ItemState::Failed(result.error_message().to_string())
                }
            }
        };
        states.insert(member.name.clone(), state);
    }
    states
}

/// Failed or skipped state for a member that must not run in this item.
fn member_gate(
    plan: &ExpansionPlan,
    member: &NodeDefinition,
    states: &HashMap<String, ItemState>,
    pruned: &HashSet<String>,
) -> Option<ItemState> {
    if pruned.contains(&member.name) {
        return Some(ItemState::Skipped);
    }
    let mut all_skipped = !member.depends_on.is_empty();
    for dep in &member.depends_on {
        let status = match states.get(dep) {
            Some(state) => state.status(),
            None if dep == &plan.expander => NodeStatus::Completed,
            None => plan.external.get(dep).copied().unwrap_or(NodeStatus::Completed),
        };
        match status {
            NodeStatus::Failed => return Some(ItemState::Failed(format!("upstream node '{dep}' failed"))),
            NodeStatus::Skipped => {}
            _ => all_skipped = false,
        }
    }
    all_skipped.then_some(ItemState::Skipped)
}

/// Per-item result handed to the aggregate: the sink's output, or a map of
/// sink outputs when the subgraph has several sinks.
fn item_result(sinks: &[String], states: &HashMap<String, ItemState>) -> Value {
    let output = |sink: &String| match states.get(sink) {
        Some(ItemState::Completed(value)) => value.clone(),
        _ => Value::Null,
    };
    match sinks {
        [single] => output(single),
        _ => Value::Object(sinks.iter().map(|s| (s.clone(), output(s))).collect()),
    }
}

// ---------------------------------------------------------------------------
// RunLoop
// ---------------------------------------------------------------------------

enum TaskOutput {
    Node { name: String, executed: Executed },
    Expansion(ExpansionReport),
}

enum InFlight {
    Node(String),
    Expansion(String),
}

enum ExpansionState {
    /// Expander completed; waiting for the subgraph's external dependencies.
    Pending(Expansion),
    Running { collect_output: bool, started: Instant },
    Done,
}

enum Readiness {
    Wait,
    Ready,
    Fail(String),
    Skip(&'static str),
}

struct RunLoop<'a> {
    def: &'a WorkflowDefinition,
    topo: &'a Topology,
    ctx: ExecutionContext,
    status: HashMap<String, NodeStatus>,
    pruned: HashSet<String>,
    expansions: HashMap<String, ExpansionState>,
    tracker: Arc<RunTracker>,
    env: TaskEnv,
    tasks: JoinSet<TaskOutput>,
    in_flight: HashMap<Id, InFlight>,
    strict_failure: Option<String>,
    run_error: Option<String>,
}

impl<'a> RunLoop<'a> {
    fn new(
        def: &'a WorkflowDefinition,
        topo: &'a Topology,
        ctx: ExecutionContext,
        tracker: Arc<RunTracker>,
        env: TaskEnv,
    ) -> Self {
        let status = topo.order.iter().map(|n| (n.clone(), NodeStatus::Pending)).collect();
        Self {
            def,
            topo,
            ctx,
            status,
            pruned: HashSet::new(),
            expansions: HashMap::new(),
            tracker,
            env,
            tasks: JoinSet::new(),
            in_flight: HashMap::new(),
            strict_failure: None,
            run_error: None,
        }
    }

    async fn drive(mut self, budget: Duration, cancel: CancellationToken) -> WorkflowRunResult {
        let started_at = Utc::now();
        let started = Instant::now();
        let run_id = self.env.run_id;

        self.tracker.start();
        self.env.events.publish(WorkflowEvent::RunStarted {
            run_id,
            workflow_name: self.def.name.clone(),
            node_count: self.topo.len(),
        });
        tracing::info!(
            run_id = %run_id,
            workflow = %self.def.name,
            nodes = self.topo.len(),
            budget_secs = budget.as_secs(),
            "workflow run started"
        );

        let now = tokio::time::Instant::now();
        let deadline_at = now.checked_add(budget).unwrap_or(now + FAR_FUTURE);
        let mut deadline = pin!(tokio::time::sleep_until(deadline_at));
        loop {
            self.promote();
            self.launch_ready();
            self.launch_expansions();

            if self.all_terminal() {
                break;
            }
            if self.tasks.is_empty() {
                self.skip_unreachable();
                break;
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.abort("workflow cancelled", Some("cancelled: workflow cancelled"));
                    break;
                }
                _ = &mut deadline => {
                    self.abort("workflow timed out", Some("cancelled: workflow timed out"));
                    break;
                }
                joined = self.tasks.join_next_with_id() => {
                    if let Some(joined) = joined {
                        self.on_joined(joined);
                    }
                    if let Some(message) = self.strict_failure.take() {
                        self.abort(&message, None);
                        break;
                    }
                }
            }
        }

        self.finish(started_at, started)
    }

    fn status_of(&self, name: &str) -> NodeStatus {
        self.status.get(name).copied().unwrap_or_default()
    }

    fn all_terminal(&self) -> bool {
        self.status.values().all(NodeStatus::is_terminal)
    }

    // -- promotion ----------------------------------------------------------

    fn promote(&mut self) {
        let topo = self.topo;
        loop {
            let mut changed = false;
            for name in &topo.order {
                if self.status_of(name) != NodeStatus::Pending {
                    continue;
                }
                if let Some(expander) = topo.owner(name) {
                    if self.pruned.contains(name) {
                        self.skip_node(name, "branch not selected");
                        changed = true;
                        continue;
                    }
                    match self.status_of(expander) {
                        NodeStatus::Failed => {
                            self.fail_node(name, &format!("upstream node '{expander}' failed"));
                            changed = true;
                        }
                        NodeStatus::Skipped => {
                            self.skip_node(name, "fan-out skipped");
                            changed = true;
                        }
                        _ => {}
                    }
                    continue;
                }
                match self.readiness(name) {
                    Readiness::Wait => {}
                    Readiness::Ready => {
                        self.status.insert(name.clone(), NodeStatus::Ready);
                        self.tracker.set_status(name, NodeStatus::Ready);
                        changed = true;
                    }
                    Readiness::Fail(message) => {
                        self.fail_node(name, &message);
                        changed = true;
                    }
                    Readiness::Skip(reason) => {
                        self.skip_node(name, reason);
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn readiness(&self, name: &str) -> Readiness {
        let Some(node) = self.topo.node(name) else {
            return Readiness::Wait;
        };
        if self.pruned.contains(name) {
            return Readiness::Skip("branch not selected");
        }
        if !node.depends_on.iter().all(|d| self.status_of(d).is_terminal()) {
            return Readiness::Wait;
        }
        if let Some(source) = self.topo.aggregate_source(name) {
            let source_status = self.status_of(source);
            if !source_status.is_terminal() {
                return Readiness::Wait;
            }
            let expansion_done = matches!(self.expansions.get(source), None | Some(ExpansionState::Done));
            if source_status == NodeStatus::Completed && !expansion_done {
                return Readiness::Wait;
            }
        }
        if let Some(failed) = node.depends_on.iter().find(|d| self.status_of(d) == NodeStatus::Failed) {
            return Readiness::Fail(format!("upstream node '{failed}' failed"));
        }
        if !node.depends_on.is_empty() && node.depends_on.iter().all(|d| self.status_of(d) == NodeStatus::Skipped) {
            return Readiness::Skip("all dependencies skipped");
        }
        Readiness::Ready
    }

    // -- launching ----------------------------------------------------------

    fn launch_ready(&mut self) {
        let topo = self.topo;
        for name in &topo.order {
            if self.status_of(name) != NodeStatus::Ready {
                continue;
            }
            let Ok(permit) = Arc::clone(&self.env.permits).try_acquire_owned() else {
                break;
            };
            self.launch_node(name, permit);
        }
    }

    fn launch_node(&mut self, name: &str, permit: OwnedSemaphorePermit) {
        let Some(node) = self.topo.node(name).cloned() else {
            return;
        };
        let bound = BoundContext::build(&node, &self.ctx.scope());
        let mut input = NodeInput::new(Arc::clone(&node), bound);
        match node.node_type {
            NodeType::Aggregate => {
                if let Some(source) = self.topo.aggregate_source(name) {
                    input.parallel_results = self.ctx.take_parallel_results(source);
                }
            }
            NodeType::Split => input.split_targets = self.topo.subgraph(name).to_vec(),
            _ => {}
        }

        self.status.insert(name.to_string(), NodeStatus::Running);
        self.tracker.node_started(name);
        self.env.events.publish(WorkflowEvent::NodeStarted {
            run_id: self.env.run_id,
            node: name.to_string(),
            node_type: node.node_type.as_str().to_string(),
            item_index: None,
        });
        tracing::debug!(run_id = %self.env.run_id, node = name, node_type = %node.node_type, "node started");

        let env = self.env.clone();
        let task_name = name.to_string();
        let handle = self.tasks.spawn(async move {
            let _permit = permit;
            let executed = execute_node(&env, input).await;
            TaskOutput::Node {
                name: task_name,
                executed,
            }
        });
        self.in_flight.insert(handle.id(), InFlight::Node(name.to_string()));
    }

    fn launch_expansions(&mut self) {
        let topo = self.topo;
        let ready: Vec<String> = self
            .expansions
            .iter()
            .filter(|(expander, state)| {
                matches!(state, ExpansionState::Pending(_))
                    && topo
                        .external_deps(expander)
                        .iter()
                        .all(|d| self.status_of(d).is_terminal())
            })
            .map(|(expander, _)| expander.clone())
            .collect();

        for expander in ready {
            let Some(ExpansionState::Pending(expansion)) = self.expansions.remove(&expander) else {
                continue;
            };
            let members: Vec<Arc<NodeDefinition>> = topo
                .subgraph(&expander)
                .iter()
                .filter_map(|m| topo.node(m).cloned())
                .collect();
            let mut pruned = HashSet::new();
            for member in &members {
                if self.status_of(&member.name).is_terminal() {
                    pruned.insert(member.name.clone());
                    continue;
                }
                self.status.insert(member.name.clone(), NodeStatus::Running);
                self.tracker.node_started(&member.name);
            }
            self.expansions.insert(
                expander.clone(),
                ExpansionState::Running {
                    collect_output: expansion.collect_output,
                    started: Instant::now(),
                },
            );

            let plan = ExpansionPlan {
                expander: expander.clone(),
                members,
                outputs: self.ctx.outputs().clone(),
                inputs: self.ctx.inputs().clone(),
                env: self.ctx.env().clone(),
                external: topo
                    .external_deps(&expander)
                    .iter()
                    .map(|d| (d.clone(), self.status_of(d)))
                    .collect(),
                pruned,
                expansion,
            };
            let env = self.env.clone();
            let handle = self
                .tasks
                .spawn(async move { TaskOutput::Expansion(run_expansion(env, plan).await) });
            self.in_flight.insert(handle.id(), InFlight::Expansion(expander));
        }
    }

    // -- committing ---------------------------------------------------------

    fn on_joined(&mut self, joined: Result<(Id, TaskOutput), JoinError>) {
        match joined {
            Ok((id, output)) => {
                self.in_flight.remove(&id);
                match output {
                    TaskOutput::Node { name, executed } => self.commit_node(&name, executed),
                    TaskOutput::Expansion(report) => self.commit_expansion(report),
                }
            }
            Err(e) => match self.in_flight.remove(&e.id()) {
                Some(InFlight::Node(name)) => {
                    let message = format!("node task failed: {e}");
                    self.fail_node(&name, &message);
                    self.note_strict(&name, &message);
                }
                Some(InFlight::Expansion(expander)) => {
                    let message = format!("fan-out task failed: {e}");
                    self.expansions.insert(expander.clone(), ExpansionState::Done);
                    for member in self.topo.subgraph(&expander) {
                        if self.status_of(member) == NodeStatus::Running {
                            self.fail_node(member, &message);
                        }
                    }
                    self.note_strict(&expander, &message);
                }
                None => tracing::warn!(run_id = %self.env.run_id, error = %e, "unknown task failed"),
            },
        }
    }

    fn commit_node(&mut self, name: &str, executed: Executed) {
        let Some(node) = self.topo.node(name).cloned() else {
            return;
        };
        self.tracker.set_attempts(name, executed.attempts);
        let Executed {
            outcome,
            duration_ms,
            cache_hit,
            ..
        } = executed;

        match outcome {
            NodeOutcome::Routed { result, target } => {
                tracing::debug!(run_id = %self.env.run_id, node = name, target = %target, "branch selected");
                self.pruned.extend(unselected_targets(&node, Some(target.as_str())));
                self.complete_node(name, result.output, duration_ms, cache_hit);
            }
            NodeOutcome::Expand { result, expansion } => {
                self.complete_node(name, result.output, duration_ms, cache_hit);
                if self.status_of(name) == NodeStatus::Completed {
                    self.register_expansion(name, expansion);
                }
            }
            NodeOutcome::Finished(result) if result.success => {
                if node.node_type.is_branching() {
                    self.pruned.extend(unselected_targets(&node, None));
                }
                self.complete_node(name, result.output, duration_ms, cache_hit);
                if node.node_type.is_expander() {
                    // A fallback stood in for the item list; nothing runs per item.
                    self.expansions.insert(name.to_string(), ExpansionState::Done);
                    for member in self.topo.subgraph(name) {
                        self.skip_node(member, "fan-out produced no items");
                    }
                }
            }
            NodeOutcome::Finished(result) => {
                let message = result.error_message().to_string();
                self.fail_node(name, &message);
                self.note_strict(name, &message);
            }
        }
    }

    fn register_expansion(&mut self, expander: &str, expansion: Expansion) {
        if self.topo.subgraph(expander).is_empty() {
            if expansion.collect_output {
                self.ctx.set_parallel_results(expander, expansion.items);
            }
            self.expansions.insert(expander.to_string(), ExpansionState::Done);
        } else {
            self.expansions
                .insert(expander.to_string(), ExpansionState::Pending(expansion));
        }
    }

    fn commit_expansion(&mut self, report: ExpansionReport) {
        let expander = report.expander;
        let (collect_output, duration_ms) = match self.expansions.insert(expander.clone(), ExpansionState::Done) {
            Some(ExpansionState::Running { collect_output, started }) => (collect_output, elapsed_ms(started)),
            _ => (true, 0),
        };

        let topo = self.topo;
        for member in topo.subgraph(&expander) {
            if self.status_of(member) != NodeStatus::Running {
                continue;
            }
            let per_item: Vec<Option<&ItemState>> = report.items.iter().map(|states| states.get(member)).collect();
            let failure = per_item.iter().enumerate().find_map(|(i, state)| match state {
                Some(ItemState::Failed(error)) => Some(format!("item {i}: {error}")),
                _ => None,
            });
            if let Some(message) = failure {
                self.fail_node(member, &message);
                self.note_strict(member, &message);
            } else if !per_item.is_empty() && per_item.iter().all(|s| matches!(s, None | Some(ItemState::Skipped))) {
                self.skip_node(member, "skipped in every item");
            } else {
                let outputs = per_item
                    .iter()
                    .map(|state| match state {
                        Some(ItemState::Completed(value)) => value.clone(),
                        _ => Value::Null,
                    })
                    .collect();
                self.complete_node(member, Value::Array(outputs), duration_ms, false);
            }
        }

        if collect_output {
            let sinks = topo.sinks(&expander);
            let results = report.items.iter().map(|states| item_result(sinks, states)).collect();
            self.ctx.set_parallel_results(&expander, results);
        }
        tracing::debug!(
            run_id = %self.env.run_id,
            node = %expander,
            items = report.items.len(),
            duration_ms,
            "fan-out finished"
        );
    }

    // -- state transitions --------------------------------------------------

    fn complete_node(&mut self, name: &str, output: Value, duration_ms: u64, cache_hit: bool) {
        if let Err(e) = self.ctx.record_output(name, output) {
            self.fail_node(name, &e.to_string());
            self.note_strict(name, &e.to_string());
            return;
        }
        self.status.insert(name.to_string(), NodeStatus::Completed);
        self.tracker
            .node_completed(name, self.ctx.output(name).cloned().unwrap_or(Value::Null));
        self.env.events.publish(WorkflowEvent::NodeCompleted {
            run_id: self.env.run_id,
            node: name.to_string(),
            duration_ms,
            cache_hit,
        });
        tracing::debug!(run_id = %self.env.run_id, node = name, duration_ms, cache_hit, "node completed");
    }

    fn fail_node(&mut self, name: &str, message: &str) {
        if let Err(e) = self.ctx.record_error(name, message) {
            tracing::debug!(run_id = %self.env.run_id, node = name, error = %e, "error not recorded");
        }
        self.status.insert(name.to_string(), NodeStatus::Failed);
        self.tracker.node_failed(name, message);
        self.env.events.publish(WorkflowEvent::NodeFailed {
            run_id: self.env.run_id,
            node: name.to_string(),
            error: message.to_string(),
            will_retry: false,
        });
        tracing::warn!(run_id = %self.env.run_id, node = name, error = message, "node failed");
    }

    fn skip_node(&mut self, name: &str, reason: &str) {
        self.status.insert(name.to_string(), NodeStatus::Skipped);
        self.tracker.node_skipped(name);
        self.env.events.publish(WorkflowEvent::NodeSkipped {
            run_id: self.env.run_id,
            node: name.to_string(),
            reason: reason.to_string(),
        });
        tracing::debug!(run_id = %self.env.run_id, node = name, reason, "node skipped");
    }

    fn note_strict(&mut self, name: &str, message: &str) {
        if self.def.error_policy == ErrorPolicy::Strict && self.strict_failure.is_none() {
            self.strict_failure = Some(format!("node '{name}' failed: {message}"));
        }
    }

    /// Stop the run: abort in-flight tasks, fail running nodes with
    /// `running_error` (or skip them when `None`) and skip everything else.
    fn abort(&mut self, run_error: &str, running_error: Option<&str>) {
        tracing::warn!(run_id = %self.env.run_id, error = run_error, "aborting run");
        self.tasks.abort_all();
        self.in_flight.clear();

        let topo = self.topo;
        for name in &topo.order {
            match (self.status_of(name), running_error) {
                (NodeStatus::Running, Some(message)) => self.fail_node(name, message),
                (status, _) if !status.is_terminal() => self.skip_node(name, "run aborted"),
                _ => {}
            }
        }
        self.run_error = Some(run_error.to_string());
    }

    fn skip_unreachable(&mut self) {
        let topo = self.topo;
        for name in &topo.order {
            if !self.status_of(name).is_terminal() {
                tracing::warn!(run_id = %self.env.run_id, node = %name, "node unreachable");
                self.skip_node(name, "unreachable");
            }
        }
    }

    // -- completion ---------------------------------------------------------

    fn finish(self, started_at: DateTime<Utc>, started: Instant) -> WorkflowRunResult {
        let required: Vec<&str> = if self.def.outputs.is_empty() {
            self.topo.order.iter().map(String::as_str).collect()
        } else {
            self.def
                .outputs
                .values()
                .map(|reference| split_reference(reference.trim()).0)
                .collect()
        };
        let failed_required = required
            .iter()
            .find(|name| self.status_of(name) == NodeStatus::Failed)
            .map(|name| {
                format!(
                    "node '{name}' failed: {}",
                    self.ctx.error(name).unwrap_or("unknown error")
                )
            });

        let error = self.run_error.clone().or(failed_required);
        let status = if error.is_some() { RunStatus::Failed } else { RunStatus::Completed };

        let outputs = if self.def.outputs.is_empty() {
            self.topo
                .order
                .iter()
                .filter_map(|name| self.ctx.output(name).map(|v| (name.clone(), v.clone())))
                .collect()
        } else {
            self.ctx.resolve_outputs(&self.def.outputs)
        };

        let duration_ms = elapsed_ms(started);
        self.tracker.finish(status, error.clone());
        self.env.events.publish(WorkflowEvent::RunFinished {
            run_id: self.env.run_id,
            workflow_name: self.def.name.clone(),
            status,
            duration_ms,
            error: error.clone(),
        });
        match &error {
            None => tracing::info!(run_id = %self.env.run_id, duration_ms, "workflow run completed"),
            Some(e) => tracing::warn!(run_id = %self.env.run_id, duration_ms, error = %e, "workflow run failed"),
        }

        WorkflowRunResult {
            run_id: self.env.run_id,
            workflow_name: self.def.name.clone(),
            status,
            outputs,
            node_statuses: self.status.iter().map(|(k, v)| (k.clone(), *v)).collect(),
            errors: self.ctx.errors().clone(),
            error,
            started_at,
            completed_at: Utc::now(),
            duration_ms,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use nodeflow_types::config::CacheSettings;
    use nodeflow_types::service::{CodeRequest, HttpRequest, HttpResponse, LlmRequest, ServiceError};
    use serde_json::json;

    use super::*;
    use crate::cache::BoxCacheBackend;
    use crate::cache::backend::testing::TestCache;
    use crate::service::BoxFuture;
    use crate::workflow::definition::parse_workflow;

    /// Code nodes interpret their source as a tiny command language:
    /// `sleep <ms>`, `fail`, `flaky <n>` (fails the first n calls), `panic`,
    /// `echo <key>` (returns that key of the bound context). Anything else is
    /// returned as a string.
    #[derive(Default)]
    struct ScriptedServices {
        llm_calls: AtomicUsize,
        code_calls: AtomicUsize,
    }

    impl NodeServices for ScriptedServices {
        fn call_llm<'a>(&'a self, request: LlmRequest) -> BoxFuture<'a, Result<Value, ServiceError>> {
            Box::pin(async move {
                self.llm_calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!(format!("answer: {}", request.prompt)))
            })
        }

        fn send_http<'a>(&'a self, request: HttpRequest) -> BoxFuture<'a, Result<HttpResponse, ServiceError>> {
            Box::pin(async move { Err(ServiceError::Http(format!("offline: {}", request.url))) })
        }

        fn run_code<'a>(&'a self, request: CodeRequest) -> BoxFuture<'a, Result<Value, ServiceError>> {
            Box::pin(async move {
                let call = self.code_calls.fetch_add(1, Ordering::SeqCst) + 1;
                let mut words = request.code.split_whitespace();
                match (words.next(), words.next()) {
                    (Some("sleep"), Some(ms)) => {
                        let ms: u64 = ms.parse().unwrap();
                        tokio::time::sleep(Duration::from_millis(ms)).await;
                        Ok(json!("slept"))
                    }
                    (Some("fail"), _) => Err(ServiceError::Code("boom".into())),
                    (Some("flaky"), Some(n)) => {
                        if call <= n.parse().unwrap() {
                            Err(ServiceError::Code(format!("flaky call {call}")))
                        } else {
                            Ok(json!("recovered"))
                        }
                    }
                    (Some("panic"), _) => panic!("script asked to panic"),
                    (Some("echo"), Some(key)) => Ok(request.input.get(key).cloned().unwrap_or(Value::Null)),
                    _ => Ok(json!(request.code)),
                }
            })
        }
    }

    fn engine_with(services: Arc<ScriptedServices>, config: EngineConfig) -> WorkflowEngine {
        WorkflowEngine::new(config, services)
    }

    fn engine() -> (WorkflowEngine, Arc<ScriptedServices>) {
        let services = Arc::new(ScriptedServices::default());
        (engine_with(Arc::clone(&services), EngineConfig::default()), services)
    }

    fn inputs(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    async fn run(engine: &WorkflowEngine, yaml: &str, input: Value) -> WorkflowRunResult {
        let def = parse_workflow(yaml).unwrap();
        engine.run(&def, inputs(input), RunOptions::default()).await.unwrap()
    }

    fn status(result: &WorkflowRunResult, node: &str) -> NodeStatus {
        result.node_statuses[node]
    }

    // -----------------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn independent_nodes_run_concurrently() {
        let (engine, _) = engine();
        let started = Instant::now();
        let result = run(
            &engine,
            r#"
name: parallel
nodes:
  a: { type: code, config: { code: "sleep 200" } }
  b: { type: code, config: { code: "sleep 200" } }
  c: { type: code, config: { code: "sleep 200" } }
"#,
            json!({}),
        )
        .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert!(started.elapsed() < Duration::from_millis(550), "took {:?}", started.elapsed());
        assert_eq!(result.outputs.len(), 3);
    }

    #[tokio::test]
    async fn max_concurrency_serializes_nodes() {
        let services = Arc::new(ScriptedServices::default());
        let config = EngineConfig {
            max_concurrency: 1,
            ..EngineConfig::default()
        };
        let engine = engine_with(services, config);
        let started = Instant::now();
        let result = run(
            &engine,
            r#"
name: serial
nodes:
  a: { type: code, config: { code: "sleep 100" } }
  b: { type: code, config: { code: "sleep 100" } }
"#,
            json!({}),
        )
        .await;
        assert!(result.is_success());
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test]
    async fn dependencies_see_upstream_outputs() {
        let (engine, _) = engine();
        let result = run(
            &engine,
            r#"
name: chain
inputs:
  who: { type: string, required: true }
nodes:
  greet:
    type: transform
    config: { output: "hello {{ inputs.who }}" }
  shout:
    type: transform
    depends_on: [greet]
    context: { text: greet }
    config: { expression: "text|upper" }
outputs:
  result: shout
"#,
            json!({"who": "ada"}),
        )
        .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.outputs["result"], json!("HELLO ADA"));
    }

    #[tokio::test]
    async fn conditional_prunes_unselected_branch_transitively() {
        let (engine, _) = engine();
        let yaml = r#"
name: branch
inputs:
  score: { type: number, required: true }
nodes:
  gate:
    type: conditional
    config:
      conditions:
        - { condition: "inputs.score > 50", target: high }
      default: low
  high:
    type: transform
    depends_on: [gate]
    config: { output: "high" }
  low:
    type: transform
    depends_on: [gate]
    config: { output: "low" }
  after_low:
    type: transform
    depends_on: [low]
    config: { output: "after" }
  final:
    type: join
    depends_on: [high, low]
outputs:
  verdict: final
"#;
        let result = run(&engine, yaml, json!({"score": 80})).await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(status(&result, "high"), NodeStatus::Completed);
        assert_eq!(status(&result, "low"), NodeStatus::Skipped);
        assert_eq!(status(&result, "after_low"), NodeStatus::Skipped);
        assert_eq!(status(&result, "final"), NodeStatus::Completed);
        assert_eq!(result.outputs["verdict"], json!({"high": "high"}));

        let result = run(&engine, yaml, json!({"score": 10})).await;
        assert_eq!(status(&result, "high"), NodeStatus::Skipped);
        assert_eq!(status(&result, "after_low"), NodeStatus::Completed);
    }

    // -----------------------------------------------------------------------
    // Fan-out / fan-in
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn split_runs_dependents_per_item_and_aggregates() {
        let (engine, _) = engine();
        let result = run(
            &engine,
            r#"
name: fan
inputs:
  names: { type: array, required: true }
nodes:
  split:
    type: split
    config: { items: names, item_name: name }
  greet:
    type: transform
    depends_on: [split]
    context: { n: name }
    config: { output: "hi {{ n }}" }
  collect:
    type: aggregate
    depends_on: [greet]
outputs:
  greetings: collect
  per_item: greet
"#,
            json!({"names": ["a", "b", "c"]}),
        )
        .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.outputs["greetings"], json!(["hi a", "hi b", "hi c"]));
        assert_eq!(result.outputs["per_item"], json!(["hi a", "hi b", "hi c"]));
    }

    #[tokio::test]
    async fn unselected_branch_inside_fan_out_is_skipped() {
        let (engine, _) = engine();
        let result = run(
            &engine,
            r#"
name: branch_in_fan
inputs:
  xs: { type: array, required: true }
nodes:
  split:
    type: split
    config: { items: xs }
  gate:
    type: conditional
    config:
      conditions:
        - { condition: "false", target: a }
      default: b
  a:
    type: transform
    depends_on: [split, gate]
    config: { output: "ran {{ item }}" }
  b:
    type: transform
    depends_on: [gate]
    config: { output: "b" }
  after_a:
    type: transform
    depends_on: [a]
    config: { output: "after" }
"#,
            json!({"xs": [1, 2]}),
        )
        .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(status(&result, "a"), NodeStatus::Skipped);
        assert_eq!(status(&result, "after_a"), NodeStatus::Skipped);
        assert_eq!(status(&result, "b"), NodeStatus::Completed);
        assert!(!result.outputs.contains_key("a"));
    }

    #[tokio::test]
    async fn aggregate_behind_single_step_reads_its_dependency() {
        let (engine, _) = engine();
        let result = run(
            &engine,
            r#"
name: late_collect
inputs:
  xs: { type: array, required: true }
nodes:
  split:
    type: split
    config: { items: xs }
  fetch:
    type: transform
    depends_on: [split]
    config: { output: "f{{ item }}" }
  label:
    type: transform
    depends_on: [fetch]
    config: { output: "LABELLED" }
  collect:
    type: aggregate
    depends_on: [label]
"#,
            json!({"xs": [1, 2]}),
        )
        .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.outputs["fetch"], json!(["f1", "f2"]));
        assert_eq!(result.outputs["label"], json!("LABELLED"));
        assert_eq!(result.outputs["collect"], json!(["LABELLED"]));
    }

    #[tokio::test]
    async fn foreach_sequential_subgraph_with_two_steps() {
        let (engine, _) = engine();
        let result = run(
            &engine,
            r#"
name: loop
inputs:
  xs: { type: array, required: true }
nodes:
  each:
    type: foreach
    config: { items: xs, parallel: false, subgraph: [double, label] }
  double:
    type: transform
    depends_on: [each]
    config: { expression: "item * 2" }
  label:
    type: transform
    depends_on: [double]
    context: { d: double }
    config: { output: { value: "{{ d }}" } }
  gather:
    type: aggregate
    depends_on: [label]
    config: { source: each, field: value }
outputs:
  values: gather
"#,
            json!({"xs": [1, 2, 3]}),
        )
        .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.outputs["values"], json!([2.0, 4.0, 6.0]));
    }

    #[tokio::test]
    async fn foreach_item_failure_fails_member() {
        let (engine, _) = engine();
        let result = run(
            &engine,
            r#"
name: loop
inputs:
  xs: { type: array, required: true }
nodes:
  each:
    type: foreach
    config: { items: xs, subgraph: [work] }
  work:
    type: code
    depends_on: [each]
    config: { code: "fail" }
  gather:
    type: aggregate
    depends_on: [work]
outputs:
  all: gather
"#,
            json!({"xs": [1, 2]}),
        )
        .await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.errors["work"].starts_with("item 0:"), "{}", result.errors["work"]);
        assert_eq!(result.errors["gather"], "upstream node 'work' failed");
    }

    #[tokio::test]
    async fn split_over_non_array_fails() {
        let (engine, _) = engine();
        let result = run(
            &engine,
            r#"
name: bad
inputs:
  xs: { type: any }
nodes:
  split:
    type: split
    config: { items: xs }
  work:
    type: transform
    depends_on: [split]
    config: { output: "{{ item }}" }
"#,
            json!({"xs": "nope"}),
        )
        .await;
        assert_eq!(status(&result, "split"), NodeStatus::Failed);
        assert_eq!(status(&result, "work"), NodeStatus::Failed);
        assert_eq!(result.errors["work"], "upstream node 'split' failed");
    }

    // -----------------------------------------------------------------------
    // Failure handling
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn failure_propagates_but_siblings_continue() {
        let (engine, _) = engine();
        let yaml = r#"
name: fail
nodes:
  bad: { type: code, config: { code: "fail" } }
  downstream:
    type: transform
    depends_on: [bad]
    config: { output: "never" }
  sibling: { type: transform, config: { output: "ok" } }
outputs:
  ok: sibling
"#;
        let result = run(&engine, yaml, json!({})).await;
        assert!(result.is_success(), "only the sibling is required");
        assert_eq!(status(&result, "bad"), NodeStatus::Failed);
        assert_eq!(status(&result, "downstream"), NodeStatus::Failed);
        assert_eq!(result.errors["downstream"], "upstream node 'bad' failed");
        assert_eq!(result.outputs["ok"], json!("ok"));
        assert!(result.errors["bad"].contains("boom"));
    }

    #[tokio::test]
    async fn failed_output_node_fails_run() {
        let (engine, _) = engine();
        let result = run(
            &engine,
            r#"
name: fail
nodes:
  bad: { type: code, config: { code: "fail" } }
outputs:
  out: bad
"#,
            json!({}),
        )
        .await;
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.as_deref().unwrap().starts_with("node 'bad' failed"));
        assert!(result.outputs.is_empty());
    }

    #[tokio::test]
    async fn fallback_replaces_failure() {
        let (engine, _) = engine();
        let result = run(
            &engine,
            r#"
name: fallback
nodes:
  bad:
    type: code
    fallback: { items: [] }
    config: { code: "fail" }
  next:
    type: transform
    depends_on: [bad]
    context: { items: bad.items }
    config: { expression: "items|length" }
outputs:
  count: next
"#,
            json!({}),
        )
        .await;
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(status(&result, "bad"), NodeStatus::Completed);
        assert_eq!(result.outputs["count"], json!(0.0));
    }

    #[tokio::test]
    async fn retry_until_success() {
        let (engine, services) = engine();
        let def = parse_workflow(
            r#"
name: retry
nodes:
  flaky:
    type: code
    retry: { max_attempts: 3, delay_ms: 1 }
    config: { code: "flaky 2" }
"#,
        )
        .unwrap();
        let run_id = Uuid::now_v7();
        let result = engine
            .run(&def, Map::new(), RunOptions::default().with_run_id(run_id))
            .await
            .unwrap();
        assert!(result.is_success(), "{:?}", result.error);
        assert_eq!(result.outputs["flaky"], json!("recovered"));
        assert_eq!(services.code_calls.load(Ordering::SeqCst), 3);
        assert_eq!(engine.snapshot(run_id).unwrap().nodes["flaky"].attempts, 3);
    }

    #[tokio::test]
    async fn retry_exhaustion_fails() {
        let (engine, services) = engine();
        let result = run(
            &engine,
            r#"
name: retry
nodes:
  flaky:
    type: code
    retry: { max_attempts: 2, delay_ms: 1 }
    config: { code: "flaky 5" }
"#,
            json!({}),
        )
        .await;
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(services.code_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn strict_policy_aborts_run() {
        let (engine, _) = engine();
        let started = Instant::now();
        let result = run(
            &engine,
            r#"
name: strict
error_policy: strict
nodes:
  bad: { type: code, config: { code: "fail" } }
  slow: { type: code, config: { code: "sleep 3000" } }
  after:
    type: transform
    depends_on: [slow]
    config: { output: "x" }
"#,
            json!({}),
        )
        .await;
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.as_deref().unwrap().starts_with("node 'bad' failed"));
        assert_eq!(status(&result, "slow"), NodeStatus::Skipped);
        assert_eq!(status(&result, "after"), NodeStatus::Skipped);
    }

    #[tokio::test]
    async fn panicking_node_is_recorded_as_failure() {
        let (engine, _) = engine();
        let result = run(
            &engine,
            r#"
name: panic
nodes:
  boom: { type: code, config: { code: "panic" } }
  fine: { type: transform, config: { output: "ok" } }
"#,
            json!({}),
        )
        .await;
        assert_eq!(status(&result, "boom"), NodeStatus::Failed);
        assert!(result.errors["boom"].contains("node panicked"));
        assert_eq!(status(&result, "fine"), NodeStatus::Completed);
    }

    #[tokio::test]
    async fn node_timeout_fails_node() {
        let (engine, _) = engine();
        let result = run(
            &engine,
            r#"
name: slow
nodes:
  slow:
    type: code
    timeout_secs: 1
    config: { code: "sleep 3000" }
"#,
            json!({}),
        )
        .await;
        assert_eq!(result.errors["slow"], "node timed out after 1s");
    }

    // -----------------------------------------------------------------------
    // Time budget and cancellation
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn workflow_timeout_keeps_completed_outputs() {
        let (engine, _) = engine();
        let def = parse_workflow(
            r#"
name: budget
nodes:
  quick: { type: transform, config: { output: "done" } }
  slow: { type: code, config: { code: "sleep 5000" } }
  after:
    type: transform
    depends_on: [slow]
    config: { output: "x" }
"#,
        )
        .unwrap();
        let result = engine
            .run(&def, Map::new(), RunOptions::default().with_timeout(Duration::from_millis(200)))
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("workflow timed out"));
        assert_eq!(result.errors["slow"], "cancelled: workflow timed out");
        assert_eq!(status(&result, "after"), NodeStatus::Skipped);
        assert_eq!(status(&result, "quick"), NodeStatus::Completed);
        assert_eq!(result.outputs["quick"], json!("done"));
    }

    #[tokio::test]
    async fn cancel_stops_run() {
        let (engine, _) = engine();
        let def = parse_workflow(
            r#"
name: cancel
nodes:
  slow: { type: code, config: { code: "sleep 5000" } }
"#,
        )
        .unwrap();
        let run_id = Uuid::now_v7();
        let options = RunOptions::default().with_run_id(run_id);
        let (result, cancelled) = tokio::join!(engine.run(&def, Map::new(), options), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            assert_eq!(engine.active_runs(), vec![run_id]);
            engine.cancel(run_id)
        });
        cancelled.unwrap();
        let result = result.unwrap();
        assert_eq!(result.error.as_deref(), Some("workflow cancelled"));
        assert_eq!(result.errors["slow"], "cancelled: workflow cancelled");
        assert!(engine.active_runs().is_empty());
    }

    #[tokio::test]
    async fn cancel_unknown_run_errors() {
        let (engine, _) = engine();
        assert!(matches!(engine.cancel(Uuid::now_v7()), Err(EngineError::RunNotFound(_))));
    }

    // -----------------------------------------------------------------------
    // Inputs
    // -----------------------------------------------------------------------

    const TYPED: &str = r#"
name: typed
inputs:
  count: { type: integer, required: true }
  label: { type: string, default: "none" }
nodes:
  echo:
    type: transform
    config: { output: "{{ inputs.label }}" }
outputs:
  label: echo
"#;

    #[tokio::test]
    async fn missing_required_input_rejected() {
        let (engine, _) = engine();
        let def = parse_workflow(TYPED).unwrap();
        let err = engine.run(&def, Map::new(), RunOptions::default()).await.unwrap_err();
        assert_eq!(err.to_string(), "invalid inputs: missing required input 'count'");
    }

    #[tokio::test]
    async fn mistyped_input_rejected() {
        let (engine, _) = engine();
        let def = parse_workflow(TYPED).unwrap();
        let err = engine
            .run(&def, inputs(json!({"count": "three"})), RunOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "invalid inputs: input 'count' expected integer, got string");
    }

    #[tokio::test]
    async fn defaults_applied() {
        let (engine, _) = engine();
        let result = run(&engine, TYPED, json!({"count": 3})).await;
        assert_eq!(result.outputs["label"], json!("none"));
    }

    #[tokio::test]
    async fn env_is_exposed_to_templates() {
        let (engine, _) = engine();
        let def = parse_workflow(
            r#"
name: env
nodes:
  region:
    type: transform
    config: { output: "{{ env.REGION }}" }
"#,
        )
        .unwrap();
        let mut options = RunOptions::default();
        options.env.insert("REGION".into(), json!("eu-west"));
        let result = engine.run(&def, Map::new(), options).await.unwrap();
        assert_eq!(result.outputs["region"], json!("eu-west"));
    }

    // -----------------------------------------------------------------------
    // Cache, progress, events
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn cached_llm_node_not_called_twice() {
        let services = Arc::new(ScriptedServices::default());
        let cache = NodeCache::new(BoxCacheBackend::new(TestCache::default()), &CacheSettings::default());
        let engine = engine_with(Arc::clone(&services), EngineConfig::default()).with_cache(cache);
        let yaml = r#"
name: cached
inputs:
  topic: { type: string, required: true }
nodes:
  ask:
    type: llm
    config: { prompt: "tell me about {{ inputs.topic }}" }
outputs:
  answer: ask
"#;
        let first = run(&engine, yaml, json!({"topic": "rust"})).await;
        let second = run(&engine, yaml, json!({"topic": "rust"})).await;
        assert_eq!(first.outputs, second.outputs);
        assert_eq!(services.llm_calls.load(Ordering::SeqCst), 1);

        run(&engine, yaml, json!({"topic": "go"})).await;
        assert_eq!(services.llm_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn snapshot_reports_final_state() {
        let (engine, _) = engine();
        let def = parse_workflow(
            r#"
name: snap
nodes:
  a: { type: transform, config: { output: "x" } }
  b: { type: code, config: { code: "fail" } }
"#,
        )
        .unwrap();
        let run_id = Uuid::now_v7();
        engine
            .run(&def, Map::new(), RunOptions::default().with_run_id(run_id))
            .await
            .unwrap();
        let snap = engine.snapshot(run_id).unwrap();
        assert_eq!(snap.status, RunStatus::Failed);
        assert_eq!(snap.nodes["a"].status, NodeStatus::Completed);
        assert_eq!(snap.nodes["a"].output, Some(json!("x")));
        assert_eq!(snap.nodes["b"].status, NodeStatus::Failed);
        assert!(snap.started_at.is_some() && snap.completed_at.is_some());

        assert!(engine.remove_run(run_id).is_some());
        assert!(engine.snapshot(run_id).is_none());
    }

    #[tokio::test]
    async fn duplicate_run_id_rejected() {
        let (engine, _) = engine();
        let def = parse_workflow("name: one\nnodes:\n  a: { type: transform, config: { output: x } }\n").unwrap();
        let run_id = Uuid::now_v7();
        let options = RunOptions::default().with_run_id(run_id);
        engine.run(&def, Map::new(), options.clone()).await.unwrap();
        assert!(matches!(
            engine.run(&def, Map::new(), options).await,
            Err(EngineError::DuplicateRun(_))
        ));
    }

    #[tokio::test]
    async fn oldest_finished_runs_are_evicted() {
        let services = Arc::new(ScriptedServices::default());
        let config = EngineConfig {
            retained_runs: 2,
            ..EngineConfig::default()
        };
        let engine = engine_with(services, config);
        let def = parse_workflow("name: one\nnodes:\n  a: { type: transform, config: { output: x } }\n").unwrap();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let run_id = Uuid::now_v7();
            let options = RunOptions::default().with_run_id(run_id);
            engine.run(&def, Map::new(), options).await.unwrap();
            ids.push(run_id);
        }
        assert!(engine.snapshot(ids[0]).is_none());
        assert!(engine.snapshot(ids[1]).is_some());
        assert!(engine.snapshot(ids[2]).is_some());

        // An explicitly removed run frees its slot.
        engine.remove_run(ids[1]);
        let run_id = Uuid::now_v7();
        engine
            .run(&def, Map::new(), RunOptions::default().with_run_id(run_id))
            .await
            .unwrap();
        assert!(engine.snapshot(ids[2]).is_some());
        assert!(engine.snapshot(run_id).is_some());
    }

    #[tokio::test]
    async fn events_bracket_the_run() {
        let (engine, _) = engine();
        let mut rx = engine.events().subscribe();
        run(
            &engine,
            r#"
name: events
nodes:
  a: { type: transform, config: { output: "x" } }
  b:
    type: transform
    depends_on: [a]
    config: { output: "y" }
"#,
            json!({}),
        )
        .await;

        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        assert!(matches!(events.first(), Some(WorkflowEvent::RunStarted { node_count: 2, .. })));
        assert!(matches!(
            events.last(),
            Some(WorkflowEvent::RunFinished {
                status: RunStatus::Completed,
                ..
            })
        ));
        let completed: Vec<&str> = events
            .iter()
            .filter_map(|e| match e {
                WorkflowEvent::NodeCompleted { node, .. } => Some(node.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(completed, vec!["a", "b"]);
    }
}
