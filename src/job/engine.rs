/// Job entry graph executor
///
/// Walks the control-flow graph of a job from its start entry. Each entry is
/// executed with a copy of the incoming result; the hops that fire decide which
/// entries run next. Successors of a parallel entry run on their own tasks and are
/// always joined before the spawning entry returns.

use crate::engine::Engine;
use crate::error::{panic_message, EngineError};
use crate::job::entry::{EntryContext, JobEntry};
use crate::job::tracker::{JobTracker, TrackerEntry, TrackerEventKind};
use crate::job::types::{HopCondition, JobDefinition, JobEntryMeta, START_ENTRY_TYPE};
use crate::listener::LifecycleEvent;
use crate::result::{JobResult, RunOutcome};
use crate::status::{ExecutionFlags, ExecutionStatus};
use crate::variables::Variables;
use futures::FutureExt;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// A branch that ended with an error, together with what it completed
#[derive(Debug)]
struct BranchFailure {
    error: EngineError,
    partial: JobResult,
}

/// Entry configuration keys holding inline pipeline or job definitions
const NESTED_DEFINITION_KEYS: [&str; 2] = ["pipeline", "job"];

type BranchFuture = Pin<Box<dyn Future<Output = Result<JobResult, BranchFailure>> + Send + 'static>>;

/// Internal representation of a job as a petgraph graph. Cycles are allowed.
struct JobGraph {
    /// Node weight: index into the definition's entries. Edge weight: hop condition.
    graph: DiGraph<usize, HopCondition>,
    nodes: Vec<NodeIndex>,
}

impl JobGraph {
    /// Outgoing hops of an entry in declaration order
    fn next_hops(&self, entry: usize) -> Vec<(usize, HopCondition)> {
        let mut edges: Vec<_> = self.graph.edges(self.nodes[entry]).collect();
        edges.sort_by_key(|edge| edge.id());
        edges
            .into_iter()
            .map(|edge| (self.graph[edge.target()], *edge.weight()))
            .collect()
    }
}

/// Shared state of one job run
struct JobRun {
    name: String,
    engine: Engine,
    def: JobDefinition,
    graph: JobGraph,
    start: usize,
    flags: ExecutionFlags,
    stop: CancellationToken,
    parent_stop: Option<CancellationToken>,
    /// Errors of every executed entry, sequential and parallel
    errors: AtomicU64,
    /// Branch invocation counter
    entry_nr: AtomicU64,
    started: AtomicBool,
    variables: Arc<Variables>,
    tracker: JobTracker,
    result: Mutex<Option<JobResult>>,
}

/// A prepared job
///
/// Cheap to clone; clones share the same run, so one clone can `stop()` while
/// another awaits `run()`.
#[derive(Clone)]
pub struct Job {
    run: Arc<JobRun>,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("name", &self.run.name)
            .field("entries", &self.run.def.entries.len())
            .field("flags", &self.run.flags.snapshot())
            .finish()
    }
}

impl Job {
    /// Validate the job graph and locate the start entry. Nothing runs yet.
    pub fn prepare(
        engine: &Engine,
        def: &JobDefinition,
        parent_stop: Option<CancellationToken>,
    ) -> Result<Self, EngineError> {
        Self::prepare_nested(engine, def, parent_stop, &Variables::new(), &HashMap::new())
    }

    /// Prepare a job called from another run: it inherits `parent` variables and
    /// receives `parameters` for the parameters it declares
    pub fn prepare_nested(
        engine: &Engine,
        def: &JobDefinition,
        parent_stop: Option<CancellationToken>,
        parent: &Variables,
        parameters: &HashMap<String, String>,
    ) -> Result<Self, EngineError> {
        tracing::debug!(
            "📊 Preparing job '{}' with {} entries and {} hops",
            def.name,
            def.entries.len(),
            def.hops.len()
        );
        let graph = build_job_graph(def)?;
        let start = find_start(def)?;

        for meta in &def.entries {
            if !engine.registry().has_entry_type(&meta.entry_type) {
                return Err(EngineError::Configuration(format!(
                    "job entry '{}' has unknown type '{}'",
                    meta.name, meta.entry_type
                )));
            }
        }

        let stop = match &parent_stop {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };

        Ok(Self {
            run: Arc::new(JobRun {
                name: def.name.clone(),
                engine: engine.clone(),
                def: def.clone(),
                graph,
                start,
                flags: ExecutionFlags::new(),
                stop,
                parent_stop,
                errors: AtomicU64::new(0),
                entry_nr: AtomicU64::new(0),
                started: AtomicBool::new(false),
                variables: Arc::new(Variables::inherit(parent, &def.parameters, parameters)),
                tracker: JobTracker::new(&def.name, engine.config().max_job_entries_logged),
                result: Mutex::new(None),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.run.name
    }

    /// Variables of this run, parameters included
    pub fn variables(&self) -> &Variables {
        &self.run.variables
    }

    /// Execute the job from its start entry, repeating while the start entry asks
    /// for it and the job is not stopped
    pub async fn run(&self, initial: JobResult) -> RunOutcome<JobResult> {
        let run = &self.run;
        if run.started.swap(true, Ordering::SeqCst) {
            let err = EngineError::Configuration(format!("job '{}' was already executed", run.name));
            return RunOutcome::failed(initial, err);
        }

        let started = Instant::now();
        run.flags.set_initialized(true);
        run.flags.set_active(true);
        tracing::info!("🚀 Starting job '{}'", run.name);
        run.tracker.add(TrackerEntry {
            kind: TrackerEventKind::JobStarted,
            entry_name: &run.name,
            entry_nr: 0,
            comment: "start of job execution",
            reason: "start",
            outcome: None,
        });
        run.engine.listeners().emit(LifecycleEvent::JobStarted { job: run.name.clone() });

        let start_meta = &run.def.entries[run.start];
        let (mut result, error) = match run.create_entry(start_meta) {
            Ok(start_entry) => self.run_iterations(start_entry.repeat(), initial).await,
            Err(e) => {
                run.errors.fetch_add(1, Ordering::SeqCst);
                (initial, Some(e))
            }
        };

        let stopped = run.is_stopped();
        let nr_errors = run.errors.load(Ordering::SeqCst);
        result.nr_errors = nr_errors;
        result.success = nr_errors == 0 && !stopped;
        result.stopped = stopped;

        let (comment, reason) = match &error {
            None => ("end of job execution", "finished"),
            Some(_) => ("job execution ended", "emergency"),
        };
        run.tracker.add(TrackerEntry {
            kind: TrackerEventKind::JobFinished,
            entry_name: &run.name,
            entry_nr: 0,
            comment,
            reason,
            outcome: Some((result.success, nr_errors)),
        });

        *run.result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());
        run.flags.set_active(false);
        run.flags.set_finished(true);
        run.engine.listeners().emit(LifecycleEvent::JobFinished {
            job: run.name.clone(),
            success: result.success,
            nr_errors,
            stopped,
        });

        match error {
            None => {
                tracing::info!(
                    "🎉 Job '{}' {} in {:?} with {} error(s)",
                    run.name,
                    if stopped { "stopped" } else { "finished" },
                    started.elapsed(),
                    nr_errors
                );
                RunOutcome::ok(result)
            }
            Some(e) => {
                tracing::error!("❌ Job '{}' failed: {}", run.name, e);
                RunOutcome::failed(result, e)
            }
        }
    }

    async fn run_iterations(&self, repeat: Option<Duration>, initial: JobResult) -> (JobResult, Option<EngineError>) {
        let run = &self.run;
        let mut previous = initial;
        let mut first = true;
        while (first || repeat.is_some()) && !run.is_stopped() {
            if let (false, Some(interval)) = (first, repeat) {
                tokio::select! {
                    _ = run.stop.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
            first = false;
            let nr = run.next_entry_nr();
            match run.clone().execute(nr, previous.clone(), run.start, "start".to_string()).await {
                Ok(result) => previous = result,
                Err(failure) => return (failure.partial, Some(failure.error)),
            }
        }
        (previous, None)
    }

    /// Request the job to stop. Idempotent, callable from any task. Running
    /// entries observe it through their context; no new entry starts afterwards.
    pub fn stop(&self) {
        if self.run.flags.mark_stopped() {
            tracing::info!("🛑 Stopping job '{}'", self.run.name);
        }
        self.run.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.run.is_stopped()
    }

    /// Poll until the job finished. Returns false when the timeout elapsed first.
    pub async fn wait_until_finished(&self, timeout: Option<Duration>) -> bool {
        let poll = self.run.engine.config().wait_poll();
        let deadline = timeout.map(|t| Instant::now() + t);
        while !self.run.flags.is_finished() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
        true
    }

    pub fn tracker(&self) -> &JobTracker {
        &self.run.tracker
    }

    pub fn flags(&self) -> &ExecutionFlags {
        &self.run.flags
    }

    pub fn nr_errors(&self) -> u64 {
        self.run.errors.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ExecutionStatus {
        self.run.flags.status(self.nr_errors())
    }

    /// Final result, once the job finished
    pub fn result(&self) -> Option<JobResult> {
        self.run.result.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl JobRun {
    fn is_stopped(&self) -> bool {
        if self.parent_stop.as_ref().is_some_and(|p| p.is_cancelled()) {
            self.flags.set_stopped(true);
        }
        self.flags.is_stopped() || self.stop.is_cancelled()
    }

    /// Create the entry logic with variables resolved in its configuration.
    /// Nested definitions are left alone: the nested run resolves them itself.
    fn create_entry(&self, meta: &JobEntryMeta) -> Result<Box<dyn JobEntry>, EngineError> {
        let mut resolved = meta.clone();
        if let serde_json::Value::Object(config) = &mut resolved.config {
            for (key, value) in config.iter_mut() {
                if !NESTED_DEFINITION_KEYS.contains(&key.as_str()) {
                    *value = self.variables.resolve_json(value);
                }
            }
        }
        self.engine.registry().create_entry(&resolved)
    }

    fn next_entry_nr(&self) -> u64 {
        self.entry_nr.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn execute(self: Arc<Self>, nr: u64, previous: JobResult, entry: usize, reason: String) -> BranchFuture {
        Box::pin(async move { self.execute_entry(nr, previous, entry, reason).await })
    }

    /// Run one entry, then the entries its firing hops lead to
    async fn execute_entry(
        self: Arc<Self>,
        nr: u64,
        mut previous: JobResult,
        entry: usize,
        reason: String,
    ) -> Result<JobResult, BranchFailure> {
        if self.is_stopped() {
            return Ok(JobResult::stopped(nr));
        }
        let meta: &JobEntryMeta = &self.def.entries[entry];
        if meta.reset_errors {
            previous.nr_errors = 0;
        }

        let logic = match self.create_entry(meta) {
            Ok(logic) => logic,
            Err(error) => return Err(self.entry_failed(meta, nr, previous, &reason, error)),
        };
        let evaluates = meta.evaluates.unwrap_or_else(|| logic.evaluates());

        self.tracker.add(TrackerEntry {
            kind: TrackerEventKind::EntryStarted,
            entry_name: &meta.name,
            entry_nr: nr,
            comment: "start of job entry",
            reason: &reason,
            outcome: None,
        });
        self.engine.listeners().emit(LifecycleEvent::EntryStarted {
            job: self.name.clone(),
            entry: meta.name.clone(),
            entry_nr: nr,
        });
        tracing::info!("➡️ Job '{}': starting entry [{}] ({})", self.name, meta.name, reason);

        let ctx = EntryContext {
            engine: self.engine.clone(),
            job_name: self.name.clone(),
            entry_name: meta.name.clone(),
            entry_nr: nr,
            stop: self.stop.clone(),
            variables: Arc::clone(&self.variables),
        };
        let executed = AssertUnwindSafe(logic.execute(previous.clone(), &ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|payload| {
                Err(anyhow::anyhow!("entry panicked: {}", panic_message(payload.as_ref())))
            });
        let mut new_result = match executed {
            Ok(result) => result,
            Err(cause) => {
                let error = EngineError::node(&meta.name, cause);
                return Err(self.entry_failed(meta, nr, previous, &reason, error));
            }
        };
        new_result.entry_nr = nr;
        self.errors.fetch_add(new_result.nr_errors, Ordering::SeqCst);

        self.tracker.add(TrackerEntry {
            kind: TrackerEventKind::EntryFinished,
            entry_name: &meta.name,
            entry_nr: nr,
            comment: "job entry ended",
            reason: &reason,
            outcome: Some((new_result.success, new_result.nr_errors)),
        });
        self.engine.listeners().emit(LifecycleEvent::EntryFinished {
            job: self.name.clone(),
            entry: meta.name.clone(),
            entry_nr: nr,
            success: new_result.success,
            nr_errors: new_result.nr_errors,
        });
        tracing::info!(
            "✅ Job '{}': finished entry [{}] (result={}, errors={})",
            self.name,
            meta.name,
            new_result.success,
            new_result.nr_errors
        );

        let firing: Vec<(usize, HopCondition)> = self
            .graph
            .next_hops(entry)
            .into_iter()
            .filter(|(_, condition)| condition.fires(evaluates, new_result.success))
            .collect();
        if firing.is_empty() {
            return Ok(new_result);
        }

        if meta.parallel {
            return self.execute_parallel(meta, nr, new_result, firing).await;
        }

        let mut last = None;
        for (target, condition) in firing {
            if self.is_stopped() {
                break;
            }
            let branch_nr = self.next_entry_nr();
            let result = self
                .clone()
                .execute(branch_nr, new_result.clone(), target, condition.reason().to_string())
                .await?;
            last = Some(result);
        }
        Ok(last.unwrap_or(new_result))
    }

    /// Launch one task per firing hop and join them all
    ///
    /// Branch results are merged in launch order. When branches fail, the one that
    /// failed first in time is returned as the branch error and the others are logged.
    async fn execute_parallel(
        self: &Arc<Self>,
        meta: &JobEntryMeta,
        nr: u64,
        new_result: JobResult,
        firing: Vec<(usize, HopCondition)>,
    ) -> Result<JobResult, BranchFailure> {
        let mut branches = JoinSet::new();
        let mut launched: HashMap<tokio::task::Id, (usize, String)> = HashMap::new();
        for (order, (target, condition)) in firing.into_iter().enumerate() {
            if self.is_stopped() {
                break;
            }
            let branch_nr = self.next_entry_nr();
            let future = self
                .clone()
                .execute(branch_nr, new_result.clone(), target, condition.reason().to_string());
            let handle = branches.spawn(async move { (order, future.await) });
            let target_name = self.def.entries[target].name.clone();
            tracing::info!("🔀 Job '{}': launched entry [{}] in parallel", self.name, target_name);
            launched.insert(handle.id(), (order, target_name));
        }

        // Collected in completion order; the first failure to complete is propagated
        let mut outcomes: Vec<(usize, String, Result<JobResult, BranchFailure>)> = Vec::new();
        let mut first_failed: Option<usize> = None;
        while let Some(joined) = branches.join_next().await {
            let (order, name, outcome) = match joined {
                Ok((order, outcome)) => {
                    let name = launched
                        .values()
                        .find(|(o, _)| *o == order)
                        .map(|(_, name)| name.clone())
                        .unwrap_or_default();
                    (order, name, outcome)
                }
                Err(e) => {
                    let (order, name) = launched.get(&e.id()).cloned().unwrap_or((usize::MAX, String::new()));
                    self.errors.fetch_add(1, Ordering::SeqCst);
                    let error = EngineError::node(&name, anyhow::anyhow!("branch task aborted: {}", e));
                    let partial = JobResult {
                        entry_nr: nr,
                        nr_errors: 1,
                        ..JobResult::default()
                    };
                    (order, name, Err(BranchFailure { error, partial }))
                }
            };
            if outcome.is_err() && first_failed.is_none() {
                first_failed = Some(outcomes.len());
            }
            outcomes.push((order, name, outcome));
        }
        let first_failed = first_failed.and_then(|completed| outcomes.get(completed).map(|(order, _, _)| *order));
        outcomes.sort_by_key(|(order, _, _)| *order);

        // Branches start from a copy of `new_result`; only what each adds is merged
        let mut merged = new_result.clone();
        merged.entry_nr = nr;
        let mut first_failure: Option<(String, EngineError)> = None;
        for (order, name, outcome) in outcomes {
            match outcome {
                Ok(result) => merged.merge_branch(&new_result, &result),
                Err(failure) => {
                    merged.merge_branch(&new_result, &failure.partial);
                    if first_failure.is_none() && Some(order) == first_failed {
                        first_failure = Some((name, failure.error));
                    } else {
                        tracing::error!(
                            "❌ Job '{}': parallel branch [{}] of [{}] also failed: {}",
                            self.name,
                            name,
                            meta.name,
                            failure.error
                        );
                    }
                }
            }
        }
        if merged.nr_errors > 0 {
            merged.success = false;
        }

        match first_failure {
            None => Ok(merged),
            Some((entry, error)) => {
                merged.success = false;
                Err(BranchFailure {
                    error: EngineError::ParallelBranch {
                        entry,
                        source: Box::new(error),
                    },
                    partial: merged,
                })
            }
        }
    }

    /// Record a failed entry: one error, a finished tracker record, a failure
    fn entry_failed(
        &self,
        meta: &JobEntryMeta,
        nr: u64,
        previous: JobResult,
        reason: &str,
        error: EngineError,
    ) -> BranchFailure {
        self.errors.fetch_add(1, Ordering::SeqCst);
        tracing::error!("❌ Job '{}': entry [{}] failed: {}", self.name, meta.name, error);
        self.tracker.add(TrackerEntry {
            kind: TrackerEventKind::EntryFinished,
            entry_name: &meta.name,
            entry_nr: nr,
            comment: "job entry failed",
            reason,
            outcome: Some((false, 1)),
        });
        self.engine.listeners().emit(LifecycleEvent::EntryFinished {
            job: self.name.clone(),
            entry: meta.name.clone(),
            entry_nr: nr,
            success: false,
            nr_errors: 1,
        });
        let mut partial = previous;
        partial.entry_nr = nr;
        partial.nr_errors = 1;
        partial.success = false;
        BranchFailure { error, partial }
    }
}

/// Build the job graph, rejecting duplicate entry names and hops to unknown entries
fn build_job_graph(def: &JobDefinition) -> Result<JobGraph, EngineError> {
    let mut graph = DiGraph::new();
    let mut name_to_index: HashMap<&str, NodeIndex> = HashMap::new();
    let mut nodes = Vec::with_capacity(def.entries.len());

    for (idx, entry) in def.entries.iter().enumerate() {
        let node = graph.add_node(idx);
        if name_to_index.insert(entry.name.as_str(), node).is_some() {
            return Err(EngineError::Configuration(format!(
                "job '{}' declares entry '{}' twice",
                def.name, entry.name
            )));
        }
        nodes.push(node);
    }

    for hop in def.hops.iter().filter(|h| h.enabled) {
        let lookup = |name: &str| {
            name_to_index.get(name).copied().ok_or_else(|| {
                EngineError::Graph(format!(
                    "hop '{}' -> '{}' references unknown entry '{}'",
                    hop.from, hop.to, name
                ))
            })
        };
        let from = lookup(hop.from.as_str())?;
        let to = lookup(hop.to.as_str())?;
        graph.add_edge(from, to, hop.condition);
    }

    Ok(JobGraph { graph, nodes })
}

/// The explicitly named start entry, or the first entry of type `START`
fn find_start(def: &JobDefinition) -> Result<usize, EngineError> {
    match &def.start {
        Some(name) => def.entries.iter().position(|e| &e.name == name).ok_or_else(|| {
            EngineError::Configuration(format!("start entry '{}' of job '{}' not found", name, def.name))
        }),
        None => def
            .entries
            .iter()
            .position(|e| e.entry_type == START_ENTRY_TYPE)
            .ok_or_else(|| EngineError::Configuration(format!("job '{}' has no start entry", def.name))),
    }
}
