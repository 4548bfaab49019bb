/// Pipeline scheduler
///
/// Converts a pipeline definition into a petgraph DAG, wires one bounded row set
/// per hop and runs every transform on its own tokio task. The scheduler waits
/// for all transform tasks, merges their counters and collects their failures
/// into the pipeline result.

use crate::engine::Engine;
use crate::error::EngineError;
use crate::listener::LifecycleEvent;
use crate::pipeline::rowset::RowSet;
use crate::pipeline::transform::{
    CounterSnapshot, NodeReport, NodeState, PipelineShared, TransformHandle, TransformRuntime, TransformStatus, Wiring,
};
use crate::pipeline::types::{PipelineDefinition, TransformMeta};
use crate::result::{JobResult, RunOutcome};
use crate::row::ResultRow;
use crate::status::{ExecutionFlags, ExecutionStatus};
use crate::variables::Variables;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::{CancellationToken, DropGuard};

/// Options of a single pipeline run
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Stop request of the caller (a job), propagated to the pipeline
    pub parent_stop: Option<CancellationToken>,
    /// Rows of the previous job result, readable by `RowsFromResult`
    pub input_rows: Arc<Vec<ResultRow>>,
    /// Variables of the caller, inherited by the pipeline
    pub variables: Variables,
    /// Values for the parameters declared by the pipeline
    pub parameters: HashMap<String, String>,
}

/// A transform that ended with an error
#[derive(Debug, Clone, Serialize)]
pub struct NodeFailure {
    pub transform: String,
    pub message: String,
}

/// Final state of a pipeline run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineResult {
    pub pipeline: String,
    /// Counters summed over every transform
    pub totals: CounterSnapshot,
    /// Transforms that failed, in the order they reported
    pub failures: Vec<NodeFailure>,
    pub transforms: Vec<TransformStatus>,
    #[serde(serialize_with = "serialize_rows")]
    pub result_rows: Vec<ResultRow>,
    /// Stopped externally or by the caller, as opposed to by a failing transform
    pub stopped: bool,
    pub elapsed_ms: u64,
}

fn serialize_rows<S: Serializer>(rows: &[ResultRow], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(rows.iter().map(|row| row.to_json()))
}

impl PipelineResult {
    /// Result of a pipeline that never ran
    pub fn empty(pipeline: &str) -> Self {
        Self {
            pipeline: pipeline.to_string(),
            totals: CounterSnapshot::default(),
            failures: Vec::new(),
            transforms: Vec::new(),
            result_rows: Vec::new(),
            stopped: false,
            elapsed_ms: 0,
        }
    }

    /// True iff no transform failed and the pipeline was not stopped
    pub fn succeeded(&self) -> bool {
        self.failures.is_empty() && !self.stopped
    }

    /// Errors counted by all transforms, including rows routed to error hops
    pub fn nr_errors(&self) -> u64 {
        self.totals.errors
    }

    /// Counters of one transform
    pub fn transform(&self, name: &str) -> Option<&TransformStatus> {
        self.transforms.iter().find(|t| t.name == name)
    }

    /// Convert into the result a job entry hands to its successors.
    /// Rows routed over an error hop were handled and do not count as job errors.
    pub fn to_job_result(&self) -> JobResult {
        let mut result = JobResult {
            success: self.succeeded(),
            nr_errors: self.failures.len() as u64,
            lines_read: self.totals.lines_read,
            lines_written: self.totals.lines_written,
            lines_input: self.totals.lines_input,
            lines_output: self.totals.lines_output,
            lines_updated: self.totals.lines_updated,
            lines_rejected: self.totals.lines_rejected,
            stopped: self.stopped,
            ..JobResult::default()
        };
        result.set_rows(self.result_rows.clone());
        result.log_text = self
            .failures
            .iter()
            .map(|f| format!("{}: {}", f.transform, f.message))
            .collect::<Vec<_>>()
            .join("\n");
        result
    }
}

/// Internal representation of a pipeline as a petgraph DAG
struct PipelineGraph {
    /// Node weight: index into the definition's transforms. Edge weight: error hop.
    graph: DiGraph<usize, bool>,
}

/// A prepared pipeline, ready to run once
///
/// Wrap it in an `Arc` to stop, pause or inspect it from other tasks while
/// `run` is being awaited.
pub struct Pipeline {
    name: String,
    engine: Engine,
    flags: ExecutionFlags,
    stop: CancellationToken,
    /// Set by `stop()` and by a caller's stop request
    externally_stopped: AtomicBool,
    /// Set when a failing transform stopped the other ones
    error_stop: AtomicBool,
    disposed: AtomicBool,
    pause: watch::Sender<bool>,
    runtimes: tokio::sync::Mutex<Vec<TransformRuntime>>,
    handles: Vec<Arc<TransformHandle>>,
    rowsets: Vec<Arc<RowSet>>,
    shared: Arc<PipelineShared>,
    parent_stop: Option<CancellationToken>,
    last_result: Mutex<Option<PipelineResult>>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("transforms", &self.handles.len())
            .field("rowsets", &self.rowsets.len())
            .field("flags", &self.flags.snapshot())
            .finish()
    }
}

impl Pipeline {
    /// Validate the definition, create every transform and wire the row sets.
    /// Nothing runs yet.
    pub fn prepare(engine: &Engine, def: &PipelineDefinition, options: RunOptions) -> Result<Self, EngineError> {
        tracing::debug!(
            "📊 Preparing pipeline '{}' with {} transforms and {} hops",
            def.name,
            def.transforms.len(),
            def.hops.len()
        );
        let pipeline_graph = build_pipeline_graph(def)?;
        let graph = &pipeline_graph.graph;

        let stop = match &options.parent_stop {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let capacity = def.rowset_size.unwrap_or(engine.config().rowset_size).max(1);

        // One consumer signal per transform, shared by all of its inputs
        let mut wirings: Vec<Wiring> = def.transforms.iter().map(|_| Wiring::default()).collect();
        let mut rowsets = Vec::with_capacity(graph.edge_count());
        for edge in graph.edge_indices() {
            let Some((from, to)) = graph.edge_endpoints(edge) else {
                continue;
            };
            let (from, to) = (graph[from], graph[to]);
            let is_error = graph[edge];
            let rowset = Arc::new(RowSet::new(
                &def.transforms[from].name,
                &def.transforms[to].name,
                capacity,
                wirings[to].consumer_signal.clone(),
                stop.clone(),
            ));
            tracing::debug!("  🔗 Row set '{}' (capacity {}, error: {})", rowset.name(), capacity, is_error);
            if is_error {
                if wirings[from].error_output.is_some() {
                    return Err(EngineError::Configuration(format!(
                        "transform '{}' has more than one error hop",
                        def.transforms[from].name
                    )));
                }
                wirings[from].error_output = Some(rowset.clone());
            } else {
                wirings[from].outputs.push(rowset.clone());
            }
            wirings[to].inputs.push(rowset.clone());
            rowsets.push(rowset);
        }

        let variables = Variables::inherit(&options.variables, &def.parameters, &options.parameters);
        let shared = Arc::new(PipelineShared {
            pipeline: def.name.clone(),
            stop: stop.clone(),
            feedback_size: engine.config().feedback_size,
            previous_rows: options.input_rows.clone(),
            result_rows: Mutex::new(Vec::new()),
            variables,
        });

        let (pause, pause_rx) = watch::channel(false);
        let mut runtimes = Vec::with_capacity(def.transforms.len());
        for (meta, wiring) in def.transforms.iter().zip(wirings) {
            let meta = &TransformMeta {
                config: shared.variables.resolve_json(&meta.config),
                ..meta.clone()
            };
            let transform = engine.registry().create_transform(meta)?;
            if wiring.error_output.is_some() && !transform.supports_error_handling() {
                return Err(EngineError::Configuration(format!(
                    "transform '{}' of type '{}' does not support error handling",
                    meta.name, meta.transform_type
                )));
            }
            runtimes.push(TransformRuntime::new(meta, transform, wiring, shared.clone(), pause_rx.clone()));
        }
        let handles = runtimes.iter().map(|r| r.handle()).collect();

        tracing::debug!("✅ Pipeline '{}' prepared", def.name);
        Ok(Self {
            name: def.name.clone(),
            engine: engine.clone(),
            flags: ExecutionFlags::new(),
            stop,
            externally_stopped: AtomicBool::new(false),
            error_stop: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            pause,
            runtimes: tokio::sync::Mutex::new(runtimes),
            handles,
            rowsets,
            shared,
            parent_stop: options.parent_stop,
            last_result: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn flags(&self) -> &ExecutionFlags {
        &self.flags
    }

    /// Variables of this run, parameters included
    pub fn variables(&self) -> &Variables {
        &self.shared.variables
    }

    /// Initialize all transforms, run them to completion and collect the result
    pub async fn run(&self) -> RunOutcome<PipelineResult> {
        let started = Instant::now();
        let mut runtimes = std::mem::take(&mut *self.runtimes.lock().await);
        if runtimes.is_empty() && !self.handles.is_empty() {
            let err = EngineError::Configuration(format!("pipeline '{}' was already executed or disposed", self.name));
            return RunOutcome::failed(self.collect_result(Vec::new(), started), err);
        }

        tracing::info!("🚀 Starting pipeline '{}' ({} transforms)", self.name, runtimes.len());
        self.engine.listeners().emit(LifecycleEvent::PipelineStarted {
            pipeline: self.name.clone(),
        });

        for idx in 0..runtimes.len() {
            if let Err(e) = runtimes[idx].initialize().await {
                tracing::error!("❌ Pipeline '{}' failed to initialize: {}", self.name, e);
                for runtime in runtimes.iter_mut() {
                    runtime.dispose().await;
                }
                self.disposed.store(true, Ordering::SeqCst);
                self.flags.set_finished(true);
                let failure = NodeFailure {
                    transform: runtimes[idx].name().to_string(),
                    message: e.to_string(),
                };
                let result = self.collect_result(vec![failure], started);
                self.emit_finished(&result);
                return RunOutcome::failed(result, e);
            }
        }
        self.flags.set_initialized(true);
        self.flags.set_active(true);

        let monitor_token = CancellationToken::new();
        let monitor = self.spawn_monitor(monitor_token.clone());
        let mut guard = RunGuard {
            pipeline: self,
            tasks: JoinSet::new(),
            _monitor: monitor_token.drop_guard(),
        };
        let mut task_names = HashMap::new();
        for runtime in runtimes {
            let name = runtime.name().to_string();
            let handle = guard.tasks.spawn(runtime.run());
            task_names.insert(handle.id(), name);
        }

        let mut failures = Vec::new();
        while let Some(joined) = guard.tasks.join_next().await {
            let failure = match joined {
                Ok(report) => {
                    if let Some(handle) = self.handles.iter().find(|h| h.name() == report.name) {
                        self.engine.listeners().emit(LifecycleEvent::TransformFinished {
                            pipeline: self.name.clone(),
                            status: handle.status(),
                        });
                    }
                    report.failure.map(|message| NodeFailure {
                        transform: report.name,
                        message,
                    })
                }
                Err(e) => Some(NodeFailure {
                    transform: task_names.get(&e.id()).cloned().unwrap_or_else(|| "unknown".to_string()),
                    message: format!("transform task aborted: {}", e),
                }),
            };
            if let Some(failure) = failure {
                failures.push(failure);
                self.stop_on_error();
            }
        }

        drop(guard);
        if let Err(e) = monitor.await {
            tracing::warn!("⚠️ Progress monitor of '{}' ended abnormally: {}", self.name, e);
        }
        self.disposed.store(true, Ordering::SeqCst);

        let result = self.collect_result(failures, started);
        self.flags.set_active(false);
        if self.stop.is_cancelled() {
            self.flags.set_stopped(true);
        }
        self.flags.set_finished(true);
        self.emit_finished(&result);
        *self.last_result.lock().unwrap_or_else(PoisonError::into_inner) = Some(result.clone());

        match result.failures.first() {
            None => {
                tracing::info!(
                    "🎉 Pipeline '{}' {} in {}ms: W={} E={}",
                    self.name,
                    if result.stopped { "stopped" } else { "finished" },
                    result.elapsed_ms,
                    result.totals.lines_written,
                    result.totals.errors
                );
                RunOutcome::ok(result)
            }
            Some(first) => {
                let err = EngineError::PipelineFailed {
                    pipeline: self.name.clone(),
                    count: result.failures.len(),
                    first: format!("{}: {}", first.transform, first.message),
                };
                tracing::error!("❌ {}", err);
                RunOutcome::failed(result, err)
            }
        }
    }

    /// Request every transform to stop. Idempotent, callable from any task.
    pub fn stop(&self) {
        self.externally_stopped.store(true, Ordering::SeqCst);
        if self.flags.mark_stopped() {
            tracing::info!("🛑 Stopping pipeline '{}'", self.name);
        }
        self.stop.cancel();
    }

    /// A transform failed: stop all the others
    fn stop_on_error(&self) {
        if !self.error_stop.swap(true, Ordering::SeqCst) {
            tracing::warn!("⚠️ Pipeline '{}' stops all transforms after a failure", self.name);
            self.flags.set_stopped(true);
            self.stop.cancel();
        }
    }

    /// Park every transform at its next loop boundary
    pub fn pause(&self) {
        self.flags.set_paused(true);
        self.pause.send_replace(true);
        tracing::info!("⏸️ Pipeline '{}' paused", self.name);
    }

    pub fn resume(&self) {
        self.flags.set_paused(false);
        self.pause.send_replace(false);
        tracing::info!("▶️ Pipeline '{}' resumed", self.name);
    }

    /// Poll until the pipeline finished. Returns false when the timeout elapsed first.
    pub async fn wait_until_finished(&self, timeout: Option<Duration>) -> bool {
        let poll = self.engine.config().wait_poll();
        let deadline = timeout.map(|t| Instant::now() + t);
        while !self.flags.is_finished() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return false;
            }
            tokio::time::sleep(poll).await;
        }
        true
    }

    /// Dispose transforms that never ran and close every row set. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut runtimes = std::mem::take(&mut *self.runtimes.lock().await);
        for runtime in runtimes.iter_mut() {
            runtime.dispose().await;
        }
        for rowset in &self.rowsets {
            rowset.mark_done();
        }
        tracing::debug!("🧹 Pipeline '{}' disposed", self.name);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn transform_statuses(&self) -> Vec<TransformStatus> {
        self.handles.iter().map(|h| h.status()).collect()
    }

    /// Errors counted so far across all transforms
    pub fn nr_errors(&self) -> u64 {
        self.handles.iter().map(|h| h.counters().errors).sum()
    }

    pub fn status(&self) -> ExecutionStatus {
        self.flags.status(self.nr_errors())
    }

    /// Result of the completed run, if any
    pub fn result(&self) -> Option<PipelineResult> {
        self.last_result.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn was_stopped(&self) -> bool {
        let parent = self.parent_stop.as_ref().is_some_and(|p| p.is_cancelled());
        self.externally_stopped.load(Ordering::SeqCst)
            || parent
            || (self.stop.is_cancelled() && !self.error_stop.load(Ordering::SeqCst))
    }

    fn collect_result(&self, failures: Vec<NodeFailure>, started: Instant) -> PipelineResult {
        let transforms = self.transform_statuses();
        let mut totals = CounterSnapshot::default();
        for status in &transforms {
            totals.add(&status.counters);
        }
        let result_rows = std::mem::take(&mut *self.shared.result_rows.lock().unwrap_or_else(PoisonError::into_inner));
        PipelineResult {
            pipeline: self.name.clone(),
            totals,
            failures,
            transforms,
            result_rows,
            stopped: self.was_stopped(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    fn emit_finished(&self, result: &PipelineResult) {
        self.engine.listeners().emit(LifecycleEvent::PipelineFinished {
            pipeline: self.name.clone(),
            nr_errors: result.nr_errors(),
            stopped: result.stopped,
        });
    }

    /// Periodic progress reporting, off the row hot path
    fn spawn_monitor(&self, token: CancellationToken) -> tokio::task::JoinHandle<()> {
        let handles = self.handles.clone();
        let listeners = self.engine.listeners().clone();
        let pipeline = self.name.clone();
        let interval = self.engine.config().feedback_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let transforms: Vec<TransformStatus> = handles.iter().map(|h| h.status()).collect();
                        let running = transforms
                            .iter()
                            .filter(|t| matches!(t.state, NodeState::Running | NodeState::Paused))
                            .count();
                        let written: u64 = transforms.iter().map(|t| t.counters.lines_written).sum();
                        tracing::info!(
                            "📈 Pipeline '{}': {} of {} transforms running, {} rows written",
                            pipeline,
                            running,
                            transforms.len(),
                            written
                        );
                        listeners.emit(LifecycleEvent::Progress {
                            pipeline: pipeline.clone(),
                            transforms,
                        });
                    }
                }
            }
        })
    }
}

/// Owns the transform tasks while `Pipeline::run` awaits them
///
/// Dropping it stops the progress monitor. If `run` itself is dropped before every
/// task was joined, the remaining transforms are stopped and left to finish on
/// their own, which marks their outputs done and disposes them.
struct RunGuard<'a> {
    pipeline: &'a Pipeline,
    tasks: JoinSet<NodeReport>,
    _monitor: DropGuard,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.tasks.is_empty() {
            return;
        }
        let pipeline = self.pipeline;
        tracing::warn!(
            "⚠️ Pipeline '{}' abandoned with {} transforms still running, stopping them",
            pipeline.name,
            self.tasks.len()
        );
        pipeline.externally_stopped.store(true, Ordering::SeqCst);
        pipeline.flags.set_stopped(true);
        pipeline.stop.cancel();
        self.tasks.detach_all();
        pipeline.flags.set_active(false);
        pipeline.flags.set_finished(true);
    }
}

/// Build a petgraph DAG from the pipeline definition
///
/// Rejects duplicate transform names, hops to unknown transforms and cycles.
fn build_pipeline_graph(def: &PipelineDefinition) -> Result<PipelineGraph, EngineError> {
    let mut graph = DiGraph::new();
    let mut name_to_index: HashMap<&str, NodeIndex> = HashMap::new();

    for (idx, transform) in def.transforms.iter().enumerate() {
        let node = graph.add_node(idx);
        if name_to_index.insert(transform.name.as_str(), node).is_some() {
            return Err(EngineError::Configuration(format!(
                "pipeline '{}' declares transform '{}' twice",
                def.name, transform.name
            )));
        }
    }

    for hop in def.hops.iter().filter(|h| h.enabled) {
        let lookup = |name: &str| {
            name_to_index.get(name).copied().ok_or_else(|| {
                EngineError::Graph(format!(
                    "hop '{}' -> '{}' references unknown transform '{}'",
                    hop.from, hop.to, name
                ))
            })
        };
        let from = lookup(hop.from.as_str())?;
        let to = lookup(hop.to.as_str())?;
        graph.add_edge(from, to, hop.error);
    }

    if let Err(cycle) = toposort(&graph, None) {
        let at: &TransformMeta = &def.transforms[graph[cycle.node_id()]];
        tracing::error!("❌ Pipeline '{}' contains a cycle", def.name);
        return Err(EngineError::Graph(format!(
            "pipeline '{}' contains a cycle through '{}'",
            def.name, at.name
        )));
    }

    Ok(PipelineGraph { graph })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grid() -> serde_json::Value {
        json!({ "fields": [ { "name": "n", "type": "integer" } ], "rows": [[1], [2]] })
    }

    fn prepare(def: &PipelineDefinition) -> Result<Pipeline, EngineError> {
        Pipeline::prepare(&Engine::with_builtins(), def, RunOptions::default())
    }

    #[test]
    fn unknown_transform_reference_is_graph_error() {
        let def = PipelineDefinition::new("p")
            .transform("grid", "DataGrid", grid())
            .hop("grid", "nowhere");
        assert!(matches!(prepare(&def), Err(EngineError::Graph(_))));
    }

    #[test]
    fn cycle_is_graph_error() {
        let def = PipelineDefinition::new("p")
            .transform("a", "Dummy", json!({}))
            .transform("b", "Dummy", json!({}))
            .hop("a", "b")
            .hop("b", "a");
        let err = prepare(&def).unwrap_err();
        assert!(matches!(err, EngineError::Graph(ref msg) if msg.contains("cycle")));
    }

    #[test]
    fn disabled_hops_are_ignored() {
        let mut def = PipelineDefinition::new("p")
            .transform("a", "Dummy", json!({}))
            .transform("b", "Dummy", json!({}))
            .hop("a", "b")
            .hop("b", "a");
        def.hops[1].enabled = false;
        assert!(prepare(&def).is_ok());
    }

    #[test]
    fn duplicate_names_and_unknown_types_are_configuration_errors() {
        let def = PipelineDefinition::new("p")
            .transform("a", "Dummy", json!({}))
            .transform("a", "Dummy", json!({}));
        assert!(matches!(prepare(&def), Err(EngineError::Configuration(_))));

        let def = PipelineDefinition::new("p").transform("a", "NoSuchPlugin", json!({}));
        assert!(matches!(prepare(&def), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn error_hop_requires_error_handling_support() {
        let def = PipelineDefinition::new("p")
            .transform("a", "Dummy", json!({}))
            .transform("b", "Dummy", json!({}))
            .error_hop("a", "b");
        let err = prepare(&def).unwrap_err();
        assert!(matches!(err, EngineError::Configuration(ref msg) if msg.contains("error handling")));
    }

    #[tokio::test]
    async fn dispose_before_run_is_idempotent_and_blocks_run() {
        let def = PipelineDefinition::new("p")
            .transform("grid", "DataGrid", grid())
            .transform("out", "Dummy", json!({}))
            .hop("grid", "out");
        let pipeline = prepare(&def).unwrap();
        pipeline.dispose().await;
        pipeline.dispose().await;
        assert!(pipeline.is_disposed());
        assert!(pipeline.transform_statuses().iter().all(|t| t.disposed && t.state == NodeState::Disposed));

        let outcome = pipeline.run().await;
        assert!(matches!(outcome.error, Some(EngineError::Configuration(_))));
    }
}
