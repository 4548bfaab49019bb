/// Transform runtime
///
/// Hosts one transform for the duration of a pipeline run: pulls rows from the
/// input row sets, invokes the transform logic one unit at a time, pushes rows to
/// the output row sets and keeps line counters. The loop checks the stop request
/// every iteration; blocking row set calls wake up on it as well.

use crate::error::{panic_message, ChannelError, EngineError};
use crate::pipeline::rowset::{Fetch, RowSet};
use crate::pipeline::types::TransformMeta;
use crate::row::{Field, ResultRow, Row, RowSchema, Value, ValueType};
use crate::variables::Variables;
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use thiserror::Error;
use tokio::sync::{watch, Notify};
use tokio_util::sync::CancellationToken;

/// Field names appended to rows sent over an error hop
pub const ERROR_COUNT_FIELD: &str = "error_count";
pub const ERROR_DESCRIPTION_FIELD: &str = "error_description";

/// Lifecycle state of a transform runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NodeState {
    Created,
    Initialized,
    Running,
    Paused,
    Stopped,
    Finished,
    /// Disposed without ever running
    Disposed,
}

/// What the transform wants after processing one unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Continue,
    Done,
}

/// Failure of a single `process_one` call
#[derive(Debug, Error)]
pub enum TransformError {
    /// The given row could not be processed. Routed to the error hop when one is
    /// wired and the transform supports error handling, fatal otherwise.
    #[error("{message}")]
    Row {
        schema: Arc<RowSchema>,
        row: Row,
        message: String,
    },

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl TransformError {
    pub fn row(schema: &Arc<RowSchema>, row: Row, message: impl Into<String>) -> Self {
        TransformError::Row {
            schema: schema.clone(),
            row,
            message: message.into(),
        }
    }
}

/// Row processing logic of one transform
///
/// Implementations are created per run by the plugin registry and own their
/// per-run resources. `process_one` is called repeatedly until it returns
/// `Done`, an error, or the pipeline is stopped.
#[async_trait]
pub trait Transform: Send {
    /// Acquire resources. Returning `false` fails the pipeline before any row moves.
    async fn init(&mut self, _ctx: &mut TransformContext) -> anyhow::Result<bool> {
        Ok(true)
    }

    async fn process_one(&mut self, ctx: &mut TransformContext) -> Result<ProcessOutcome, TransformError>;

    /// Release resources. Called exactly once, whatever the outcome of the run.
    async fn dispose(&mut self, _ctx: &mut TransformContext) {}

    /// Whether rejected rows may be routed to an error hop
    fn supports_error_handling(&self) -> bool {
        false
    }
}

/// Line counters of one transform, updated from its runtime task
#[derive(Debug, Default)]
pub struct TransformCounters {
    read: AtomicU64,
    written: AtomicU64,
    input: AtomicU64,
    output: AtomicU64,
    updated: AtomicU64,
    rejected: AtomicU64,
    errors: AtomicU64,
}

impl TransformCounters {
    pub fn add_read(&self, n: u64) {
        self.read.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_written(&self, n: u64) -> u64 {
        self.written.fetch_add(n, Ordering::Relaxed) + n
    }

    pub fn add_input(&self, n: u64) {
        self.input.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_output(&self, n: u64) {
        self.output.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_updated(&self, n: u64) {
        self.updated.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_rejected(&self, n: u64) {
        self.rejected.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_errors(&self, n: u64) {
        self.errors.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            lines_read: self.read.load(Ordering::Relaxed),
            lines_written: self.written.load(Ordering::Relaxed),
            lines_input: self.input.load(Ordering::Relaxed),
            lines_output: self.output.load(Ordering::Relaxed),
            lines_updated: self.updated.load(Ordering::Relaxed),
            lines_rejected: self.rejected.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`TransformCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CounterSnapshot {
    pub lines_read: u64,
    pub lines_written: u64,
    pub lines_input: u64,
    pub lines_output: u64,
    pub lines_updated: u64,
    pub lines_rejected: u64,
    pub errors: u64,
}

impl CounterSnapshot {
    pub fn add(&mut self, other: &CounterSnapshot) {
        self.lines_read += other.lines_read;
        self.lines_written += other.lines_written;
        self.lines_input += other.lines_input;
        self.lines_output += other.lines_output;
        self.lines_updated += other.lines_updated;
        self.lines_rejected += other.lines_rejected;
        self.errors += other.errors;
    }
}

/// Status of one transform as reported by the pipeline monitor and the API
#[derive(Debug, Clone, Serialize)]
pub struct TransformStatus {
    pub name: String,
    pub transform_type: String,
    pub state: NodeState,
    pub disposed: bool,
    #[serde(flatten)]
    pub counters: CounterSnapshot,
    /// Rows waiting in the input row sets
    pub input_buffered: usize,
    /// Rows waiting in the output row sets
    pub output_buffered: usize,
}

/// Shared view of a transform runtime, kept by the pipeline after the runtime
/// moved into its task
#[derive(Debug)]
pub struct TransformHandle {
    name: String,
    transform_type: String,
    state: Mutex<NodeState>,
    disposed: AtomicBool,
    counters: Arc<TransformCounters>,
    inputs: Vec<Arc<RowSet>>,
    outputs: Vec<Arc<RowSet>>,
}

impl TransformHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> NodeState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: NodeState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    pub fn status(&self) -> TransformStatus {
        TransformStatus {
            name: self.name.clone(),
            transform_type: self.transform_type.clone(),
            state: self.state(),
            disposed: self.is_disposed(),
            counters: self.counters.snapshot(),
            input_buffered: self.inputs.iter().map(|r| r.buffered()).sum(),
            output_buffered: self.outputs.iter().map(|r| r.buffered()).sum(),
        }
    }
}

/// State shared by every transform of one pipeline run
#[derive(Debug)]
pub(crate) struct PipelineShared {
    pub pipeline: String,
    pub stop: CancellationToken,
    pub feedback_size: u64,
    /// Rows handed in from the previous job result
    pub previous_rows: Arc<Vec<ResultRow>>,
    /// Rows collected into the pipeline result
    pub result_rows: Mutex<Vec<ResultRow>>,
    pub variables: Variables,
}

/// Row sets of one transform
#[derive(Debug, Default)]
pub(crate) struct Wiring {
    pub inputs: Vec<Arc<RowSet>>,
    pub outputs: Vec<Arc<RowSet>>,
    pub error_output: Option<Arc<RowSet>>,
    pub consumer_signal: Arc<Notify>,
}

/// Everything a transform may touch while running
#[derive(Debug)]
pub struct TransformContext {
    name: String,
    distribute: bool,
    shared: Arc<PipelineShared>,
    inputs: Vec<Arc<RowSet>>,
    input_drained: Vec<bool>,
    input_cursor: usize,
    input_schema: Option<Arc<RowSchema>>,
    outputs: Vec<Arc<RowSet>>,
    output_cursor: usize,
    error_output: Option<Arc<RowSet>>,
    /// (source schema, schema with error fields appended)
    error_schema: Option<(Arc<RowSchema>, Arc<RowSchema>)>,
    consumer_signal: Arc<Notify>,
    counters: Arc<TransformCounters>,
}

impl TransformContext {
    pub(crate) fn new(meta: &TransformMeta, wiring: Wiring, shared: Arc<PipelineShared>) -> Self {
        let input_count = wiring.inputs.len();
        Self {
            name: meta.name.clone(),
            distribute: meta.distribute,
            shared,
            inputs: wiring.inputs,
            input_drained: vec![false; input_count],
            input_cursor: 0,
            input_schema: None,
            outputs: wiring.outputs,
            output_cursor: 0,
            error_output: wiring.error_output,
            error_schema: None,
            consumer_signal: wiring.consumer_signal,
            counters: Arc::new(TransformCounters::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pipeline_name(&self) -> &str {
        &self.shared.pipeline
    }

    pub fn has_inputs(&self) -> bool {
        !self.inputs.is_empty()
    }

    pub fn has_error_output(&self) -> bool {
        self.error_output.is_some()
    }

    /// Schema of the last row returned by `get_row`
    pub fn input_schema(&self) -> Option<&Arc<RowSchema>> {
        self.input_schema.as_ref()
    }

    pub fn counters(&self) -> &TransformCounters {
        &self.counters
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stop.is_cancelled()
    }

    /// Stop request of the pipeline, for transforms that wait on their own
    pub fn stop_token(&self) -> &CancellationToken {
        &self.shared.stop
    }

    /// Variables of the pipeline run, parameters included
    pub fn variables(&self) -> &Variables {
        &self.shared.variables
    }

    /// Rows of the job result the pipeline was started with
    pub fn previous_result_rows(&self) -> &Arc<Vec<ResultRow>> {
        &self.shared.previous_rows
    }

    /// Add a row to the result rows of the pipeline
    pub fn add_result_row(&self, row: ResultRow) {
        self.shared
            .result_rows
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(row);
    }

    /// Next row from any input, round-robin across the inputs.
    /// `Ok(None)` once every input is done and drained, or immediately for a source.
    pub async fn get_row(&mut self) -> Result<Option<Row>, ChannelError> {
        let count = self.inputs.len();
        if count == 0 {
            return Ok(None);
        }
        loop {
            let mut open = false;
            for offset in 0..count {
                let idx = (self.input_cursor + offset) % count;
                if self.input_drained[idx] {
                    continue;
                }
                match self.inputs[idx].try_get() {
                    Fetch::Row(row) => {
                        self.input_cursor = (idx + 1) % count;
                        self.input_schema = self.inputs[idx].schema();
                        self.counters.add_read(1);
                        return Ok(Some(row));
                    }
                    Fetch::Empty => open = true,
                    Fetch::Drained => self.input_drained[idx] = true,
                }
            }
            if !open {
                return Ok(None);
            }
            tokio::select! {
                biased;
                _ = self.shared.stop.cancelled() => {
                    return Err(ChannelError::Stopped(format!("{} (input)", self.name)));
                }
                _ = self.consumer_signal.notified() => {}
            }
        }
    }

    /// Push a row to the outputs: round-robin when distributing, to every output
    /// when copying. Outputs whose consumer already left are skipped. A transform
    /// without outputs still counts the row as written.
    pub async fn put_row(&mut self, schema: &Arc<RowSchema>, row: Row) -> Result<(), ChannelError> {
        if self.outputs.is_empty() {
            self.wrote_row();
            return Ok(());
        }
        if self.distribute || self.outputs.len() == 1 {
            while !self.outputs.is_empty() {
                let idx = self.output_cursor % self.outputs.len();
                match self.outputs[idx].put(schema, row.clone()).await {
                    Ok(()) => {
                        self.output_cursor = idx + 1;
                        self.wrote_row();
                        return Ok(());
                    }
                    Err(ChannelError::Closed(name)) => self.drop_output(idx, &name),
                    Err(e) => return Err(e),
                }
            }
            return Ok(());
        }

        let mut delivered = false;
        let mut idx = 0;
        while idx < self.outputs.len() {
            match self.outputs[idx].put(schema, row.clone()).await {
                Ok(()) => {
                    delivered = true;
                    idx += 1;
                }
                Err(ChannelError::Closed(name)) => self.drop_output(idx, &name),
                Err(e) => return Err(e),
            }
        }
        if delivered {
            self.wrote_row();
        }
        Ok(())
    }

    /// Send a rejected row over the error hop with `error_count` and
    /// `error_description` appended
    pub async fn put_error(
        &mut self,
        schema: &Arc<RowSchema>,
        mut row: Row,
        nr_errors: u64,
        description: &str,
    ) -> Result<(), ChannelError> {
        let Some(error_output) = self.error_output.clone() else {
            return Err(ChannelError::Closed(format!("{} (error output)", self.name)));
        };
        let extended = match &self.error_schema {
            Some((source, extended)) if Arc::ptr_eq(source, schema) => extended.clone(),
            _ => {
                let extended = Arc::new(schema.extended([
                    Field::new(ERROR_COUNT_FIELD, ValueType::Integer),
                    Field::new(ERROR_DESCRIPTION_FIELD, ValueType::String),
                ]));
                self.error_schema = Some((schema.clone(), extended.clone()));
                extended
            }
        };
        row.push(Value::Integer(nr_errors as i64));
        row.push(Value::String(description.to_string()));
        error_output.put(&extended, row).await?;
        self.counters.add_rejected(1);
        Ok(())
    }

    fn wrote_row(&self) {
        let written = self.counters.add_written(1);
        let feedback = self.shared.feedback_size;
        if feedback > 0 && written % feedback == 0 {
            tracing::info!("📊 {}.{} - linenr {}", self.shared.pipeline, self.name, written);
        }
    }

    fn drop_output(&mut self, idx: usize, rowset: &str) {
        tracing::debug!("🔌 {} stops writing to closed row set '{}'", self.name, rowset);
        self.outputs.remove(idx);
    }

    fn mark_outputs_done(&self) {
        for output in &self.outputs {
            output.mark_done();
        }
        if let Some(error_output) = &self.error_output {
            error_output.mark_done();
        }
    }

    /// A consumer that left releases any producer still writing to it
    fn release_inputs(&self) {
        for input in &self.inputs {
            input.mark_done();
        }
    }
}

/// Final report of a transform runtime
#[derive(Debug)]
pub struct NodeReport {
    pub name: String,
    pub state: NodeState,
    pub failure: Option<String>,
}

/// One transform plus its context, driven on its own task
pub struct TransformRuntime {
    transform: Box<dyn Transform>,
    ctx: TransformContext,
    handle: Arc<TransformHandle>,
    pause: watch::Receiver<bool>,
}

impl TransformRuntime {
    pub(crate) fn new(
        meta: &TransformMeta,
        transform: Box<dyn Transform>,
        wiring: Wiring,
        shared: Arc<PipelineShared>,
        pause: watch::Receiver<bool>,
    ) -> Self {
        let inputs = wiring.inputs.clone();
        let mut outputs = wiring.outputs.clone();
        outputs.extend(wiring.error_output.clone());
        let ctx = TransformContext::new(meta, wiring, shared);
        let handle = Arc::new(TransformHandle {
            name: meta.name.clone(),
            transform_type: meta.transform_type.clone(),
            state: Mutex::new(NodeState::Created),
            disposed: AtomicBool::new(false),
            counters: ctx.counters.clone(),
            inputs,
            outputs,
        });
        Self {
            transform,
            ctx,
            handle,
            pause,
        }
    }

    pub fn handle(&self) -> Arc<TransformHandle> {
        self.handle.clone()
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    /// Run the transform's `init`
    pub async fn initialize(&mut self) -> Result<(), EngineError> {
        match self.transform.init(&mut self.ctx).await {
            Ok(true) => {
                self.handle.set_state(NodeState::Initialized);
                tracing::debug!("🔧 Transform '{}' initialized", self.ctx.name);
                Ok(())
            }
            Ok(false) => Err(EngineError::node(
                &self.ctx.name,
                anyhow::anyhow!("initialization returned false"),
            )),
            Err(e) => Err(EngineError::node(&self.ctx.name, e)),
        }
    }

    /// Whether a rejected row can be routed instead of failing the transform
    fn routes_errors(&self) -> bool {
        self.ctx.has_error_output() && self.transform.supports_error_handling()
    }

    /// Process loop. Always marks the outputs done and disposes the transform
    /// before returning.
    pub async fn run(mut self) -> NodeReport {
        self.handle.set_state(NodeState::Running);
        tracing::debug!("▶️ Transform '{}' started", self.ctx.name);

        let mut failure = None;
        let mut iterations: u64 = 0;
        let final_state = loop {
            if self.ctx.is_stopped() {
                break NodeState::Stopped;
            }
            let paused = *self.pause.borrow();
            if paused {
                self.handle.set_state(NodeState::Paused);
                if !self.wait_for_resume().await {
                    break NodeState::Stopped;
                }
                self.handle.set_state(NodeState::Running);
                continue;
            }

            let processed = match AssertUnwindSafe(self.transform.process_one(&mut self.ctx))
                .catch_unwind()
                .await
            {
                Ok(processed) => processed,
                Err(payload) => Err(TransformError::Fatal(anyhow::anyhow!(
                    "transform panicked: {}",
                    panic_message(payload.as_ref())
                ))),
            };
            match processed {
                Ok(ProcessOutcome::Continue) => {}
                Ok(ProcessOutcome::Done) => break NodeState::Finished,
                Err(TransformError::Channel(e)) if e.is_stop() => break NodeState::Stopped,
                Err(TransformError::Row { schema, row, message }) if self.routes_errors() => {
                    self.ctx.counters.add_errors(1);
                    tracing::debug!("↪️ {} rejected a row: {}", self.ctx.name, message);
                    if let Err(e) = self.ctx.put_error(&schema, row, 1, &message).await {
                        if !e.is_stop() {
                            failure = Some(e.to_string());
                        }
                        break NodeState::Stopped;
                    }
                }
                Err(e) => {
                    self.ctx.counters.add_errors(1);
                    tracing::error!("❌ Transform '{}' failed: {:#}", self.ctx.name, e);
                    failure = Some(format!("{:#}", e));
                    break NodeState::Stopped;
                }
            }

            iterations += 1;
            if iterations % 64 == 0 {
                tokio::task::yield_now().await;
            }
        };

        self.handle.set_state(final_state);
        self.ctx.mark_outputs_done();
        self.ctx.release_inputs();
        self.dispose().await;

        let counters = self.handle.counters();
        tracing::info!(
            "✅ Transform '{}' ended ({:?}): R={} W={} E={}",
            self.ctx.name,
            final_state,
            counters.lines_read,
            counters.lines_written,
            counters.errors
        );

        NodeReport {
            name: self.ctx.name.clone(),
            state: final_state,
            failure,
        }
    }

    /// Park until resumed or stopped. False when the pause switch is gone.
    async fn wait_for_resume(&mut self) -> bool {
        loop {
            let paused = *self.pause.borrow_and_update();
            if !paused || self.ctx.is_stopped() {
                return true;
            }
            tokio::select! {
                _ = self.ctx.shared.stop.cancelled() => return true,
                changed = self.pause.changed() => {
                    if changed.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    /// Release the transform's resources; only the first call does anything
    pub async fn dispose(&mut self) {
        if self.handle.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transform.dispose(&mut self.ctx).await;
        if matches!(self.handle.state(), NodeState::Created | NodeState::Initialized) {
            self.handle.set_state(NodeState::Disposed);
            self.ctx.mark_outputs_done();
        }
    }
}
