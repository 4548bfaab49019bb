/// Remote execution REST API endpoints
///
/// Accepts pipeline and job definitions, runs them in the background and keeps a
/// record of every execution so it can be inspected and stopped while it runs.

use crate::{
    config::DEFAULT_EXECUTION_RETENTION_SECS,
    engine::Engine,
    job::{Job, JobDefinition},
    pipeline::{Pipeline, PipelineDefinition, RunOptions},
    result::JobResult,
    status::ExecutionStatus,
    variables::Variables,
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use uuid::Uuid;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    /// Engine context used for every submitted run
    pub engine: Engine,
    /// Running executions and the finished ones still within retention
    pub executions: Arc<RwLock<HashMap<Uuid, ExecutionRecord>>>,
    /// How long a finished execution stays listed
    pub retention: Duration,
}

impl AppState {
    pub fn new(engine: Engine) -> Self {
        Self::with_retention(engine, Duration::from_secs(DEFAULT_EXECUTION_RETENTION_SECS))
    }

    pub fn with_retention(engine: Engine, retention: Duration) -> Self {
        Self {
            engine,
            executions: Arc::new(RwLock::new(HashMap::new())),
            retention,
        }
    }

    /// Drop finished executions older than the retention. Running ones are kept.
    pub async fn evict_finished(&self) -> usize {
        let now = Utc::now();
        let retention = self.retention;
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, record| {
            let age = record.finished_at.and_then(|finished| (now - finished).to_std().ok());
            !age.is_some_and(|age| age >= retention)
        });
        let evicted = before - executions.len();
        if evicted > 0 {
            tracing::debug!("🧹 Evicted {} finished executions", evicted);
        }
        evicted
    }

    /// Request a stop of every execution that is still running
    pub async fn stop_all(&self) {
        let executions = self.executions.read().await;
        for record in executions.values().filter(|r| r.finished_at.is_none()) {
            tracing::info!("🛑 Stopping execution {} ({})", record.id, record.name);
            record.handle.stop();
        }
    }

    async fn register(&self, kind: ExecutionKind, name: &str, handle: ExecutionHandle) -> Uuid {
        self.evict_finished().await;
        let id = Uuid::new_v4();
        let record = ExecutionRecord {
            id,
            kind,
            name: name.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            handle,
            result: None,
            error: None,
        };
        self.executions.write().await.insert(id, record);
        id
    }

    async fn finish(&self, id: Uuid, result: Option<Value>, error: Option<String>) {
        if let Some(record) = self.executions.write().await.get_mut(&id) {
            record.finished_at = Some(Utc::now());
            record.result = result;
            record.error = error;
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionKind {
    Pipeline,
    Job,
}

/// Live handle used to query and stop a running execution
#[derive(Clone)]
pub enum ExecutionHandle {
    Pipeline(Arc<Pipeline>),
    Job(Job),
}

impl ExecutionHandle {
    pub fn stop(&self) {
        match self {
            ExecutionHandle::Pipeline(pipeline) => pipeline.stop(),
            ExecutionHandle::Job(job) => job.stop(),
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        match self {
            ExecutionHandle::Pipeline(pipeline) => pipeline.status(),
            ExecutionHandle::Job(job) => job.status(),
        }
    }

    pub fn nr_errors(&self) -> u64 {
        match self {
            ExecutionHandle::Pipeline(pipeline) => pipeline.nr_errors(),
            ExecutionHandle::Job(job) => job.nr_errors(),
        }
    }
}

/// One submitted execution
pub struct ExecutionRecord {
    pub id: Uuid,
    pub kind: ExecutionKind,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub handle: ExecutionHandle,
    /// Final result as JSON, once finished
    pub result: Option<Value>,
    pub error: Option<String>,
}

impl ExecutionRecord {
    fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id,
            kind: self.kind,
            name: self.name.clone(),
            status: self.handle.status(),
            nr_errors: self.handle.nr_errors(),
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

/// Listing entry of an execution
#[derive(Debug, Serialize)]
pub struct ExecutionSummary {
    pub id: Uuid,
    pub kind: ExecutionKind,
    pub name: String,
    pub status: ExecutionStatus,
    pub nr_errors: u64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// Response for submission and stop operations
#[derive(Debug, Serialize)]
pub struct ExecutionResponse {
    pub id: Uuid,
    pub message: String,
}

/// Request body for pipeline submission
#[derive(Debug, Deserialize)]
pub struct SubmitPipelineRequest {
    pub pipeline: PipelineDefinition,
    /// Values for the parameters the pipeline declares
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Request body for job submission
#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    pub job: JobDefinition,
    #[serde(default)]
    pub parameters: HashMap<String, String>,
}

/// Create execution routes
///
/// All endpoints use the shared application state for the engine and the
/// execution records.
pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/pipelines", post(submit_pipeline))
        .route("/api/jobs", post(submit_job))
        .route("/api/executions", get(list_executions))
        .route("/api/executions/{id}", get(get_execution).delete(delete_execution))
        .route("/api/executions/{id}/stop", post(stop_execution))
}

/// Submit a pipeline for execution
///
/// POST /api/pipelines
/// Body: { "pipeline": { "name": "...", "transforms": [...], "hops": [...] }, "parameters": { ... } }
async fn submit_pipeline(
    State(state): State<AppState>,
    Json(payload): Json<SubmitPipelineRequest>,
) -> Result<Json<ExecutionResponse>, StatusCode> {
    let def = payload.pipeline;
    let options = RunOptions {
        parameters: payload.parameters,
        ..RunOptions::default()
    };

    // Validation happens before anything is registered
    let pipeline = match state.engine.prepare_pipeline(&def, options) {
        Ok(pipeline) => Arc::new(pipeline),
        Err(e) => {
            tracing::warn!("⚠️ Rejected pipeline '{}': {}", def.name, e);
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    let id = state
        .register(ExecutionKind::Pipeline, &def.name, ExecutionHandle::Pipeline(Arc::clone(&pipeline)))
        .await;

    let task_state = state.clone();
    tokio::spawn(async move {
        let outcome = pipeline.run().await;
        pipeline.dispose().await;
        let error = outcome.error.as_ref().map(|e| e.to_string());
        let result = serde_json::to_value(&outcome.result).ok();
        task_state.finish(id, result, error).await;
    });

    tracing::info!("🚀 Submitted pipeline '{}' as execution {}", def.name, id);

    Ok(Json(ExecutionResponse {
        id,
        message: format!("Pipeline '{}' started", def.name),
    }))
}

/// Submit a job for execution
///
/// POST /api/jobs
/// Body: { "job": { "name": "...", "entries": [...], "hops": [...] }, "parameters": { ... } }
async fn submit_job(
    State(state): State<AppState>,
    Json(payload): Json<SubmitJobRequest>,
) -> Result<Json<ExecutionResponse>, StatusCode> {
    let def = payload.job;

    let job = match Job::prepare_nested(&state.engine, &def, None, &Variables::new(), &payload.parameters) {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!("⚠️ Rejected job '{}': {}", def.name, e);
            return Err(StatusCode::BAD_REQUEST);
        }
    };

    let id = state
        .register(ExecutionKind::Job, &def.name, ExecutionHandle::Job(job.clone()))
        .await;

    let task_state = state.clone();
    tokio::spawn(async move {
        let outcome = job.run(JobResult::successful()).await;
        let error = outcome.error.as_ref().map(|e| e.to_string());
        let result = serde_json::to_value(&outcome.result).ok();
        task_state.finish(id, result, error).await;
    });

    tracing::info!("🚀 Submitted job '{}' as execution {}", def.name, id);

    Ok(Json(ExecutionResponse {
        id,
        message: format!("Job '{}' started", def.name),
    }))
}

/// List all executions, most recent first
///
/// GET /api/executions
async fn list_executions(State(state): State<AppState>) -> Json<Value> {
    state.evict_finished().await;
    let executions = state.executions.read().await;
    let mut summaries: Vec<ExecutionSummary> = executions.values().map(ExecutionRecord::summary).collect();
    summaries.sort_by(|a, b| b.started_at.cmp(&a.started_at));
    Json(json!({ "executions": summaries }))
}

/// Inspect one execution
///
/// GET /api/executions/{id}
/// Returns the summary plus transform statuses (pipelines) or tracker records
/// (jobs), and the final result once finished.
async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, StatusCode> {
    let executions = state.executions.read().await;
    let record = executions.get(&id).ok_or(StatusCode::NOT_FOUND)?;

    let detail = match &record.handle {
        ExecutionHandle::Pipeline(pipeline) => json!({ "transforms": pipeline.transform_statuses() }),
        ExecutionHandle::Job(job) => json!({ "tracker": job.tracker().records() }),
    };

    Ok(Json(json!({
        "execution": record.summary(),
        "detail": detail,
        "result": record.result,
        "error": record.error,
    })))
}

/// Request a stop of a running execution
///
/// POST /api/executions/{id}/stop
async fn stop_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionResponse>, StatusCode> {
    let executions = state.executions.read().await;
    let record = executions.get(&id).ok_or(StatusCode::NOT_FOUND)?;

    if record.finished_at.is_some() {
        return Err(StatusCode::CONFLICT);
    }

    record.handle.stop();
    tracing::info!("🛑 Stop requested for execution {} ({})", id, record.name);

    Ok(Json(ExecutionResponse {
        id,
        message: format!("Stop requested for '{}'", record.name),
    }))
}

/// Remove the record of a finished execution
///
/// DELETE /api/executions/{id}
async fn delete_execution(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ExecutionResponse>, StatusCode> {
    let mut executions = state.executions.write().await;
    let record = executions.get(&id).ok_or(StatusCode::NOT_FOUND)?;

    // Running executions must be stopped first
    if record.finished_at.is_none() {
        return Err(StatusCode::CONFLICT);
    }

    let name = record.name.clone();
    executions.remove(&id);
    tracing::info!("🗑️ Removed execution {} ({})", id, name);

    Ok(Json(ExecutionResponse {
        id,
        message: format!("Execution of '{}' removed", name),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn pipeline_request(pipeline: PipelineDefinition) -> Json<SubmitPipelineRequest> {
        Json(SubmitPipelineRequest {
            pipeline,
            parameters: HashMap::new(),
        })
    }

    fn job_request(job: JobDefinition) -> Json<SubmitJobRequest> {
        Json(SubmitJobRequest {
            job,
            parameters: HashMap::new(),
        })
    }

    async fn wait_finished(state: &AppState, id: Uuid) {
        for _ in 0..500 {
            if state.executions.read().await[&id].finished_at.is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("execution {} did not finish", id);
    }

    #[tokio::test]
    async fn submitted_pipeline_runs_to_completion() {
        let state = AppState::new(Engine::with_builtins());
        let def = PipelineDefinition::new("gen")
            .transform("gen", "RowGenerator", json!({ "limit": 25 }))
            .transform("out", "Dummy", json!({}))
            .hop("gen", "out");

        let Json(response) = submit_pipeline(State(state.clone()), pipeline_request(def))
            .await
            .unwrap();
        wait_finished(&state, response.id).await;

        let Json(detail) = get_execution(State(state.clone()), Path(response.id)).await.unwrap();
        assert_eq!(detail["execution"]["kind"], "pipeline");
        assert_eq!(detail["execution"]["status"], "Finished");
        assert!(detail["error"].is_null());
        assert_eq!(detail["result"]["totals"]["lines_written"], 50);
    }

    #[tokio::test]
    async fn invalid_definitions_are_rejected() {
        let state = AppState::new(Engine::with_builtins());
        let def = PipelineDefinition::new("bad").hop("missing", "nowhere");
        let err = submit_pipeline(State(state.clone()), pipeline_request(def))
            .await
            .err();
        assert_eq!(err, Some(StatusCode::BAD_REQUEST));

        let err = submit_job(State(state.clone()), job_request(JobDefinition::new("empty")))
            .await
            .err();
        assert_eq!(err, Some(StatusCode::BAD_REQUEST));
        assert!(state.executions.read().await.is_empty());
    }

    #[tokio::test]
    async fn running_job_can_be_stopped() {
        let state = AppState::new(Engine::with_builtins());
        let def = JobDefinition::new("waits")
            .entry("start", "START", json!({}))
            .entry("wait", "DELAY", json!({ "ms": 60_000 }))
            .hop("start", "wait");

        let Json(response) = submit_job(State(state.clone()), job_request(def))
            .await
            .unwrap();
        stop_execution(State(state.clone()), Path(response.id)).await.unwrap();
        wait_finished(&state, response.id).await;

        let Json(detail) = get_execution(State(state.clone()), Path(response.id)).await.unwrap();
        assert_eq!(detail["result"]["success"], false);
        assert_eq!(
            stop_execution(State(state.clone()), Path(response.id)).await.err(),
            Some(StatusCode::CONFLICT)
        );

        let Json(list) = list_executions(State(state)).await;
        assert_eq!(list["executions"].as_array().map(Vec::len), Some(1));
    }

    #[tokio::test]
    async fn only_finished_executions_can_be_deleted() {
        let state = AppState::new(Engine::with_builtins());
        let def = JobDefinition::new("waits")
            .entry("start", "START", json!({}))
            .entry("wait", "DELAY", json!({ "ms": 60_000 }))
            .hop("start", "wait");

        let Json(response) = submit_job(State(state.clone()), job_request(def))
            .await
            .unwrap();
        assert_eq!(
            delete_execution(State(state.clone()), Path(response.id)).await.err(),
            Some(StatusCode::CONFLICT)
        );

        stop_execution(State(state.clone()), Path(response.id)).await.unwrap();
        wait_finished(&state, response.id).await;
        delete_execution(State(state.clone()), Path(response.id)).await.unwrap();

        assert_eq!(
            get_execution(State(state.clone()), Path(response.id)).await.err(),
            Some(StatusCode::NOT_FOUND)
        );
        assert_eq!(
            delete_execution(State(state), Path(response.id)).await.err(),
            Some(StatusCode::NOT_FOUND)
        );
    }

    #[tokio::test]
    async fn finished_executions_expire_after_retention() {
        let state = AppState::with_retention(Engine::with_builtins(), Duration::ZERO);
        let done = PipelineDefinition::new("short")
            .transform("gen", "RowGenerator", json!({ "limit": 3 }))
            .transform("out", "Dummy", json!({}))
            .hop("gen", "out");
        let Json(finished) = submit_pipeline(State(state.clone()), pipeline_request(done))
            .await
            .unwrap();
        wait_finished(&state, finished.id).await;

        let waiting = JobDefinition::new("waits")
            .entry("start", "START", json!({}))
            .entry("wait", "DELAY", json!({ "ms": 60_000 }))
            .hop("start", "wait");
        let Json(running) = submit_job(State(state.clone()), job_request(waiting))
            .await
            .unwrap();

        let Json(list) = list_executions(State(state.clone())).await;
        let listed = list["executions"].as_array().cloned().unwrap_or_default();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0]["id"], running.id.to_string());
        assert!(!state.executions.read().await.contains_key(&finished.id));

        state.stop_all().await;
        wait_finished(&state, running.id).await;
        assert_eq!(state.evict_finished().await, 1);
        assert!(state.executions.read().await.is_empty());
    }
}
