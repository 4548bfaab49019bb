//! Integration tests for job execution
//!
//! These tests drive jobs through the public engine API:
//! - Conditional hop evaluation
//! - Parallel branches and error aggregation
//! - Repeating start entries and stop requests
//! - Nested pipelines and jobs
//! - Lifecycle listeners and the job tracker

use async_trait::async_trait;
use hopline::error::EngineError;
use hopline::job::{EntryContext, JobDefinition, JobEntry, TrackerEventKind};
use hopline::listener::{ExecutionListener, LifecycleEvent};
use hopline::pipeline::PipelineDefinition;
use hopline::row::Value;
use hopline::status::ExecutionStatus;
use hopline::{Engine, JobResult};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn finished_names(job: &hopline::Job) -> Vec<String> {
    job.tracker()
        .records_of(TrackerEventKind::EntryFinished)
        .into_iter()
        .map(|r| r.entry_name)
        .collect()
}

#[tokio::test]
async fn failure_hop_fires_after_a_failing_entry() {
    let engine = Engine::with_builtins();
    let def = JobDefinition::new("recovering")
        .entry("start", "START", json!({}))
        .entry("work", "ABORT", json!({ "message": "source offline" }))
        .entry("ok", "DUMMY", json!({}))
        .entry("recover", "SUCCESS", json!({}))
        .hop("start", "work")
        .on_success("work", "ok")
        .on_failure("work", "recover");

    let job = engine.prepare_job(&def, None).unwrap();
    let outcome = job.run(JobResult::successful()).await;
    assert!(outcome.is_ok());
    assert_eq!(finished_names(&job), vec!["start", "work", "recover"]);
    assert_eq!(outcome.result.nr_errors, 1);
    assert!(!outcome.result.success);
}

#[tokio::test]
async fn success_hop_fires_after_a_successful_entry() {
    let engine = Engine::with_builtins();
    let def = JobDefinition::new("happy")
        .entry("start", "START", json!({}))
        .entry("work", "DUMMY", json!({}))
        .entry("ok", "SUCCESS", json!({}))
        .entry("recover", "DUMMY", json!({}))
        .hop("start", "work")
        .on_success("work", "ok")
        .on_failure("work", "recover");

    let job = engine.prepare_job(&def, None).unwrap();
    let outcome = job.run(JobResult::successful()).await;
    assert!(outcome.is_ok());
    assert_eq!(finished_names(&job), vec!["start", "work", "ok"]);
    assert!(outcome.result.success);
    assert_eq!(job.nr_errors(), 0);
    assert_eq!(job.status().to_string(), "Finished");
}

#[tokio::test]
async fn parallel_branches_aggregate_errors() {
    let engine = Engine::with_builtins();
    let def = JobDefinition::new("fan-out")
        .entry("start", "START", json!({}))
        .parallel_entry("A", "DUMMY", json!({}))
        .entry("B", "ABORT", json!({}))
        .entry("C", "SUCCESS", json!({}))
        .hop("start", "A")
        .hop("A", "B")
        .hop("A", "C");

    let job = engine.prepare_job(&def, None).unwrap();
    let outcome = job.run(JobResult::successful()).await;
    assert!(outcome.is_ok());
    assert_eq!(outcome.result.nr_errors, 1);
    assert!(!outcome.result.success);

    let finished = job.tracker().records_of(TrackerEventKind::EntryFinished);
    assert_eq!(finished.len(), 4);
    assert_eq!(finished[0].entry_name, "start");
    assert_eq!(finished[1].entry_name, "A");
    let mut branches: Vec<&str> = finished[2..].iter().map(|r| r.entry_name.as_str()).collect();
    branches.sort();
    assert_eq!(branches, vec!["B", "C"]);
    assert!(finished.windows(2).all(|w| w[0].sequence < w[1].sequence));

    let job_finished = job.tracker().records_of(TrackerEventKind::JobFinished);
    assert_eq!(job_finished.len(), 1);
    assert_eq!(job_finished[0].reason, "finished");
    assert_eq!(job_finished[0].nr_errors, Some(1));
}

struct Explode;

#[async_trait]
impl JobEntry for Explode {
    async fn execute(&self, _previous: JobResult, _ctx: &EntryContext) -> anyhow::Result<JobResult> {
        anyhow::bail!("disk full")
    }
}

#[tokio::test]
async fn failing_parallel_branch_surfaces_as_branch_error() {
    let engine = Engine::with_builtins();
    engine.registry().register_entry("EXPLODE", |_meta| Ok(Box::new(Explode)));
    let def = JobDefinition::new("three-way")
        .entry("start", "START", json!({}))
        .parallel_entry("fork", "DUMMY", json!({}))
        .entry("left", "SUCCESS", json!({}))
        .entry("middle", "EXPLODE", json!({}))
        .entry("right", "DELAY", json!({ "ms": 5 }))
        .hop("start", "fork")
        .hop("fork", "left")
        .hop("fork", "middle")
        .hop("fork", "right");

    let outcome = engine.run_job(&def, JobResult::successful()).await;
    match &outcome.error {
        Some(EngineError::ParallelBranch { entry, source }) => {
            assert_eq!(entry, "middle");
            assert!(source.to_string().contains("disk full"), "{}", source);
        }
        other => panic!("expected a parallel branch error, got {:?}", other),
    }
    assert_eq!(outcome.result.nr_errors, 1);
    assert!(!outcome.result.success);
}

#[tokio::test]
async fn failing_branch_records_an_emergency_finish() {
    let engine = Engine::with_builtins();
    engine.registry().register_entry("EXPLODE", |_meta| Ok(Box::new(Explode)));
    let def = JobDefinition::new("emergency")
        .entry("start", "START", json!({}))
        .entry("boom", "EXPLODE", json!({}))
        .entry("after", "DUMMY", json!({}))
        .hop("start", "boom")
        .hop("boom", "after");

    let job = engine.prepare_job(&def, None).unwrap();
    let outcome = job.run(JobResult::successful()).await;
    assert!(matches!(outcome.error, Some(EngineError::NodeExecution { ref node, .. }) if node == "boom"));
    assert_eq!(finished_names(&job), vec!["start", "boom"]);

    let job_finished = job.tracker().records_of(TrackerEventKind::JobFinished);
    assert_eq!(job_finished[0].reason, "emergency");
    assert_eq!(job.nr_errors(), 1);
}

struct Crash;

#[async_trait]
impl JobEntry for Crash {
    async fn execute(&self, _previous: JobResult, _ctx: &EntryContext) -> anyhow::Result<JobResult> {
        panic!("corrupt checkpoint state")
    }
}

#[tokio::test]
async fn panicking_entry_still_finishes_the_job() {
    let engine = Engine::with_builtins();
    engine.registry().register_entry("CRASH", |_meta| Ok(Box::new(Crash)));
    let def = JobDefinition::new("crashing")
        .entry("start", "START", json!({}))
        .entry("crash", "CRASH", json!({}))
        .entry("after", "DUMMY", json!({}))
        .hop("start", "crash")
        .hop("crash", "after");

    let job = engine.prepare_job(&def, None).unwrap();
    let runner = {
        let job = job.clone();
        tokio::spawn(async move { job.run(JobResult::successful()).await })
    };
    assert!(job.wait_until_finished(Some(Duration::from_secs(2))).await);
    let outcome = runner.await.unwrap();

    match &outcome.error {
        Some(EngineError::NodeExecution { node, cause }) => {
            assert_eq!(node, "crash");
            assert!(format!("{:#}", cause).contains("corrupt checkpoint state"));
        }
        other => panic!("expected an entry failure, got {:?}", other),
    }
    assert_eq!(job.nr_errors(), 1);
    assert_eq!(job.status(), ExecutionStatus::Finished { with_errors: true });
    assert_eq!(finished_names(&job), vec!["start", "crash"]);
    let job_finished = job.tracker().records_of(TrackerEventKind::JobFinished);
    assert_eq!(job_finished[0].reason, "emergency");
}

struct SlowExplode;

#[async_trait]
impl JobEntry for SlowExplode {
    async fn execute(&self, _previous: JobResult, ctx: &EntryContext) -> anyhow::Result<JobResult> {
        ctx.sleep(Duration::from_millis(80)).await;
        anyhow::bail!("timed out talking to the warehouse")
    }
}

#[tokio::test]
async fn earliest_failing_branch_is_reported() {
    let engine = Engine::with_builtins();
    engine.registry().register_entry("EXPLODE", |_meta| Ok(Box::new(Explode)));
    engine.registry().register_entry("SLOW_EXPLODE", |_meta| Ok(Box::new(SlowExplode)));
    let def = JobDefinition::new("race")
        .entry("start", "START", json!({}))
        .parallel_entry("fork", "DUMMY", json!({}))
        .entry("slow", "SLOW_EXPLODE", json!({}))
        .entry("fast", "EXPLODE", json!({}))
        .hop("start", "fork")
        .hop("fork", "slow")
        .hop("fork", "fast");

    let outcome = engine.run_job(&def, JobResult::successful()).await;
    match &outcome.error {
        Some(EngineError::ParallelBranch { entry, source }) => {
            assert_eq!(entry, "fast");
            assert!(source.to_string().contains("disk full"), "{}", source);
        }
        other => panic!("expected a parallel branch error, got {:?}", other),
    }
    assert_eq!(outcome.result.nr_errors, 2);
}

#[tokio::test]
async fn rows_from_before_a_fork_are_kept_once() {
    let engine = Engine::with_builtins();
    let load = PipelineDefinition::new("load")
        .transform(
            "grid",
            "DataGrid",
            json!({
                "fields": [ { "name": "id", "type": "integer" } ],
                "rows": [ [1], [2], [3] ]
            }),
        )
        .transform("collect", "RowsToResult", json!({}))
        .hop("grid", "collect");
    let def = JobDefinition::new("fork-after-load")
        .entry("start", "START", json!({}))
        .entry("load", "PIPELINE", json!({ "pipeline": load }))
        .parallel_entry("fork", "DUMMY", json!({}))
        .entry("left", "DUMMY", json!({}))
        .entry("right", "SUCCESS", json!({}))
        .hop("start", "load")
        .hop("load", "fork")
        .hop("fork", "left")
        .hop("fork", "right");

    let outcome = engine.run_job(&def, JobResult::successful()).await;
    assert!(outcome.is_ok(), "{:?}", outcome.error);
    let result = outcome.result;
    assert_eq!(result.rows.len(), 3);
    assert_eq!(result.lines_written, 6);
    assert!(result.success);
}

#[tokio::test]
async fn repeating_start_runs_until_stopped() {
    let engine = Engine::with_builtins();
    let def = JobDefinition::new("poller")
        .entry("start", "START", json!({ "repeat": true, "interval_ms": 20 }))
        .entry("poll", "DUMMY", json!({}))
        .hop("start", "poll");

    let job = engine.prepare_job(&def, None).unwrap();
    let runner = {
        let job = job.clone();
        tokio::spawn(async move { job.run(JobResult::successful()).await })
    };
    tokio::time::sleep(Duration::from_millis(120)).await;
    job.stop();
    job.stop();

    assert!(job.wait_until_finished(Some(Duration::from_secs(5))).await);
    let outcome = runner.await.unwrap();
    assert!(outcome.is_ok());
    assert!(outcome.result.stopped);
    assert!(!outcome.result.success);
    assert_eq!(outcome.result.nr_errors, 0);

    let polls = finished_names(&job).iter().filter(|n| *n == "poll").count();
    assert!(polls >= 2, "only {} iterations", polls);
}

#[tokio::test]
async fn stop_interrupts_a_waiting_entry() {
    let engine = Engine::with_builtins();
    let def = JobDefinition::new("sleepy")
        .entry("start", "START", json!({}))
        .entry("wait", "DELAY", json!({ "ms": 60_000 }))
        .entry("after", "DUMMY", json!({}))
        .hop("start", "wait")
        .hop("wait", "after");

    let job = engine.prepare_job(&def, None).unwrap();
    let runner = {
        let job = job.clone();
        tokio::spawn(async move { job.run(JobResult::successful()).await })
    };
    tokio::time::sleep(Duration::from_millis(30)).await;
    job.stop();

    let outcome = tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("stop did not interrupt the delay")
        .unwrap();
    assert!(outcome.result.stopped);
    assert!(!finished_names(&job).contains(&"after".to_string()));
}

#[tokio::test]
async fn nested_pipelines_pass_rows_along() {
    let engine = Engine::with_builtins();
    let load = PipelineDefinition::new("load")
        .transform(
            "grid",
            "DataGrid",
            json!({
                "fields": [ { "name": "id", "type": "integer" } ],
                "rows": [ [1], [2], [3] ]
            }),
        )
        .transform("collect", "RowsToResult", json!({}))
        .hop("grid", "collect");
    let reload = PipelineDefinition::new("reload")
        .transform("replay", "RowsFromResult", json!({}))
        .transform("collect", "RowsToResult", json!({}))
        .hop("replay", "collect");

    let def = JobDefinition::new("etl")
        .entry("start", "START", json!({}))
        .entry("load", "PIPELINE", json!({ "pipeline": load }))
        .entry("reload", "PIPELINE", json!({ "pipeline": reload }))
        .hop("start", "load")
        .on_success("load", "reload");

    let outcome = engine.run_job(&def, JobResult::successful()).await;
    assert!(outcome.is_ok(), "{:?}", outcome.error);
    let result = outcome.result;
    assert!(result.success);
    assert_eq!(result.rows.len(), 3);
    assert_eq!(result.rows[2].value("id"), Some(&Value::Integer(3)));
    assert_eq!(result.lines_input, 3);
    assert!(result.lines_written >= 6);
}

#[tokio::test]
async fn failing_nested_pipeline_fails_the_entry() {
    let engine = Engine::with_builtins();
    let broken = PipelineDefinition::new("broken")
        .transform("gen", "RowGenerator", json!({ "limit": 10 }))
        .transform("abort", "Abort", json!({ "message": "bad batch" }))
        .hop("gen", "abort");
    let def = JobDefinition::new("guarded")
        .entry("start", "START", json!({}))
        .entry("run", "PIPELINE", json!({ "pipeline": broken }))
        .entry("alert", "SUCCESS", json!({}))
        .hop("start", "run")
        .on_failure("run", "alert");

    let job = engine.prepare_job(&def, None).unwrap();
    let outcome = job.run(JobResult::successful()).await;
    assert!(outcome.is_ok());
    assert_eq!(finished_names(&job), vec!["start", "run", "alert"]);
    assert_eq!(job.nr_errors(), 1);
}

#[tokio::test]
async fn nested_job_errors_count_in_the_parent() {
    let engine = Engine::with_builtins();
    let child = JobDefinition::new("child")
        .entry("start", "START", json!({}))
        .entry("fail", "ABORT", json!({}))
        .hop("start", "fail");
    let def = JobDefinition::new("parent")
        .entry("start", "START", json!({}))
        .entry("child", "JOB", json!({ "job": child }))
        .entry("fine", "DUMMY", json!({}))
        .entry("handled", "SUCCESS", json!({}))
        .hop("start", "child")
        .on_success("child", "fine")
        .on_failure("child", "handled");

    let job = engine.prepare_job(&def, None).unwrap();
    let outcome = job.run(JobResult::successful()).await;
    assert!(outcome.is_ok());
    assert_eq!(finished_names(&job), vec!["start", "child", "handled"]);
    assert_eq!(outcome.result.nr_errors, 1);
}

fn region_report() -> JobDefinition {
    let report = PipelineDefinition::new("report")
        .transform(
            "grid",
            "DataGrid",
            json!({
                "fields": [ { "name": "table", "type": "string" }, { "name": "region", "type": "string" } ],
                "rows": [ [ "${TABLE}", "${REGION}" ] ]
            }),
        )
        .transform("collect", "RowsToResult", json!({}))
        .hop("grid", "collect");
    JobDefinition::new("report-job")
        .parameter("REGION", "eu")
        .entry("start", "START", json!({}))
        .entry("report", "PIPELINE", json!({ "pipeline": report }))
        .hop("start", "report")
}

fn text(result: &JobResult, field: &str) -> Option<String> {
    match result.rows.first()?.value(field)? {
        Value::String(s) => Some(s.clone()),
        _ => None,
    }
}

#[tokio::test]
async fn nested_jobs_inherit_variables_and_receive_parameters() {
    let engine = Engine::with_builtins();
    let def = JobDefinition::new("nightly")
        .parameter("TABLE", "orders")
        .entry("start", "START", json!({}))
        .entry(
            "child",
            "JOB",
            json!({ "job": region_report(), "parameters": { "REGION": "us-${TABLE}" } }),
        )
        .hop("start", "child");

    let job = engine.prepare_job(&def, None).unwrap();
    assert_eq!(job.variables().get("TABLE"), Some("orders"));
    let outcome = job.run(JobResult::successful()).await;
    assert!(outcome.is_ok(), "{:?}", outcome.error);
    assert_eq!(text(&outcome.result, "table").as_deref(), Some("orders"));
    assert_eq!(text(&outcome.result, "region").as_deref(), Some("us-orders"));

    // Without a passed value the declared default applies
    let outcome = engine.run_job(&region_report(), JobResult::successful()).await;
    assert!(outcome.is_ok(), "{:?}", outcome.error);
    assert_eq!(text(&outcome.result, "region").as_deref(), Some("eu"));
    assert_eq!(text(&outcome.result, "table").as_deref(), Some("${TABLE}"));
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
}

impl ExecutionListener for Recorder {
    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
        let value = serde_json::to_value(event)?;
        let name = value["event"].as_str().unwrap_or_default().to_string();
        self.events.lock().unwrap().push(name);
        Ok(())
    }
}

struct Broken;

impl ExecutionListener for Broken {
    fn on_event(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
        anyhow::bail!("sink unavailable")
    }
}

#[tokio::test]
async fn listeners_see_every_lifecycle_event() {
    let engine = Engine::with_builtins();
    let recorder = Arc::new(Recorder::default());
    engine.add_listener(Arc::new(Broken));
    engine.add_listener(recorder.clone());

    let pipeline = PipelineDefinition::new("small")
        .transform("gen", "RowGenerator", json!({ "limit": 5 }))
        .transform("sink", "Dummy", json!({}))
        .hop("gen", "sink");
    let def = JobDefinition::new("observed")
        .entry("start", "START", json!({}))
        .entry("pipe", "PIPELINE", json!({ "pipeline": pipeline }))
        .hop("start", "pipe");

    let outcome = engine.run_job(&def, JobResult::successful()).await;
    assert!(outcome.is_ok());

    let events = recorder.events.lock().unwrap().clone();
    assert_eq!(events.first().map(String::as_str), Some("job_started"));
    assert_eq!(events.last().map(String::as_str), Some("job_finished"));
    let count = |name: &str| events.iter().filter(|e| *e == name).count();
    assert_eq!(count("entry_started"), 2);
    assert_eq!(count("entry_finished"), 2);
    assert_eq!(count("pipeline_started"), 1);
    assert_eq!(count("transform_finished"), 2);
    assert_eq!(count("pipeline_finished"), 1);
}

#[tokio::test]
async fn job_without_start_is_rejected() {
    let engine = Engine::with_builtins();
    let def = JobDefinition::new("headless").entry("a", "DUMMY", json!({}));
    let err = engine.prepare_job(&def, None).err().unwrap();
    assert!(err.is_configuration());

    let outcome = engine.run_job(&def, JobResult::successful()).await;
    assert!(outcome.error.is_some_and(|e| e.is_configuration()));
}
