/// Built-in job entries
///
/// - START: special start entry, optionally repeating
/// - PIPELINE: runs a nested pipeline
/// - JOB: runs a nested job
/// - SUCCESS / ABORT: force the outcome of a branch
/// - DUMMY: passes the incoming result on unchanged
/// - DELAY: waits, interruptible by a stop request

use crate::job::engine::Job;
use crate::job::entry::{EntryContext, JobEntry};
use crate::job::types::{JobDefinition, JobEntryMeta};
use crate::pipeline::engine::{Pipeline, RunOptions};
use crate::pipeline::types::PipelineDefinition;
use crate::plugins::registry::PluginRegistry;
use crate::result::JobResult;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Register every built-in job entry
pub fn register(registry: &PluginRegistry) {
    registry.register_entry("START", |meta| Ok(Box::new(Start::from_meta(meta)?)));
    registry.register_entry("PIPELINE", |meta| Ok(Box::new(RunPipeline::from_meta(meta)?)));
    registry.register_entry("JOB", |meta| Ok(Box::new(RunJob::from_meta(meta)?)));
    registry.register_entry("SUCCESS", |_meta| Ok(Box::new(Success)));
    registry.register_entry("ABORT", |meta| Ok(Box::new(Abort::from_meta(meta)?)));
    registry.register_entry("DUMMY", |_meta| Ok(Box::new(Dummy)));
    registry.register_entry("DELAY", |meta| Ok(Box::new(Delay::from_meta(meta)?)));
}

fn parse_config<T: DeserializeOwned>(meta: &JobEntryMeta) -> Result<T> {
    let raw = if meta.config.is_null() {
        serde_json::json!({})
    } else {
        meta.config.clone()
    };
    serde_json::from_value(raw).with_context(|| format!("invalid configuration of job entry '{}'", meta.name))
}

/// Values for the parameters of a nested run, from the optional `parameters` map
fn parameter_values(meta: &JobEntryMeta) -> Result<HashMap<String, String>> {
    match meta.config.get("parameters") {
        None | Some(serde_json::Value::Null) => Ok(HashMap::new()),
        Some(raw) => serde_json::from_value(raw.clone())
            .with_context(|| format!("parameters of job entry '{}' must map names to strings", meta.name)),
    }
}

/// Where a nested definition comes from
#[derive(Debug, Clone)]
enum Source<T> {
    Inline(T),
    File(PathBuf),
}

impl<T: DeserializeOwned> Source<T> {
    fn from_config(meta: &JobEntryMeta, inline_key: &str) -> Result<Self> {
        if let Some(inline) = meta.config.get(inline_key) {
            let def = serde_json::from_value(inline.clone())
                .with_context(|| format!("invalid inline {} of job entry '{}'", inline_key, meta.name))?;
            return Ok(Source::Inline(def));
        }
        match meta.config.get("file").and_then(|f| f.as_str()) {
            Some(file) => Ok(Source::File(PathBuf::from(file))),
            None => anyhow::bail!("job entry '{}' needs either '{}' or 'file'", meta.name, inline_key),
        }
    }

    async fn load(&self) -> Result<T>
    where
        T: Clone,
    {
        match self {
            Source::Inline(def) => Ok(def.clone()),
            Source::File(path) => {
                let raw = tokio::fs::read_to_string(path)
                    .await
                    .with_context(|| format!("cannot read {}", path.display()))?;
                serde_json::from_str(&raw).with_context(|| format!("cannot parse {}", path.display()))
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct StartConfig {
    #[serde(default)]
    repeat: bool,
    #[serde(default = "default_interval_ms")]
    interval_ms: u64,
}

fn default_interval_ms() -> u64 {
    60_000
}

/// Special start entry. Never evaluates, so only unconditional hops leave it.
pub struct Start {
    repeat: Option<Duration>,
}

impl Start {
    fn from_meta(meta: &JobEntryMeta) -> Result<Self> {
        let config: StartConfig = parse_config(meta)?;
        Ok(Self {
            repeat: config.repeat.then(|| Duration::from_millis(config.interval_ms)),
        })
    }
}

#[async_trait]
impl JobEntry for Start {
    async fn execute(&self, mut previous: JobResult, _ctx: &EntryContext) -> Result<JobResult> {
        previous.success = true;
        Ok(previous)
    }

    fn evaluates(&self) -> bool {
        false
    }

    fn repeat(&self) -> Option<Duration> {
        self.repeat
    }
}

/// Runs a pipeline. Its result rows replace the carried rows, its counters are
/// added, and every failed transform counts as one error.
pub struct RunPipeline {
    source: Source<PipelineDefinition>,
    parameters: HashMap<String, String>,
}

impl RunPipeline {
    fn from_meta(meta: &JobEntryMeta) -> Result<Self> {
        Ok(Self {
            source: Source::from_config(meta, "pipeline")?,
            parameters: parameter_values(meta)?,
        })
    }
}

#[async_trait]
impl JobEntry for RunPipeline {
    async fn execute(&self, previous: JobResult, ctx: &EntryContext) -> Result<JobResult> {
        let def = self.source.load().await?;
        let options = RunOptions {
            parent_stop: Some(ctx.stop.clone()),
            input_rows: previous.rows.clone(),
            variables: (*ctx.variables).clone(),
            parameters: self.parameters.clone(),
        };
        let pipeline = Pipeline::prepare(&ctx.engine, &def, options)?;
        let outcome = pipeline.run().await;
        pipeline.dispose().await;

        let produced = outcome.result.to_job_result();
        if let Some(e) = &outcome.error {
            tracing::warn!("⚠️ Entry [{}]: {}", ctx.entry_name, e);
        }

        let mut result = previous;
        result.add_lines(&produced);
        result.nr_errors = produced.nr_errors;
        result.success = produced.success;
        result.stopped = produced.stopped;
        result.rows = produced.rows;
        result.log_text = produced.log_text;
        Ok(result)
    }
}

/// Runs a nested job sharing this job's stop request and variables
pub struct RunJob {
    source: Source<JobDefinition>,
    parameters: HashMap<String, String>,
}

impl RunJob {
    fn from_meta(meta: &JobEntryMeta) -> Result<Self> {
        Ok(Self {
            source: Source::from_config(meta, "job")?,
            parameters: parameter_values(meta)?,
        })
    }
}

#[async_trait]
impl JobEntry for RunJob {
    async fn execute(&self, previous: JobResult, ctx: &EntryContext) -> Result<JobResult> {
        let def = self.source.load().await?;
        let job = Job::prepare_nested(
            &ctx.engine,
            &def,
            Some(ctx.stop.clone()),
            &ctx.variables,
            &self.parameters,
        )?;
        let outcome = job.run(previous).await;
        let mut result = outcome.result;
        if let Some(e) = outcome.error {
            tracing::warn!("⚠️ Entry [{}]: nested job failed: {}", ctx.entry_name, e);
            result.success = false;
            if !result.log_text.is_empty() {
                result.log_text.push('\n');
            }
            result.log_text.push_str(&e.to_string());
        }
        Ok(result)
    }
}

/// Ends a branch successfully
pub struct Success;

#[async_trait]
impl JobEntry for Success {
    async fn execute(&self, mut previous: JobResult, _ctx: &EntryContext) -> Result<JobResult> {
        previous.nr_errors = 0;
        previous.success = true;
        Ok(previous)
    }
}

#[derive(Debug, Deserialize)]
struct AbortConfig {
    #[serde(default)]
    message: Option<String>,
}

/// Ends a branch with one error
pub struct Abort {
    message: Option<String>,
}

impl Abort {
    fn from_meta(meta: &JobEntryMeta) -> Result<Self> {
        let config: AbortConfig = parse_config(meta)?;
        Ok(Self { message: config.message })
    }
}

#[async_trait]
impl JobEntry for Abort {
    async fn execute(&self, mut previous: JobResult, ctx: &EntryContext) -> Result<JobResult> {
        let message = self
            .message
            .clone()
            .unwrap_or_else(|| format!("job '{}' aborted", ctx.job_name));
        tracing::error!("🛑 Entry [{}]: {}", ctx.entry_name, message);
        previous.nr_errors = 1;
        previous.success = false;
        previous.log_text = message;
        Ok(previous)
    }
}

/// Does nothing
pub struct Dummy;

#[async_trait]
impl JobEntry for Dummy {
    async fn execute(&self, previous: JobResult, _ctx: &EntryContext) -> Result<JobResult> {
        Ok(previous)
    }
}

#[derive(Debug, Deserialize)]
struct DelayConfig {
    ms: u64,
}

/// Waits for a fixed time; fails the branch when the job is stopped meanwhile
pub struct Delay {
    duration: Duration,
}

impl Delay {
    fn from_meta(meta: &JobEntryMeta) -> Result<Self> {
        let config: DelayConfig = parse_config(meta)?;
        Ok(Self {
            duration: Duration::from_millis(config.ms),
        })
    }
}

#[async_trait]
impl JobEntry for Delay {
    async fn execute(&self, mut previous: JobResult, ctx: &EntryContext) -> Result<JobResult> {
        tracing::debug!("⏳ Entry [{}] waits {:?}", ctx.entry_name, self.duration);
        previous.success = ctx.sleep(self.duration).await;
        Ok(previous)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn meta(entry_type: &str, config: serde_json::Value) -> JobEntryMeta {
        JobEntryMeta {
            name: "e".into(),
            entry_type: entry_type.into(),
            config,
            parallel: false,
            evaluates: None,
            reset_errors: true,
        }
    }

    #[test]
    fn start_repeat_configuration() {
        let start = Start::from_meta(&meta("START", json!({}))).unwrap();
        assert_eq!(start.repeat(), None);
        assert!(!start.evaluates());

        let start = Start::from_meta(&meta("START", json!({ "repeat": true, "interval_ms": 5 }))).unwrap();
        assert_eq!(start.repeat(), Some(Duration::from_millis(5)));
    }

    #[test]
    fn nested_sources_need_a_definition() {
        assert!(RunPipeline::from_meta(&meta("PIPELINE", json!({}))).is_err());
        assert!(RunPipeline::from_meta(&meta("PIPELINE", json!({ "file": "load.json" }))).is_ok());
        assert!(RunJob::from_meta(&meta("JOB", json!({ "job": { "name": "child" } }))).is_ok());
        assert!(RunJob::from_meta(&meta("JOB", json!({ "job": { "entries": 3 } }))).is_err());
    }

    #[test]
    fn nested_parameters_must_be_strings() {
        let ok = meta("JOB", json!({ "file": "child.json", "parameters": { "REGION": "us" } }));
        assert_eq!(RunJob::from_meta(&ok).unwrap().parameters["REGION"], "us");
        let bad = meta("PIPELINE", json!({ "file": "load.json", "parameters": { "LIMIT": 5 } }));
        assert!(RunPipeline::from_meta(&bad).is_err());
    }

    #[test]
    fn delay_requires_duration() {
        assert!(Delay::from_meta(&meta("DELAY", json!({}))).is_err());
        assert!(Delay::from_meta(&meta("DELAY", json!({ "ms": 10 }))).is_ok());
    }
}
