/// Built-in transforms
///
/// Small set of generic row transforms:
/// - DataGrid: source emitting rows declared in its configuration
/// - RowGenerator: source emitting a sequence of rows, optionally until stopped
/// - Dummy: pass-through
/// - RowsToResult: collects rows into the pipeline result rows
/// - RowsFromResult: emits the rows of the previous job result
/// - RequireFields: rejects rows with missing values (supports error hops)
/// - Abort: fails the pipeline once a row threshold is reached

use crate::pipeline::transform::{ProcessOutcome, Transform, TransformContext, TransformError};
use crate::pipeline::types::TransformMeta;
use crate::plugins::registry::PluginRegistry;
use crate::row::{Field, ResultRow, Row, RowSchema, Value, ValueType};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;

/// Register every built-in transform
pub fn register(registry: &PluginRegistry) {
    registry.register_transform("DataGrid", |meta| Ok(Box::new(DataGrid::from_meta(meta)?)));
    registry.register_transform("RowGenerator", |meta| Ok(Box::new(RowGenerator::from_meta(meta)?)));
    registry.register_transform("Dummy", |_meta| Ok(Box::new(Dummy)));
    registry.register_transform("RowsToResult", |_meta| Ok(Box::new(RowsToResult)));
    registry.register_transform("RowsFromResult", |_meta| Ok(Box::new(RowsFromResult { next: 0 })));
    registry.register_transform("RequireFields", |meta| Ok(Box::new(RequireFields::from_meta(meta)?)));
    registry.register_transform("Abort", |meta| Ok(Box::new(Abort::from_meta(meta)?)));
}

/// Parse a transform's configuration, treating a missing one as empty
fn parse_config<T: for<'de> Deserialize<'de>>(meta: &TransformMeta) -> Result<T> {
    let raw = if meta.config.is_null() {
        serde_json::json!({})
    } else {
        meta.config.clone()
    };
    serde_json::from_value(raw).with_context(|| format!("invalid configuration of transform '{}'", meta.name))
}

/// Current row schema of a pass-through transform
fn input_schema(ctx: &TransformContext) -> Result<Arc<RowSchema>, TransformError> {
    ctx.input_schema()
        .cloned()
        .ok_or_else(|| TransformError::Fatal(anyhow!("no input schema known for '{}'", ctx.name())))
}

#[derive(Debug, Deserialize)]
struct GridConfig {
    #[serde(default)]
    fields: Vec<Field>,
    #[serde(default)]
    rows: Vec<Vec<serde_json::Value>>,
}

/// Emits the rows of its configuration, then finishes
pub struct DataGrid {
    schema: Arc<RowSchema>,
    rows: std::vec::IntoIter<Row>,
}

impl DataGrid {
    fn from_meta(meta: &TransformMeta) -> Result<Self> {
        let config: GridConfig = parse_config(meta)?;
        let schema = Arc::new(RowSchema::new(config.fields));
        let mut rows = Vec::with_capacity(config.rows.len());
        for (nr, raw) in config.rows.iter().enumerate() {
            if raw.len() != schema.len() {
                anyhow::bail!("row {} has {} values, expected {}", nr + 1, raw.len(), schema.len());
            }
            let values = raw
                .iter()
                .zip(schema.fields())
                .map(|(value, field)| {
                    Value::from_json(value, field.value_type)
                        .with_context(|| format!("row {}, field '{}'", nr + 1, field.name))
                })
                .collect::<Result<Vec<_>>>()?;
            rows.push(Row::new(values));
        }
        Ok(Self {
            schema,
            rows: rows.into_iter(),
        })
    }
}

#[async_trait]
impl Transform for DataGrid {
    async fn process_one(&mut self, ctx: &mut TransformContext) -> Result<ProcessOutcome, TransformError> {
        match self.rows.next() {
            Some(row) => {
                ctx.put_row(&self.schema, row).await?;
                Ok(ProcessOutcome::Continue)
            }
            None => Ok(ProcessOutcome::Done),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GeneratorConfig {
    #[serde(default = "default_limit")]
    limit: u64,
    #[serde(default)]
    never_ending: bool,
    #[serde(default = "default_sequence_field")]
    sequence_field: String,
    /// Pause between two rows
    #[serde(default)]
    interval_ms: u64,
}

fn default_limit() -> u64 {
    10
}

fn default_sequence_field() -> String {
    "id".to_string()
}

/// Emits rows with an increasing sequence number
pub struct RowGenerator {
    schema: Arc<RowSchema>,
    limit: Option<u64>,
    interval: Option<Duration>,
    next: u64,
}

impl RowGenerator {
    fn from_meta(meta: &TransformMeta) -> Result<Self> {
        let config: GeneratorConfig = parse_config(meta)?;
        Ok(Self {
            schema: Arc::new(RowSchema::new(vec![Field::new(config.sequence_field, ValueType::Integer)])),
            limit: (!config.never_ending).then_some(config.limit),
            interval: (config.interval_ms > 0).then(|| Duration::from_millis(config.interval_ms)),
            next: 1,
        })
    }
}

#[async_trait]
impl Transform for RowGenerator {
    async fn process_one(&mut self, ctx: &mut TransformContext) -> Result<ProcessOutcome, TransformError> {
        if self.limit.is_some_and(|limit| self.next > limit) {
            return Ok(ProcessOutcome::Done);
        }
        if let Some(interval) = self.interval {
            tokio::select! {
                _ = ctx.stop_token().cancelled() => return Ok(ProcessOutcome::Continue),
                _ = tokio::time::sleep(interval) => {}
            }
        }
        let row = Row::new(vec![Value::Integer(self.next as i64)]);
        ctx.put_row(&self.schema, row).await?;
        self.next += 1;
        Ok(ProcessOutcome::Continue)
    }
}

/// Passes every row through unchanged
pub struct Dummy;

#[async_trait]
impl Transform for Dummy {
    async fn process_one(&mut self, ctx: &mut TransformContext) -> Result<ProcessOutcome, TransformError> {
        let Some(row) = ctx.get_row().await? else {
            return Ok(ProcessOutcome::Done);
        };
        let schema = input_schema(ctx)?;
        ctx.put_row(&schema, row).await?;
        Ok(ProcessOutcome::Continue)
    }
}

/// Copies every row into the result rows of the pipeline and passes it on
pub struct RowsToResult;

#[async_trait]
impl Transform for RowsToResult {
    async fn process_one(&mut self, ctx: &mut TransformContext) -> Result<ProcessOutcome, TransformError> {
        let Some(row) = ctx.get_row().await? else {
            return Ok(ProcessOutcome::Done);
        };
        let schema = input_schema(ctx)?;
        ctx.add_result_row(ResultRow::new(schema.clone(), row.clone()));
        ctx.put_row(&schema, row).await?;
        Ok(ProcessOutcome::Continue)
    }
}

/// Emits the rows handed to the pipeline by the previous job entry
pub struct RowsFromResult {
    next: usize,
}

#[async_trait]
impl Transform for RowsFromResult {
    async fn process_one(&mut self, ctx: &mut TransformContext) -> Result<ProcessOutcome, TransformError> {
        let rows = ctx.previous_result_rows().clone();
        let Some(result_row) = rows.get(self.next) else {
            return Ok(ProcessOutcome::Done);
        };
        self.next += 1;
        ctx.counters().add_input(1);
        ctx.put_row(&result_row.schema, result_row.row.clone()).await?;
        Ok(ProcessOutcome::Continue)
    }
}

#[derive(Debug, Deserialize)]
struct RequireConfig {
    fields: Vec<String>,
}

/// Rejects rows where one of the configured fields is missing or null
pub struct RequireFields {
    fields: Vec<String>,
}

impl RequireFields {
    fn from_meta(meta: &TransformMeta) -> Result<Self> {
        let config: RequireConfig = parse_config(meta)?;
        if config.fields.is_empty() {
            anyhow::bail!("no fields to check");
        }
        Ok(Self { fields: config.fields })
    }
}

#[async_trait]
impl Transform for RequireFields {
    async fn process_one(&mut self, ctx: &mut TransformContext) -> Result<ProcessOutcome, TransformError> {
        let Some(row) = ctx.get_row().await? else {
            return Ok(ProcessOutcome::Done);
        };
        let schema = input_schema(ctx)?;
        let missing = self.fields.iter().find(|name| match schema.index_of(name) {
            Some(idx) => row.get(idx).map_or(true, Value::is_null),
            None => true,
        });
        if let Some(name) = missing {
            return Err(TransformError::row(&schema, row, format!("field '{}' is required", name)));
        }
        ctx.put_row(&schema, row).await?;
        Ok(ProcessOutcome::Continue)
    }

    fn supports_error_handling(&self) -> bool {
        true
    }
}

#[derive(Debug, Deserialize)]
struct AbortConfig {
    #[serde(default)]
    threshold: u64,
    #[serde(default)]
    message: Option<String>,
}

/// Fails once more than `threshold` rows arrived
pub struct Abort {
    threshold: u64,
    message: Option<String>,
    seen: u64,
}

impl Abort {
    fn from_meta(meta: &TransformMeta) -> Result<Self> {
        let config: AbortConfig = parse_config(meta)?;
        Ok(Self {
            threshold: config.threshold,
            message: config.message,
            seen: 0,
        })
    }
}

#[async_trait]
impl Transform for Abort {
    async fn process_one(&mut self, ctx: &mut TransformContext) -> Result<ProcessOutcome, TransformError> {
        let Some(row) = ctx.get_row().await? else {
            return Ok(ProcessOutcome::Done);
        };
        self.seen += 1;
        if self.seen > self.threshold {
            let message = self
                .message
                .clone()
                .unwrap_or_else(|| format!("row nr {} causing abort", self.seen));
            return Err(TransformError::Fatal(anyhow!(message)));
        }
        let schema = input_schema(ctx)?;
        ctx.put_row(&schema, row).await?;
        Ok(ProcessOutcome::Continue)
    }
}
