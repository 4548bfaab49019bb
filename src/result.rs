/// Result aggregate passed along pipelines and jobs
///
/// Every job entry receives a copy of the incoming result and returns a new one.
/// The row list is shared behind an `Arc` and only cloned when an entry actually
/// changes it, so downstream entries read the rows of their predecessors without
/// ever mutating them in place.

use crate::error::EngineError;
use crate::row::ResultRow;
use serde::{Serialize, Serializer};
use std::sync::Arc;

/// Aggregate outcome of a job entry, a job branch or a whole job
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobResult {
    /// Sequence number of the branch invocation that produced this result
    pub entry_nr: u64,
    /// Boolean outcome evaluated by conditional hops
    pub success: bool,
    /// Number of errors accumulated so far
    pub nr_errors: u64,
    pub lines_read: u64,
    pub lines_written: u64,
    pub lines_input: u64,
    pub lines_output: u64,
    pub lines_updated: u64,
    pub lines_rejected: u64,
    /// True when the producing run was interrupted by a stop request
    pub stopped: bool,
    pub exit_status: i32,
    pub log_text: String,
    /// Rows carried from entry to entry
    #[serde(serialize_with = "serialize_rows")]
    pub rows: Arc<Vec<ResultRow>>,
}

fn serialize_rows<S: Serializer>(rows: &Arc<Vec<ResultRow>>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.collect_seq(rows.iter().map(|row| row.to_json()))
}

impl JobResult {
    pub fn new() -> Self {
        Self::default()
    }

    /// Successful, empty result
    pub fn successful() -> Self {
        Self {
            success: true,
            ..Self::default()
        }
    }

    /// Result returned by a branch that observed the stop flag
    pub fn stopped(entry_nr: u64) -> Self {
        Self {
            entry_nr,
            stopped: true,
            ..Self::default()
        }
    }

    /// Mutable access to the row list, cloning it first if it is shared
    pub fn rows_mut(&mut self) -> &mut Vec<ResultRow> {
        Arc::make_mut(&mut self.rows)
    }

    /// Replace the row list
    pub fn set_rows(&mut self, rows: Vec<ResultRow>) {
        self.rows = Arc::new(rows);
    }

    /// Sum line counters of `other` into `self`, leaving errors and flags untouched
    pub fn add_lines(&mut self, other: &JobResult) {
        self.lines_read += other.lines_read;
        self.lines_written += other.lines_written;
        self.lines_input += other.lines_input;
        self.lines_output += other.lines_output;
        self.lines_updated += other.lines_updated;
        self.lines_rejected += other.lines_rejected;
    }

    /// Merge a branch result: sum counters and errors, append rows, AND success,
    /// OR stopped.
    pub fn merge(&mut self, other: &JobResult) {
        self.add_lines(other);
        self.nr_errors += other.nr_errors;
        self.success = self.success && other.success;
        self.stopped = self.stopped || other.stopped;
        if !other.rows.is_empty() {
            self.rows_mut().extend(other.rows.iter().cloned());
        }
        if !other.log_text.is_empty() {
            if !self.log_text.is_empty() {
                self.log_text.push('\n');
            }
            self.log_text.push_str(&other.log_text);
        }
        if other.exit_status != 0 {
            self.exit_status = other.exit_status;
        }
    }
    /// Merge a branch that started from a copy of `base`, counting only what the
    /// branch added. Counters and rows inherited from `base` are already part of
    /// `self` and are not counted again.
    pub fn merge_branch(&mut self, base: &JobResult, branch: &JobResult) {
        self.lines_read += branch.lines_read.saturating_sub(base.lines_read);
        self.lines_written += branch.lines_written.saturating_sub(base.lines_written);
        self.lines_input += branch.lines_input.saturating_sub(base.lines_input);
        self.lines_output += branch.lines_output.saturating_sub(base.lines_output);
        self.lines_updated += branch.lines_updated.saturating_sub(base.lines_updated);
        self.lines_rejected += branch.lines_rejected.saturating_sub(base.lines_rejected);
        self.nr_errors += branch.nr_errors;
        self.success = self.success && branch.success;
        self.stopped = self.stopped || branch.stopped;

        let added: &[ResultRow] = if Arc::ptr_eq(&branch.rows, &base.rows) {
            &[]
        } else if branch.rows.starts_with(&base.rows) {
            &branch.rows[base.rows.len()..]
        } else {
            &branch.rows
        };
        if !added.is_empty() {
            self.rows_mut().extend(added.iter().cloned());
        }

        let log = match branch.log_text.strip_prefix(base.log_text.as_str()) {
            Some(rest) if !base.log_text.is_empty() => rest.trim_start_matches('\n'),
            _ => branch.log_text.as_str(),
        };
        if !log.is_empty() {
            if !self.log_text.is_empty() {
                self.log_text.push('\n');
            }
            self.log_text.push_str(log);
        }
        if branch.exit_status != 0 {
            self.exit_status = branch.exit_status;
        }
    }
}

/// Final value of a top-level run together with the error that ended it, if any.
/// The result always reflects exactly what completed.
#[derive(Debug)]
pub struct RunOutcome<T> {
    pub result: T,
    pub error: Option<EngineError>,
}

impl<T> RunOutcome<T> {
    pub fn ok(result: T) -> Self {
        Self { result, error: None }
    }

    pub fn failed(result: T, error: EngineError) -> Self {
        Self {
            result,
            error: Some(error),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }

    /// Drop the partial result on failure
    pub fn into_result(self) -> Result<T, EngineError> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.result),
        }
    }
}
