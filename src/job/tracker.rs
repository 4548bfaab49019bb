/// Job tracker
///
/// Append-only log of job and entry start / finish records. Sequence numbers are
/// assigned under the lock, so records of parallel branches are totally ordered
/// and every "entry finished" record comes after its "entry started" record.
/// Only the last `max_records` records are kept.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerEventKind {
    JobStarted,
    EntryStarted,
    EntryFinished,
    JobFinished,
}

/// One line of the tracker
#[derive(Debug, Clone, Serialize)]
pub struct TrackerRecord {
    pub sequence: u64,
    pub kind: TrackerEventKind,
    pub entry_name: String,
    pub entry_nr: u64,
    pub comment: String,
    pub reason: String,
    /// Outcome, for finished records
    pub success: Option<bool>,
    pub nr_errors: Option<u64>,
    pub logged_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct TrackerLog {
    next_sequence: u64,
    records: VecDeque<TrackerRecord>,
}

#[derive(Debug)]
pub struct JobTracker {
    job_name: String,
    /// 0 keeps everything
    max_records: usize,
    log: Mutex<TrackerLog>,
}

/// Fields of a record before it gets a sequence number
#[derive(Debug, Clone)]
pub struct TrackerEntry<'a> {
    pub kind: TrackerEventKind,
    pub entry_name: &'a str,
    pub entry_nr: u64,
    pub comment: &'a str,
    pub reason: &'a str,
    pub outcome: Option<(bool, u64)>,
}

impl JobTracker {
    pub fn new(job_name: &str, max_records: usize) -> Self {
        Self {
            job_name: job_name.to_string(),
            max_records,
            log: Mutex::new(TrackerLog::default()),
        }
    }

    pub fn job_name(&self) -> &str {
        &self.job_name
    }

    /// Append a record, dropping the oldest ones beyond the limit
    pub fn add(&self, entry: TrackerEntry<'_>) -> TrackerRecord {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let record = TrackerRecord {
            sequence: log.next_sequence,
            kind: entry.kind,
            entry_name: entry.entry_name.to_string(),
            entry_nr: entry.entry_nr,
            comment: entry.comment.to_string(),
            reason: entry.reason.to_string(),
            success: entry.outcome.map(|(success, _)| success),
            nr_errors: entry.outcome.map(|(_, errors)| errors),
            logged_at: Utc::now(),
        };
        log.next_sequence += 1;
        log.records.push_back(record.clone());
        if self.max_records > 0 {
            while log.records.len() > self.max_records {
                log.records.pop_front();
            }
        }
        record
    }

    /// Retained records in sequence order
    pub fn records(&self) -> Vec<TrackerRecord> {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.records.iter().cloned().collect()
    }

    /// Retained records of one kind
    pub fn records_of(&self, kind: TrackerEventKind) -> Vec<TrackerRecord> {
        let log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        log.records.iter().filter(|r| r.kind == kind).cloned().collect()
    }

    /// Total number of records ever added
    pub fn total_added(&self) -> u64 {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).next_sequence
    }

    pub fn len(&self) -> usize {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn started(name: &str) -> TrackerEntry<'_> {
        TrackerEntry {
            kind: TrackerEventKind::EntryStarted,
            entry_name: name,
            entry_nr: 1,
            comment: "start of job entry",
            reason: "start",
            outcome: None,
        }
    }

    #[test]
    fn keeps_only_the_last_records() {
        let tracker = JobTracker::new("job", 3);
        for i in 0..5 {
            tracker.add(started(&format!("e{}", i)));
        }
        let records = tracker.records();
        assert_eq!(records.len(), 3);
        assert_eq!(records[0].entry_name, "e2");
        assert_eq!(records[2].sequence, 4);
        assert_eq!(tracker.total_added(), 5);
    }

    #[test]
    fn zero_limit_keeps_everything() {
        let tracker = JobTracker::new("job", 0);
        for _ in 0..50 {
            tracker.add(started("e"));
        }
        assert_eq!(tracker.len(), 50);
    }

    #[test]
    fn concurrent_appends_get_unique_sequences() {
        let tracker = Arc::new(JobTracker::new("job", 0));
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.add(started("e"));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        let records = tracker.records();
        assert_eq!(records.len(), 400);
        assert!(records.windows(2).all(|w| w[0].sequence + 1 == w[1].sequence));
    }

    #[test]
    fn finished_records_carry_outcome() {
        let tracker = JobTracker::new("job", 10);
        tracker.add(TrackerEntry {
            kind: TrackerEventKind::EntryFinished,
            entry_name: "load",
            entry_nr: 2,
            comment: "job entry ended",
            reason: "",
            outcome: Some((false, 1)),
        });
        let finished = tracker.records_of(TrackerEventKind::EntryFinished);
        assert_eq!(finished[0].success, Some(false));
        assert_eq!(finished[0].nr_errors, Some(1));
    }
}
