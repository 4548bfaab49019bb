/// Lifecycle flags and status text shared by pipelines and jobs
///
/// The lifecycle is a set of independent booleans toggled by explicit transitions,
/// never a packed bitmask. A run can be `stopped` and `finished` at the same time.

use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

/// Independent lifecycle flags of one pipeline or job run
#[derive(Debug, Default)]
pub struct ExecutionFlags {
    initialized: AtomicBool,
    active: AtomicBool,
    stopped: AtomicBool,
    paused: AtomicBool,
    finished: AtomicBool,
}

impl ExecutionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub fn set_initialized(&self, value: bool) {
        self.initialized.store(value, Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn set_active(&self, value: bool) {
        self.active.store(value, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn set_stopped(&self, value: bool) {
        self.stopped.store(value, Ordering::SeqCst);
    }

    /// Set the stopped flag, returning true only for the call that flipped it
    pub fn mark_stopped(&self) -> bool {
        !self.stopped.swap(true, Ordering::SeqCst)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn set_paused(&self, value: bool) {
        self.paused.store(value, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn set_finished(&self, value: bool) {
        self.finished.store(value, Ordering::SeqCst);
    }

    /// Derive the human readable status for the given error count
    pub fn status(&self, nr_errors: u64) -> ExecutionStatus {
        let with_errors = nr_errors > 0;
        if self.is_active() {
            if self.is_stopped() {
                ExecutionStatus::Halting
            } else if self.is_paused() {
                ExecutionStatus::Paused
            } else {
                ExecutionStatus::Running
            }
        } else if self.is_stopped() {
            ExecutionStatus::Stopped { with_errors }
        } else if self.is_finished() {
            ExecutionStatus::Finished { with_errors }
        } else {
            ExecutionStatus::Waiting
        }
    }

    /// Point-in-time copy of all flags
    pub fn snapshot(&self) -> FlagSnapshot {
        FlagSnapshot {
            initialized: self.is_initialized(),
            active: self.is_active(),
            stopped: self.is_stopped(),
            paused: self.is_paused(),
            finished: self.is_finished(),
        }
    }
}

/// Serializable copy of [`ExecutionFlags`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlagSnapshot {
    pub initialized: bool,
    pub active: bool,
    pub stopped: bool,
    pub paused: bool,
    pub finished: bool,
}

/// Status of a run as shown to operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Waiting,
    Running,
    Paused,
    Halting,
    Finished { with_errors: bool },
    Stopped { with_errors: bool },
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (text, with_errors) = match self {
            ExecutionStatus::Waiting => ("Waiting", false),
            ExecutionStatus::Running => ("Running", false),
            ExecutionStatus::Paused => ("Paused", false),
            ExecutionStatus::Halting => ("Halting", false),
            ExecutionStatus::Finished { with_errors } => ("Finished", *with_errors),
            ExecutionStatus::Stopped { with_errors } => ("Stopped", *with_errors),
        };
        if with_errors {
            write!(f, "{} (with errors)", text)
        } else {
            f.write_str(text)
        }
    }
}

impl Serialize for ExecutionStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}
