/// Execution listeners
///
/// Lifecycle events of pipelines and jobs are delivered to every registered
/// [`ExecutionListener`]. A failing listener is logged and skipped; it never
/// aborts the run that produced the event.

use crate::pipeline::transform::TransformStatus;
use arc_swap::ArcSwap;
use serde::Serialize;
use std::sync::Arc;

/// Lifecycle event emitted by the engine
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    PipelineStarted {
        pipeline: String,
    },
    TransformFinished {
        pipeline: String,
        status: TransformStatus,
    },
    /// Periodic snapshot from the pipeline monitor
    Progress {
        pipeline: String,
        transforms: Vec<TransformStatus>,
    },
    PipelineFinished {
        pipeline: String,
        nr_errors: u64,
        stopped: bool,
    },
    JobStarted {
        job: String,
    },
    EntryStarted {
        job: String,
        entry: String,
        entry_nr: u64,
    },
    EntryFinished {
        job: String,
        entry: String,
        entry_nr: u64,
        success: bool,
        nr_errors: u64,
    },
    JobFinished {
        job: String,
        success: bool,
        nr_errors: u64,
        stopped: bool,
    },
}

/// Sink for lifecycle events
pub trait ExecutionListener: Send + Sync {
    fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()>;
}

/// Set of listeners shared by every run of an engine
///
/// Registration swaps the whole list atomically, so emitting never takes a lock.
#[derive(Clone, Default)]
pub struct Listeners {
    inner: Arc<ArcSwap<Vec<Arc<dyn ExecutionListener>>>>,
}

impl Listeners {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Arc<dyn ExecutionListener>) {
        self.inner.rcu(|current| {
            let mut next: Vec<Arc<dyn ExecutionListener>> = current.iter().cloned().collect();
            next.push(listener.clone());
            next
        });
    }

    pub fn len(&self) -> usize {
        self.inner.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver an event to every listener
    pub fn emit(&self, event: LifecycleEvent) {
        let listeners = self.inner.load();
        for listener in listeners.iter() {
            if let Err(e) = listener.on_event(&event) {
                tracing::warn!("⚠️ Execution listener failed on {:?}: {:#}", event, e);
            }
        }
    }
}

impl std::fmt::Debug for Listeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("count", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Collect(Mutex<Vec<String>>);

    impl ExecutionListener for Collect {
        fn on_event(&self, event: &LifecycleEvent) -> anyhow::Result<()> {
            let json = serde_json::to_value(event)?;
            self.0.lock().unwrap().push(json["event"].as_str().unwrap_or_default().to_string());
            Ok(())
        }
    }

    struct Broken;

    impl ExecutionListener for Broken {
        fn on_event(&self, _event: &LifecycleEvent) -> anyhow::Result<()> {
            anyhow::bail!("sink unavailable")
        }
    }

    #[test]
    fn failing_listener_does_not_block_others() {
        let listeners = Listeners::new();
        let collect = Arc::new(Collect(Mutex::new(Vec::new())));
        listeners.add(Arc::new(Broken));
        listeners.add(collect.clone());
        assert_eq!(listeners.len(), 2);

        listeners.emit(LifecycleEvent::JobStarted { job: "nightly".into() });
        listeners.emit(LifecycleEvent::JobFinished {
            job: "nightly".into(),
            success: true,
            nr_errors: 0,
            stopped: false,
        });

        assert_eq!(
            *collect.0.lock().unwrap(),
            vec!["job_started".to_string(), "job_finished".to_string()]
        );
    }
}
