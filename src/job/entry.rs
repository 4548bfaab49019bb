/// Job entry contract
///
/// Entry logic is created per invocation by the plugin registry. It receives a
/// copy of the incoming result and returns the result its successors will see.

use crate::engine::Engine;
use crate::result::JobResult;
use crate::variables::Variables;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[async_trait]
pub trait JobEntry: Send + Sync {
    /// Run the entry. An `Err` counts as one error and stops the current branch.
    async fn execute(&self, previous: JobResult, ctx: &EntryContext) -> anyhow::Result<JobResult>;

    /// Whether conditional hops may fire from this entry
    fn evaluates(&self) -> bool {
        true
    }

    /// Interval between executions when this is a repeating start entry
    fn repeat(&self) -> Option<Duration> {
        None
    }
}

/// What an entry may use while executing
#[derive(Debug, Clone)]
pub struct EntryContext {
    pub engine: Engine,
    pub job_name: String,
    pub entry_name: String,
    /// Sequence number of this invocation within the job run
    pub entry_nr: u64,
    /// Stop request of the job; nested pipelines and jobs derive theirs from it
    pub stop: CancellationToken,
    /// Variables of the job, inherited by nested pipelines and jobs
    pub variables: Arc<Variables>,
}

impl EntryContext {
    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Sleep unless the job is stopped first. Returns false when interrupted.
    pub async fn sleep(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.stop.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }
}
