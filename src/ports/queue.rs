use crate::domain::jobs::{JobOutcome, RenderJob};
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
    #[error("malformed job payload: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobQueuePort: Send + Sync {
    /// Dequeue a job (blocking with timeout)
    /// timeout_secs: 0.0 for infinite (or long poll), >0.0 for specific timeout
    async fn dequeue_job(&self, timeout_secs: f64) -> Result<Option<RenderJob>, QueueError>;

    /// Hand the terminal result of a job back to the queue
    async fn report_result(&self, outcome: &JobOutcome) -> Result<(), QueueError>;

    /// Which of `job_ids` have a pending cancellation request. Returned
    /// requests are consumed.
    async fn take_cancellations(&self, job_ids: &[String]) -> Result<Vec<String>, QueueError>;
}
