use crate::domain::jobs::JobEvent;
use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("notification rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
    #[error("notification delivery failed: {0}")]
    Delivery(String),
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotifierPort: Send + Sync {
    /// Deliver one lifecycle event. Called once per attempt; retries are the caller's concern.
    async fn notify(&self, event: &JobEvent) -> Result<(), NotifyError>;
}
