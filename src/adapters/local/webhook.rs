//! Backend callback notifier: POSTs each lifecycle event as JSON.

use crate::domain::jobs::JobEvent;
use crate::ports::notifier::{NotifierPort, NotifyError};
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

pub struct WebhookNotifier {
    client: Client,
    /// Notifications are disabled when there is nowhere to send them.
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.filter(|u| !u.trim().is_empty()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.url.is_some()
    }
}

#[async_trait]
impl NotifierPort for WebhookNotifier {
    async fn notify(&self, event: &JobEvent) -> Result<(), NotifyError> {
        let Some(url) = &self.url else {
            debug!(job_id = %event.job_id, "No callback URL, skipping {} event", event.status);
            return Ok(());
        };

        let response = self
            .client
            .post(url)
            .json(event)
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!(job_id = %event.job_id, "Callback accepted {} event", event.status);
        Ok(())
    }
}
