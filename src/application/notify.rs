//! Best-effort delivery of lifecycle events to the external notifier.
//!
//! Each job gets one delivery task so events reach the notifier in the order
//! they were produced. Stale progress events are coalesced while a slow
//! delivery is in flight; the terminal event is never dropped. Delivery
//! tasks outlive the job that produced them, so a slow backend never holds
//! a job slot.

use crate::config::NotifierConfig;
use crate::domain::jobs::JobEvent;
use crate::ports::notifier::NotifierPort;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub struct NotificationDispatcher<N> {
    notifier: Arc<N>,
    config: NotifierConfig,
    tasks: Mutex<JoinSet<()>>,
}

impl<N> NotificationDispatcher<N>
where
    N: NotifierPort + 'static,
{
    pub fn new(notifier: Arc<N>, config: NotifierConfig) -> Self {
        Self {
            notifier,
            config,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Start the ordered delivery channel for one job.
    pub fn start_job(&self, job_id: &str) -> JobNotifications {
        let (tx, mut rx) = mpsc::unbounded_channel::<JobEvent>();
        let notifier = self.notifier.clone();
        let config = self.config.clone();
        let job_id = job_id.to_string();

        let mut tasks = self.tasks.lock();
        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                error!("Notification task failed: {}", e);
            }
        }
        tasks.spawn(async move {
            while let Some(mut event) = rx.recv().await {
                while !event.is_terminal() {
                    match rx.try_recv() {
                        Ok(next) => event = next,
                        Err(_) => break,
                    }
                }
                deliver(notifier.as_ref(), &config, &event).await;
            }
            debug!(job_id = %job_id, "Notification channel closed");
        });

        JobNotifications { tx }
    }

    /// Number of jobs whose events are still being delivered.
    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Wait until every closed job channel has been fully delivered.
    pub async fn flush(&self) {
        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        if !tasks.is_empty() {
            info!("Waiting for notifications of {} job(s)", tasks.len());
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!("Notification task failed: {}", e);
            }
        }
    }
}

/// Try to deliver one event; failures are logged and swallowed.
pub async fn deliver<N: NotifierPort + ?Sized>(
    notifier: &N,
    config: &NotifierConfig,
    event: &JobEvent,
) -> bool {
    let attempts = config.attempts.max(1);
    for attempt in 0..attempts {
        match tokio::time::timeout(config.attempt_timeout, notifier.notify(event)).await {
            Ok(Ok(())) => {
                debug!(
                    job_id = %event.job_id,
                    "Delivered {} event ({}%)", event.status, event.progress
                );
                return true;
            }
            Ok(Err(e)) => warn!(
                job_id = %event.job_id,
                "Notification attempt {}/{} failed: {}",
                attempt + 1,
                attempts,
                e
            ),
            Err(_) => warn!(
                job_id = %event.job_id,
                "Notification attempt {}/{} timed out after {:?}",
                attempt + 1,
                attempts,
                config.attempt_timeout
            ),
        }
        if attempt + 1 < attempts {
            tokio::time::sleep(config.backoff_base * 2u32.pow(attempt)).await;
        }
    }
    error!(
        job_id = %event.job_id,
        "Giving up on {} notification after {} attempts", event.status, attempts
    );
    false
}

/// Sending half of a job's delivery channel.
pub struct JobNotifications {
    tx: mpsc::UnboundedSender<JobEvent>,
}

impl JobNotifications {
    pub fn send(&self, event: JobEvent) {
        if self.tx.send(event).is_err() {
            warn!("Notification task is gone, event dropped");
        }
    }

    /// Close the channel. Queued events are still delivered in the background.
    pub fn close(self) {
        drop(self.tx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::jobs::{JobOutcome, JobStatus};
    use crate::ports::notifier::{MockNotifierPort, NotifyError};
    use async_trait::async_trait;
    use mockall::Sequence;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn quick_config(attempts: u32) -> NotifierConfig {
        NotifierConfig {
            attempts,
            attempt_timeout: Duration::from_millis(50),
            backoff_base: Duration::from_millis(1),
        }
    }

    fn event(progress: u8) -> JobEvent {
        JobEvent::progress("job-1", JobStatus::Rendering, progress, None)
    }

    #[tokio::test]
    async fn test_deliver_retries_until_success() {
        let mut mock = MockNotifierPort::new();
        let mut seq = Sequence::new();
        mock.expect_notify()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_| Err(NotifyError::Delivery("connection refused".into())));
        mock.expect_notify()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        assert!(deliver(&mock, &quick_config(3), &event(30)).await);
    }

    #[tokio::test]
    async fn test_deliver_gives_up_after_bounded_attempts() {
        let mut mock = MockNotifierPort::new();
        mock.expect_notify().times(3).returning(|_| {
            Err(NotifyError::Rejected {
                status: 500,
                body: "oops".into(),
            })
        });

        assert!(!deliver(&mock, &quick_config(3), &event(30)).await);
    }

    struct SlowNotifier;

    #[async_trait]
    impl NotifierPort for SlowNotifier {
        async fn notify(&self, _event: &JobEvent) -> Result<(), NotifyError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_each_attempt_is_bounded_by_timeout() {
        let started = std::time::Instant::now();
        assert!(!deliver(&SlowNotifier, &quick_config(2), &event(10)).await);
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<JobEvent>>,
    }

    #[async_trait]
    impl NotifierPort for Recorder {
        async fn notify(&self, event: &JobEvent) -> Result<(), NotifyError> {
            self.events.lock().push(event.clone());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_terminal_event_is_delivered_last() {
        let recorder = Arc::new(Recorder::default());
        let dispatcher = NotificationDispatcher::new(recorder.clone(), quick_config(1));
        let job = dispatcher.start_job("job-1");

        for p in [20, 40, 60] {
            job.send(event(p));
        }
        job.send(JobEvent::terminal(
            &JobOutcome::Cancelled {
                job_id: "job-1".into(),
            },
            60,
        ));
        job.close();
        dispatcher.flush().await;
        assert_eq!(dispatcher.pending(), 0);

        let events = recorder.events.lock();
        assert!(!events.is_empty());
        assert_eq!(events.iter().filter(|e| e.is_terminal()).count(), 1);
        assert_eq!(events.last().unwrap().status, JobStatus::Cancelled);
        assert!(events.windows(2).all(|w| w[0].progress <= w[1].progress));
    }
}
