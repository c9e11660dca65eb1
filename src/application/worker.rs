use super::orchestrator::JobOrchestrator;
use crate::domain::jobs::JobOutcome;
use crate::ports::media::MediaPort;
use crate::ports::notifier::NotifierPort;
use crate::ports::queue::JobQueuePort;
use crate::ports::storage::StoragePort;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Pulls jobs off the queue and runs them under the orchestrator's job cap.
pub struct WorkerService<S, N, M, Q> {
    orchestrator: Arc<JobOrchestrator<S, N, M>>,
    queue: Arc<Q>,
    /// How long a single dequeue blocks before the loop re-checks shutdown.
    poll_timeout: Duration,
    /// How often running jobs are checked for cancellation requests.
    cancel_poll: Duration,
}

impl<S, N, M, Q> WorkerService<S, N, M, Q>
where
    S: StoragePort + 'static,
    N: NotifierPort + 'static,
    M: MediaPort + 'static,
    Q: JobQueuePort + 'static,
{
    pub fn new(orchestrator: Arc<JobOrchestrator<S, N, M>>, queue: Arc<Q>) -> Self {
        Self {
            orchestrator,
            queue,
            poll_timeout: Duration::from_secs(5),
            cancel_poll: Duration::from_secs(2),
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn with_cancel_poll(mut self, cancel_poll: Duration) -> Self {
        self.cancel_poll = cancel_poll;
        self
    }

    /// Run until `shutdown` fires, then wait for the jobs already started.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!("Worker started");
        let mut running = JoinSet::new();
        let watch_stop = CancellationToken::new();
        let watcher = tokio::spawn(watch_cancellations(
            self.orchestrator.clone(),
            self.queue.clone(),
            self.cancel_poll,
            watch_stop.clone(),
        ));

        while !shutdown.is_cancelled() {
            // A slot first, so nothing is taken off the queue beyond the cap.
            let permit = tokio::select! {
                permit = self.orchestrator.admit() => permit,
                _ = shutdown.cancelled() => break,
            };
            let permit = match permit {
                Ok(permit) => permit,
                Err(e) => {
                    error!("Job admission closed: {}", e);
                    break;
                }
            };

            // Not raced against shutdown: a popped job must not be dropped.
            let job = match self.queue.dequeue_job(self.poll_timeout.as_secs_f64()).await {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    warn!("Queue error: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(1)) => {}
                        _ = shutdown.cancelled() => break,
                    }
                    continue;
                }
            };

            info!(job_id = %job.job_id, "Dequeued job");
            let orchestrator = self.orchestrator.clone();
            let queue = self.queue.clone();
            running.spawn(async move {
                match orchestrator
                    .run_admitted(job, permit, CancellationToken::new())
                    .await
                {
                    Ok(outcome) => report(queue.as_ref(), &outcome).await,
                    Err(e) => warn!("Job not started: {}", e),
                }
            });

            while let Some(joined) = running.try_join_next() {
                if let Err(e) = joined {
                    error!("Job task panicked: {}", e);
                }
            }
        }

        if !running.is_empty() {
            info!("Waiting for {} running job(s) to finish", running.len());
        }
        while let Some(joined) = running.join_next().await {
            if let Err(e) = joined {
                error!("Job task panicked: {}", e);
            }
        }
        watch_stop.cancel();
        if let Err(e) = watcher.await {
            error!("Cancellation watcher panicked: {}", e);
        }
        info!("Worker stopped");
    }
}

/// Forward cancellation requests from the queue to the jobs they name.
async fn watch_cancellations<S, N, M, Q>(
    orchestrator: Arc<JobOrchestrator<S, N, M>>,
    queue: Arc<Q>,
    every: Duration,
    stop: CancellationToken,
) where
    S: StoragePort + 'static,
    N: NotifierPort + 'static,
    M: MediaPort + 'static,
    Q: JobQueuePort + 'static,
{
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.cancelled() => break,
        }
        let running = orchestrator.running_job_ids();
        if running.is_empty() {
            continue;
        }
        match queue.take_cancellations(&running).await {
            Ok(requested) => {
                for job_id in requested {
                    if !orchestrator.cancel(&job_id) {
                        debug!(job_id = %job_id, "Cancellation for a job that already finished");
                    }
                }
            }
            Err(e) => warn!("Failed to poll cancellation requests: {}", e),
        }
    }
}

async fn report<Q: JobQueuePort + ?Sized>(queue: &Q, outcome: &JobOutcome) {
    if let Err(e) = queue.report_result(outcome).await {
        error!(job_id = %outcome.job_id(), "Failed to report job result: {}", e);
    }
}
