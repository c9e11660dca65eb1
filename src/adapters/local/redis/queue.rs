//! Redis JobQueuePort implementation.

use super::pool::RedisPool;
use super::{CANCEL_PREFIX, JOB_RESULT_PREFIX, JOB_RESULT_TTL_SECS, RENDER_QUEUE};
use crate::domain::jobs::{JobOutcome, RenderJob};
use crate::ports::queue::{JobQueuePort, QueueError};
use async_trait::async_trait;
use deadpool_redis::redis::{self, AsyncCommands};
use tracing::{debug, info, warn};

fn backend(e: impl std::fmt::Display) -> QueueError {
    QueueError::Backend(e.to_string())
}

fn cancel_key(job_id: &str) -> String {
    format!("{}{}", CANCEL_PREFIX, job_id)
}

#[async_trait]
impl JobQueuePort for RedisPool {
    async fn dequeue_job(&self, timeout_secs: f64) -> Result<Option<RenderJob>, QueueError> {
        let mut conn = self.pool.get().await.map_err(backend)?;
        let result: Option<(String, String)> = conn
            .brpop(RENDER_QUEUE, timeout_secs)
            .await
            .map_err(backend)?;
        let Some((_, json)) = result else {
            return Ok(None);
        };
        match serde_json::from_str::<RenderJob>(&json) {
            Ok(job) => {
                debug!(job_id = %job.job_id, "Dequeued job");
                Ok(Some(job))
            }
            Err(e) => {
                // Dropped rather than retried: it would fail the same way again.
                warn!("Discarding malformed job payload: {}", e);
                Err(QueueError::Serialization(e))
            }
        }
    }

    async fn report_result(&self, outcome: &JobOutcome) -> Result<(), QueueError> {
        let mut conn = self.pool.get().await.map_err(backend)?;
        let key = format!("{}{}", JOB_RESULT_PREFIX, outcome.job_id());
        let json = serde_json::to_string(outcome)?;
        conn.set_ex::<_, _, ()>(&key, json, JOB_RESULT_TTL_SECS)
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn take_cancellations(&self, job_ids: &[String]) -> Result<Vec<String>, QueueError> {
        if job_ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.pool.get().await.map_err(backend)?;
        let keys: Vec<String> = job_ids.iter().map(|id| cancel_key(id)).collect();
        // Plain MGET: the typed helper turns a single key into GET.
        let flags: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&keys)
            .query_async(&mut conn)
            .await
            .map_err(backend)?;

        let requested: Vec<String> = job_ids
            .iter()
            .zip(flags)
            .filter_map(|(id, flag)| flag.map(|_| id.clone()))
            .collect();
        if !requested.is_empty() {
            let consumed: Vec<String> = requested.iter().map(|id| cancel_key(id)).collect();
            conn.del::<_, ()>(&consumed).await.map_err(backend)?;
            info!("Cancellation requested for {:?}", requested);
        }
        Ok(requested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_key() {
        assert_eq!(cancel_key("job-7"), "overlayer:cancel:job-7");
    }
}
