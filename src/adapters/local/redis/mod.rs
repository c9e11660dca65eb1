//! Redis adapter for local deployment.
//!
//! Provides the Redis-backed `JobQueuePort`. The backend pushes jobs as JSON
//! documents onto a list and asks for cancellation by setting a per-job key;
//! terminal outcomes are stored per job for the backend to pick up.

mod pool;
mod queue;

pub use pool::RedisPool;

/// Redis key constants
const RENDER_QUEUE: &str = "overlayer:render_jobs";
const JOB_RESULT_PREFIX: &str = "overlayer:job_result:";
const CANCEL_PREFIX: &str = "overlayer:cancel:";
/// Results expire after a day.
const JOB_RESULT_TTL_SECS: u64 = 24 * 60 * 60;
