//! Configuration for the render worker.

use crate::adapters::local::chrome::ChromeConfig;
use crate::adapters::local::ffmpeg::FfmpegConfig;
use crate::domain::av::encoder::IntermediateCodec;
use crate::domain::progress::ProgressRange;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// What happens to a chunk that is mid-render when its job is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CancelMode {
    /// Let the chunk finish, then stop before the next one.
    #[default]
    FinishChunk,
    /// Stop after the current frame and abort the chunk's encoder.
    AbortChunk,
}

impl FromStr for CancelMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "finish_chunk" | "finish" => Ok(CancelMode::FinishChunk),
            "abort_chunk" | "abort" => Ok(CancelMode::AbortChunk),
            other => Err(format!("unknown cancel mode '{}'", other)),
        }
    }
}

/// Share of the 0-100 progress scale given to each step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressPlan {
    pub initializing: ProgressRange,
    pub rendering: ProgressRange,
    pub merging: ProgressRange,
    pub compositing: ProgressRange,
    pub uploading: ProgressRange,
}

impl Default for ProgressPlan {
    fn default() -> Self {
        Self {
            initializing: ProgressRange::new(0, 20),
            rendering: ProgressRange::new(20, 75),
            merging: ProgressRange::new(75, 80),
            compositing: ProgressRange::new(80, 95),
            uploading: ProgressRange::new(95, 100),
        }
    }
}

/// Tunables of the job orchestrator.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the per-job working directories.
    pub temp_dir: PathBuf,
    /// Used when a job does not carry its own chunk size.
    pub default_chunk_size: f64,
    /// Chunks rendered at once within a job. Capped by the pool size.
    pub chunk_parallelism: usize,
    /// Jobs allowed to run at once in this process.
    pub max_concurrent_jobs: usize,
    /// Extra attempts for a failed frame capture.
    pub capture_retries: u32,
    pub upload_attempts: u32,
    /// Backoff before retry `n` is `upload_backoff * 2^(n-1)`.
    pub upload_backoff: Duration,
    pub chunk_timeout: Duration,
    pub merge_timeout: Duration,
    pub composite_timeout: Duration,
    pub upload_timeout: Duration,
    pub cancel_mode: CancelMode,
    /// Output key is `<prefix>/<job_id>/output.<ext>`.
    pub upload_prefix: String,
    pub progress: ProgressPlan,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            temp_dir: env::temp_dir().join("render"),
            default_chunk_size: 10.0,
            chunk_parallelism: 4,
            max_concurrent_jobs: 3,
            capture_retries: 2,
            upload_attempts: 3,
            upload_backoff: Duration::from_secs(1),
            chunk_timeout: Duration::from_secs(600),
            merge_timeout: Duration::from_secs(600),
            composite_timeout: Duration::from_secs(1800),
            upload_timeout: Duration::from_secs(900),
            cancel_mode: CancelMode::default(),
            upload_prefix: "rendered".to_string(),
            progress: ProgressPlan::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub pool_size: usize,
    /// Attempts at creating one renderer before giving up.
    pub create_attempts: u32,
    pub create_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            create_attempts: 3,
            create_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct NotifierConfig {
    pub attempts: u32,
    pub attempt_timeout: Duration,
    /// Backoff before retry `n` is `backoff_base * 2^n`.
    pub backoff_base: Duration,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            attempts: 3,
            attempt_timeout: Duration::from_secs(30),
            backoff_base: Duration::from_secs(1),
        }
    }
}

/// Everything the worker binary reads from the environment.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub redis_url: String,
    pub temp_dir: PathBuf,
    /// Root directory of the local storage adapter.
    pub storage_root: PathBuf,
    /// Prefix for locators returned by uploads. Defaults to `file://` paths.
    pub public_base_url: Option<String>,
    /// Lifecycle events are POSTed here. Notifications are off when unset.
    pub callback_url: Option<String>,
    pub callback_retry_count: u32,
    pub callback_timeout: Duration,
    pub max_concurrent_jobs: usize,
    pub browser_pool_size: usize,
    pub browser_timeout: Duration,
    pub chrome_path: PathBuf,
    pub render_page_url: String,
    pub use_gpu_encoding: bool,
    pub intermediate_codec: IntermediateCodec,
    pub chunk_size_seconds: f64,
    pub rendering_timeout: Duration,
    pub chunk_timeout: Duration,
    pub merge_timeout: Duration,
    pub upload_timeout: Duration,
    pub cancel_mode: CancelMode,
    /// How often running jobs are checked for cancellation requests.
    pub cancel_poll_interval: Duration,
    pub log_level: String,
    #[cfg(feature = "aws")]
    pub s3_bucket: Option<String>,
}

fn env_parse<T>(key: &str, default: T) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(e) => {
                warn!("Ignoring invalid {}={:?}: {}", key, raw, e);
                default
            }
        },
        Err(_) => default,
    }
}

fn env_string(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| String::from(default))
}

fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl WorkerConfig {
    /// Load configuration from `.env` and environment variables.
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        Self {
            redis_url: env_string("REDIS_URL", "redis://127.0.0.1/"),
            temp_dir: PathBuf::from(env_string("TEMP_DIR", "/tmp/render")),
            storage_root: PathBuf::from(env_string("STORAGE_ROOT", "./storage")),
            public_base_url: env_optional("PUBLIC_BASE_URL"),
            callback_url: env_optional("BACKEND_CALLBACK_URL"),
            callback_retry_count: env_parse("CALLBACK_RETRY_COUNT", 3),
            callback_timeout: Duration::from_secs(env_parse("CALLBACK_TIMEOUT", 30)),
            max_concurrent_jobs: env_parse("MAX_CONCURRENT_JOBS", 3),
            browser_pool_size: env_parse("BROWSER_POOL_SIZE", 4),
            browser_timeout: Duration::from_millis(env_parse("BROWSER_TIMEOUT", 60_000)),
            chrome_path: PathBuf::from(env_string("CHROME_PATH", "chromium")),
            render_page_url: env_string("RENDER_PAGE_URL", "http://localhost:3001/render"),
            use_gpu_encoding: env_parse("USE_GPU_ENCODING", true),
            intermediate_codec: env_parse("INTERMEDIATE_CODEC", IntermediateCodec::default()),
            chunk_size_seconds: env_parse("CHUNK_SIZE_SECONDS", 10.0),
            rendering_timeout: Duration::from_secs(env_parse("RENDERING_TIMEOUT", 1800)),
            chunk_timeout: Duration::from_secs(env_parse("CHUNK_TIMEOUT", 600)),
            merge_timeout: Duration::from_secs(env_parse("MERGE_TIMEOUT", 600)),
            upload_timeout: Duration::from_secs(env_parse("UPLOAD_TIMEOUT", 900)),
            cancel_mode: env_parse("CANCEL_MODE", CancelMode::default()),
            cancel_poll_interval: Duration::from_millis(env_parse("CANCEL_POLL_INTERVAL", 2_000)),
            log_level: env_string("LOG_LEVEL", "info"),
            #[cfg(feature = "aws")]
            s3_bucket: env_optional("S3_BUCKET"),
        }
    }

    pub fn pipeline(&self) -> PipelineConfig {
        PipelineConfig {
            temp_dir: self.temp_dir.clone(),
            default_chunk_size: self.chunk_size_seconds,
            chunk_parallelism: self.browser_pool_size.max(1),
            max_concurrent_jobs: self.max_concurrent_jobs.max(1),
            chunk_timeout: self.chunk_timeout,
            merge_timeout: self.merge_timeout,
            composite_timeout: self.rendering_timeout,
            upload_timeout: self.upload_timeout,
            cancel_mode: self.cancel_mode,
            ..PipelineConfig::default()
        }
    }

    pub fn pool(&self) -> PoolConfig {
        PoolConfig {
            pool_size: self.browser_pool_size.max(1),
            ..PoolConfig::default()
        }
    }

    pub fn notifier(&self) -> NotifierConfig {
        NotifierConfig {
            attempts: self.callback_retry_count.max(1),
            attempt_timeout: self.callback_timeout,
            ..NotifierConfig::default()
        }
    }

    pub fn chrome(&self) -> ChromeConfig {
        ChromeConfig {
            chrome_path: self.chrome_path.clone(),
            render_page_url: self.render_page_url.clone(),
            timeout: self.browser_timeout,
        }
    }

    pub fn ffmpeg(&self) -> FfmpegConfig {
        FfmpegConfig {
            intermediate: self.intermediate_codec,
            prefer_hardware: self.use_gpu_encoding,
            ..FfmpegConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_mode_from_str() {
        assert_eq!("abort_chunk".parse(), Ok(CancelMode::AbortChunk));
        assert_eq!("FINISH_CHUNK".parse(), Ok(CancelMode::FinishChunk));
        assert!("later".parse::<CancelMode>().is_err());
    }

    #[test]
    fn test_default_progress_plan_is_contiguous() {
        let plan = ProgressPlan::default();
        let ranges = [
            plan.initializing,
            plan.rendering,
            plan.merging,
            plan.compositing,
            plan.uploading,
        ];
        assert_eq!(ranges[0].start, 0);
        assert_eq!(ranges[4].end, 100);
        for pair in ranges.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        env::set_var("OVERLAYER_TEST_POOL", "many");
        assert_eq!(env_parse("OVERLAYER_TEST_POOL", 4usize), 4);
        env::set_var("OVERLAYER_TEST_POOL", "2");
        assert_eq!(env_parse("OVERLAYER_TEST_POOL", 4usize), 2);
        env::remove_var("OVERLAYER_TEST_POOL");
    }
}
