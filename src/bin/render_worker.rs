//! Render worker binary.
//!
//! Wires up:
//! - Storage (local filesystem, or S3 with the `aws` feature and `S3_BUCKET`)
//! - Redis job queue and the backend callback notifier
//! - Headless Chromium renderer pool and ffmpeg media tooling
//! - The job orchestrator and the queue-driven worker loop

use anyhow::Context;
use overlayer::adapters::local::{
    ChromeSurfaceFactory, FfmpegMedia, LocalStorage, RedisPool, WebhookNotifier,
};
use overlayer::application::pool::RendererPool;
use overlayer::application::worker::WorkerService;
use overlayer::config::WorkerConfig;
use overlayer::ports::storage::StoragePort;
use overlayer::JobOrchestrator;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::from_env();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("overlayer={0},render_worker={0}", config.log_level)));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    tokio::fs::create_dir_all(&config.temp_dir)
        .await
        .with_context(|| format!("creating {}", config.temp_dir.display()))?;

    #[cfg(feature = "aws")]
    if let Some(bucket) = config.s3_bucket.clone() {
        info!("Using S3 bucket {}", bucket);
        let storage = overlayer::adapters::aws::S3Storage::from_env(bucket).await;
        return run(config, Arc::new(storage)).await;
    }

    info!("Using local storage at {}", config.storage_root.display());
    let storage = LocalStorage::new(config.storage_root.clone(), config.public_base_url.clone());
    run(config, Arc::new(storage)).await
}

async fn run<S: StoragePort + 'static>(config: WorkerConfig, storage: Arc<S>) -> anyhow::Result<()> {
    let queue = Arc::new(RedisPool::new(&config.redis_url).context("connecting to Redis")?);

    let notifier = WebhookNotifier::new(config.callback_url.clone(), config.callback_timeout);
    if !notifier.is_enabled() {
        warn!("BACKEND_CALLBACK_URL is not set, lifecycle callbacks are disabled");
    }

    let media = FfmpegMedia::new(config.ffmpeg());
    let pool = Arc::new(RendererPool::new(
        Arc::new(ChromeSurfaceFactory::new(config.chrome())),
        config.pool(),
    ));

    let orchestrator = Arc::new(JobOrchestrator::new(
        storage,
        Arc::new(media),
        pool.clone(),
        Arc::new(notifier),
        config.notifier(),
        config.pipeline(),
    ));
    let worker = WorkerService::new(orchestrator.clone(), queue)
        .with_cancel_poll(config.cancel_poll_interval);

    let shutdown = CancellationToken::new();
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested, finishing running jobs");
            signal.cancel();
        }
    });

    info!(
        "Render worker up: {} job(s) at once, {} renderer(s)",
        config.max_concurrent_jobs,
        pool.pool_size()
    );
    worker.run(shutdown).await;
    pool.shutdown().await;
    orchestrator.flush_notifications().await;
    info!("Render worker stopped");
    Ok(())
}
