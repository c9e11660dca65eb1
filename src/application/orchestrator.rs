//! Runs one render job end to end: download, plan, render chunks in parallel,
//! merge, composite, upload. Emits lifecycle events along the way and always
//! finishes with exactly one terminal event.

use super::events::EventHub;
use super::notify::{JobNotifications, NotificationDispatcher};
use super::pool::RendererPool;
use super::renderer::FrameRenderer;
use crate::config::{CancelMode, NotifierConfig, PipelineConfig};
use crate::domain::av::compositor::{self, CompositeRequest};
use crate::domain::av::encoder::{EncodeSettings, EncodedSegment};
use crate::domain::chunks::{self, Chunk};
use crate::domain::jobs::{JobEvent, JobFailure, JobOutcome, JobStatus, RenderJob};
use crate::domain::progress::{ProgressTracker, WeightedCompletion};
use crate::error::RenderError;
use crate::ports::media::{FrameSink, MediaPort};
use crate::ports::notifier::NotifierPort;
use crate::ports::storage::{StorageError, StoragePort};
use crate::ports::surface::RenderSurface;
use futures::stream::{FuturesUnordered, StreamExt};
use futures::{pin_mut, Future, TryStreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// How long a timed-out step gets to stop after being cancelled.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Proof that a job fits under the concurrent job cap.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

pub struct JobOrchestrator<S, N, M> {
    storage: Arc<S>,
    media: Arc<M>,
    pool: Arc<RendererPool>,
    notifications: NotificationDispatcher<N>,
    events: Arc<EventHub>,
    renderer: FrameRenderer,
    config: PipelineConfig,
    admission: Arc<Semaphore>,
    active: Mutex<HashMap<String, CancellationToken>>,
}

impl<S, N, M> JobOrchestrator<S, N, M>
where
    S: StoragePort + 'static,
    N: NotifierPort + 'static,
    M: MediaPort + 'static,
{
    pub fn new(
        storage: Arc<S>,
        media: Arc<M>,
        pool: Arc<RendererPool>,
        notifier: Arc<N>,
        notifier_config: NotifierConfig,
        config: PipelineConfig,
    ) -> Self {
        Self {
            storage,
            media,
            pool,
            notifications: NotificationDispatcher::new(notifier, notifier_config),
            events: Arc::new(EventHub::new()),
            renderer: FrameRenderer::new(config.capture_retries),
            admission: Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1))),
            config,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Receive every lifecycle event of every job run by this orchestrator.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Take a job slot if one is free right now.
    pub fn try_admit(&self) -> Option<AdmissionPermit> {
        self.admission
            .clone()
            .try_acquire_owned()
            .ok()
            .map(|permit| AdmissionPermit { _permit: permit })
    }

    /// Wait until a job slot frees up.
    pub async fn admit(&self) -> Result<AdmissionPermit, RenderError> {
        self.admission
            .clone()
            .acquire_owned()
            .await
            .map(|permit| AdmissionPermit { _permit: permit })
            .map_err(|_| RenderError::AtCapacity)
    }

    /// Number of jobs currently running.
    pub fn active_jobs(&self) -> usize {
        self.active.lock().len()
    }

    /// Ids of the jobs currently running.
    pub fn running_job_ids(&self) -> Vec<String> {
        self.active.lock().keys().cloned().collect()
    }

    /// Wait for lifecycle events of finished jobs to be delivered.
    pub async fn flush_notifications(&self) {
        self.notifications.flush().await;
    }

    /// Request cooperative cancellation of a running job.
    pub fn cancel(&self, job_id: &str) -> bool {
        match self.active.lock().get(job_id) {
            Some(token) => {
                info!(job_id = %job_id, "Cancellation requested");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Run `job` to completion, refusing it when the job cap is reached.
    pub async fn submit(&self, job: RenderJob) -> Result<JobOutcome, RenderError> {
        self.submit_with_cancel(job, CancellationToken::new()).await
    }

    pub async fn submit_with_cancel(
        &self,
        job: RenderJob,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, RenderError> {
        let permit = self.try_admit().ok_or_else(|| {
            warn!(job_id = %job.job_id, "Refusing job: concurrent job limit reached");
            RenderError::AtCapacity
        })?;
        self.run_admitted(job, permit, cancel).await
    }

    /// Run an already admitted job to a terminal outcome. Only refused,
    /// with `DuplicateJob`, when a job with the same id is still running.
    pub async fn run_admitted(
        &self,
        job: RenderJob,
        permit: AdmissionPermit,
        cancel: CancellationToken,
    ) -> Result<JobOutcome, RenderError> {
        let job_id = job.job_id.clone();
        {
            let mut active = self.active.lock();
            if active.contains_key(&job_id) {
                warn!(job_id = %job_id, "Refusing job: already running");
                return Err(RenderError::DuplicateJob(job_id));
            }
            active.insert(job_id.clone(), cancel.clone());
        }

        let span = info_span!("job", job_id = %job_id);
        let outcome = async move {
            let reporter = JobReporter::new(
                &job_id,
                self.notifications.start_job(&job_id),
                self.events.clone(),
            );
            info!(
                "Starting render: {} @ {} fps -> {}",
                job.resolution,
                job.fps,
                job.output_format.extension()
            );

            let result = match job.validate() {
                Ok(()) => {
                    let workspace = self.config.temp_dir.join(&job.job_id);
                    let result = self.execute(&job, &workspace, &reporter, &cancel).await;
                    remove_workspace(&workspace).await;
                    result
                }
                Err(e) => Err(e),
            };

            let outcome = match result {
                Ok(output_locator) => {
                    info!("Render completed: {}", output_locator);
                    JobOutcome::Success {
                        job_id: job_id.clone(),
                        output_locator,
                    }
                }
                Err(e) if e.is_cancelled() => {
                    info!("Render cancelled during {}", reporter.status());
                    JobOutcome::Cancelled {
                        job_id: job_id.clone(),
                    }
                }
                Err(e) => {
                    let failure = JobFailure::from_error(reporter.status(), &e);
                    error!(
                        step = %failure.step,
                        chunk = ?failure.chunk_index,
                        "Render failed: {}", e
                    );
                    JobOutcome::Failure {
                        job_id: job_id.clone(),
                        failure,
                    }
                }
            };

            self.active.lock().remove(&job_id);
            drop(permit);
            reporter.finish(&outcome);
            outcome
        }
        .instrument(span)
        .await;
        Ok(outcome)
    }

    async fn execute(
        &self,
        job: &RenderJob,
        workspace: &Path,
        reporter: &JobReporter,
        cancel: &CancellationToken,
    ) -> Result<String, RenderError> {
        let plan = self.config.progress;

        // Initializing
        checkpoint(cancel)?;
        reporter.transition(JobStatus::Initializing, plan.initializing.at(0.0));
        tokio::fs::create_dir_all(workspace).await?;
        let source = workspace.join(format!("source.{}", source_extension(&job.source_video_ref)));
        self.download_source(&job.source_video_ref, &source, cancel)
            .await?;
        reporter.progress(plan.initializing.at(0.5));

        let info = self.media.probe(&source).await?;
        compositor::check_geometry(job.resolution, job.fps, &info)?;
        let chunk_size = job
            .chunk_size_seconds
            .unwrap_or(self.config.default_chunk_size);
        let chunks = chunks::plan(info.duration, chunk_size)?;
        info!(
            "Source is {:.3}s, {} chunks of {}s",
            info.duration,
            chunks.len(),
            chunk_size
        );
        reporter.progress(plan.initializing.at(1.0));

        // Rendering
        checkpoint(cancel)?;
        reporter.transition(JobStatus::Rendering, plan.rendering.at(0.0));
        let segments = self.render_chunks(job, &chunks, workspace, reporter, cancel).await?;

        // Merging
        checkpoint(cancel)?;
        reporter.transition(JobStatus::Merging, plan.merging.at(0.0));
        let overlay = workspace.join(format!("overlay.{}", self.media.segment_extension()));
        {
            let media = self.media.as_ref();
            let (segments, overlay) = (&segments, &overlay);
            run_step(
                JobStatus::Merging,
                self.config.merge_timeout,
                cancel,
                |token| async move { media.merge(segments, overlay, &token).await },
            )
            .await?;
        }

        // Compositing
        checkpoint(cancel)?;
        reporter.transition(JobStatus::Compositing, plan.compositing.at(0.0));
        let output = workspace.join(format!("output.{}", job.output_format.extension()));
        let request = CompositeRequest {
            source,
            overlay,
            output: output.clone(),
            format: job.output_format,
            resolution: job.resolution,
            fps: job.fps,
        };
        {
            let media = self.media.as_ref();
            let request = &request;
            let range = plan.compositing;
            let on_progress = move |fraction: f64| reporter.progress(range.at(fraction));
            let on_progress = &on_progress;
            run_step(
                JobStatus::Compositing,
                self.config.composite_timeout,
                cancel,
                |token| async move { media.composite(request, on_progress, &token).await },
            )
            .await?;
        }

        // Uploading
        checkpoint(cancel)?;
        reporter.transition(JobStatus::Uploading, plan.uploading.at(0.0));
        let key = format!(
            "{}/{}/output.{}",
            self.config.upload_prefix,
            job.job_id,
            job.output_format.extension()
        );
        let (output, key) = (&output, &key);
        run_step(
            JobStatus::Uploading,
            self.config.upload_timeout,
            cancel,
            |token| async move { self.upload_output(output, key, &token).await },
        )
        .await
    }

    async fn download_source(
        &self,
        source_ref: &str,
        local: &Path,
        cancel: &CancellationToken,
    ) -> Result<(), RenderError> {
        self.with_storage_retries("download", cancel, || self.storage.download(source_ref, local))
            .await
            .map_err(|(_, e)| RenderError::SourceUnavailable(format!("{}: {}", source_ref, e)))?
    }

    async fn upload_output(
        &self,
        output: &Path,
        key: &str,
        cancel: &CancellationToken,
    ) -> Result<String, RenderError> {
        self.with_storage_retries("upload", cancel, || self.storage.upload(output, key))
            .await
            .map_err(|(attempts, e)| RenderError::Upload {
                attempts,
                message: e.to_string(),
            })?
    }

    /// Retry transient storage failures with exponential backoff.
    ///
    /// The outer error carries the attempt count and last storage error; the
    /// inner result is `Err(Cancelled)` when cancelled mid-transfer or while
    /// backing off.
    async fn with_storage_retries<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<Result<T, RenderError>, (u32, StorageError)>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StorageError>>,
    {
        let attempts = self.config.upload_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                result = op() => result,
                _ = cancel.cancelled() => return Ok(Err(RenderError::Cancelled)),
            };
            match result {
                Ok(value) => return Ok(Ok(value)),
                Err(e) if e.is_transient() && attempt < attempts => {
                    let backoff = self.config.upload_backoff * 2u32.pow(attempt - 1);
                    warn!(
                        "Storage {} failed (attempt {}/{}), retrying in {:?}: {}",
                        what, attempt, attempts, backoff, e
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = cancel.cancelled() => return Ok(Err(RenderError::Cancelled)),
                    }
                    attempt += 1;
                }
                Err(e) => return Err((attempt, e)),
            }
        }
    }

    /// Render all chunks with bounded parallelism. The first failure stops
    /// the remaining chunks and removes every segment produced so far.
    async fn render_chunks(
        &self,
        job: &RenderJob,
        chunks: &[Chunk],
        workspace: &Path,
        reporter: &JobReporter,
        cancel: &CancellationToken,
    ) -> Result<Vec<EncodedSegment>, RenderError> {
        let parallelism = self
            .config
            .chunk_parallelism
            .min(self.pool.pool_size())
            .max(1);
        let range = self.config.progress.rendering;
        let mut completion =
            WeightedCompletion::new(chunks.iter().map(|c| c.frame_count(job.fps)).collect());
        let mut segments: Vec<Option<EncodedSegment>> = vec![None; chunks.len()];

        // Stops in-flight chunks: on any chunk failure, and on job
        // cancellation when chunks are aborted rather than finished.
        let stop = match self.config.cancel_mode {
            CancelMode::AbortChunk => cancel.child_token(),
            CancelMode::FinishChunk => CancellationToken::new(),
        };

        let mut pending = chunks.iter();
        let mut in_flight = FuturesUnordered::new();
        let mut failure: Option<RenderError> = None;

        loop {
            while failure.is_none() && !cancel.is_cancelled() && in_flight.len() < parallelism {
                match pending.next() {
                    Some(chunk) => in_flight.push(self.render_chunk(job, chunk, workspace, &stop)),
                    None => break,
                }
            }
            let Some((index, result)) = in_flight.next().await else {
                break;
            };
            match result {
                Ok(segment) => {
                    debug!(chunk = index, "Chunk done");
                    segments[index] = segment;
                    reporter.progress(range.at(completion.complete(index)));
                }
                Err(e) => {
                    if failure.is_none() {
                        if !e.is_cancelled() {
                            error!(chunk = index, "Chunk failed: {}", e);
                        }
                        stop.cancel();
                        failure = Some(e);
                    }
                }
            }
        }

        let segments: Vec<EncodedSegment> = segments.into_iter().flatten().collect();
        let failure = failure.or_else(|| cancel.is_cancelled().then_some(RenderError::Cancelled));
        if let Some(e) = failure {
            for segment in &segments {
                if let Err(err) = tokio::fs::remove_file(&segment.path).await {
                    warn!("Failed to remove segment {}: {}", segment.path.display(), err);
                }
            }
            return Err(e);
        }
        Ok(segments)
    }

    /// Render and encode one chunk under the per-chunk timeout.
    async fn render_chunk(
        &self,
        job: &RenderJob,
        chunk: &Chunk,
        workspace: &Path,
        stop: &CancellationToken,
    ) -> (usize, Result<Option<EncodedSegment>, RenderError>) {
        let token = stop.child_token();
        let work = self.render_chunk_inner(job, chunk, workspace, &token);
        pin_mut!(work);
        let result = match tokio::time::timeout(self.config.chunk_timeout, &mut work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(chunk = chunk.index, "Chunk exceeded {:?}", self.config.chunk_timeout);
                token.cancel();
                let _ = tokio::time::timeout(STOP_GRACE, &mut work).await;
                Err(RenderError::Timeout {
                    step: JobStatus::Rendering,
                    chunk_index: Some(chunk.index),
                    after: self.config.chunk_timeout,
                })
            }
        };
        (chunk.index, result)
    }

    async fn render_chunk_inner(
        &self,
        job: &RenderJob,
        chunk: &Chunk,
        workspace: &Path,
        stop: &CancellationToken,
    ) -> Result<Option<EncodedSegment>, RenderError> {
        if chunk.frame_count(job.fps) == 0 {
            debug!(chunk = chunk.index, "Chunk holds no frame boundary, skipping");
            return Ok(None);
        }

        let mut slot = self.pool.acquire(stop).await?;
        let output = workspace.join(format!(
            "chunk_{:04}.{}",
            chunk.index,
            self.media.segment_extension()
        ));
        let settings = EncodeSettings {
            resolution: job.resolution,
            fps: job.fps,
        };
        let mut sink = match self.media.open_encoder(chunk, &settings, &output).await {
            Ok(sink) => sink,
            Err(e) => {
                self.pool.release(slot).await;
                return Err(e);
            }
        };

        let streamed = self
            .stream_frames(job, chunk, slot.surface(), sink.as_mut(), stop)
            .await;
        match streamed {
            Ok(()) => {
                self.pool.release(slot).await;
                sink.finish().await.map(Some)
            }
            Err(e) => {
                sink.abort().await;
                if matches!(
                    e,
                    RenderError::FrameCapture { .. } | RenderError::OverlayLoad { .. }
                ) {
                    self.pool.discard(slot).await;
                } else {
                    self.pool.release(slot).await;
                }
                Err(e)
            }
        }
    }

    /// Pipe rendered frames into the encoder one at a time.
    async fn stream_frames(
        &self,
        job: &RenderJob,
        chunk: &Chunk,
        surface: &mut dyn RenderSurface,
        sink: &mut dyn FrameSink,
        stop: &CancellationToken,
    ) -> Result<(), RenderError> {
        let frames = self.renderer.render(
            surface,
            &job.overlay_spec,
            *chunk,
            job.resolution,
            job.fps,
        );
        pin_mut!(frames);
        while let Some(frame) = frames.try_next().await? {
            sink.write_frame(&frame).await?;
            if stop.is_cancelled() {
                return Err(RenderError::Cancelled);
            }
        }
        Ok(())
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<(), RenderError> {
    if cancel.is_cancelled() {
        Err(RenderError::Cancelled)
    } else {
        Ok(())
    }
}

/// Run one pipeline step under its own timeout. On expiry the step is asked
/// to stop through its token and given a grace period before being dropped.
async fn run_step<T, F, Fut>(
    step: JobStatus,
    limit: Duration,
    cancel: &CancellationToken,
    f: F,
) -> Result<T, RenderError>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<T, RenderError>>,
{
    let token = cancel.child_token();
    let work = f(token.clone());
    pin_mut!(work);
    match tokio::time::timeout(limit, &mut work).await {
        Ok(result) => result,
        Err(_) => {
            warn!("{} step exceeded {:?}, stopping it", step, limit);
            token.cancel();
            let _ = tokio::time::timeout(STOP_GRACE, &mut work).await;
            Err(RenderError::Timeout {
                step,
                chunk_index: None,
                after: limit,
            })
        }
    }
}

fn source_extension(source_ref: &str) -> String {
    let path = source_ref.split(['?', '#']).next().unwrap_or(source_ref);
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty() && e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_else(|| "mp4".to_string())
}

async fn remove_workspace(workspace: &Path) {
    match tokio::fs::remove_dir_all(workspace).await {
        Ok(()) => debug!("Removed workspace {}", workspace.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("Failed to remove workspace {}: {}", workspace.display(), e),
    }
}

struct ReporterState {
    status: JobStatus,
    tracker: ProgressTracker,
}

/// Owns a job's status and progress and publishes every change.
struct JobReporter {
    job_id: String,
    state: Mutex<ReporterState>,
    notifications: JobNotifications,
    events: Arc<EventHub>,
}

impl JobReporter {
    fn new(job_id: &str, notifications: JobNotifications, events: Arc<EventHub>) -> Self {
        Self {
            job_id: job_id.to_string(),
            state: Mutex::new(ReporterState {
                status: JobStatus::Queued,
                tracker: ProgressTracker::new(),
            }),
            notifications,
            events,
        }
    }

    fn status(&self) -> JobStatus {
        self.state.lock().status
    }

    fn publish(&self, event: JobEvent) {
        self.events.publish(event.clone());
        self.notifications.send(event);
    }

    fn transition(&self, next: JobStatus, percent: u8) {
        let mut state = self.state.lock();
        if !state.status.can_transition_to(next) {
            warn!("Ignoring transition {} -> {}", state.status, next);
            return;
        }
        info!("{} -> {}", state.status, next);
        state.status = next;
        state.tracker.advance(percent);
        let event = JobEvent::progress(&self.job_id, next, state.tracker.current(), None);
        self.publish(event);
    }

    /// Publish only when the percentage actually moved.
    fn progress(&self, percent: u8) {
        let mut state = self.state.lock();
        if let Some(current) = state.tracker.advance(percent) {
            let event = JobEvent::progress(&self.job_id, state.status, current, None);
            self.publish(event);
        }
    }

    /// Publish the terminal event and hand the channel over to delivery.
    fn finish(self, outcome: &JobOutcome) {
        let progress = {
            let mut state = self.state.lock();
            state.status = outcome.status();
            match outcome {
                JobOutcome::Success { .. } => 100,
                _ => state.tracker.current(),
            }
        };
        self.publish(JobEvent::terminal(outcome, progress));
        self.notifications.close();
    }
}
