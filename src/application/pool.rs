//! Bounded pool of reusable render surfaces.
//!
//! A semaphore caps the number of live surfaces at `pool_size`: a surface
//! exists only while it is leased (holding a permit) or parked idle, and new
//! surfaces are created only by an acquirer that found no idle one.

use crate::config::PoolConfig;
use crate::error::RenderError;
use crate::ports::surface::{RenderSurface, SurfaceFactory};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// A surface leased to one chunk render.
pub struct RendererSlot {
    surface: Box<dyn RenderSurface>,
    _permit: OwnedSemaphorePermit,
}

impl RendererSlot {
    pub fn surface(&mut self) -> &mut dyn RenderSurface {
        self.surface.as_mut()
    }
}

pub struct RendererPool {
    factory: Arc<dyn SurfaceFactory>,
    config: PoolConfig,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Box<dyn RenderSurface>>>,
    shut_down: AtomicBool,
}

impl RendererPool {
    pub fn new(factory: Arc<dyn SurfaceFactory>, config: PoolConfig) -> Self {
        let pool_size = config.pool_size.max(1);
        info!("Renderer pool created with {} slots", pool_size);
        Self {
            factory,
            permits: Arc::new(Semaphore::new(pool_size)),
            config,
            idle: Mutex::new(Vec::with_capacity(pool_size)),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn pool_size(&self) -> usize {
        self.config.pool_size.max(1)
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }

    /// Wait for a free slot, reusing an idle surface or creating one.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<RendererSlot, RenderError> {
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|_| RenderError::RendererUnavailable {
                    attempts: 0,
                    message: "renderer pool is shut down".into(),
                })?
            }
            _ = cancel.cancelled() => return Err(RenderError::Cancelled),
        };

        let parked = self.idle.lock().pop();
        let surface = match parked {
            Some(surface) => surface,
            None => self.create_surface().await?,
        };
        Ok(RendererSlot {
            surface,
            _permit: permit,
        })
    }

    async fn create_surface(&self) -> Result<Box<dyn RenderSurface>, RenderError> {
        let attempts = self.config.create_attempts.max(1);
        let mut last_error = String::new();
        for attempt in 1..=attempts {
            match self.factory.create().await {
                Ok(surface) => {
                    debug!("Created render surface (attempt {})", attempt);
                    return Ok(surface);
                }
                Err(e) => {
                    warn!(
                        "Render surface creation failed (attempt {}/{}): {}",
                        attempt, attempts, e
                    );
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(self.config.create_backoff * attempt).await;
                    }
                }
            }
        }
        Err(RenderError::RendererUnavailable {
            attempts,
            message: last_error,
        })
    }

    /// Reset the surface and park it for reuse. A surface that fails to reset
    /// is closed instead.
    pub async fn release(&self, slot: RendererSlot) {
        let RendererSlot {
            mut surface,
            _permit,
        } = slot;

        if self.shut_down.load(Ordering::SeqCst) {
            surface.close().await;
            return;
        }
        match surface.reset().await {
            Ok(()) => self.idle.lock().push(surface),
            Err(e) => {
                warn!("Render surface failed to reset, closing it: {}", e);
                surface.close().await;
            }
        }
    }

    /// Close a broken surface. The next `acquire` creates a replacement.
    pub async fn discard(&self, slot: RendererSlot) {
        let RendererSlot {
            mut surface,
            _permit,
        } = slot;
        warn!("Discarding render surface");
        surface.close().await;
    }

    /// Close every idle surface and refuse further leases. Idempotent.
    pub async fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        let idle: Vec<_> = std::mem::take(&mut *self.idle.lock());
        info!("Shutting down renderer pool ({} idle surfaces)", idle.len());
        for mut surface in idle {
            surface.close().await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeFactory;
    use super::*;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn pool(size: usize, factory: Arc<FakeFactory>) -> RendererPool {
        RendererPool::new(
            factory,
            PoolConfig {
                pool_size: size,
                create_attempts: 3,
                create_backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_acquire_blocks_at_pool_size() {
        let (factory, state) = FakeFactory::new();
        let pool = pool(2, factory);
        let cancel = CancellationToken::new();

        let first = pool.acquire(&cancel).await.unwrap();
        let _second = pool.acquire(&cancel).await.unwrap();
        let third = tokio::time::timeout(Duration::from_millis(50), pool.acquire(&cancel)).await;
        assert!(third.is_err());

        pool.release(first).await;
        let _third = pool.acquire(&cancel).await.unwrap();
        assert_eq!(state.created.load(Ordering::SeqCst), 2);
        assert_eq!(state.max_live.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_released_surface_is_reset_and_reused() {
        let (factory, state) = FakeFactory::new();
        let pool = pool(1, factory);
        let cancel = CancellationToken::new();

        let slot = pool.acquire(&cancel).await.unwrap();
        pool.release(slot).await;
        assert_eq!(pool.idle_count(), 1);
        let _slot = pool.acquire(&cancel).await.unwrap();

        assert_eq!(state.created.load(Ordering::SeqCst), 1);
        assert_eq!(state.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_reset_closes_surface() {
        let (factory, state) = FakeFactory::new();
        let pool = pool(1, factory);
        let cancel = CancellationToken::new();
        state.fail_reset.store(true, Ordering::SeqCst);

        let slot = pool.acquire(&cancel).await.unwrap();
        pool.release(slot).await;
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(state.closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_discarded_surface_is_replaced() {
        let (factory, state) = FakeFactory::new();
        let pool = pool(1, factory);
        let cancel = CancellationToken::new();

        let slot = pool.acquire(&cancel).await.unwrap();
        pool.discard(slot).await;
        assert_eq!(state.closed.load(Ordering::SeqCst), 1);

        let _slot = pool.acquire(&cancel).await.unwrap();
        assert_eq!(state.created.load(Ordering::SeqCst), 2);
        assert_eq!(state.max_live.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_creation_failures_exhaust_retries() {
        let (factory, state) = FakeFactory::new();
        state.create_failures.store(5, Ordering::SeqCst);
        let pool = pool(1, factory);

        let err = match pool.acquire(&CancellationToken::new()).await {
            Err(e) => e,
            Ok(_) => panic!("acquire should fail"),
        };
        assert!(matches!(err, RenderError::RendererUnavailable { attempts: 3, .. }));

        // The permit went back: a later acquire can still succeed.
        state.create_failures.store(0, Ordering::SeqCst);
        assert!(pool.acquire(&CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn test_acquire_observes_cancellation() {
        let (factory, _state) = FakeFactory::new();
        let pool = pool(1, factory);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).await.unwrap();

        let waiter = CancellationToken::new();
        waiter.cancel();
        assert!(matches!(
            pool.acquire(&waiter).await,
            Err(RenderError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (factory, state) = FakeFactory::new();
        let pool = pool(2, factory);
        let cancel = CancellationToken::new();

        let a = pool.acquire(&cancel).await.unwrap();
        let b = pool.acquire(&cancel).await.unwrap();
        pool.release(a).await;

        pool.shutdown().await;
        pool.shutdown().await;
        assert_eq!(state.closed.load(Ordering::SeqCst), 1);

        // Leased surfaces are closed when they come back.
        pool.release(b).await;
        assert_eq!(state.closed.load(Ordering::SeqCst), 2);
        assert!(pool.acquire(&cancel).await.is_err());
    }
}
