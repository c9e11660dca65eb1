//! The overlay rendering surface: a browser page (or anything else) that can
//! load an overlay description, seek to a timestamp and capture a transparent
//! raster of what it shows.

use crate::domain::jobs::Resolution;
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum SurfaceError {
    /// The operation failed but the surface is still usable.
    #[error("surface error: {0}")]
    Transient(String),
    /// The underlying renderer is gone and must be replaced.
    #[error("surface crashed: {0}")]
    Crashed(String),
    #[error("surface operation timed out: {0}")]
    Timeout(String),
}

impl SurfaceError {
    pub fn is_crash(&self) -> bool {
        matches!(self, SurfaceError::Crashed(_))
    }
}

#[async_trait]
pub trait RenderSurface: Send {
    /// Prepare the surface at `resolution` and load the overlay description.
    async fn load_overlay(
        &mut self,
        overlay_spec: &serde_json::Value,
        resolution: Resolution,
    ) -> Result<(), SurfaceError>;

    /// Resolves only once the surface shows the frame at `timestamp`.
    async fn seek_to(&mut self, timestamp: f64) -> Result<(), SurfaceError>;

    /// PNG bytes with alpha, exactly at the loaded resolution.
    async fn capture(&mut self) -> Result<Bytes, SurfaceError>;

    /// Return to a blank, ready state between leases.
    async fn reset(&mut self) -> Result<(), SurfaceError>;

    /// Release the underlying renderer. Safe to call more than once.
    async fn close(&mut self);
}

#[async_trait]
pub trait SurfaceFactory: Send + Sync {
    async fn create(&self) -> Result<Box<dyn RenderSurface>, SurfaceError>;
}
