//! Headless Chromium render surface driven over the DevTools protocol.
//!
//! The render page must expose `window.loadOverlay(spec)` and
//! `window.seekTo(seconds)`; the latter returns a promise that resolves once
//! the page shows the requested instant.

mod cdp;
mod surface;

pub use surface::{ChromeSurface, ChromeSurfaceFactory};

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ChromeConfig {
    pub chrome_path: PathBuf,
    pub render_page_url: String,
    /// Bound on launching the browser and on every DevTools call.
    pub timeout: Duration,
}

impl Default for ChromeConfig {
    fn default() -> Self {
        Self {
            chrome_path: PathBuf::from("chromium"),
            render_page_url: "http://localhost:3001/render".to_string(),
            timeout: Duration::from_millis(60_000),
        }
    }
}
