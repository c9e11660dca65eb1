use super::cdp::CdpClient;
use super::ChromeConfig;
use crate::domain::jobs::Resolution;
use crate::ports::surface::{RenderSurface, SurfaceError, SurfaceFactory};
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use serde_json::{json, Value};
use std::process::Stdio;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tracing::{debug, info, trace, warn};

/// Flags trimmed down from the memory-saving set the render farm ran with.
const CHROME_FLAGS: &[&str] = &[
    "--headless=new",
    "--remote-debugging-port=0",
    "--no-sandbox",
    "--disable-setuid-sandbox",
    "--disable-gpu",
    "--disable-dev-shm-usage",
    "--disable-web-security",
    "--disable-extensions",
    "--disable-background-networking",
    "--disable-background-timer-throttling",
    "--disable-backgrounding-occluded-windows",
    "--disable-renderer-backgrounding",
    "--disable-breakpad",
    "--disable-default-apps",
    "--disable-sync",
    "--disable-features=TranslateUI,BackForwardCache",
    "--no-first-run",
    "--hide-scrollbars",
    "--mute-audio",
];

/// Pull the browser websocket endpoint out of a Chromium stderr line.
pub(crate) fn parse_devtools_url(line: &str) -> Option<&str> {
    line.trim()
        .strip_prefix("DevTools listening on ")
        .filter(|url| url.starts_with("ws://"))
}

pub struct ChromeSurfaceFactory {
    config: ChromeConfig,
}

impl ChromeSurfaceFactory {
    pub fn new(config: ChromeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl SurfaceFactory for ChromeSurfaceFactory {
    async fn create(&self) -> Result<Box<dyn RenderSurface>, SurfaceError> {
        let surface = ChromeSurface::launch(self.config.clone()).await?;
        Ok(Box::new(surface))
    }
}

/// One headless Chromium process with a single page.
pub struct ChromeSurface {
    config: ChromeConfig,
    process: Child,
    client: CdpClient,
    session_id: String,
    resolution: Option<Resolution>,
    closed: bool,
    _profile: TempDir,
}

impl ChromeSurface {
    pub async fn launch(config: ChromeConfig) -> Result<Self, SurfaceError> {
        let profile = TempDir::new()
            .map_err(|e| SurfaceError::Crashed(format!("no profile directory: {}", e)))?;
        let mut process = Command::new(&config.chrome_path)
            .args(CHROME_FLAGS)
            .arg(format!("--user-data-dir={}", profile.path().display()))
            .arg("about:blank")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SurfaceError::Crashed(format!(
                    "failed to start {}: {}",
                    config.chrome_path.display(),
                    e
                ))
            })?;

        let stderr = process
            .stderr
            .take()
            .ok_or_else(|| SurfaceError::Crashed("browser stderr unavailable".into()))?;
        let ws_url = match tokio::time::timeout(config.timeout, devtools_endpoint(stderr)).await {
            Ok(Ok(url)) => url,
            Ok(Err(e)) => {
                let _ = process.kill().await;
                return Err(e);
            }
            Err(_) => {
                let _ = process.kill().await;
                return Err(SurfaceError::Timeout("browser did not announce DevTools".into()));
            }
        };
        debug!("Browser DevTools at {}", ws_url);

        let client = CdpClient::connect(&ws_url, config.timeout).await?;
        let target = client
            .call("Target.createTarget", json!({ "url": "about:blank" }), None)
            .await?;
        let target_id = target["targetId"]
            .as_str()
            .ok_or_else(|| SurfaceError::Crashed("createTarget returned no targetId".into()))?
            .to_string();
        let attached = client
            .call(
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
                None,
            )
            .await?;
        let session_id = attached["sessionId"]
            .as_str()
            .ok_or_else(|| SurfaceError::Crashed("attachToTarget returned no sessionId".into()))?
            .to_string();

        let surface = Self {
            config,
            process,
            client,
            session_id,
            resolution: None,
            closed: false,
            _profile: profile,
        };
        surface.send("Page.enable", json!({})).await?;
        surface.send("Runtime.enable", json!({})).await?;
        surface
            .send(
                "Emulation.setDefaultBackgroundColorOverride",
                json!({ "color": { "r": 0, "g": 0, "b": 0, "a": 0 } }),
            )
            .await?;
        info!("Launched headless browser (pid {:?})", surface.process.id());
        Ok(surface)
    }

    async fn send(&self, method: &str, params: Value) -> Result<Value, SurfaceError> {
        self.client
            .call(method, params, Some(&self.session_id))
            .await
    }

    /// Evaluate `expression` in the page, awaiting it when it is a promise.
    async fn evaluate(&self, expression: &str) -> Result<Value, SurfaceError> {
        let reply = self
            .send(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "awaitPromise": true,
                    "returnByValue": true,
                }),
            )
            .await?;
        if let Some(details) = reply.get("exceptionDetails") {
            let message = details["exception"]["description"]
                .as_str()
                .or_else(|| details["text"].as_str())
                .unwrap_or("script error");
            return Err(SurfaceError::Transient(message.to_string()));
        }
        Ok(reply["result"]["value"].clone())
    }

    /// Poll until the render page has loaded and exposes its hooks.
    async fn wait_for_page(&self) -> Result<(), SurfaceError> {
        let ready = "document.readyState === 'complete' \
                     && typeof window.loadOverlay === 'function' \
                     && typeof window.seekTo === 'function'";
        let deadline = tokio::time::Instant::now() + self.config.timeout;
        loop {
            if self.evaluate(ready).await? == Value::Bool(true) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SurfaceError::Timeout(format!(
                    "render page {} not ready",
                    self.config.render_page_url
                )));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    fn check_alive(&mut self) -> Result<(), SurfaceError> {
        if self.closed {
            return Err(SurfaceError::Crashed("surface is closed".into()));
        }
        if let Ok(Some(status)) = self.process.try_wait() {
            return Err(SurfaceError::Crashed(format!("browser exited with {}", status)));
        }
        Ok(())
    }
}

async fn devtools_endpoint(stderr: ChildStderr) -> Result<String, SurfaceError> {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some(url) = parse_devtools_url(&line) {
            let url = url.to_string();
            // Keep draining so the browser never blocks on a full pipe.
            tokio::spawn(async move {
                while let Ok(Some(line)) = lines.next_line().await {
                    trace!(target: "chromium", "{}", line);
                }
            });
            return Ok(url);
        }
        trace!(target: "chromium", "{}", line);
    }
    Err(SurfaceError::Crashed(
        "browser exited before announcing DevTools".into(),
    ))
}

#[async_trait]
impl RenderSurface for ChromeSurface {
    async fn load_overlay(
        &mut self,
        overlay_spec: &Value,
        resolution: Resolution,
    ) -> Result<(), SurfaceError> {
        self.check_alive()?;
        self.send(
            "Emulation.setDeviceMetricsOverride",
            json!({
                "width": resolution.width,
                "height": resolution.height,
                "deviceScaleFactor": 1,
                "mobile": false,
            }),
        )
        .await?;
        self.send(
            "Page.navigate",
            json!({ "url": self.config.render_page_url }),
        )
        .await?;
        self.wait_for_page().await?;
        self.evaluate(&format!("window.loadOverlay({})", overlay_spec))
            .await?;
        self.resolution = Some(resolution);
        debug!("Overlay loaded at {}", resolution);
        Ok(())
    }

    async fn seek_to(&mut self, timestamp: f64) -> Result<(), SurfaceError> {
        self.check_alive()?;
        self.evaluate(&format!("window.seekTo({})", timestamp))
            .await
            .map(|_| ())
    }

    async fn capture(&mut self) -> Result<Bytes, SurfaceError> {
        self.check_alive()?;
        let resolution = self
            .resolution
            .ok_or_else(|| SurfaceError::Transient("capture before overlay was loaded".into()))?;
        let shot = self
            .send(
                "Page.captureScreenshot",
                json!({
                    "format": "png",
                    "fromSurface": true,
                    "captureBeyondViewport": false,
                    "clip": {
                        "x": 0,
                        "y": 0,
                        "width": resolution.width,
                        "height": resolution.height,
                        "scale": 1,
                    },
                }),
            )
            .await?;
        let data = shot["data"]
            .as_str()
            .ok_or_else(|| SurfaceError::Transient("screenshot carried no data".into()))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .map(Bytes::from)
            .map_err(|e| SurfaceError::Transient(format!("invalid screenshot payload: {}", e)))
    }

    async fn reset(&mut self) -> Result<(), SurfaceError> {
        self.check_alive()?;
        self.resolution = None;
        self.send("Page.navigate", json!({ "url": "about:blank" }))
            .await
            .map(|_| ())
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if !self.client.is_crashed() {
            let close = self.client.call("Browser.close", json!({}), None);
            if tokio::time::timeout(Duration::from_secs(2), close).await.is_err() {
                debug!("Browser.close timed out");
            }
        }
        match tokio::time::timeout(Duration::from_secs(2), self.process.wait()).await {
            Ok(_) => {}
            Err(_) => {
                if let Err(e) = self.process.kill().await {
                    warn!("Failed to kill browser: {}", e);
                }
            }
        }
        debug!("Browser closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_parse_devtools_url() {
        assert_eq!(
            parse_devtools_url(
                "DevTools listening on ws://127.0.0.1:39181/devtools/browser/5b1c-44\n"
            ),
            Some("ws://127.0.0.1:39181/devtools/browser/5b1c-44")
        );
        assert_eq!(parse_devtools_url("[0101/ERROR:gpu_init.cc] nope"), None);
    }

    #[tokio::test]
    async fn test_missing_binary_fails_creation() {
        let factory = ChromeSurfaceFactory::new(ChromeConfig {
            chrome_path: PathBuf::from("/nonexistent/chromium"),
            ..ChromeConfig::default()
        });
        match factory.create().await {
            Err(e) => assert!(e.is_crash()),
            Ok(_) => panic!("creation should fail"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_browser_exiting_early_fails_creation() {
        let factory = ChromeSurfaceFactory::new(ChromeConfig {
            chrome_path: PathBuf::from("false"),
            timeout: Duration::from_secs(5),
            ..ChromeConfig::default()
        });
        match factory.create().await {
            Err(SurfaceError::Crashed(message)) => assert!(message.contains("DevTools")),
            Err(other) => panic!("unexpected error: {}", other),
            Ok(_) => panic!("creation should fail"),
        }
    }
}
