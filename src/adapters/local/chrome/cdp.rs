//! Minimal Chrome DevTools protocol client.
//!
//! Commands are JSON messages with an `id`; the reply carrying the same id
//! resolves the caller. Everything without an id is an event, of which only
//! crash notifications matter here.

use crate::ports::surface::SurfaceError;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, trace, warn};

type Reply = Result<Value, String>;
type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Reply>>>>;

const CRASH_EVENTS: [&str; 2] = ["Inspector.targetCrashed", "Target.targetCrashed"];

pub struct CdpClient {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: Pending,
    next_id: AtomicU64,
    crashed: Arc<AtomicBool>,
    timeout: Duration,
    tasks: Vec<JoinHandle<()>>,
}

impl CdpClient {
    pub async fn connect(ws_url: &str, timeout: Duration) -> Result<Self, SurfaceError> {
        let (stream, _) = tokio::time::timeout(timeout, connect_async(ws_url))
            .await
            .map_err(|_| SurfaceError::Timeout(format!("connecting to {}", ws_url)))?
            .map_err(|e| SurfaceError::Crashed(format!("DevTools connection failed: {}", e)))?;
        let (mut sink, mut source) = stream.split();

        let (outgoing, mut rx) = mpsc::unbounded_channel::<Message>();
        let writer = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(e) = sink.send(message).await {
                    debug!("DevTools socket write failed: {}", e);
                    break;
                }
            }
        });

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let crashed = Arc::new(AtomicBool::new(false));
        let reader = {
            let pending = pending.clone();
            let crashed = crashed.clone();
            tokio::spawn(async move {
                while let Some(message) = source.next().await {
                    let text = match message {
                        Ok(Message::Text(text)) => text,
                        Ok(Message::Close(_)) => break,
                        Ok(_) => continue,
                        Err(e) => {
                            debug!("DevTools socket read failed: {}", e);
                            break;
                        }
                    };
                    let Ok(value) = serde_json::from_str::<Value>(&text) else {
                        warn!("Ignoring malformed DevTools message");
                        continue;
                    };
                    dispatch(&pending, &crashed, value);
                }
                crashed.store(true, Ordering::SeqCst);
                // Dropping the senders fails every outstanding call.
                pending.lock().clear();
            })
        };

        Ok(Self {
            outgoing,
            pending,
            next_id: AtomicU64::new(1),
            crashed,
            timeout,
            tasks: vec![writer, reader],
        })
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    /// Send one command and wait for its reply, bounded by the client timeout.
    pub async fn call(
        &self,
        method: &str,
        params: Value,
        session_id: Option<&str>,
    ) -> Result<Value, SurfaceError> {
        if self.is_crashed() {
            return Err(SurfaceError::Crashed("DevTools connection is gone".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut command = json!({ "id": id, "method": method, "params": params });
        if let Some(session_id) = session_id {
            command["sessionId"] = Value::String(session_id.to_string());
        }

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        trace!("-> {} #{}", method, id);
        if self.outgoing.send(Message::Text(command.to_string())).is_err() {
            self.pending.lock().remove(&id);
            return Err(SurfaceError::Crashed("DevTools connection is gone".into()));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(message))) => Err(SurfaceError::Transient(format!("{}: {}", method, message))),
            Ok(Err(_)) => Err(SurfaceError::Crashed(format!(
                "DevTools connection closed during {}",
                method
            ))),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(SurfaceError::Timeout(format!(
                    "{} after {:?}",
                    method, self.timeout
                )))
            }
        }
    }
}

fn dispatch(pending: &Pending, crashed: &AtomicBool, value: Value) {
    if let Some(id) = value.get("id").and_then(Value::as_u64) {
        let Some(tx) = pending.lock().remove(&id) else {
            return;
        };
        let reply = match value.get("error") {
            Some(error) => Err(error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown DevTools error")
                .to_string()),
            None => Ok(value.get("result").cloned().unwrap_or(Value::Null)),
        };
        let _ = tx.send(reply);
        return;
    }

    if let Some(method) = value.get("method").and_then(Value::as_str) {
        if CRASH_EVENTS.contains(&method) {
            warn!("Render target crashed");
            crashed.store(true, Ordering::SeqCst);
            pending.lock().clear();
        }
    }
}

impl Drop for CdpClient {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}
