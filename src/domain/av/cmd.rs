//! Spawning and supervising ffmpeg-family subprocesses.

use std::ffi::OsStr;
use std::io;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lines of stderr kept as diagnostic output.
const DIAGNOSTIC_LINES: usize = 40;

/// Non-zero exit of a subprocess, with the tail of its stderr.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessFailure {
    pub exit_code: Option<i32>,
    pub diagnostic: String,
}

#[derive(Debug)]
pub enum RunError {
    Spawn(io::Error),
    Failed(ProcessFailure),
    Cancelled,
}

/// A `Command` that is killed if its handle is dropped mid-flight.
pub fn command(program: impl AsRef<OsStr>) -> Command {
    let mut cmd = Command::new(program);
    cmd.kill_on_drop(true);
    cmd
}

/// Keep only the last lines of a stderr capture.
pub fn diagnostic_tail(stderr: &[u8]) -> String {
    let text = String::from_utf8_lossy(stderr);
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(DIAGNOSTIC_LINES);
    lines[start..].join("\n")
}

/// Drain stderr in the background so a chatty process never blocks on it.
pub fn drain_stderr(stderr: Option<ChildStderr>) -> Option<JoinHandle<io::Result<Vec<u8>>>> {
    stderr.map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = Vec::new();
            stderr.read_to_end(&mut buf).await?;
            Ok(buf)
        })
    })
}

pub async fn collect_stderr(handle: Option<JoinHandle<io::Result<Vec<u8>>>>) -> Vec<u8> {
    match handle {
        Some(handle) => match handle.await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => {
                warn!("Failed to read subprocess stderr: {}", e);
                Vec::new()
            }
            Err(e) => {
                warn!("Stderr drain task failed: {}", e);
                Vec::new()
            }
        },
        None => Vec::new(),
    }
}

/// Ask ffmpeg to quit (`q` on stdin, then EOF), kill it if it ignores us.
pub async fn stop_gracefully(child: &mut Child, stdin: Option<ChildStdin>, grace: Duration) {
    if let Some(mut stdin) = stdin {
        let _ = stdin.write_all(b"q").await;
        let _ = stdin.shutdown().await;
    }
    match tokio::time::timeout(grace, child.wait()).await {
        Ok(_) => debug!("Subprocess stopped after quit request"),
        Err(_) => {
            warn!("Subprocess ignored quit request for {:?}, killing it", grace);
            if let Err(e) = child.kill().await {
                warn!("Failed to kill subprocess: {}", e);
            }
        }
    }
}

/// Run a command to completion.
///
/// Every stdout line is passed to `on_stdout_line` (used for `-progress pipe:1`).
/// Cancellation stops the process cooperatively and returns `RunError::Cancelled`.
pub async fn run(
    cmd: &mut Command,
    mut on_stdout_line: impl FnMut(&str),
    cancel: &CancellationToken,
    grace: Duration,
) -> Result<(), RunError> {
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(RunError::Spawn)?;
    let stdin = child.stdin.take();
    let stderr = drain_stderr(child.stderr.take());
    let mut stdout = child.stdout.take().map(|out| BufReader::new(out).lines());

    let status = loop {
        tokio::select! {
            status = child.wait() => break status.map_err(RunError::Spawn)?,
            line = async {
                match stdout.as_mut() {
                    Some(lines) => lines.next_line().await,
                    None => std::future::pending().await,
                }
            } => {
                match line {
                    Ok(Some(line)) => on_stdout_line(&line),
                    _ => stdout = None,
                }
            }
            _ = cancel.cancelled() => {
                stop_gracefully(&mut child, stdin, grace).await;
                let _ = collect_stderr(stderr).await;
                return Err(RunError::Cancelled);
            }
        }
    };
    drop(stdin);

    let stderr = collect_stderr(stderr).await;
    if status.success() {
        debug!("Subprocess finished: {}", diagnostic_tail(&stderr));
        Ok(())
    } else {
        Err(RunError::Failed(ProcessFailure {
            exit_code: status.code(),
            diagnostic: diagnostic_tail(&stderr),
        }))
    }
}

/// Run a short-lived command and return its stdout.
pub async fn output(cmd: &mut Command) -> Result<Vec<u8>, RunError> {
    cmd.stdin(Stdio::null());
    let output = cmd.output().await.map_err(RunError::Spawn)?;
    if output.status.success() {
        Ok(output.stdout)
    } else {
        Err(RunError::Failed(ProcessFailure {
            exit_code: output.status.code(),
            diagnostic: diagnostic_tail(&output.stderr),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diagnostic_tail_keeps_last_lines() {
        let stderr: String = (0..100).map(|i| format!("line {}\n", i)).collect();
        let tail = diagnostic_tail(stderr.as_bytes());
        let lines: Vec<&str> = tail.lines().collect();
        assert_eq!(lines.len(), DIAGNOSTIC_LINES);
        assert_eq!(lines[0], "line 60");
        assert_eq!(*lines.last().unwrap(), "line 99");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_reports_exit_code_and_stderr() {
        let mut cmd = command("sh");
        cmd.arg("-c").arg("echo out; echo 'bad things' >&2; exit 3");
        let mut seen = Vec::new();
        let result = run(
            &mut cmd,
            |line| seen.push(line.to_string()),
            &CancellationToken::new(),
            Duration::from_secs(1),
        )
        .await;

        match result {
            Err(RunError::Failed(failure)) => {
                assert_eq!(failure.exit_code, Some(3));
                assert_eq!(failure.diagnostic, "bad things");
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(seen, vec!["out".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let mut cmd = command("sh");
        cmd.arg("-c").arg("sleep 30");
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = run(&mut cmd, |_| {}, &cancel, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(RunError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }
}
