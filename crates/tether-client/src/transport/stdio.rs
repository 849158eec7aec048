//! Subprocess transport: newline-delimited JSON over stdin/stdout.
//!
//! The child's stdout is parsed by a dedicated reader task, stdin is fed
//! by a dedicated writer task, and stderr is drained to the log so it
//! never mixes with the frame stream. Construction captures parameters
//! only; the subprocess, channels, and tasks all come into existence in
//! `open()`.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use tether_protocol::message::JsonRpcMessage;

use super::{Lifecycle, Transport};
use crate::error::ClientError;

/// Parser-to-correlator channel depth. Backpressure blocks the reader
/// task, not the child.
const INBOUND_DEPTH: usize = 100;
const OUTBOUND_DEPTH: usize = 64;
/// How long to wait for the child to exit after stdin closes.
const REAP_GRACE: Duration = Duration::from_secs(2);

// ---------------------------------------------------------------------------
// StdioServerParams
// ---------------------------------------------------------------------------

/// How to launch a stdio server.
///
/// `env` values may reference parent environment variables as `${NAME}`;
/// unresolved references keep the literal text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StdioServerParams {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub env: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl StdioServerParams {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: None,
            cwd: None,
        }
    }
}

/// Expand `${NAME}` references from the parent process environment.
fn expand_env_value(value: &str) -> String {
    let pattern = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap();
    pattern
        .replace_all(value, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

// ---------------------------------------------------------------------------
// StdioTransport
// ---------------------------------------------------------------------------

struct OpenIo {
    outbound: mpsc::Sender<JsonRpcMessage>,
    tasks: Vec<JoinHandle<()>>,
    child: Option<Child>,
}

pub struct StdioTransport {
    params: StdioServerParams,
    lifecycle: StdMutex<Lifecycle>,
    io: StdMutex<Option<OpenIo>>,
    inbound: Mutex<Option<mpsc::Receiver<JsonRpcMessage>>>,
}

impl StdioTransport {
    /// Capture launch parameters. Nothing is spawned or allocated here.
    pub fn new(params: StdioServerParams) -> Self {
        Self {
            params,
            lifecycle: StdMutex::new(Lifecycle::Unopened),
            io: StdMutex::new(None),
            inbound: Mutex::new(None),
        }
    }

    pub fn params(&self) -> &StdioServerParams {
        &self.params
    }

    fn lifecycle(&self) -> Lifecycle {
        *lock_unpoisoned(&self.lifecycle)
    }
}

fn lock_unpoisoned<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[async_trait]
impl Transport for StdioTransport {
    async fn open(&self) -> Result<(), ClientError> {
        match self.lifecycle() {
            Lifecycle::Unopened => {}
            Lifecycle::Open => return Ok(()),
            Lifecycle::Closed => return Err(ClientError::TransportClosed),
        }

        let mut cmd = Command::new(&self.params.command);
        cmd.args(&self.params.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.params.cwd {
            cmd.current_dir(dir);
        }
        if let Some(env) = &self.params.env {
            for (key, value) in env {
                cmd.env(key, expand_env_value(value));
            }
        }

        let mut child = cmd.spawn().map_err(|e| {
            ClientError::transport(format!("failed to spawn {}: {e}", self.params.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::transport("child stdin not captured"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::transport("child stdout not captured"))?;
        let stderr = child.stderr.take();

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_DEPTH);

        let mut tasks = Vec::with_capacity(3);
        tasks.push(tokio::spawn(read_frames(
            stdout,
            inbound_tx,
            self.params.command.clone(),
        )));
        tasks.push(tokio::spawn(write_frames(stdin, outbound_rx)));
        if let Some(stderr) = stderr {
            tasks.push(tokio::spawn(drain_stderr(
                self.params.command.clone(),
                stderr,
            )));
        }

        *self.inbound.lock().await = Some(inbound_rx);
        *lock_unpoisoned(&self.io) = Some(OpenIo {
            outbound: outbound_tx,
            tasks,
            child: Some(child),
        });
        *lock_unpoisoned(&self.lifecycle) = Lifecycle::Open;
        debug!(command = %self.params.command, "stdio transport open");
        Ok(())
    }

    async fn send(&self, message: &JsonRpcMessage) -> Result<(), ClientError> {
        let outbound = match lock_unpoisoned(&self.io).as_ref() {
            Some(io) => io.outbound.clone(),
            None => return Err(ClientError::TransportClosed),
        };
        outbound
            .send(message.clone())
            .await
            .map_err(|_| ClientError::transport("server process is gone"))
    }

    async fn receive(&self) -> Result<Option<JsonRpcMessage>, ClientError> {
        let mut guard = self.inbound.lock().await;
        match guard.as_mut() {
            Some(inbound) => Ok(inbound.recv().await),
            None => Err(ClientError::TransportClosed),
        }
    }

    async fn close(&self) -> Result<(), ClientError> {
        {
            let mut lifecycle = lock_unpoisoned(&self.lifecycle);
            if *lifecycle == Lifecycle::Closed {
                return Ok(());
            }
            *lifecycle = Lifecycle::Closed;
        }
        let Some(mut io) = lock_unpoisoned(&self.io).take() else {
            return Ok(());
        };

        // Dropping the outbound sender lets the writer drain queued
        // frames and then drop stdin, which is EOF to the child.
        drop(io.outbound);

        if let Some(mut child) = io.child.take() {
            match tokio::time::timeout(REAP_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(command = %self.params.command, %status, "server process exited")
                }
                Ok(Err(error)) => {
                    warn!(command = %self.params.command, %error, "failed waiting for server process")
                }
                Err(_) => {
                    warn!(command = %self.params.command, "server process did not exit, killing");
                    if let Err(error) = child.kill().await {
                        warn!(command = %self.params.command, %error, "failed to kill server process");
                    }
                }
            }
        }

        for task in io.tasks {
            task.abort();
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// I/O tasks
// ---------------------------------------------------------------------------

async fn read_frames(
    stdout: ChildStdout,
    inbound: mpsc::Sender<JsonRpcMessage>,
    command: String,
) {
    let mut reader = BufReader::new(stdout);
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match trimmed.parse::<JsonRpcMessage>() {
                    Ok(message) => {
                        // Bounded channel: a slow consumer blocks us here
                        // rather than buffering without limit.
                        if inbound.send(message).await.is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        warn!(server = %command, %error, "skipping malformed frame");
                    }
                }
            }
            Err(error) => {
                debug!(server = %command, %error, "stdout read failed");
                break;
            }
        }
    }
    debug!(server = %command, "stdout reader exiting");
}

async fn write_frames(mut stdin: ChildStdin, mut outbound: mpsc::Receiver<JsonRpcMessage>) {
    while let Some(message) = outbound.recv().await {
        let mut line = match message.encode() {
            Ok(json) => json,
            Err(error) => {
                warn!(%error, "failed to serialize outbound frame");
                continue;
            }
        };
        line.push('\n');
        if let Err(error) = stdin.write_all(line.as_bytes()).await {
            debug!(%error, "stdin write failed");
            break;
        }
        if let Err(error) = stdin.flush().await {
            debug!(%error, "stdin flush failed");
            break;
        }
    }
    // stdin drops here: EOF to the child.
}

async fn drain_stderr(command: String, stderr: ChildStderr) {
    let mut reader = BufReader::new(stderr);
    let mut line = String::new();
    let mut count = 0u64;
    let mut last_reset = tokio::time::Instant::now();

    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => break,
            Ok(_) => {
                let msg = line.trim_end();
                if msg.is_empty() {
                    continue;
                }
                // Rate limit: max 20 lines per second.
                if last_reset.elapsed() > Duration::from_secs(1) {
                    count = 0;
                    last_reset = tokio::time::Instant::now();
                }
                count += 1;
                if count <= 20 {
                    warn!(server = %command, "[server-stderr] {}", msg);
                }
            }
            Err(error) => {
                debug!(server = %command, %error, "failed to read server stderr");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_resolves_from_parent_environment() {
        std::env::set_var("TETHER_TEST_TOKEN", "sekrit");
        assert_eq!(expand_env_value("Bearer ${TETHER_TEST_TOKEN}"), "Bearer sekrit");
        std::env::remove_var("TETHER_TEST_TOKEN");
    }

    #[test]
    fn expand_env_preserves_unresolved_references() {
        assert_eq!(
            expand_env_value("${TETHER_TEST_NO_SUCH_VAR_123}"),
            "${TETHER_TEST_NO_SUCH_VAR_123}"
        );
        assert_eq!(expand_env_value("plain"), "plain");
        assert_eq!(expand_env_value("${not-a-name}"), "${not-a-name}");
    }

    #[tokio::test]
    async fn send_and_receive_fail_before_open() {
        let transport =
            StdioTransport::new(StdioServerParams::new("cat", Vec::new()));
        let message = JsonRpcMessage::notification("x", None);
        assert!(matches!(
            transport.send(&message).await,
            Err(ClientError::TransportClosed)
        ));
        assert!(matches!(
            transport.receive().await,
            Err(ClientError::TransportClosed)
        ));
    }

    #[tokio::test]
    async fn close_before_open_is_fine_and_open_after_close_fails() {
        let transport =
            StdioTransport::new(StdioServerParams::new("cat", Vec::new()));
        transport.close().await.expect("close unopened");
        transport.close().await.expect("close is idempotent");
        assert!(matches!(
            transport.open().await,
            Err(ClientError::TransportClosed)
        ));
    }
}
