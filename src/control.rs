//! Control channel between the CLI and the daemon.
//!
//! One JSON object per line in each direction over a Unix domain socket:
//! `{"type":"START_WATCHING","interval":5}` answered by `{"success":true}`.

use crate::analysis::AnalysisVerdict;
use crate::model::ModelParams;
use crate::session::Availability;
use crate::settings::{GoalAlert, WatcherSettings};
use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::time::timeout;

pub const MAX_REQUEST_BYTES: u64 = 64 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ControlMessage {
    StartWatching {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval: Option<u32>,
    },
    StopWatching,
    TestNotification,
    Status,
    CheckNow,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerStatus {
    pub period_in_minutes: u32,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatcherStatus {
    pub alert: Option<GoalAlert>,
    pub settings: WatcherSettings,
    pub trigger: Option<TriggerStatus>,
    pub availability: Availability,
    #[serde(default)]
    pub model_params: Option<ModelParams>,
    pub checking: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<Box<WatcherStatus>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<AnalysisVerdict>,
}

impl ControlResponse {
    pub fn ok() -> Self {
        Self {
            success: true,
            error: None,
            status: None,
            verdict: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            status: None,
            verdict: None,
        }
    }

    pub fn with_status(status: WatcherStatus) -> Self {
        Self {
            status: Some(Box::new(status)),
            ..Self::ok()
        }
    }
}

/// Receives control messages inside the daemon.
#[async_trait]
pub trait ControlHandler: Send + Sync {
    async fn handle(&self, message: ControlMessage) -> ControlResponse;
}

/// Sends control messages to the daemon.
#[async_trait]
pub trait ControlClient: Send + Sync {
    async fn send(&self, message: ControlMessage) -> Result<ControlResponse>;
}

pub fn bind(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
    }
    if path.exists() {
        std::fs::remove_file(path)
            .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
    }
    UnixListener::bind(path).with_context(|| format!("failed to bind {}", path.display()))
}

/// Accepts connections until the listener fails. Each connection carries one
/// request and is served on its own task.
pub async fn serve(listener: UnixListener, handler: Arc<dyn ControlHandler>) -> Result<()> {
    loop {
        let (stream, _) = listener
            .accept()
            .await
            .context("failed to accept control connection")?;
        let handler = Arc::clone(&handler);
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, handler).await {
                tracing::warn!(error = %format!("{err:#}"), "control connection failed");
            }
        });
    }
}

async fn handle_connection(stream: UnixStream, handler: Arc<dyn ControlHandler>) -> Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let response = match timeout(READ_TIMEOUT, read_request(read_half)).await {
        Err(_) => ControlResponse::failed("timed out waiting for request"),
        Ok(Err(err)) => ControlResponse::failed(format!("{err:#}")),
        Ok(Ok(message)) => {
            tracing::debug!(message = ?message, "control message received");
            handler.handle(message).await
        }
    };

    let mut line = serde_json::to_vec(&response).context("failed to encode response")?;
    line.push(b'\n');
    write_half
        .write_all(&line)
        .await
        .context("failed to write response")?;
    write_half.shutdown().await.ok();
    Ok(())
}

async fn read_request(read_half: tokio::net::unix::OwnedReadHalf) -> Result<ControlMessage> {
    let mut reader = BufReader::new(read_half.take(MAX_REQUEST_BYTES + 1));
    let mut line = String::new();
    reader
        .read_line(&mut line)
        .await
        .context("failed to read request")?;
    if line.len() as u64 > MAX_REQUEST_BYTES {
        bail!("request exceeds {MAX_REQUEST_BYTES} bytes");
    }
    if line.trim().is_empty() {
        bail!("empty request");
    }
    serde_json::from_str(line.trim()).context("invalid control message")
}

#[derive(Debug, Clone)]
pub struct SocketClient {
    path: PathBuf,
    response_timeout: Duration,
    check_timeout: Duration,
}

impl SocketClient {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            response_timeout: RESPONSE_TIMEOUT,
            check_timeout: RESPONSE_TIMEOUT,
        }
    }

    pub fn with_response_timeout(mut self, response_timeout: Duration) -> Self {
        self.response_timeout = response_timeout;
        self
    }

    /// CHECK_NOW replies only after a full inference, so it gets its own bound.
    pub fn with_check_timeout(mut self, check_timeout: Duration) -> Self {
        self.check_timeout = check_timeout;
        self
    }

    fn timeout_for(&self, message: &ControlMessage) -> Duration {
        match message {
            ControlMessage::CheckNow => self.check_timeout,
            _ => self.response_timeout,
        }
    }
}

#[async_trait]
impl ControlClient for SocketClient {
    async fn send(&self, message: ControlMessage) -> Result<ControlResponse> {
        let stream = UnixStream::connect(&self.path).await.with_context(|| {
            format!(
                "failed to connect to {} (is the daemon running?)",
                self.path.display()
            )
        })?;
        let (read_half, mut write_half) = stream.into_split();
        let response_timeout = self.timeout_for(&message);

        let mut line = serde_json::to_vec(&message).context("failed to encode message")?;
        line.push(b'\n');
        write_half
            .write_all(&line)
            .await
            .context("failed to send message")?;

        let mut reader = BufReader::new(read_half);
        let mut response = String::new();
        timeout(response_timeout, reader.read_line(&mut response))
            .await
            .context("timed out waiting for daemon response")?
            .context("failed to read daemon response")?;
        if response.trim().is_empty() {
            bail!("daemon closed the connection without responding");
        }
        serde_json::from_str(response.trim()).context("invalid daemon response")
    }
}
