use crate::error::WatchError;
use crate::model::ImagePayload;
use crate::permissions::{ScreenRecordingStatus, screen_recording_help_message, screen_recording_status};
use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose};
use image::GenericImageView;
use image::ImageFormat;
use image::imageops::FilterType;
use std::io::Cursor;
use std::path::PathBuf;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(10);

#[async_trait]
pub trait ScreenshotProvider: Send + Sync {
    /// Captures the visible screen and returns it as a PNG data URL.
    async fn capture(&self) -> Result<String>;
}

#[derive(Debug, Clone)]
pub struct SystemScreenshotProvider {
    output_path: PathBuf,
    command: Vec<String>,
}

impl SystemScreenshotProvider {
    pub fn new(output_path: impl Into<PathBuf>, command: Option<Vec<String>>) -> Self {
        Self {
            output_path: output_path.into(),
            command: command.unwrap_or_else(default_command),
        }
    }
}

fn default_command() -> Vec<String> {
    let args: &[&str] = if cfg!(target_os = "macos") {
        &["screencapture", "-x", "-t", "png", "{path}"]
    } else {
        &["grim", "-t", "png", "{path}"]
    };
    args.iter().map(|arg| arg.to_string()).collect()
}

#[async_trait]
impl ScreenshotProvider for SystemScreenshotProvider {
    async fn capture(&self) -> Result<String> {
        if screen_recording_status() == ScreenRecordingStatus::Denied {
            bail!(
                "Screen Recording permission is denied. {}",
                screen_recording_help_message()
            );
        }

        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("screenshot command is empty"))?;
        let path = self.output_path.to_string_lossy();
        let args: Vec<String> = args.iter().map(|arg| arg.replace("{path}", &path)).collect();

        if let Some(parent) = self.output_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let mut command = Command::new(program);
        command.args(&args);

        let status = timeout(SCREENSHOT_TIMEOUT, command.status())
            .await
            .map_err(|_| {
                anyhow!(
                    "{program} timed out after {:.0}s",
                    SCREENSHOT_TIMEOUT.as_secs_f32()
                )
            })?
            .with_context(|| format!("failed to execute {program}"))?;

        if !status.success() {
            bail!("{program} exited with status {status}");
        }

        let bytes = tokio::fs::read(&self.output_path)
            .await
            .with_context(|| format!("failed to read screenshot {}", self.output_path.display()))?;
        Ok(encode_data_url("image/png", &bytes))
    }
}

pub fn encode_data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", general_purpose::STANDARD.encode(bytes))
}

pub fn decode_data_url(data_url: &str) -> Result<ImagePayload, WatchError> {
    let rest = data_url
        .strip_prefix("data:")
        .ok_or_else(|| WatchError::Decode("not a data URL".to_string()))?;
    let (header, data) = rest
        .split_once(',')
        .ok_or_else(|| WatchError::Decode("data URL has no payload".to_string()))?;
    let mime = header
        .strip_suffix(";base64")
        .ok_or_else(|| WatchError::Decode("data URL is not base64 encoded".to_string()))?;
    if !mime.starts_with("image/") {
        return Err(WatchError::Decode(format!("unexpected media type {mime}")));
    }

    let bytes = general_purpose::STANDARD
        .decode(data.trim())
        .map_err(|err| WatchError::Decode(err.to_string()))?;
    if bytes.is_empty() {
        return Err(WatchError::Decode("image is empty".to_string()));
    }

    Ok(ImagePayload {
        mime: mime.to_string(),
        bytes,
    })
}

/// Verifies the payload is a readable image and shrinks it so the longest
/// edge is at most `max_dimension`. Small images pass through untouched.
pub fn fit_for_model(payload: ImagePayload, max_dimension: u32) -> Result<ImagePayload, WatchError> {
    let image = image::load_from_memory(&payload.bytes)
        .map_err(|err| WatchError::Decode(err.to_string()))?;
    let (width, height) = image.dimensions();
    if max_dimension == 0 || (width <= max_dimension && height <= max_dimension) {
        return Ok(payload);
    }

    let resized = image.resize(max_dimension, max_dimension, FilterType::Triangle);
    let mut bytes = Vec::new();
    resized
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .map_err(|err| WatchError::Decode(err.to_string()))?;
    tracing::debug!(
        from = %format!("{width}x{height}"),
        to = %format!("{}x{}", resized.width(), resized.height()),
        "screenshot downscaled"
    );

    Ok(ImagePayload {
        mime: "image/png".to_string(),
        bytes,
    })
}
