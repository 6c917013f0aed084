use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_OLLAMA_ENDPOINT: &str = "http://127.0.0.1:11434";
pub const DEFAULT_MODEL: &str = "gemma3:4b";
/// Headroom for capture, notification and socket round-trips around a check.
const CHECK_OVERHEAD: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatcherConfig {
    pub model: ModelConfig,
    pub capture: CaptureConfig,
    pub notifications: NotificationConfig,
    pub control: ControlConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub endpoint: String,
    pub model: String,
    #[serde(with = "humantime_serde_compat")]
    pub request_timeout: Duration,
    #[serde(with = "humantime_serde_compat")]
    pub availability_timeout: Duration,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_OLLAMA_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            request_timeout: Duration::from_secs(120),
            availability_timeout: Duration::from_secs(5),
            temperature: None,
            top_k: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Longest edge, in pixels, of the image handed to the model.
    pub max_dimension: u32,
    /// Overrides the platform screenshot command. `{path}` is replaced with the output file.
    pub command: Option<Vec<String>>,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            max_dimension: 1280,
            command: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub fallback_to_console: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            fallback_to_console: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub socket_path: Option<PathBuf>,
}

impl ModelConfig {
    /// Upper bound on how long a CHECK_NOW caller should wait for the daemon.
    pub fn check_timeout(&self) -> Duration {
        self.availability_timeout + self.request_timeout + CHECK_OVERHEAD
    }
}

impl WatcherConfig {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&text)
            .with_context(|| format!("failed to parse config {} (expected TOML)", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

mod humantime_serde_compat {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
