use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use std::io::Write;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const NOTIFY_TIMEOUT: Duration = Duration::from_secs(5);
const APP_NAME: &str = "Procrastination Watcher";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Success,
    Warning,
    Error,
    Info,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub kind: NotificationKind,
    /// Keep the notification on screen until the user dismisses it.
    pub require_interaction: bool,
}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Shows a notification and returns its id.
    async fn create(&self, id: Option<&str>, notification: &Notification) -> Result<String>;

    /// Secondary path used when [`NotificationSink::create`] fails.
    async fn show_fallback(&self, notification: &Notification) -> Result<()>;
}

pub fn notification_id() -> String {
    format!("watcher_{}", chrono::Utc::now().timestamp_millis())
}

#[derive(Debug, Clone, Copy)]
pub struct DesktopNotifier {
    fallback_to_console: bool,
}

impl DesktopNotifier {
    pub fn new(fallback_to_console: bool) -> Self {
        Self {
            fallback_to_console,
        }
    }
}

#[async_trait]
impl NotificationSink for DesktopNotifier {
    async fn create(&self, id: Option<&str>, notification: &Notification) -> Result<String> {
        let id = id.map(ToOwned::to_owned).unwrap_or_else(notification_id);
        let (program, args) = platform_command(notification);

        let output = timeout(
            NOTIFY_TIMEOUT,
            Command::new(program)
                .args(&args)
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .output(),
        )
        .await
        .map_err(|_| anyhow!("{program} timed out"))?
        .with_context(|| format!("failed to spawn {program}"))?;

        if !output.status.success() {
            bail!(
                "{program} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(id)
    }

    async fn show_fallback(&self, notification: &Notification) -> Result<()> {
        if !self.fallback_to_console {
            bail!("console fallback disabled");
        }
        let mut stderr = std::io::stderr().lock();
        writeln!(stderr, "\x07[{APP_NAME}] {}", notification.title)?;
        for line in notification.message.lines() {
            writeln!(stderr, "    {line}")?;
        }
        Ok(())
    }
}

#[cfg(target_os = "macos")]
fn platform_command(notification: &Notification) -> (&'static str, Vec<String>) {
    let script = format!(
        "display notification \"{}\" with title \"{}\" subtitle \"{}\"",
        applescript_escape(&notification.message),
        APP_NAME,
        applescript_escape(&notification.title),
    );
    ("osascript", vec!["-e".to_string(), script])
}

#[cfg(not(target_os = "macos"))]
fn platform_command(notification: &Notification) -> (&'static str, Vec<String>) {
    let urgency = match (notification.require_interaction, notification.kind) {
        (true, _) => "critical",
        (false, NotificationKind::Error | NotificationKind::Warning) => "normal",
        (false, _) => "low",
    };
    (
        "notify-send",
        vec![
            format!("--app-name={APP_NAME}"),
            format!("--urgency={urgency}"),
            notification.title.clone(),
            notification.message.clone(),
        ],
    )
}

#[cfg_attr(not(target_os = "macos"), allow(dead_code))]
fn applescript_escape(text: &str) -> String {
    text.replace('\\', "\\\\").replace('"', "\\\"")
}
