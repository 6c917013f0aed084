use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use serde::Serialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio::time::timeout;

const QUERY_TIMEOUT: Duration = Duration::from_secs(3);

#[cfg(target_os = "macos")]
const CHROMIUM_BROWSERS: &[&str] = &[
    "Google Chrome",
    "Google Chrome Canary",
    "Brave Browser",
    "Microsoft Edge",
    "Chromium",
    "Arc",
    "Vivaldi",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveTab {
    pub url: String,
    pub title: String,
}

#[async_trait]
pub trait ActiveTabProvider: Send + Sync {
    /// The tab (or window) the user is looking at, if any.
    async fn active_tab(&self) -> Result<Option<ActiveTab>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemActiveTabProvider;

#[async_trait]
impl ActiveTabProvider for SystemActiveTabProvider {
    async fn active_tab(&self) -> Result<Option<ActiveTab>> {
        timeout(QUERY_TIMEOUT, query_active_tab())
            .await
            .map_err(|_| anyhow!("active window query timed out after {}s", QUERY_TIMEOUT.as_secs()))?
    }
}

#[cfg(target_os = "macos")]
async fn query_active_tab() -> Result<Option<ActiveTab>> {
    let chromium = CHROMIUM_BROWSERS
        .iter()
        .map(|name| format!("frontName is \"{name}\""))
        .collect::<Vec<_>>()
        .join(" or ");

    let script = format!(
        r#"
tell application "System Events"
    set frontProcesses to (application processes whose frontmost is true)
    if (count of frontProcesses) is 0 then return ""
    set frontApp to item 1 of frontProcesses
    set frontName to name of frontApp
    set windowTitle to ""
    try
        set windowTitle to name of front window of frontApp
    end try
end tell

set tabUrl to ""
set tabTitle to windowTitle
if {chromium} then
    try
        tell application frontName
            set tabUrl to URL of active tab of front window
            set tabTitle to title of active tab of front window
        end tell
    end try
else if frontName is "Safari" then
    try
        tell application "Safari"
            set tabUrl to URL of front document
            set tabTitle to name of front document
        end tell
    end try
end if

return frontName & "\n" & tabUrl & "\n" & tabTitle
"#
    );

    let output = run_command("osascript", &["-e", &script])
        .await
        .and_then(CommandOutput::into_stdout)
        .context("failed to query frontmost window via AppleScript")?;
    Ok(parse_frontmost(&output))
}

#[cfg(not(target_os = "macos"))]
async fn query_active_tab() -> Result<Option<ActiveTab>> {
    let output = run_command("xdotool", &["getactivewindow", "getwindowname"])
        .await
        .context("failed to query active window via xdotool")?;
    let Some(title) = active_window_title(&output) else {
        tracing::debug!(stderr = %output.stderr, "no active window reported by xdotool");
        return Ok(None);
    };
    let class = run_command("xdotool", &["getactivewindow", "getwindowclassname"])
        .await
        .ok()
        .and_then(|output| active_window_title(&output));
    let app_name = class.as_deref().unwrap_or("unknown");
    Ok(parse_frontmost(&format!("{app_name}\n\n{title}")))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CommandOutput {
    program: String,
    success: bool,
    stdout: String,
    stderr: String,
}

impl CommandOutput {
    #[cfg_attr(not(target_os = "macos"), allow(dead_code))]
    fn into_stdout(self) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            Err(anyhow!("{} failed: {}", self.program, self.stderr))
        }
    }
}

/// Spawn failures are errors; a non-zero exit is reported in the output.
async fn run_command(program: &str, args: &[&str]) -> Result<CommandOutput> {
    let output = Command::new(program)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await
        .with_context(|| format!("failed to spawn {program}"))?;

    Ok(CommandOutput {
        program: program.to_string(),
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
}

/// xdotool exits non-zero when no window has focus.
#[cfg_attr(target_os = "macos", allow(dead_code))]
fn active_window_title(output: &CommandOutput) -> Option<String> {
    (output.success && !output.stdout.is_empty()).then(|| output.stdout.clone())
}

/// Parses `app name\nurl\ntitle`. Windows without a URL are addressed as `app://<name>`.
fn parse_frontmost(output: &str) -> Option<ActiveTab> {
    let mut lines = output.lines().map(str::trim);
    let app_name = lines.next().filter(|name| !name.is_empty())?;
    let url = lines.next().unwrap_or_default();
    let title = lines.next().unwrap_or_default();

    let url = if url.is_empty() || url == "missing value" {
        format!("app://{}", app_name.to_ascii_lowercase().replace(' ', "-"))
    } else {
        url.to_string()
    };
    let title = if title.is_empty() || title == "missing value" {
        app_name.to_string()
    } else {
        title.to_string()
    };

    Some(ActiveTab { url, title })
}

#[cfg(test)]
mod tests {
    use super::{ActiveTab, CommandOutput, active_window_title, parse_frontmost, run_command};

    fn xdotool(success: bool, stdout: &str, stderr: &str) -> CommandOutput {
        CommandOutput {
            program: "xdotool".to_string(),
            success,
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn only_a_successful_query_yields_a_window() {
        assert_eq!(
            active_window_title(&xdotool(true, "main.rs - watcher", "")),
            Some("main.rs - watcher".to_string())
        );
        assert_eq!(
            active_window_title(&xdotool(false, "", "XGetWindowProperty failed")),
            None
        );
        assert_eq!(active_window_title(&xdotool(true, "", "")), None);
    }

    #[test]
    fn failed_exit_becomes_an_error_with_stderr() {
        let err = xdotool(false, "", "Can't open display")
            .into_stdout()
            .expect_err("non-zero exit");
        assert_eq!(err.to_string(), "xdotool failed: Can't open display");
        assert_eq!(
            xdotool(true, "Funny Cat", "").into_stdout().expect("stdout"),
            "Funny Cat"
        );
    }

    #[tokio::test]
    async fn missing_binary_is_an_error_not_an_empty_window() {
        let err = run_command("procrastination-watcher-missing-binary", &[])
            .await
            .expect_err("spawn should fail");
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[test]
    fn parses_browser_tab() {
        let tab = parse_frontmost("Google Chrome\nhttps://youtube.com/watch?v=X\nFunny Cat\n");
        assert_eq!(
            tab,
            Some(ActiveTab {
                url: "https://youtube.com/watch?v=X".into(),
                title: "Funny Cat".into(),
            })
        );
    }

    #[test]
    fn non_browser_window_gets_app_url() {
        let tab = parse_frontmost("Visual Studio Code\n\nmain.rs - watcher").expect("tab");
        assert_eq!(tab.url, "app://visual-studio-code");
        assert_eq!(tab.title, "main.rs - watcher");
    }

    #[test]
    fn missing_title_falls_back_to_app_name() {
        let tab = parse_frontmost("Finder\nmissing value\n").expect("tab");
        assert_eq!(tab.title, "Finder");
    }

    #[test]
    fn empty_output_means_no_window() {
        assert_eq!(parse_frontmost(""), None);
        assert_eq!(parse_frontmost("\n\n"), None);
    }
}
