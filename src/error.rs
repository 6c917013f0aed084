//! Error taxonomy for the watcher.
//!
//! Collaborators (store backends, capture, model transport) return
//! `anyhow::Result`; the orchestration layer folds those into [`WatchError`]
//! so a failed check can be reported with a single message.

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("settings store failed: {0:#}")]
    Store(anyhow::Error),

    #[error("active window query failed: {0:#}")]
    TabQuery(anyhow::Error),

    #[error("screenshot capture failed: {0:#}")]
    Capture(anyhow::Error),

    #[error("screenshot could not be decoded: {0}")]
    Decode(String),

    #[error("{0}")]
    ModelUnavailable(String),

    #[error("model inference failed: {0:#}")]
    Inference(anyhow::Error),

    #[error("model reply is not a valid verdict: {0}")]
    MalformedVerdict(String),

    #[error("No active session to clone")]
    NoSession,

    #[error("notification failed: {0:#}")]
    Notification(anyhow::Error),

    #[error("control channel failed: {0:#}")]
    Control(anyhow::Error),

    #[error("{0}")]
    InvalidInput(String),
}

pub type WatchResult<T> = std::result::Result<T, WatchError>;

#[cfg(test)]
mod tests {
    use super::WatchError;
    use anyhow::anyhow;

    #[test]
    fn capture_error_keeps_source_chain() {
        let err = WatchError::Capture(anyhow!("permission denied").context("screencapture"));
        assert_eq!(
            err.to_string(),
            "screenshot capture failed: screencapture: permission denied"
        );
    }

    #[test]
    fn unavailable_message_is_passed_through() {
        let err = WatchError::ModelUnavailable("AI model unavailable on this device".into());
        assert_eq!(err.to_string(), "AI model unavailable on this device");
    }
}
