use crate::control::{ControlClient, ControlMessage, ControlResponse, WatcherStatus};
use crate::error::{WatchError, WatchResult};
use crate::session::AvailabilityStatus;
use crate::settings::{GoalAlert, SettingsStore, WatcherSettings, validate_check_interval};
use chrono::Utc;
use std::sync::Arc;

/// User-facing half of the watcher. Writes the goal and settings, then tells
/// the service to start or stop its trigger.
pub struct PopupController {
    store: SettingsStore,
    client: Arc<dyn ControlClient>,
}

impl PopupController {
    pub fn new(store: SettingsStore, client: Arc<dyn ControlClient>) -> Self {
        Self { store, client }
    }

    pub async fn start(&self, goal: &str, interval: u32) -> WatchResult<GoalAlert> {
        let goal = goal.trim();
        if goal.is_empty() {
            return Err(WatchError::InvalidInput(
                "Please enter a goal before starting".to_string(),
            ));
        }
        validate_check_interval(interval).map_err(WatchError::InvalidInput)?;

        let availability = self.status().await?.availability;
        if availability.status == AvailabilityStatus::NoApi {
            return Err(WatchError::ModelUnavailable(
                availability
                    .error
                    .unwrap_or_else(|| "no language model is configured".to_string()),
            ));
        }

        let alert = GoalAlert {
            goal: goal.to_string(),
            enabled: true,
            started_at: Utc::now().timestamp_millis(),
        };
        self.store
            .set_active_alert(&alert)
            .await
            .map_err(WatchError::Store)?;
        self.store
            .set_watcher_settings(WatcherSettings {
                check_interval: interval,
                enabled: true,
            })
            .await
            .map_err(WatchError::Store)?;

        self.send(ControlMessage::StartWatching {
            interval: Some(interval),
        })
        .await?;
        tracing::info!(goal = %alert.goal, interval, "watching started");
        Ok(alert)
    }

    pub async fn stop(&self) -> WatchResult<()> {
        let settings = self
            .store
            .get_watcher_settings()
            .await
            .map_err(WatchError::Store)?;
        self.store
            .clear_active_alert()
            .await
            .map_err(WatchError::Store)?;
        self.store
            .set_watcher_settings(WatcherSettings {
                check_interval: settings.check_interval,
                enabled: false,
            })
            .await
            .map_err(WatchError::Store)?;

        self.send(ControlMessage::StopWatching).await?;
        tracing::info!("watching stopped");
        Ok(())
    }

    pub async fn test_notification(&self) -> WatchResult<()> {
        self.send(ControlMessage::TestNotification).await?;
        Ok(())
    }

    pub async fn status(&self) -> WatchResult<WatcherStatus> {
        let response = self.send(ControlMessage::Status).await?;
        response
            .status
            .map(|status| *status)
            .ok_or_else(|| WatchError::Control(anyhow::anyhow!("daemon sent no status")))
    }

    pub async fn check_now(&self) -> WatchResult<ControlResponse> {
        self.send(ControlMessage::CheckNow).await
    }

    async fn send(&self, message: ControlMessage) -> WatchResult<ControlResponse> {
        let response = self
            .client
            .send(message)
            .await
            .map_err(WatchError::Control)?;
        if !response.success {
            let error = response
                .error
                .unwrap_or_else(|| "daemon reported failure".to_string());
            return Err(WatchError::Control(anyhow::anyhow!(error)));
        }
        Ok(response)
    }
}

/// Time since `started_at_ms`, as `Nm` below an hour and `Nh Mm` above.
pub fn format_elapsed(started_at_ms: i64, now_ms: i64) -> String {
    let minutes = now_ms.saturating_sub(started_at_ms).max(0) / 60_000;
    if minutes < 60 {
        format!("{minutes}m")
    } else {
        format!("{}h {}m", minutes / 60, minutes % 60)
    }
}
