use crate::checker::{ActivityChecker, CHECK_TRIGGER, CheckOutcome};
use crate::control::{
    ControlClient, ControlHandler, ControlMessage, ControlResponse, TriggerStatus, WatcherStatus,
};
use crate::notify::{Notification, NotificationKind};
use crate::scheduler::{TriggerEvent, TriggerScheduler, TriggerSpec};
use crate::settings::{DEFAULT_CHECK_INTERVAL, validate_check_interval};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Background side of the watcher: owns the check trigger and answers control
/// messages from the CLI.
pub struct WatcherService {
    checker: Arc<ActivityChecker>,
    scheduler: TriggerScheduler,
}

impl WatcherService {
    /// Returns the service together with the receiving end of its trigger
    /// channel, which [`WatcherService::run_triggers`] consumes.
    pub fn new(checker: Arc<ActivityChecker>) -> (Self, mpsc::UnboundedReceiver<TriggerEvent>) {
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();
        let service = Self {
            checker,
            scheduler: TriggerScheduler::new(trigger_tx),
        };
        (service, trigger_rx)
    }

    pub fn checker(&self) -> &Arc<ActivityChecker> {
        &self.checker
    }

    /// Re-arms the check trigger after a daemon restart when watching was
    /// left enabled. Returns whether a trigger was created.
    pub async fn restore(&self) -> Result<bool> {
        let store = self.checker.store();
        let settings = store.get_watcher_settings().await?;
        let alert = store.get_active_alert().await?;

        match alert {
            Some(alert) if settings.enabled && alert.enabled => {
                validate_check_interval(settings.check_interval).map_err(anyhow::Error::msg)?;
                self.scheduler
                    .create(
                        CHECK_TRIGGER,
                        TriggerSpec {
                            period_in_minutes: settings.check_interval,
                        },
                    )
                    .await
                    .map_err(anyhow::Error::msg)?;
                tracing::info!(
                    goal = %alert.goal,
                    interval = settings.check_interval,
                    "restored activity check trigger"
                );
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Spawns one check per fired trigger until the channel closes.
    pub async fn run_triggers(&self, mut trigger_rx: mpsc::UnboundedReceiver<TriggerEvent>) {
        while let Some(event) = trigger_rx.recv().await {
            if event.name != CHECK_TRIGGER {
                tracing::debug!(trigger = %event.name, "ignoring unknown trigger");
                continue;
            }
            tracing::debug!("check trigger fired");
            self.checker.spawn_check();
        }
    }

    pub async fn shutdown(&self) {
        self.scheduler.clear_all().await;
    }

    async fn start_watching(&self, interval: Option<u32>) -> ControlResponse {
        let interval = interval.unwrap_or(DEFAULT_CHECK_INTERVAL);
        if let Err(err) = validate_check_interval(interval) {
            tracing::warn!(interval, "rejected check interval");
            return ControlResponse::failed(err);
        }
        self.scheduler.clear(CHECK_TRIGGER).await;

        if let Err(err) = self
            .scheduler
            .create(
                CHECK_TRIGGER,
                TriggerSpec {
                    period_in_minutes: interval,
                },
            )
            .await
        {
            tracing::warn!(error = %err, interval, "failed to create check trigger");
            return ControlResponse::failed(err);
        }

        if let Some(trigger) = self.scheduler.get(CHECK_TRIGGER).await {
            tracing::info!(
                trigger = %trigger.name,
                period_in_minutes = trigger.period_in_minutes,
                scheduled_at = %trigger.scheduled_at,
                "watching started"
            );
        }

        self.checker.spawn_check();
        ControlResponse::ok()
    }

    async fn stop_watching(&self) -> ControlResponse {
        let cleared = self.scheduler.clear(CHECK_TRIGGER).await;
        tracing::info!(cleared, "watching stopped");
        ControlResponse::ok()
    }

    async fn test_notification(&self) -> ControlResponse {
        let notification = Notification {
            title: "Test Notification".to_string(),
            message: "If you see this, notifications are working!".to_string(),
            kind: NotificationKind::Info,
            require_interaction: false,
        };
        match self.checker.deliver(&notification).await {
            Some(_) => ControlResponse::ok(),
            None => ControlResponse::failed("desktop notification failed"),
        }
    }

    async fn check_now(&self) -> ControlResponse {
        match self.checker.run_check().await {
            CheckOutcome::Notified { verdict, .. } => ControlResponse {
                verdict: Some(verdict),
                ..ControlResponse::ok()
            },
            CheckOutcome::Skipped(reason) => {
                ControlResponse::failed(format!("check skipped: {reason}"))
            }
            CheckOutcome::Failed { message } => ControlResponse::failed(message),
        }
    }

    pub async fn status(&self) -> Result<WatcherStatus> {
        let store = self.checker.store();
        let trigger = self
            .scheduler
            .get(CHECK_TRIGGER)
            .await
            .map(|info| TriggerStatus {
                period_in_minutes: info.period_in_minutes,
                scheduled_at: info.scheduled_at,
            });

        Ok(WatcherStatus {
            alert: store.get_active_alert().await?,
            settings: store.get_watcher_settings().await?,
            trigger,
            availability: self.checker.availability().await,
            model_params: self.checker.model_info().await,
            checking: self.checker.is_checking(),
        })
    }
}

#[async_trait]
impl ControlHandler for WatcherService {
    async fn handle(&self, message: ControlMessage) -> ControlResponse {
        match message {
            ControlMessage::StartWatching { interval } => self.start_watching(interval).await,
            ControlMessage::StopWatching => self.stop_watching().await,
            ControlMessage::TestNotification => self.test_notification().await,
            ControlMessage::CheckNow => self.check_now().await,
            ControlMessage::Status => match self.status().await {
                Ok(status) => ControlResponse::with_status(status),
                Err(err) => ControlResponse::failed(format!("{err:#}")),
            },
        }
    }
}

/// In-process client, used when the controller and the service share a
/// runtime.
#[async_trait]
impl ControlClient for WatcherService {
    async fn send(&self, message: ControlMessage) -> Result<ControlResponse> {
        Ok(self.handle(message).await)
    }
}
