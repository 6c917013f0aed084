use crate::analysis::{AnalysisRequest, AnalysisVerdict, analyze_activity};
use crate::error::{WatchError, WatchResult};
use crate::model::ModelParams;
use crate::notify::{Notification, NotificationKind, NotificationSink, notification_id};
use crate::screenshot::{ScreenshotProvider, decode_data_url, fit_for_model};
use crate::session::{Availability, ModelInspector, SessionManager};
use crate::settings::{GoalAlert, SettingsStore};
use crate::tab::ActiveTabProvider;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;

pub const CHECK_TRIGGER: &str = "checkActivity";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NoActiveAlert,
    NoActiveTab,
    AlreadyRunning,
}

impl std::fmt::Display for SkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            SkipReason::NoActiveAlert => "no active alert",
            SkipReason::NoActiveTab => "no active tab",
            SkipReason::AlreadyRunning => "a check is already running",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    Skipped(SkipReason),
    Notified {
        verdict: AnalysisVerdict,
        notification_id: Option<String>,
    },
    Failed {
        message: String,
    },
}

#[derive(Debug, Clone)]
pub enum CheckerEvent {
    Started { check_index: u64 },
    Skipped { check_index: u64, reason: SkipReason },
    Verdict { check_index: u64, verdict: AnalysisVerdict },
    Failed { check_index: u64, message: String },
}

enum Evaluation {
    Skip(SkipReason),
    Verdict {
        alert: GoalAlert,
        verdict: AnalysisVerdict,
    },
}

/// Runs one activity check per trigger: alert -> active tab -> screenshot ->
/// verdict -> notification. Every check that gets past the skip conditions
/// ends in exactly one notification, either the verdict or an error.
pub struct ActivityChecker {
    store: SettingsStore,
    tabs: Arc<dyn ActiveTabProvider>,
    screenshots: Arc<dyn ScreenshotProvider>,
    notifier: Arc<dyn NotificationSink>,
    inspector: ModelInspector,
    sessions: Mutex<SessionManager>,
    in_flight: AtomicBool,
    checks: AtomicU64,
    max_image_dimension: u32,
    event_tx: Option<mpsc::UnboundedSender<CheckerEvent>>,
}

struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl ActivityChecker {
    pub fn new(
        store: SettingsStore,
        tabs: Arc<dyn ActiveTabProvider>,
        screenshots: Arc<dyn ScreenshotProvider>,
        notifier: Arc<dyn NotificationSink>,
        sessions: SessionManager,
    ) -> Self {
        Self {
            store,
            tabs,
            screenshots,
            notifier,
            inspector: sessions.inspector(),
            sessions: Mutex::new(sessions),
            in_flight: AtomicBool::new(false),
            checks: AtomicU64::new(0),
            max_image_dimension: 1280,
            event_tx: None,
        }
    }

    pub fn with_max_image_dimension(mut self, max_image_dimension: u32) -> Self {
        self.max_image_dimension = max_image_dimension;
        self
    }

    pub fn with_events(mut self, event_tx: mpsc::UnboundedSender<CheckerEvent>) -> Self {
        self.event_tx = Some(event_tx);
        self
    }

    pub fn store(&self) -> &SettingsStore {
        &self.store
    }

    pub fn is_checking(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Does not wait for a check in progress.
    pub async fn availability(&self) -> Availability {
        self.inspector.availability().await
    }

    pub async fn model_info(&self) -> Option<ModelParams> {
        self.inspector.model_info().await
    }

    pub async fn has_session(&self) -> bool {
        self.sessions.lock().await.has_session()
    }

    pub fn spawn_check(self: &Arc<Self>) -> JoinHandle<CheckOutcome> {
        let checker = Arc::clone(self);
        tokio::spawn(async move { checker.run_check().await })
    }

    pub async fn run_check(&self) -> CheckOutcome {
        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("trigger dropped: check already in flight");
            return CheckOutcome::Skipped(SkipReason::AlreadyRunning);
        }
        let _in_flight = InFlight(&self.in_flight);

        let check_index = self.checks.fetch_add(1, Ordering::Relaxed) + 1;
        self.send_event(CheckerEvent::Started { check_index });
        tracing::debug!(check_index, "starting activity check");

        match self.evaluate().await {
            Ok(Evaluation::Skip(reason)) => {
                tracing::debug!(check_index, %reason, "skipping check");
                self.send_event(CheckerEvent::Skipped {
                    check_index,
                    reason,
                });
                CheckOutcome::Skipped(reason)
            }
            Ok(Evaluation::Verdict { alert, verdict }) => {
                tracing::info!(
                    check_index,
                    on_track = verdict.on_track,
                    confidence = verdict.confidence,
                    reason = %verdict.reason,
                    "analysis result"
                );
                let notification_id = self
                    .deliver(&verdict_notification(&alert.goal, &verdict))
                    .await;
                self.send_event(CheckerEvent::Verdict {
                    check_index,
                    verdict: verdict.clone(),
                });
                CheckOutcome::Notified {
                    verdict,
                    notification_id,
                }
            }
            Err(err) => {
                let message = err.to_string();
                tracing::error!(check_index, error = %message, "activity check failed");
                self.deliver(&error_notification(&message)).await;
                self.send_event(CheckerEvent::Failed {
                    check_index,
                    message: message.clone(),
                });
                CheckOutcome::Failed { message }
            }
        }
    }

    async fn evaluate(&self) -> WatchResult<Evaluation> {
        let alert = match self.store.get_active_alert().await.map_err(WatchError::Store)? {
            Some(alert) if alert.enabled => alert,
            _ => return Ok(Evaluation::Skip(SkipReason::NoActiveAlert)),
        };

        let Some(tab) = self.tabs.active_tab().await.map_err(WatchError::TabQuery)? else {
            return Ok(Evaluation::Skip(SkipReason::NoActiveTab));
        };
        tracing::debug!(url = %tab.url, title = %tab.title, "current tab");

        let data_url = self
            .screenshots
            .capture()
            .await
            .map_err(WatchError::Capture)?;
        tracing::debug!(chars = data_url.len(), "screenshot captured");

        let image = fit_for_model(decode_data_url(&data_url)?, self.max_image_dimension)?;
        tracing::debug!(bytes = image.bytes.len(), "screenshot decoded");

        let request = AnalysisRequest {
            goal: alert.goal.clone(),
            tab_url: tab.url,
            tab_title: tab.title,
            image,
        };
        let verdict = {
            let mut sessions = self.sessions.lock().await;
            analyze_activity(&mut sessions, request).await?
        };

        Ok(Evaluation::Verdict { alert, verdict })
    }

    /// Shows `notification`, falling back to the secondary path on failure.
    /// A failure of both paths is logged and otherwise dropped.
    pub async fn deliver(&self, notification: &Notification) -> Option<String> {
        let id = notification_id();
        match self.notifier.create(Some(&id), notification).await {
            Ok(id) => {
                tracing::debug!(id = %id, title = %notification.title, "notification created");
                Some(id)
            }
            Err(err) => {
                let err = WatchError::Notification(err);
                tracing::warn!(error = %err, "notification failed, trying fallback");
                if let Err(err) = self.notifier.show_fallback(notification).await {
                    let err = WatchError::Notification(err);
                    tracing::error!(error = %err, "fallback notification failed");
                }
                None
            }
        }
    }

    fn send_event(&self, event: CheckerEvent) {
        if let Some(tx) = &self.event_tx {
            let _ = tx.send(event);
        }
    }
}

pub fn verdict_notification(goal: &str, verdict: &AnalysisVerdict) -> Notification {
    if verdict.on_track {
        Notification {
            title: "✅ On Track!".to_string(),
            message: format!("Great job! Keep working on: \"{goal}\"\n\n{}", verdict.reason),
            kind: NotificationKind::Success,
            require_interaction: true,
        }
    } else {
        Notification {
            title: "⚠️ Procrastination Detected".to_string(),
            message: format!("You said you'd: \"{goal}\"\n\n{}", verdict.reason),
            kind: NotificationKind::Warning,
            require_interaction: true,
        }
    }
}

pub fn error_notification(message: &str) -> Notification {
    Notification {
        title: "❌ Watcher Error".to_string(),
        message: format!("Error: {message}"),
        kind: NotificationKind::Error,
        require_interaction: false,
    }
}

#[cfg(test)]
mod tests {
    use super::{ActivityChecker, CheckOutcome, CheckerEvent, SkipReason};
    use crate::fakes::{FakeModel, FakeScreenshots, FakeTabs, RecordingNotifier};
    use crate::model::ModelAvailability;
    use crate::notify::NotificationKind;
    use crate::session::SessionManager;
    use crate::settings::{GoalAlert, SettingsStore};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Harness {
        store: SettingsStore,
        tabs: Arc<FakeTabs>,
        screenshots: Arc<FakeScreenshots>,
        notifier: Arc<RecordingNotifier>,
        model: Arc<FakeModel>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with(
                FakeTabs::new("https://youtube.com/watch?v=X", "Funny Cat"),
                FakeScreenshots::new(),
                RecordingNotifier::default(),
                FakeModel::new(ModelAvailability::Readily).with_reply(
                    r#"{"onTrack":false,"confidence":85,"reason":"Off-topic video"}"#,
                ),
            )
        }

        fn with(
            tabs: FakeTabs,
            screenshots: FakeScreenshots,
            notifier: RecordingNotifier,
            model: FakeModel,
        ) -> Self {
            Self {
                store: SettingsStore::in_memory(),
                tabs: Arc::new(tabs),
                screenshots: Arc::new(screenshots),
                notifier: Arc::new(notifier),
                model: Arc::new(model),
            }
        }

        fn checker(&self) -> ActivityChecker {
            ActivityChecker::new(
                self.store.clone(),
                self.tabs.clone(),
                self.screenshots.clone(),
                self.notifier.clone(),
                SessionManager::new(Some(self.model.clone())),
            )
        }

        async fn watch(&self, goal: &str, enabled: bool) {
            self.store
                .set_active_alert(&GoalAlert {
                    goal: goal.to_string(),
                    enabled,
                    started_at: 0,
                })
                .await
                .expect("set alert");
        }
    }

    #[tokio::test]
    async fn absent_or_disabled_alert_is_a_no_op() {
        let harness = Harness::new();
        let checker = harness.checker();

        assert_eq!(
            checker.run_check().await,
            CheckOutcome::Skipped(SkipReason::NoActiveAlert)
        );

        harness.watch("Study React", false).await;
        assert_eq!(
            checker.run_check().await,
            CheckOutcome::Skipped(SkipReason::NoActiveAlert)
        );

        assert_eq!(harness.tabs.calls(), 0);
        assert_eq!(harness.screenshots.calls(), 0);
        assert!(harness.model.prompts().is_empty());
        assert_eq!(harness.notifier.attempts(), 0);
    }

    #[tokio::test]
    async fn missing_tab_is_a_no_op() {
        let harness = Harness::with(
            FakeTabs::empty(),
            FakeScreenshots::new(),
            RecordingNotifier::default(),
            FakeModel::new(ModelAvailability::Readily),
        );
        harness.watch("Study React", true).await;

        assert_eq!(
            harness.checker().run_check().await,
            CheckOutcome::Skipped(SkipReason::NoActiveTab)
        );
        assert_eq!(harness.screenshots.calls(), 0);
        assert!(harness.notifier.delivered().is_empty());
    }

    #[tokio::test]
    async fn off_track_verdict_raises_warning() {
        let harness = Harness::new();
        harness.watch("Study React", true).await;
        let checker = harness.checker();

        let outcome = checker.run_check().await;
        let CheckOutcome::Notified { verdict, .. } = outcome else {
            panic!("expected a verdict, got {outcome:?}");
        };
        assert!(!verdict.on_track);
        assert_eq!(verdict.confidence, 85);

        let prompt = harness.model.prompts().pop().expect("prompt");
        assert!(prompt.contains("Study React"));
        assert!(prompt.contains("https://youtube.com/watch?v=X"));
        assert!(prompt.contains("Funny Cat"));

        let delivered = harness.notifier.delivered();
        assert_eq!(delivered.len(), 1);
        let notification = &delivered[0].notification;
        assert_eq!(notification.kind, NotificationKind::Warning);
        assert_eq!(notification.title, "⚠️ Procrastination Detected");
        assert!(notification.message.contains("\"Study React\""));
        assert!(notification.message.contains("Off-topic video"));
        assert!(notification.require_interaction);

        assert!(!checker.has_session().await);
    }

    #[tokio::test]
    async fn on_track_verdict_raises_encouragement() {
        let harness = Harness::with(
            FakeTabs::new("https://react.dev/learn", "Quick Start – React"),
            FakeScreenshots::new(),
            RecordingNotifier::default(),
            FakeModel::new(ModelAvailability::Readily)
                .with_reply("Here you go:\n{\"onTrack\":true,\"confidence\":95,\"reason\":\"React docs\"}"),
        );
        harness.watch("Study React", true).await;

        harness.checker().run_check().await;
        let delivered = harness.notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].notification.kind, NotificationKind::Success);
        assert!(
            delivered[0]
                .notification
                .message
                .starts_with("Great job! Keep working on: \"Study React\"")
        );
    }

    #[tokio::test]
    async fn capture_failure_yields_one_error_and_no_inference() {
        let harness = Harness::with(
            FakeTabs::new("https://example.com", "Example"),
            FakeScreenshots::failing(),
            RecordingNotifier::default(),
            FakeModel::new(ModelAvailability::Readily),
        );
        harness.watch("Study React", true).await;

        let outcome = harness.checker().run_check().await;
        assert!(matches!(outcome, CheckOutcome::Failed { .. }));
        assert!(harness.model.prompts().is_empty());
        assert_eq!(harness.model.sessions_created(), 0);

        let delivered = harness.notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].notification.title, "❌ Watcher Error");
        assert_eq!(delivered[0].notification.kind, NotificationKind::Error);
        assert!(
            delivered[0]
                .notification
                .message
                .contains("Cannot access contents of the page")
        );
    }

    #[tokio::test]
    async fn undecodable_screenshot_is_reported() {
        let harness = Harness::with(
            FakeTabs::new("https://example.com", "Example"),
            FakeScreenshots::returning("data:image/png;base64,bW9jay1pbWFnZQ=="),
            RecordingNotifier::default(),
            FakeModel::new(ModelAvailability::Readily),
        );
        harness.watch("Study React", true).await;

        let outcome = harness.checker().run_check().await;
        assert!(matches!(outcome, CheckOutcome::Failed { .. }));
        assert!(harness.model.prompts().is_empty());
        assert_eq!(harness.notifier.delivered().len(), 1);
    }

    #[tokio::test]
    async fn model_unavailable_is_reported() {
        let harness = Harness::with(
            FakeTabs::new("https://example.com", "Example"),
            FakeScreenshots::new(),
            RecordingNotifier::default(),
            FakeModel::new(ModelAvailability::Unavailable),
        );
        harness.watch("Study React", true).await;

        let outcome = harness.checker().run_check().await;
        assert_eq!(
            outcome,
            CheckOutcome::Failed {
                message: "AI model unavailable on this device".into()
            }
        );
        assert_eq!(
            harness.notifier.delivered()[0].notification.message,
            "Error: AI model unavailable on this device"
        );
    }

    #[tokio::test]
    async fn failed_notification_uses_fallback() {
        let harness = Harness::with(
            FakeTabs::new("https://youtube.com/watch?v=X", "Funny Cat"),
            FakeScreenshots::new(),
            RecordingNotifier::failing_primary(),
            FakeModel::new(ModelAvailability::Readily),
        );
        harness.watch("Study React", true).await;

        let outcome = harness.checker().run_check().await;
        assert!(matches!(
            outcome,
            CheckOutcome::Notified {
                notification_id: None,
                ..
            }
        ));
        let delivered = harness.notifier.delivered();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].fallback);
    }

    #[tokio::test]
    async fn double_notification_failure_is_swallowed() {
        let harness = Harness::with(
            FakeTabs::new("https://youtube.com/watch?v=X", "Funny Cat"),
            FakeScreenshots::new(),
            RecordingNotifier::failing_everything(),
            FakeModel::new(ModelAvailability::Readily),
        );
        harness.watch("Study React", true).await;

        let outcome = harness.checker().run_check().await;
        assert!(matches!(outcome, CheckOutcome::Notified { .. }));
        assert!(harness.notifier.delivered().is_empty());
    }

    #[tokio::test]
    async fn overlapping_trigger_is_dropped() {
        let harness = Harness::with(
            FakeTabs::new("https://youtube.com/watch?v=X", "Funny Cat"),
            FakeScreenshots::new(),
            RecordingNotifier::default(),
            FakeModel::new(ModelAvailability::Readily).with_prompt_delay(Duration::from_millis(200)),
        );
        harness.watch("Study React", true).await;
        let checker = Arc::new(harness.checker());

        let first = checker.spawn_check();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(checker.is_checking());
        assert_eq!(
            checker.run_check().await,
            CheckOutcome::Skipped(SkipReason::AlreadyRunning)
        );

        let outcome = first.await.expect("join");
        assert!(matches!(outcome, CheckOutcome::Notified { .. }));
        assert!(!checker.is_checking());
        assert_eq!(harness.model.sessions_created(), 1);
        assert_eq!(harness.notifier.delivered().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn availability_answers_during_slow_inference() {
        let harness = Harness::with(
            FakeTabs::new("https://youtube.com/watch?v=X", "Funny Cat"),
            FakeScreenshots::new(),
            RecordingNotifier::default(),
            FakeModel::new(ModelAvailability::Readily).with_prompt_delay(Duration::from_secs(120)),
        );
        harness.watch("Study React", true).await;
        let checker = Arc::new(harness.checker());

        let running = checker.spawn_check();
        while harness.model.prompts().is_empty() {
            tokio::task::yield_now().await;
        }
        assert!(checker.is_checking());

        let availability = tokio::time::timeout(Duration::from_secs(5), checker.availability())
            .await
            .expect("availability must not wait for the inference");
        assert!(availability.available);
        let params = tokio::time::timeout(Duration::from_secs(5), checker.model_info())
            .await
            .expect("model info must not wait for the inference");
        assert!(params.is_some());

        running.abort();
    }

    #[tokio::test]
    async fn emits_events_per_check() {
        let harness = Harness::new();
        harness.watch("Study React", true).await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let checker = harness.checker().with_events(tx);

        checker.run_check().await;
        drop(checker);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert!(matches!(events[0], CheckerEvent::Started { check_index: 1 }));
        assert!(matches!(
            events[1],
            CheckerEvent::Verdict { check_index: 1, .. }
        ));
    }
}
