use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TriggerSpec {
    pub period_in_minutes: u32,
}

impl TriggerSpec {
    pub fn validate(&self) -> Result<(), String> {
        if self.period_in_minutes == 0 {
            return Err("period must be greater than 0".to_string());
        }
        Ok(())
    }

    pub fn period(&self) -> Duration {
        Duration::from_secs(u64::from(self.period_in_minutes) * 60)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerInfo {
    pub name: String,
    pub period_in_minutes: u32,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TriggerEvent {
    pub name: String,
}

struct ActiveTrigger {
    info: TriggerInfo,
    handle: JoinHandle<()>,
}

/// Named recurring triggers. Each trigger is a task that emits a
/// [`TriggerEvent`] every period; the first fire comes one period after
/// creation.
pub struct TriggerScheduler {
    triggers: Mutex<HashMap<String, ActiveTrigger>>,
    event_tx: mpsc::UnboundedSender<TriggerEvent>,
}

impl TriggerScheduler {
    pub fn new(event_tx: mpsc::UnboundedSender<TriggerEvent>) -> Self {
        Self {
            triggers: Mutex::new(HashMap::new()),
            event_tx,
        }
    }

    /// Creates `name`, replacing any trigger already registered under it.
    pub async fn create(&self, name: &str, spec: TriggerSpec) -> Result<TriggerInfo, String> {
        spec.validate()?;

        let info = TriggerInfo {
            name: name.to_string(),
            period_in_minutes: spec.period_in_minutes,
            scheduled_at: Utc::now(),
        };
        let handle = spawn_trigger(name.to_string(), spec.period(), self.event_tx.clone());

        let mut triggers = self.triggers.lock().await;
        if let Some(previous) = triggers.insert(
            name.to_string(),
            ActiveTrigger {
                info: info.clone(),
                handle,
            },
        ) {
            previous.handle.abort();
        }
        tracing::debug!(trigger = name, period_in_minutes = spec.period_in_minutes, "trigger created");
        Ok(info)
    }

    pub async fn clear(&self, name: &str) -> bool {
        match self.triggers.lock().await.remove(name) {
            Some(trigger) => {
                trigger.handle.abort();
                tracing::debug!(trigger = name, "trigger cleared");
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, name: &str) -> Option<TriggerInfo> {
        self.triggers
            .lock()
            .await
            .get(name)
            .map(|trigger| trigger.info.clone())
    }

    pub async fn clear_all(&self) {
        for (_, trigger) in self.triggers.lock().await.drain() {
            trigger.handle.abort();
        }
    }
}

fn spawn_trigger(
    name: String,
    period: Duration,
    event_tx: mpsc::UnboundedSender<TriggerEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        // Missed periods after a suspend are not replayed.
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            interval.tick().await;
            if event_tx.send(TriggerEvent { name: name.clone() }).is_err() {
                break;
            }
        }
    })
}
