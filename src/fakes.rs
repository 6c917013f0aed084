//! In-memory collaborators shared by the unit tests.

use crate::model::{
    ImagePayload, LanguageModel, ModelAvailability, ModelParams, ModelSession, PromptTurn,
    SessionConfig,
};
use crate::notify::{Notification, NotificationSink};
use crate::screenshot::{ScreenshotProvider, encode_data_url};
use crate::tab::{ActiveTab, ActiveTabProvider};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn sample_png() -> Vec<u8> {
    let mut bytes = Vec::new();
    RgbImage::new(8, 6)
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .expect("encode png");
    bytes
}

pub fn sample_image() -> ImagePayload {
    ImagePayload {
        mime: "image/png".into(),
        bytes: sample_png(),
    }
}

#[derive(Default)]
struct ModelState {
    created: AtomicUsize,
    destroyed: AtomicUsize,
    prompts: Mutex<Vec<String>>,
    last_config: Mutex<Option<SessionConfig>>,
}

pub struct FakeModel {
    availability: ModelAvailability,
    availability_fails: bool,
    availability_delay: Duration,
    reply: String,
    prompt_fails: bool,
    prompt_delay: Duration,
    state: Arc<ModelState>,
}

impl FakeModel {
    pub fn new(availability: ModelAvailability) -> Self {
        Self {
            availability,
            availability_fails: false,
            availability_delay: Duration::ZERO,
            reply: r#"{"onTrack":true,"confidence":90,"reason":"Reading docs"}"#.to_string(),
            prompt_fails: false,
            prompt_delay: Duration::ZERO,
            state: Arc::new(ModelState::default()),
        }
    }

    pub fn failing_availability(mut self) -> Self {
        self.availability_fails = true;
        self
    }

    pub fn with_availability_delay(mut self, delay: Duration) -> Self {
        self.availability_delay = delay;
        self
    }

    pub fn with_reply(mut self, reply: &str) -> Self {
        self.reply = reply.to_string();
        self
    }

    pub fn failing_prompt(mut self) -> Self {
        self.prompt_fails = true;
        self
    }

    pub fn with_prompt_delay(mut self, delay: Duration) -> Self {
        self.prompt_delay = delay;
        self
    }

    pub fn sessions_created(&self) -> usize {
        self.state.created.load(Ordering::SeqCst)
    }

    pub fn sessions_destroyed(&self) -> usize {
        self.state.destroyed.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.state.prompts.lock().expect("prompts mutex poisoned").clone()
    }

    pub fn last_config(&self) -> Option<SessionConfig> {
        self.state
            .last_config
            .lock()
            .expect("config mutex poisoned")
            .clone()
    }

    fn session(&self) -> FakeSession {
        FakeSession {
            reply: self.reply.clone(),
            fails: self.prompt_fails,
            delay: self.prompt_delay,
            state: self.state.clone(),
        }
    }
}

#[async_trait]
impl LanguageModel for FakeModel {
    async fn availability(&self) -> Result<ModelAvailability> {
        if !self.availability_delay.is_zero() {
            tokio::time::sleep(self.availability_delay).await;
        }
        if self.availability_fails {
            return Err(anyhow!("availability backend exploded"));
        }
        Ok(self.availability)
    }

    async fn create(&self, config: SessionConfig) -> Result<Box<dyn ModelSession>> {
        self.state.created.fetch_add(1, Ordering::SeqCst);
        *self.state.last_config.lock().expect("config mutex poisoned") = Some(config);
        Ok(Box::new(self.session()))
    }

    async fn params(&self) -> Result<ModelParams> {
        Ok(ModelParams::default())
    }
}

struct FakeSession {
    reply: String,
    fails: bool,
    delay: Duration,
    state: Arc<ModelState>,
}

#[async_trait]
impl ModelSession for FakeSession {
    async fn prompt(&mut self, turns: Vec<PromptTurn>) -> Result<String> {
        let text = turns.iter().map(PromptTurn::text).collect::<Vec<_>>().join("\n");
        self.state
            .prompts
            .lock()
            .expect("prompts mutex poisoned")
            .push(text);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fails {
            return Err(anyhow!("model crashed"));
        }
        Ok(self.reply.clone())
    }

    async fn clone_session(&self) -> Result<Box<dyn ModelSession>> {
        Ok(Box::new(FakeSession {
            reply: self.reply.clone(),
            fails: self.fails,
            delay: self.delay,
            state: self.state.clone(),
        }))
    }

    fn destroy(&mut self) {
        self.state.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

pub struct FakeTabs {
    tab: Option<ActiveTab>,
    calls: AtomicUsize,
}

impl FakeTabs {
    pub fn new(url: &str, title: &str) -> Self {
        Self {
            tab: Some(ActiveTab {
                url: url.to_string(),
                title: title.to_string(),
            }),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn empty() -> Self {
        Self {
            tab: None,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ActiveTabProvider for FakeTabs {
    async fn active_tab(&self) -> Result<Option<ActiveTab>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.tab.clone())
    }
}

pub struct FakeScreenshots {
    fails: bool,
    data_url: String,
    calls: AtomicUsize,
}

impl FakeScreenshots {
    pub fn new() -> Self {
        Self {
            fails: false,
            data_url: encode_data_url("image/png", &sample_png()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            fails: true,
            ..Self::new()
        }
    }

    pub fn returning(data_url: &str) -> Self {
        Self {
            data_url: data_url.to_string(),
            ..Self::new()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ScreenshotProvider for FakeScreenshots {
    async fn capture(&self) -> Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fails {
            return Err(anyhow!("Cannot access contents of the page"));
        }
        Ok(self.data_url.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivered {
    pub notification: Notification,
    pub fallback: bool,
}

#[derive(Default)]
pub struct RecordingNotifier {
    primary_fails: bool,
    fallback_fails: bool,
    delivered: Mutex<Vec<Delivered>>,
    attempts: AtomicUsize,
}

impl RecordingNotifier {
    pub fn failing_primary() -> Self {
        Self {
            primary_fails: true,
            ..Self::default()
        }
    }

    pub fn failing_everything() -> Self {
        Self {
            primary_fails: true,
            fallback_fails: true,
            ..Self::default()
        }
    }

    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered
            .lock()
            .expect("notifier mutex poisoned")
            .clone()
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationSink for RecordingNotifier {
    async fn create(&self, id: Option<&str>, notification: &Notification) -> Result<String> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.primary_fails {
            return Err(anyhow!("notification service unavailable"));
        }
        self.delivered
            .lock()
            .expect("notifier mutex poisoned")
            .push(Delivered {
                notification: notification.clone(),
                fallback: false,
            });
        Ok(id.unwrap_or("generated").to_string())
    }

    async fn show_fallback(&self, notification: &Notification) -> Result<()> {
        if self.fallback_fails {
            return Err(anyhow!("fallback unavailable"));
        }
        self.delivered
            .lock()
            .expect("notifier mutex poisoned")
            .push(Delivered {
                notification: notification.clone(),
                fallback: true,
            });
        Ok(())
    }
}
