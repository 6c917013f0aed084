use crate::error::{WatchError, WatchResult};
use crate::model::{
    ExpectedOutput, LanguageModel, Modality, ModelAvailability, ModelParams, ModelSession,
    PromptTurn, SessionConfig,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

pub const AVAILABILITY_TIMEOUT: Duration = Duration::from_secs(5);

pub const SYSTEM_INSTRUCTION: &str = "You are a productivity assistant called Procrastination Watcher.
Your job is to analyze whether the user's current activity aligns with their stated goal.

Rules:
1. Be understanding but firm - procrastination is natural but needs gentle correction
2. Consider context: YouTube can be work-related (tutorials), Reddit can be research
3. Return ONLY valid JSON - no markdown, no explanations
4. Be concise and encouraging in your reasoning";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AvailabilityStatus {
    ReadilyAvailable,
    AfterDownload,
    NoApi,
    Unavailable,
    Error,
}

impl std::fmt::Display for AvailabilityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            AvailabilityStatus::ReadilyAvailable => "readily-available",
            AvailabilityStatus::AfterDownload => "after-download",
            AvailabilityStatus::NoApi => "no-api",
            AvailabilityStatus::Unavailable => "unavailable",
            AvailabilityStatus::Error => "error",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Availability {
    pub available: bool,
    pub status: AvailabilityStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Availability {
    fn from_model(availability: ModelAvailability) -> Self {
        let status = match availability {
            ModelAvailability::Readily => AvailabilityStatus::ReadilyAvailable,
            ModelAvailability::AfterDownload => AvailabilityStatus::AfterDownload,
            ModelAvailability::Unavailable => AvailabilityStatus::Unavailable,
        };
        Self {
            available: status != AvailabilityStatus::Unavailable,
            status,
            error: None,
        }
    }

    fn failed(status: AvailabilityStatus, error: impl Into<String>) -> Self {
        Self {
            available: false,
            status,
            error: Some(error.into()),
        }
    }
}

/// Read-only view of the model used for status queries.
///
/// Cloned out of [`SessionManager`] so status queries never wait behind a running
/// inference.
#[derive(Clone)]
pub struct ModelInspector {
    model: Option<Arc<dyn LanguageModel>>,
    timeout: Duration,
}

impl ModelInspector {
    /// Asks the model for its availability. Never fails: problems come back as a status.
    pub async fn availability(&self) -> Availability {
        let Some(model) = self.model.as_ref() else {
            tracing::warn!("language model API not configured");
            return Availability::failed(
                AvailabilityStatus::NoApi,
                "Local language model is not configured",
            );
        };

        match timeout(self.timeout, model.availability()).await {
            Ok(Ok(availability)) => {
                let result = Availability::from_model(availability);
                tracing::debug!(status = %result.status, "AI availability status");
                result
            }
            Ok(Err(err)) => {
                tracing::warn!(error = %format!("{err:#}"), "availability check error");
                Availability::failed(AvailabilityStatus::Error, format!("{err:#}"))
            }
            Err(_) => {
                tracing::warn!(
                    timeout_secs = self.timeout.as_secs_f32(),
                    "availability check timed out"
                );
                Availability::failed(AvailabilityStatus::Error, "Availability check timeout")
            }
        }
    }

    pub async fn model_info(&self) -> Option<ModelParams> {
        let model = self.model.as_ref()?;
        match timeout(self.timeout, model.params()).await {
            Ok(Ok(params)) => Some(params),
            Ok(Err(err)) => {
                tracing::warn!(error = %format!("{err:#}"), "failed to get model params");
                None
            }
            Err(_) => {
                tracing::warn!("model params query timed out");
                None
            }
        }
    }
}

/// Owns the single live model session.
///
/// `NoSession -> SessionReady` on [`SessionManager::ensure_session`],
/// back to `NoSession` on [`SessionManager::reset_session`].
pub struct SessionManager {
    inspector: ModelInspector,
    session: Option<Box<dyn ModelSession>>,
    temperature: Option<f32>,
    top_k: Option<u32>,
}

impl SessionManager {
    pub fn new(model: Option<Arc<dyn LanguageModel>>) -> Self {
        Self {
            inspector: ModelInspector {
                model,
                timeout: AVAILABILITY_TIMEOUT,
            },
            session: None,
            temperature: None,
            top_k: None,
        }
    }

    pub fn with_availability_timeout(mut self, availability_timeout: Duration) -> Self {
        self.inspector.timeout = availability_timeout;
        self
    }

    pub fn with_sampling(mut self, temperature: Option<f32>, top_k: Option<u32>) -> Self {
        self.temperature = temperature;
        self.top_k = top_k;
        self
    }

    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    pub fn inspector(&self) -> ModelInspector {
        self.inspector.clone()
    }

    pub async fn availability(&self) -> Availability {
        self.inspector.availability().await
    }

    pub async fn ensure_session(&mut self) -> WatchResult<&mut (dyn ModelSession + 'static)> {
        if self.session.is_none() {
            let model = self.inspector.model.clone().ok_or_else(|| {
                WatchError::ModelUnavailable("Local language model is not configured".to_string())
            })?;

            let status = match timeout(self.inspector.timeout, model.availability()).await {
                Ok(Ok(status)) => status,
                Ok(Err(err)) => {
                    return Err(WatchError::ModelUnavailable(format!(
                        "AI availability check failed: {err:#}"
                    )));
                }
                Err(_) => {
                    return Err(WatchError::ModelUnavailable(
                        "Availability check timeout".to_string(),
                    ));
                }
            };

            if status == ModelAvailability::Unavailable {
                return Err(WatchError::ModelUnavailable(
                    "AI model unavailable on this device".to_string(),
                ));
            }

            let session = model
                .create(self.session_config())
                .await
                .map_err(WatchError::Inference)?;
            tracing::info!("model session created");
            self.session = Some(session);
        }

        self.session.as_deref_mut().ok_or(WatchError::NoSession)
    }

    pub fn reset_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            session.destroy();
            tracing::debug!("model session destroyed");
        }
    }

    pub async fn clone_session(&self) -> WatchResult<Box<dyn ModelSession>> {
        let session = self.session.as_ref().ok_or(WatchError::NoSession)?;
        session.clone_session().await.map_err(WatchError::Inference)
    }

    pub async fn model_info(&self) -> Option<ModelParams> {
        self.inspector.model_info().await
    }

    fn session_config(&self) -> SessionConfig {
        SessionConfig {
            initial_prompts: vec![PromptTurn::system(SYSTEM_INSTRUCTION)],
            expected_inputs: vec![Modality::Text, Modality::Image],
            expected_outputs: vec![ExpectedOutput {
                modality: Modality::Text,
                languages: vec!["en".to_string()],
            }],
            temperature: self.temperature,
            top_k: self.top_k,
        }
    }
}
