use crate::error::{WatchError, WatchResult};
use crate::model::{ContentPart, ImagePayload, PromptTurn, Role};
use crate::session::SessionManager;
use serde::{Deserialize, Serialize};

pub const MAX_REASON_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisVerdict {
    pub on_track: bool,
    pub confidence: u8,
    pub reason: String,
}

#[derive(Debug, Clone)]
pub struct AnalysisRequest {
    pub goal: String,
    pub tab_url: String,
    pub tab_title: String,
    pub image: ImagePayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawVerdict {
    on_track: bool,
    confidence: f64,
    reason: String,
}

/// Runs one analysis on a fresh session.
///
/// The session is reset afterwards whether or not the model produced a usable
/// verdict, so every check starts from an empty context.
pub async fn analyze_activity(
    sessions: &mut SessionManager,
    request: AnalysisRequest,
) -> WatchResult<AnalysisVerdict> {
    let result = prompt_for_verdict(sessions, request).await;
    sessions.reset_session();
    if let Err(err) = &result {
        tracing::warn!(error = %err, "analysis failed");
    }
    result
}

async fn prompt_for_verdict(
    sessions: &mut SessionManager,
    request: AnalysisRequest,
) -> WatchResult<AnalysisVerdict> {
    let session = sessions.ensure_session().await?;
    let raw = session
        .prompt(build_prompt(&request))
        .await
        .map_err(WatchError::Inference)?;
    tracing::debug!(reply = %raw, "model reply");

    if raw.trim().is_empty() {
        return Err(WatchError::MalformedVerdict("Empty AI response".to_string()));
    }
    parse_verdict(&sanitize_reply(&raw))
}

pub fn build_prompt(request: &AnalysisRequest) -> Vec<PromptTurn> {
    let text = format!(
        r#"User's stated goal: "{goal}"

Current activity:
- URL: {url}
- Title: {title}

Analyze if this activity aligns with the goal. Consider:
- Is the content relevant to the goal?
- Could this be legitimate work/research?
- Or is this clear procrastination?

Return ONLY JSON:
{{
  "onTrack": true/false,
  "confidence": 0-100,
  "reason": "brief explanation (max 60 chars)"
}}"#,
        goal = request.goal,
        url = request.tab_url,
        title = request.tab_title,
    );

    vec![PromptTurn {
        role: Role::User,
        content: vec![
            ContentPart::Text(text),
            ContentPart::Image(request.image.clone()),
        ],
    }]
}

/// Strips code fences and surrounding prose, leaving the text from the first
/// `{` to the last `}` when such a span exists. Idempotent.
pub fn sanitize_reply(raw: &str) -> String {
    let mut cleaned = raw.trim().to_string();

    while let Some(start) = cleaned.find("```") {
        let after = &cleaned[start + 3..];
        let skipped = after.len() - after.trim_start().len();
        cleaned.replace_range(start..start + 3 + skipped, "");
    }

    let cleaned = cleaned.trim();
    match (cleaned.find('{'), cleaned.rfind('}')) {
        (Some(first), Some(last)) if last > first => cleaned[first..=last].to_string(),
        _ => cleaned.to_string(),
    }
}

pub fn parse_verdict(text: &str) -> WatchResult<AnalysisVerdict> {
    let raw: RawVerdict = serde_json::from_str(text)
        .map_err(|err| WatchError::MalformedVerdict(err.to_string()))?;

    if !raw.confidence.is_finite() || !(0.0..=100.0).contains(&raw.confidence) {
        return Err(WatchError::MalformedVerdict(format!(
            "confidence {} is outside 0-100",
            raw.confidence
        )));
    }

    let reason = raw.reason.trim();
    let reason = match reason.char_indices().nth(MAX_REASON_CHARS) {
        Some((cut, _)) => reason[..cut].trim_end().to_string(),
        None => reason.to_string(),
    };

    Ok(AnalysisVerdict {
        on_track: raw.on_track,
        confidence: raw.confidence.round() as u8,
        reason,
    })
}
