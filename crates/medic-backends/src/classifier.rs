//! Chat-completion failure classifier

use crate::http;
use medic_core::{Classification, FailureClassifier, PortError, RemediationAction};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Environment variable holding the API key
pub const API_KEY_ENV: &str = "OPENAI_API_KEY";

/// Where and how to ask
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierSettings {
    /// Base URL of an OpenAI-compatible API
    pub endpoint: String,
    pub model: String,
    pub max_tokens: u32,
}

impl Default for ClassifierSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o".to_string(),
            max_tokens: 100,
        }
    }
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
    max_tokens: u32,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

/// Prompt asking for one action word followed by a rationale
#[must_use]
pub fn build_prompt(pipeline_name: &str, failed_step: Option<&str>, error_text: &str) -> String {
    format!(
        "Pipeline: {pipeline_name}\n\
         Failed Activity: {}\n\
         Error: {error_text}\n\n\
         Based on this, should we retry the full pipeline, just the failed activity, or not retry? \
         Reply with one word: 'full', 'partial', or 'none', then a rationale.",
        failed_step.unwrap_or("unknown")
    )
}

/// Turn a free-text reply into a classification
///
/// Keywords are checked in priority order `full`, `partial`, `none`; a
/// reply with none of them is treated as `none`. The lowercased reply is
/// kept whole as the rationale.
#[must_use]
pub fn parse_reply(reply: &str) -> Classification {
    let rationale = reply.trim().to_lowercase();
    let action = if rationale.contains("full") {
        RemediationAction::Full
    } else if rationale.contains("partial") {
        RemediationAction::Partial
    } else {
        RemediationAction::None
    };
    Classification::new(action, rationale)
}

/// Classifier backed by a chat-completion endpoint
#[derive(Debug, Clone)]
pub struct ChatClassifier {
    http: reqwest::Client,
    settings: ClassifierSettings,
    api_key: String,
}

impl ChatClassifier {
    pub fn new(
        settings: ClassifierSettings,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, PortError> {
        let api_key = api_key.into();
        http::require_secret(&api_key, API_KEY_ENV)?;
        Ok(Self {
            http: http::client(timeout)?,
            settings,
            api_key,
        })
    }

    fn completions_url(&self) -> String {
        format!("{}/chat/completions", self.settings.endpoint.trim_end_matches('/'))
    }
}

#[async_trait::async_trait]
impl FailureClassifier for ChatClassifier {
    async fn classify(
        &self,
        pipeline_name: &str,
        failed_step: Option<&str>,
        error_text: &str,
    ) -> Result<Classification, PortError> {
        let prompt = build_prompt(pipeline_name, failed_step, error_text);
        let request = ChatRequest {
            model: &self.settings.model,
            messages: [ChatMessage {
                role: "user",
                content: &prompt,
            }],
            max_tokens: self.settings.max_tokens,
        };

        let response: ChatResponse = http::send_json(
            self.http
                .post(self.completions_url())
                .bearer_auth(&self.api_key)
                .json(&request),
        )
        .await?;

        let reply = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.trim().is_empty())
            .ok_or_else(|| PortError::Malformed("chat reply carried no content".into()))?;
        tracing::debug!(pipeline = pipeline_name, reply = %reply.trim(), "classifier replied");
        Ok(parse_reply(&reply))
    }
}
