//! Language-model collaborator.
//!
//! The call itself is opaque to the scheduling subsystem: a prompt goes in,
//! text or a classified error comes out. The HTTP implementation targets an
//! OpenAI-compatible chat completions endpoint.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AppConfig;
use crate::selection::GenerationMode;

#[derive(Debug, Error)]
pub enum GenerateError {
    #[error("model API returned status {status}: {message}")]
    Api { status: u16, message: String },
    #[error("network error calling model API: {0}")]
    Network(String),
    #[error("unexpected model API response: {0}")]
    InvalidResponse(String),
}

/// Whether a failed generation is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    Permanent,
}

/// Rate limits, timeouts and server errors heal on their own; bad input and
/// schema mismatches do not. Anything unrecognized defaults to transient so
/// a novel failure gets retried before being declared dead.
pub fn classify_error(error: &GenerateError) -> FailureKind {
    match error {
        GenerateError::Api { status, .. } => match status {
            400 | 404 | 413 | 422 => FailureKind::Permanent,
            _ => FailureKind::Transient,
        },
        GenerateError::Network(_) => FailureKind::Transient,
        GenerateError::InvalidResponse(_) => FailureKind::Permanent,
    }
}

#[async_trait]
pub trait GenerationClient: Send + Sync + 'static {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError>;
}

pub struct HttpGenerationClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpGenerationClient {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: config.model_api_url.trim_end_matches('/').to_string(),
            api_key: config.model_api_key.clone(),
            model: config.model_name.clone(),
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[async_trait]
impl GenerationClient for HttpGenerationClient {
    async fn generate(&self, prompt: &str) -> Result<String, GenerateError> {
        let request = ChatRequest {
            model: &self.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|err| GenerateError::Network(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(GenerateError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|err| GenerateError::InvalidResponse(err.to_string()))?;

        parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|content| !content.is_empty())
            .ok_or_else(|| GenerateError::InvalidResponse("empty completion".to_string()))
    }
}

/// Prompt assembly for a page (or selection) of extracted text.
pub fn build_prompt(mode: GenerationMode, locale: &str, unit_index: i32, text: &str) -> String {
    let instruction = match mode {
        GenerationMode::Explain => {
            "Explain the following page to a student in clear, simple terms."
        }
        GenerationMode::Summary => "Summarize the key points of the following page.",
        GenerationMode::Outline => {
            "Produce a structured outline of the following page's content."
        }
        GenerationMode::Selection => {
            "Explain the selected passages from the following page in detail."
        }
    };
    format!("{instruction}\nRespond in locale '{locale}'.\n\n[Page {unit_index}]\n{text}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16) -> GenerateError {
        GenerateError::Api {
            status,
            message: String::new(),
        }
    }

    #[test]
    fn rate_limits_and_server_errors_are_transient() {
        assert_eq!(classify_error(&api(429)), FailureKind::Transient);
        assert_eq!(classify_error(&api(408)), FailureKind::Transient);
        assert_eq!(classify_error(&api(500)), FailureKind::Transient);
        assert_eq!(classify_error(&api(503)), FailureKind::Transient);
    }

    #[test]
    fn bad_input_is_permanent() {
        assert_eq!(classify_error(&api(400)), FailureKind::Permanent);
        assert_eq!(classify_error(&api(404)), FailureKind::Permanent);
        assert_eq!(classify_error(&api(422)), FailureKind::Permanent);
    }

    #[test]
    fn unknown_statuses_default_to_transient() {
        assert_eq!(classify_error(&api(418)), FailureKind::Transient);
        assert_eq!(classify_error(&api(402)), FailureKind::Transient);
    }

    #[test]
    fn network_errors_are_transient_and_schema_mismatch_is_permanent() {
        assert_eq!(
            classify_error(&GenerateError::Network("timed out".into())),
            FailureKind::Transient
        );
        assert_eq!(
            classify_error(&GenerateError::InvalidResponse("missing field".into())),
            FailureKind::Permanent
        );
    }

    #[test]
    fn prompt_carries_mode_locale_and_text() {
        let prompt = build_prompt(GenerationMode::Summary, "de", 4, "page text");
        assert!(prompt.contains("Summarize"));
        assert!(prompt.contains("'de'"));
        assert!(prompt.contains("[Page 4]"));
        assert!(prompt.contains("page text"));
    }
}
