use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use crate::config::Config;
use crate::error::EchoAvatarError;
use crate::host::LlmClient;
use crate::llm_types::{Message, MessagesRequest, MessagesResponse};

const MAX_RATE_LIMIT_RETRIES: u32 = 3;

pub fn create_llm_client(config: &Config) -> Result<Arc<dyn LlmClient>, EchoAvatarError> {
    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.llm_timeout_secs))
        .build()?;
    let client: Arc<dyn LlmClient> = match config.llm_provider.as_str() {
        "anthropic" => Arc::new(AnthropicProvider::new(config, http)),
        _ => Arc::new(OpenAiProvider::new(config, http)),
    };
    Ok(client)
}

fn rate_limit_delay(attempt: u32) -> Duration {
    Duration::from_secs(2u64.pow(attempt))
}

/// Send the request built by `build`, retrying HTTP 429 with exponential backoff.
/// Any other status is returned to the caller untouched.
async fn send_with_retry<F>(build: F) -> Result<reqwest::Response, EchoAvatarError>
where
    F: Fn() -> reqwest::RequestBuilder,
{
    let mut retries = 0u32;
    loop {
        let response = build().send().await?;
        if response.status() != reqwest::StatusCode::TOO_MANY_REQUESTS
            || retries >= MAX_RATE_LIMIT_RETRIES
        {
            return Ok(response);
        }
        retries += 1;
        let delay = rate_limit_delay(retries);
        warn!("Rate limited, retrying in {delay:?} (attempt {retries}/{MAX_RATE_LIMIT_RETRIES})");
        tokio::time::sleep(delay).await;
    }
}

// ---------------------------------------------------------------------------
// Anthropic provider
// ---------------------------------------------------------------------------

pub struct AnthropicProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    base_url: String,
}

impl AnthropicProvider {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        AnthropicProvider {
            http,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            base_url: config
                .llm_base_url
                .clone()
                .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".into()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct AnthropicApiError {
    error: AnthropicApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct AnthropicApiErrorDetail {
    message: String,
    #[serde(rename = "type")]
    error_type: String,
}

#[async_trait]
impl LlmClient for AnthropicProvider {
    async fn complete(&self, prompt: &str) -> Result<Option<String>, EchoAvatarError> {
        let request = MessagesRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![Message::user(prompt)],
        };

        let response = send_with_retry(|| {
            self.http
                .post(&self.base_url)
                .header("x-api-key", &self.api_key)
                .header("anthropic-version", "2023-06-01")
                .header("content-type", "application/json")
                .json(&request)
        })
        .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_success() {
            let parsed: MessagesResponse = serde_json::from_str(&body).map_err(|e| {
                EchoAvatarError::LlmApi(format!("Failed to parse response: {e}\nBody: {body}"))
            })?;
            return Ok(parsed.text());
        }
        match serde_json::from_str::<AnthropicApiError>(&body) {
            Ok(api_err) => Err(EchoAvatarError::LlmApi(format!(
                "{}: {}",
                api_err.error.error_type, api_err.error.message
            ))),
            Err(_) => Err(EchoAvatarError::LlmApi(format!("HTTP {status}: {body}"))),
        }
    }
}

// ---------------------------------------------------------------------------
// OpenAI-compatible provider  (OpenAI, OpenRouter, DeepSeek, Ollama …)
// ---------------------------------------------------------------------------

pub struct OpenAiProvider {
    http: reqwest::Client,
    api_key: String,
    model: String,
    max_tokens: u32,
    chat_url: String,
}

impl OpenAiProvider {
    pub fn new(config: &Config, http: reqwest::Client) -> Self {
        let base = config
            .llm_base_url
            .as_deref()
            .unwrap_or("https://api.openai.com/v1");
        OpenAiProvider {
            http,
            api_key: config.api_key.clone(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            chat_url: chat_completions_url(base),
        }
    }
}

fn chat_completions_url(base: &str) -> String {
    format!("{}/chat/completions", base.trim_end_matches('/'))
}

#[derive(Debug, Deserialize)]
struct OaiResponse {
    choices: Vec<OaiChoice>,
}

#[derive(Debug, Deserialize)]
struct OaiChoice {
    message: OaiMessage,
}

#[derive(Debug, Deserialize)]
struct OaiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OaiErrorResponse {
    error: OaiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct OaiErrorDetail {
    message: String,
}

fn oai_reply_text(oai: OaiResponse) -> Option<String> {
    oai.choices
        .into_iter()
        .next()
        .and_then(|c| c.message.content)
        .filter(|text| !text.trim().is_empty())
}

#[async_trait]
impl LlmClient for OpenAiProvider {
    async fn complete(&self, prompt: &str) -> Result<Option<String>, EchoAvatarError> {
        let body = json!({
            "model": self.model,
            "max_tokens": self.max_tokens,
            "messages": [Message::user(prompt)],
        });

        let response = send_with_retry(|| {
            let req = self
                .http
                .post(&self.chat_url)
                .header("Content-Type", "application/json")
                .json(&body);
            if self.api_key.trim().is_empty() {
                req
            } else {
                req.bearer_auth(&self.api_key)
            }
        })
        .await?;

        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        if status.is_success() {
            let oai: OaiResponse = serde_json::from_str(&text).map_err(|e| {
                EchoAvatarError::LlmApi(format!("Failed to parse OpenAI response: {e}\nBody: {text}"))
            })?;
            return Ok(oai_reply_text(oai));
        }
        match serde_json::from_str::<OaiErrorResponse>(&text) {
            Ok(err) => Err(EchoAvatarError::LlmApi(err.error.message)),
            Err(_) => Err(EchoAvatarError::LlmApi(format!("HTTP {status}: {text}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_completions_url_trims_slash() {
        assert_eq!(
            chat_completions_url("https://api.openai.com/v1/"),
            "https://api.openai.com/v1/chat/completions"
        );
        assert_eq!(
            chat_completions_url("http://localhost:11434/v1"),
            "http://localhost:11434/v1/chat/completions"
        );
    }

    #[test]
    fn test_oai_reply_text() {
        let oai: OaiResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":"hello"}}]}"#).unwrap();
        assert_eq!(oai_reply_text(oai).as_deref(), Some("hello"));

        let empty: OaiResponse = serde_json::from_str(r#"{"choices":[]}"#).unwrap();
        assert!(oai_reply_text(empty).is_none());

        let null: OaiResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"content":null}}]}"#).unwrap();
        assert!(oai_reply_text(null).is_none());
    }

    #[test]
    fn test_rate_limit_delay_backs_off() {
        assert_eq!(rate_limit_delay(1), Duration::from_secs(2));
        assert_eq!(rate_limit_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn test_create_llm_client_picks_provider() {
        let config = Config {
            api_key: "k".into(),
            llm_provider: "anthropic".into(),
            ..Config::default()
        };
        assert!(create_llm_client(&config).is_ok());
    }

    #[test]
    fn test_oai_error_body() {
        let err: OaiErrorResponse =
            serde_json::from_str(r#"{"error":{"message":"bad key"}}"#).unwrap();
        assert_eq!(err.error.message, "bad key");
    }
}
