// AI Provider Service
// OpenAI-compatible chat completions client used by the topic oracle

use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::env;
use std::time::{Duration, Instant};
use thiserror::Error;

const OPENAI_DEFAULT_URL: &str = "https://api.openai.com/v1/chat/completions";

/// Transport timeout. The oracle adapter applies its own, shorter per-call timeout.
const CLIENT_TIMEOUT_SECS: u64 = 80;

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },
    #[error("Missing content in response")]
    MissingContent,
    #[error("JSON parse error: {0}")]
    JsonError(String),
    #[error("API key not configured")]
    MissingApiKey,
}

impl ProviderError {
    /// Whether repeating the same request could succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ProviderError::MissingApiKey)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSpec {
    pub name: String,
    pub model: String,
}

pub fn parse_provider(spec: &str) -> ProviderSpec {
    let parts: Vec<&str> = spec.splitn(2, ':').collect();
    if parts.len() == 2 {
        ProviderSpec {
            name: parts[0].to_string(),
            model: parts[1].to_string(),
        }
    } else {
        ProviderSpec {
            name: spec.to_string(),
            model: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: i32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    r#type: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatResponse {
    choices: Option<Vec<ChatChoice>>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageResponse>,
}

#[derive(Debug, Clone, Deserialize)]
struct ChatMessageResponse {
    content: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResult {
    pub content: String,
    pub latency_ms: i64,
}

pub struct ProviderClient {
    client: Client,
    chat_url: String,
}

impl Default for ProviderClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderClient {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(CLIENT_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();

        Self {
            client,
            chat_url: default_chat_url(),
        }
    }

    pub fn with_proxy(proxy_url: &str) -> Result<Self, ProviderError> {
        let proxy = reqwest::Proxy::all(proxy_url)?;
        let client = Client::builder()
            .timeout(Duration::from_secs(CLIENT_TIMEOUT_SECS))
            .proxy(proxy)
            .build()?;

        Ok(Self {
            client,
            chat_url: default_chat_url(),
        })
    }

    /// Override the endpoint, e.g. from a `providers.<name>.baseUrl` config entry.
    pub fn with_chat_url(mut self, url: impl Into<String>) -> Self {
        self.chat_url = url.into();
        self
    }

    pub fn chat_url(&self) -> &str {
        &self.chat_url
    }

    /// Plain-text reply.
    pub async fn call_chat(
        &self,
        model: &str,
        api_key: &str,
        system: &str,
        user: &str,
        max_tokens: i32,
    ) -> Result<ChatResult, ProviderError> {
        self.call_chat_api(model, api_key, system, user, max_tokens, false)
            .await
    }

    /// JSON-object reply (the prompt must mention JSON).
    pub async fn call_chat_json(
        &self,
        model: &str,
        api_key: &str,
        system: &str,
        user: &str,
        max_tokens: i32,
    ) -> Result<ChatResult, ProviderError> {
        self.call_chat_api(model, api_key, system, user, max_tokens, true)
            .await
    }

    async fn call_chat_api(
        &self,
        model: &str,
        api_key: &str,
        system: &str,
        user: &str,
        max_tokens: i32,
        use_json_format: bool,
    ) -> Result<ChatResult, ProviderError> {
        if api_key.trim().is_empty() {
            return Err(ProviderError::MissingApiKey);
        }

        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            max_tokens,
            temperature: 0.0,
            response_format: if use_json_format {
                Some(ResponseFormat {
                    r#type: "json_object".to_string(),
                })
            } else {
                None
            },
        };

        let start = Instant::now();

        let response = self
            .client
            .post(&self.chat_url)
            .header("Authorization", format!("Bearer {}", api_key))
            .header("Content-Type", "application/json")
            .json(&request)
            .send()
            .await?;

        let latency_ms = start.elapsed().as_millis() as i64;
        let status = response.status();

        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::ApiError {
                status: status.as_u16(),
                message: body,
            });
        }

        let data: ChatResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::JsonError(e.to_string()))?;

        let content = data
            .choices
            .and_then(|c| c.into_iter().next())
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty())
            .ok_or(ProviderError::MissingContent)?;

        Ok(ChatResult {
            content,
            latency_ms,
        })
    }
}

fn default_chat_url() -> String {
    env::var("OPENAI_API_URL").unwrap_or_else(|_| OPENAI_DEFAULT_URL.to_string())
}

/// API key from the environment only.
pub fn env_api_key(provider: &str) -> Option<String> {
    // A temporary key supplied for the current run wins over the configured one
    let env_keys = match provider {
        "openai" => vec!["TEMP_OPENAI_API_KEY", "OPENAI_API_KEY", "LIVETOPICS_OPENAI_API_KEY"],
        _ => vec![],
    };

    for key in env_keys {
        if let Ok(val) = env::var(key) {
            let v = val.trim();
            if !v.is_empty() {
                return Some(v.to_string());
            }
        }
    }
    None
}

/// API key stored in the default config file.
pub fn stored_api_key(provider: &str) -> Option<String> {
    let config_dir = super::ConfigStore::default_config_dir()?;
    let store = super::ConfigStore::new(config_dir);
    store
        .get_api_key(provider)
        .ok()
        .flatten()
        .filter(|k| !k.trim().is_empty())
}
