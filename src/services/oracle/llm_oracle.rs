// LLM Oracle
// Chat-completions backed TopicOracle.
// Replies are parsed defensively: a malformed reply degrades to defaults, it never errors.

use super::{OracleError, TopicOracle};
use crate::models::{ChangeVerdict, TopicVerdict};
use crate::services::config_store::AppConfig;
use crate::services::providers::{
    env_api_key, parse_provider, stored_api_key, ProviderClient, ProviderError,
};
use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::OnceLock;
use tracing::debug;

/// Confidence assumed when the reply omits it
const DEFAULT_CONFIDENCE: f64 = 0.5;
/// Label used when the reply carries no usable topic at all
const FALLBACK_TOPIC: &str = "General Discussion";

const TOPIC_SYSTEM_PROMPT: &str = r#"You are a section title generator for a live stream transcript. Your task is to identify topics and create concise, specific titles.

Guidelines:
- Create specific titles that precisely identify what is being discussed
- Keep titles concise but descriptive (3-7 words ideal)
- Be judicious about topic changes: only signal a new topic when the discussion has substantially moved to a new subject
- Do not provide any commentary, return only the structured response"#;

const MAJOR_SYSTEM_PROMPT: &str = r#"You identify broad chapter topics covering several minutes of a live stream transcript. Be concise.
A chapter only changes when the overall subject of the stream changes, not when a detail or example changes."#;

fn topic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\[\s*(?:major\s+)?topic\s*:\s*([^\]]+)\]").unwrap())
}

fn new_topic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\[\s*new\s+topic\s*:\s*([^\]]+)\]").unwrap())
}

fn topic_change_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\[\s*topic\s+change\s*:\s*([a-z]+)").unwrap())
}

fn confidence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)\[\s*confidence\s*:\s*([0-9]*\.?[0-9]+)").unwrap())
}

pub struct LlmOracle {
    client: ProviderClient,
    model: String,
    api_key: Option<String>,
    classify_max_tokens: i32,
    major_max_tokens: i32,
}

impl LlmOracle {
    pub fn new(client: ProviderClient, model: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            client,
            model: model.into(),
            api_key,
            classify_max_tokens: 100,
            major_max_tokens: 150,
        }
    }

    /// Build from the app config: proxy, endpoint override, model and API key.
    /// `oracle.provider` may carry a model as `name:model`.
    pub fn from_config(config: &AppConfig) -> Result<Self, ProviderError> {
        let spec = parse_provider(&config.oracle.provider);
        let provider = spec.name.as_str();

        let client = match config.proxy.as_ref().filter(|p| p.enabled) {
            Some(proxy) => match proxy.https.as_deref().or(proxy.http.as_deref()) {
                Some(url) => ProviderClient::with_proxy(url)?,
                None => ProviderClient::new(),
            },
            None => ProviderClient::new(),
        };
        let client = match config.provider_url(provider) {
            Some(url) => client.with_chat_url(url),
            None => client,
        };

        let model = config
            .provider_model(provider)
            .or(Some(spec.model.as_str()).filter(|m| !m.trim().is_empty()))
            .unwrap_or(config.oracle.model.as_str())
            .to_string();

        // Environment first, then the config that was passed in, then the default config file
        let api_key = env_api_key(provider)
            .or_else(|| config.api_key(provider).map(str::to_string))
            .or_else(|| stored_api_key(provider));

        let mut oracle = Self::new(client, model, api_key);
        oracle.classify_max_tokens = config.oracle.classify_max_tokens;
        oracle.major_max_tokens = config.oracle.major_max_tokens;
        Ok(oracle)
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn api_key(&self) -> Result<&str, OracleError> {
        self.api_key
            .as_deref()
            .ok_or(OracleError::Provider(ProviderError::MissingApiKey))
    }
}

#[async_trait]
impl TopicOracle for LlmOracle {
    async fn classify(
        &self,
        text: &str,
        current_topic: Option<&str>,
    ) -> Result<TopicVerdict, OracleError> {
        let api_key = self.api_key()?;

        let Some(previous) = current_topic else {
            let prompt = format!(
                "Analyze this transcript from a live stream and determine the main topic.\n\n\
                 Transcript: \"{}\"\n\n\
                 Return your response in this exact format - just the topic name, no explanations:\n\
                 [Topic: <brief topic name>]",
                text
            );
            let reply = self
                .client
                .call_chat(&self.model, api_key, TOPIC_SYSTEM_PROMPT, &prompt, self.classify_max_tokens)
                .await?;
            debug!("[ORACLE] classify initial latency_ms={}", reply.latency_ms);
            return Ok(TopicVerdict {
                topic: parse_topic(&reply.content).unwrap_or_else(|| FALLBACK_TOPIC.to_string()),
                changed: true,
            });
        };

        let prompt = format!(
            "Analyze this transcript from a live stream and determine if there has been a topic change.\n\n\
             Previous topic: \"{}\"\n\n\
             Current transcript: \"{}\"\n\n\
             Note that there may be some overlap between transcripts due to how they're processed.\n\
             Return your response in this exact format:\n\
             [Topic Change: Yes/No]\n\
             [New Topic: <brief topic name>]",
            previous, text
        );
        let reply = self
            .client
            .call_chat(&self.model, api_key, TOPIC_SYSTEM_PROMPT, &prompt, self.classify_max_tokens)
            .await?;
        debug!("[ORACLE] classify latency_ms={}", reply.latency_ms);
        Ok(parse_topic_change(&reply.content, previous))
    }

    async fn detect_initial(&self, text: &str) -> Result<String, OracleError> {
        let api_key = self.api_key()?;
        let prompt = format!(
            "You are analyzing the opening of a live stream transcript.\n\n\
             Transcription: \"{}\"\n\n\
             Identify a broad, general topic that covers this segment.\n\
             Return your response in this exact format - just the topic name, no explanations:\n\
             [Major Topic: <brief topic name>]",
            text
        );
        let reply = self
            .client
            .call_chat(&self.model, api_key, MAJOR_SYSTEM_PROMPT, &prompt, self.major_max_tokens)
            .await?;
        debug!("[ORACLE] detect_initial latency_ms={}", reply.latency_ms);
        Ok(parse_topic(&reply.content).unwrap_or_else(|| FALLBACK_TOPIC.to_string()))
    }

    async fn detect_change(
        &self,
        text: &str,
        current_label: &str,
        previous_summary: Option<&str>,
    ) -> Result<ChangeVerdict, OracleError> {
        let api_key = self.api_key()?;
        let context = match previous_summary {
            Some(summary) if !summary.trim().is_empty() => {
                format!("Previous chapter transcript (condensed): \"{}\"\n\n", summary)
            }
            _ => String::new(),
        };
        let prompt = format!(
            "{}Current chapter topic: \"{}\"\n\n\
             Current chapter transcript: \"{}\"\n\n\
             Decide whether the most recent part of the transcript has moved to a new broad topic.\n\
             Return only a JSON object with these fields:\n\
             - topic: the broad topic of the most recent part\n\
             - is_change: true if the chapter topic changed, otherwise false\n\
             - confidence: 0.00-1.00, how sure you are about is_change",
            context, current_label, text
        );
        let reply = self
            .client
            .call_chat_json(&self.model, api_key, MAJOR_SYSTEM_PROMPT, &prompt, self.major_max_tokens)
            .await?;
        debug!("[ORACLE] detect_change latency_ms={}", reply.latency_ms);
        Ok(parse_change_verdict(&reply.content, current_label))
    }
}

/// `[Topic: x]` / `[Major Topic: x]`, else the whole reply if it is a single short line.
fn parse_topic(content: &str) -> Option<String> {
    let content = content.trim();
    if let Some(caps) = topic_re().captures(content) {
        let topic = caps[1].trim();
        if !topic.is_empty() {
            return Some(topic.to_string());
        }
    }
    let bare = content.trim_matches(|c| c == '[' || c == ']' || c == '"').trim();
    if bare.is_empty() || bare.contains('\n') {
        None
    } else {
        Some(bare.to_string())
    }
}

/// `[Topic Change: Yes/No] [New Topic: x]`. Missing flag means no change,
/// missing topic keeps the previous one.
fn parse_topic_change(content: &str, previous: &str) -> TopicVerdict {
    let changed = topic_change_re()
        .captures(content)
        .map(|caps| caps[1].eq_ignore_ascii_case("yes"))
        .unwrap_or(false);

    let topic = new_topic_re()
        .captures(content)
        .map(|caps| caps[1].trim().to_string())
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| previous.to_string());

    TopicVerdict { topic, changed }
}

/// JSON `{"topic", "is_change", "confidence"}` with bracket-format fallback.
/// Missing confidence → 0.5, missing flag → false, missing label → `current_label`.
fn parse_change_verdict(content: &str, current_label: &str) -> ChangeVerdict {
    let value = extract_json(content)
        .and_then(|json| serde_json::from_str::<Value>(&json).ok())
        .filter(|v| v.is_object());

    let (label, is_change, confidence) = match value {
        Some(v) => (
            ["topic", "label", "new_topic"]
                .iter()
                .find_map(|k| v.get(*k).and_then(Value::as_str))
                .map(|s| s.trim().to_string()),
            ["is_change", "isChange", "topic_change", "changed"]
                .iter()
                .find_map(|k| v.get(*k).and_then(as_flag)),
            v.get("confidence").and_then(as_number),
        ),
        None => (
            new_topic_re()
                .captures(content)
                .or_else(|| topic_re().captures(content))
                .map(|caps| caps[1].trim().to_string()),
            topic_change_re()
                .captures(content)
                .map(|caps| caps[1].eq_ignore_ascii_case("yes")),
            confidence_re()
                .captures(content)
                .and_then(|caps| caps[1].parse::<f64>().ok()),
        ),
    };

    ChangeVerdict {
        label: label
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| current_label.to_string()),
        is_change: is_change.unwrap_or(false),
        confidence: confidence
            .filter(|c| c.is_finite())
            .unwrap_or(DEFAULT_CONFIDENCE)
            .clamp(0.0, 1.0),
    }
}

fn as_flag(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "yes" | "true" => Some(true),
            "no" | "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Extract the outermost JSON object from a reply that may carry prose or fences.
fn extract_json(content: &str) -> Option<String> {
    let trimmed = content.trim();
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| trimmed[start..=end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_topic_formats() {
        assert_eq!(parse_topic("[Topic: Bitcoin Price Action]").as_deref(), Some("Bitcoin Price Action"));
        assert_eq!(parse_topic("[Major Topic: Market Outlook ]").as_deref(), Some("Market Outlook"));
        assert_eq!(parse_topic("Trading Psychology").as_deref(), Some("Trading Psychology"));
        assert_eq!(parse_topic("   "), None);
    }

    #[test]
    fn test_parse_topic_change() {
        let verdict = parse_topic_change("[Topic Change: Yes]\n[New Topic: Altcoin Analysis]", "Intro");
        assert!(verdict.changed);
        assert_eq!(verdict.topic, "Altcoin Analysis");

        let verdict = parse_topic_change("[Topic Change: No]\n[New Topic: Intro]", "Intro");
        assert!(!verdict.changed);
    }

    #[test]
    fn test_parse_topic_change_malformed_defaults() {
        let verdict = parse_topic_change("I think they are still talking about charts", "Chart Patterns");
        assert!(!verdict.changed);
        assert_eq!(verdict.topic, "Chart Patterns");
    }

    #[test]
    fn test_parse_change_verdict_json() {
        let verdict = parse_change_verdict(
            "```json\n{\"topic\": \"BTC Analysis\", \"is_change\": true, \"confidence\": 0.8}\n```",
            "Intro",
        );
        assert_eq!(verdict.label, "BTC Analysis");
        assert!(verdict.is_change);
        assert!((verdict.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_parse_change_verdict_missing_fields() {
        let verdict = parse_change_verdict("{\"is_change\": \"yes\"}", "Intro");
        assert_eq!(verdict.label, "Intro");
        assert!(verdict.is_change);
        assert_eq!(verdict.confidence, 0.5);

        let verdict = parse_change_verdict("{}", "Intro");
        assert_eq!(verdict.label, "Intro");
        assert!(!verdict.is_change);
        assert_eq!(verdict.confidence, 0.5);
    }

    #[test]
    fn test_parse_change_verdict_garbage_never_errors() {
        let verdict = parse_change_verdict("no idea", "Intro");
        assert_eq!(verdict.label, "Intro");
        assert!(!verdict.is_change);
        assert_eq!(verdict.confidence, 0.5);
    }

    #[test]
    fn test_parse_change_verdict_brackets_and_clamp() {
        let verdict = parse_change_verdict(
            "[Topic Change: Yes]\n[New Topic: Q&A]\n[Confidence: 1.7]",
            "Intro",
        );
        assert_eq!(verdict.label, "Q&A");
        assert!(verdict.is_change);
        assert_eq!(verdict.confidence, 1.0);
    }

    #[tokio::test]
    async fn test_missing_api_key_is_reported() {
        let oracle = LlmOracle::new(ProviderClient::new(), "gpt-4o-mini", None);
        let err = oracle.detect_initial("hello").await.unwrap_err();
        assert!(matches!(err, OracleError::Provider(ProviderError::MissingApiKey)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_from_config_model_resolution() {
        let mut config = AppConfig::default();
        config.oracle.provider = "openai:gpt-4o".to_string();
        config.api_keys.insert("openai".to_string(), "sk-test".to_string());
        let oracle = LlmOracle::from_config(&config).unwrap();
        assert_eq!(oracle.model(), "gpt-4o");

        config.oracle.provider = "openai".to_string();
        let oracle = LlmOracle::from_config(&config).unwrap();
        assert_eq!(oracle.model(), config.oracle.model);
        assert_eq!(oracle.with_model("gpt-4.1-mini").model(), "gpt-4.1-mini");
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_passed_config_key_beats_default_config_file() {
        use crate::services::config_store::ConfigStore;

        let home = std::env::temp_dir().join(format!("livetopics-xdg-{}", uuid::Uuid::new_v4()));
        let previous_home = std::env::var_os("XDG_CONFIG_HOME");
        std::env::set_var("XDG_CONFIG_HOME", &home);
        for var in ["TEMP_OPENAI_API_KEY", "OPENAI_API_KEY", "LIVETOPICS_OPENAI_API_KEY"] {
            std::env::remove_var(var);
        }

        let default_store = ConfigStore::new(ConfigStore::default_config_dir().unwrap());
        default_store.set_api_key("openai", "sk-default-file").unwrap();

        let mut config = AppConfig::default();
        config
            .api_keys
            .insert("openai".to_string(), "sk-chosen-config".to_string());
        let oracle = LlmOracle::from_config(&config).unwrap();
        assert_eq!(oracle.api_key.as_deref(), Some("sk-chosen-config"));

        // Falls back to the default file only when the passed config has no key
        config.api_keys.clear();
        let oracle = LlmOracle::from_config(&config).unwrap();
        assert_eq!(oracle.api_key.as_deref(), Some("sk-default-file"));

        match previous_home {
            Some(value) => std::env::set_var("XDG_CONFIG_HOME", value),
            None => std::env::remove_var("XDG_CONFIG_HOME"),
        }
        let _ = std::fs::remove_dir_all(&home);
    }
}
