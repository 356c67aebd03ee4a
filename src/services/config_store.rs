// Configuration Storage Service
// Handles config file read/write and version backup

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub version: String,
    pub default_provider: Option<String>,
    pub proxy: Option<ProxyConfig>,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub oracle: OracleConfig,
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

impl AppConfig {
    /// Chat endpoint override for `provider`, if configured
    pub fn provider_url(&self, provider: &str) -> Option<&str> {
        self.providers
            .get(provider)
            .and_then(|p| p.base_url.as_deref())
            .filter(|u| !u.trim().is_empty())
    }

    pub fn provider_model(&self, provider: &str) -> Option<&str> {
        self.providers
            .get(provider)
            .and_then(|p| p.model.as_deref())
            .filter(|m| !m.trim().is_empty())
    }

    pub fn api_key(&self, provider: &str) -> Option<&str> {
        self.api_keys
            .get(provider)
            .map(String::as_str)
            .filter(|k| !k.trim().is_empty())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub enabled: bool,
    pub http: Option<String>,
    pub https: Option<String>,
}

/// Hysteresis and memory bounds for both detectors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionConfig {
    /// Minimum confidence for a major-topic change to commit
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f64,
    /// Fragments required since the last transition before classifying again
    #[serde(default = "default_min_dwell")]
    pub min_dwell: usize,
    /// Open-segment buffer size that triggers compaction
    #[serde(default = "default_max_current")]
    pub max_current: usize,
    /// Most recent fragments kept (after the head) when compacting
    #[serde(default = "default_keep_recent")]
    pub keep_recent: usize,
    /// Character budget for the previous-segment summary
    #[serde(default = "default_max_prev_len")]
    pub max_prev_len: usize,
    /// Fragments buffered before the first segment is opened
    #[serde(default = "default_initial_fragments")]
    pub initial_fragments: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_fault_pause_ms")]
    pub fault_pause_ms: u64,
    /// Queue backlog step at which a warning is logged (0 disables)
    #[serde(default = "default_backlog_warn_every")]
    pub backlog_warn_every: usize,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: default_confidence_threshold(),
            min_dwell: default_min_dwell(),
            max_current: default_max_current(),
            keep_recent: default_keep_recent(),
            max_prev_len: default_max_prev_len(),
            initial_fragments: default_initial_fragments(),
            poll_interval_ms: default_poll_interval_ms(),
            fault_pause_ms: default_fault_pause_ms(),
            backlog_warn_every: default_backlog_warn_every(),
        }
    }
}

impl DetectionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn fault_pause(&self) -> Duration {
        Duration::from_millis(self.fault_pause_ms)
    }
}

/// Remote classifier settings: model plus timeout/retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OracleConfig {
    #[serde(default = "default_provider_name")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_classify_max_tokens")]
    pub classify_max_tokens: i32,
    #[serde(default = "default_major_max_tokens")]
    pub major_max_tokens: i32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            provider: default_provider_name(),
            model: default_model(),
            call_timeout_secs: default_call_timeout_secs(),
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            classify_max_tokens: default_classify_max_tokens(),
            major_max_tokens: default_major_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub enabled: bool,
    pub model: Option<String>,
    pub base_url: Option<String>,
}

fn default_confidence_threshold() -> f64 { 0.65 }
fn default_min_dwell() -> usize { 2 }
fn default_max_current() -> usize { 100 }
fn default_keep_recent() -> usize { 50 }
fn default_max_prev_len() -> usize { 5000 }
fn default_initial_fragments() -> usize { 2 }
fn default_poll_interval_ms() -> u64 { 1000 }
fn default_fault_pause_ms() -> u64 { 1000 }
fn default_backlog_warn_every() -> usize { 25 }
fn default_provider_name() -> String { "openai".to_string() }
fn default_model() -> String { "gpt-4o-mini-2024-07-18".to_string() }
fn default_call_timeout_secs() -> u64 { 30 }
fn default_max_retries() -> u32 { 2 }
fn default_backoff_ms() -> u64 { 2000 }
fn default_classify_max_tokens() -> i32 { 100 }
fn default_major_max_tokens() -> i32 { 150 }

pub struct ConfigStore {
    config_dir: PathBuf,
    config_file: PathBuf,
}

impl ConfigStore {
    pub fn new(config_dir: PathBuf) -> Self {
        let config_file = config_dir.join("config.json");
        Self { config_dir, config_file }
    }

    /// Get default config directory
    pub fn default_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("livetopics"))
    }

    /// Ensure config directory exists
    pub fn ensure_dir(&self) -> Result<(), String> {
        fs::create_dir_all(&self.config_dir)
            .map_err(|e| format!("Failed to create config dir: {}", e))
    }

    /// Load configuration from file
    pub fn load(&self) -> Result<AppConfig, String> {
        if !self.config_file.exists() {
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&self.config_file)
            .map_err(|e| format!("Failed to read config: {}", e))?;

        serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config: {}", e))
    }

    /// Save configuration to file
    pub fn save(&self, config: &AppConfig) -> Result<(), String> {
        self.ensure_dir()?;

        if self.config_file.exists() {
            self.create_backup()?;
        }

        let content = serde_json::to_string_pretty(config)
            .map_err(|e| format!("Failed to serialize config: {}", e))?;

        fs::write(&self.config_file, content)
            .map_err(|e| format!("Failed to write config: {}", e))
    }

    fn create_backup(&self) -> Result<(), String> {
        let backup_dir = self.config_dir.join("backups");
        fs::create_dir_all(&backup_dir)
            .map_err(|e| format!("Failed to create backup dir: {}", e))?;

        let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S%.3f");
        let backup_file = backup_dir.join(format!("config_{}.json", timestamp));

        fs::copy(&self.config_file, &backup_file)
            .map_err(|e| format!("Failed to create backup: {}", e))?;

        self.cleanup_old_backups(&backup_dir, 10)?;

        Ok(())
    }

    /// Remove old backups, keeping only the most recent N
    fn cleanup_old_backups(&self, backup_dir: &Path, keep: usize) -> Result<(), String> {
        let mut entries: Vec<_> = fs::read_dir(backup_dir)
            .map_err(|e| format!("Failed to read backup dir: {}", e))?
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().map_or(false, |ext| ext == "json"))
            .collect();

        if entries.len() <= keep {
            return Ok(());
        }

        // Oldest first
        entries.sort_by_key(|e| {
            e.metadata()
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        });

        for entry in entries.iter().take(entries.len() - keep) {
            let _ = fs::remove_file(entry.path());
        }

        Ok(())
    }

    /// Get provider API key from config file
    pub fn get_api_key(&self, provider: &str) -> Result<Option<String>, String> {
        let config = self.load()?;
        Ok(config.api_keys.get(provider).cloned())
    }

    /// Store provider API key in config file
    pub fn set_api_key(&self, provider: &str, key: &str) -> Result<(), String> {
        let mut config = self.load()?;
        config.api_keys.insert(provider.to_string(), key.to_string());
        self.save(&config)
    }
}
