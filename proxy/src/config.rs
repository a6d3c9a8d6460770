use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

/// The browser user agent sent upstream. The upstream runs bot-challenge
/// checks, so the client has to look like a real browser.
pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
    AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Prefix for the environment variables holding raw credential blobs,
/// numbered from 1: `SMITHERY_COOKIE_1`, `SMITHERY_COOKIE_2`, ...
pub const CREDENTIAL_ENV_PREFIX: &str = "SMITHERY_COOKIE_";

/// Immutable configuration for the proxy, constructed once at startup and
/// injected into each component.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProxyConfig {
    /// The upstream chat endpoint.
    #[serde(default = "default_chat_url")]
    pub chat_url: String,
    /// The fixed system prompt sent with every upstream request.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
    /// Overall upstream request timeout, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// The static model catalog, in listing order.
    #[serde(default = "default_known_models")]
    pub known_models: Vec<String>,
    /// Models hidden by default when no persisted hidden set exists.
    #[serde(default = "default_hidden_models")]
    pub hidden_models: Vec<String>,
    /// Where the mutable hidden-model set is persisted. `None` disables
    /// persistence.
    #[serde(default = "default_visibility_path")]
    pub visibility_path: Option<PathBuf>,
    /// SQLite file for durable metrics. When unset, metrics are kept in a
    /// bounded in-memory buffer instead.
    #[serde(default)]
    pub metrics_db_path: Option<String>,
    /// Capacity of the in-memory metrics buffer.
    #[serde(default = "default_metrics_capacity")]
    pub metrics_max_in_memory_records: usize,
    /// Override the upstream user agent.
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            chat_url: default_chat_url(),
            system_prompt: default_system_prompt(),
            request_timeout_secs: default_request_timeout_secs(),
            known_models: default_known_models(),
            hidden_models: default_hidden_models(),
            visibility_path: default_visibility_path(),
            metrics_db_path: None,
            metrics_max_in_memory_records: default_metrics_capacity(),
            user_agent: None,
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn default_chat_url() -> String {
    "https://smithery.ai/api/chat".to_string()
}

fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}

fn default_request_timeout_secs() -> u64 {
    180
}

fn default_known_models() -> Vec<String> {
    [
        "claude-haiku-4.5",
        "claude-sonnet-4.5",
        "gpt-5",
        "gpt-5-mini",
        "gpt-5-nano",
        "gemini-2.5-flash-lite",
        "gemini-2.5-pro",
        "glm-4.6",
        "grok-4-fast-non-reasoning",
        "grok-4-fast-reasoning",
        "kimi-k2",
        "deepseek-reasoner",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_hidden_models() -> Vec<String> {
    ["gemini-2.5-flash-lite", "gemini-2.5-pro"]
        .into_iter()
        .map(str::to_string)
        .collect()
}

fn default_visibility_path() -> Option<PathBuf> {
    Some(PathBuf::from("./data/hidden_models.json"))
}

fn default_metrics_capacity() -> usize {
    5000
}
