//! Runtime configuration.
//!
//! Settings are read from `<data_dir>/council.toml` when present, then
//! individual values can be overridden through `COUNCIL_*` environment
//! variables. Every field has a default so an empty data directory works.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{CoreError, CoreResult};

/// File name of the settings file inside the data directory.
pub const CONFIG_FILE: &str = "council.toml";

/// Rate-limit action for advisor creation.
pub const ACTION_CREATE_ADVISOR: &str = "create_advisor";

/// Rate-limit action for chat turns.
pub const ACTION_SEND_MESSAGE: &str = "send_message";

/// Longest window or TTL accepted from configuration (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Limit for one rate-limited action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Calls allowed per window
    pub limit: u32,
    /// Window length in seconds
    pub window_secs: u64,
}

impl RateLimitRule {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self { limit, window_secs }
    }

    pub fn window(&self) -> chrono::Duration {
        bounded_seconds(self.window_secs)
    }
}

/// Upstream model provider
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderKind {
    #[default]
    OpenAI,
    Anthropic,
    /// Offline provider that echoes the prompt back
    Echo,
}

impl std::str::FromStr for LlmProviderKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAI),
            "anthropic" => Ok(Self::Anthropic),
            "echo" => Ok(Self::Echo),
            other => Err(CoreError::Config(format!("unknown LLM provider: {}", other))),
        }
    }
}

/// Settings for the upstream model call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmSettings {
    pub provider: LlmProviderKind,
    /// Model override; provider default when absent
    pub model: Option<String>,
    /// Base URL override, mainly for OpenAI-compatible gateways
    pub base_url: Option<String>,
    pub max_tokens: Option<u32>,
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CouncilConfig {
    /// Limits keyed by action name
    pub rate_limits: BTreeMap<String, RateLimitRule>,
    /// How long a stored idempotent result stays valid
    pub idempotency_ttl_secs: u64,
    /// Maximum length of a user message, in characters
    pub max_message_length: usize,
    /// Upper bound on handle candidates tried before giving up
    pub max_handle_attempts: u32,
    /// Number of prior messages sent to the model as context
    pub history_window: usize,
    pub llm: LlmSettings,
}

impl Default for CouncilConfig {
    fn default() -> Self {
        let mut rate_limits = BTreeMap::new();
        rate_limits.insert(ACTION_CREATE_ADVISOR.to_string(), RateLimitRule::new(10, 3600));
        rate_limits.insert(ACTION_SEND_MESSAGE.to_string(), RateLimitRule::new(30, 60));

        Self {
            rate_limits,
            idempotency_ttl_secs: 24 * 60 * 60,
            max_message_length: 10_000,
            max_handle_attempts: 1_000,
            history_window: 20,
            llm: LlmSettings::default(),
        }
    }
}

impl CouncilConfig {
    /// Load settings from the data directory, then apply environment overrides.
    pub fn load(data_dir: &Path) -> CoreResult<Self> {
        let path = data_dir.join(CONFIG_FILE);
        let mut config = if path.exists() {
            debug!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(&path)?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject durations that cannot be represented and empty rate windows.
    pub fn validate(&self) -> CoreResult<()> {
        if self.idempotency_ttl_secs > MAX_DURATION_SECS {
            return Err(CoreError::Config(format!(
                "idempotency_ttl_secs must be at most {}",
                MAX_DURATION_SECS
            )));
        }
        for (action, rule) in &self.rate_limits {
            if rule.window_secs == 0 || rule.window_secs > MAX_DURATION_SECS {
                return Err(CoreError::Config(format!(
                    "rate_limits.{}.window_secs must be between 1 and {}",
                    action, MAX_DURATION_SECS
                )));
            }
        }
        Ok(())
    }

    pub fn from_toml(content: &str) -> CoreResult<Self> {
        toml::from_str(content).map_err(|e| CoreError::Config(e.to_string()))
    }

    /// Override values from `COUNCIL_*` environment variables.
    pub fn apply_env(&mut self) -> CoreResult<()> {
        if let Some(ttl) = env_parse::<u64>("COUNCIL_IDEMPOTENCY_TTL_SECS")? {
            self.idempotency_ttl_secs = ttl;
        }
        if let Some(max) = env_parse::<usize>("COUNCIL_MAX_MESSAGE_LENGTH")? {
            self.max_message_length = max;
        }
        if let Some(window) = env_parse::<usize>("COUNCIL_HISTORY_WINDOW")? {
            self.history_window = window;
        }
        if let Some(provider) = env_value("COUNCIL_LLM_PROVIDER") {
            self.llm.provider = provider.parse()?;
        }
        if let Some(model) = env_value("COUNCIL_LLM_MODEL") {
            self.llm.model = Some(model);
        }
        if let Some(url) = env_value("COUNCIL_LLM_BASE_URL") {
            self.llm.base_url = Some(url);
        }
        Ok(())
    }

    pub fn idempotency_ttl(&self) -> chrono::Duration {
        bounded_seconds(self.idempotency_ttl_secs)
    }
}

fn bounded_seconds(secs: u64) -> chrono::Duration {
    chrono::Duration::seconds(secs.min(MAX_DURATION_SECS) as i64)
}

fn env_value(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(name: &str) -> CoreResult<Option<T>> {
    match env_value(name) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| CoreError::Config(format!("{} has an invalid value: {}", name, raw))),
        None => Ok(None),
    }
}
