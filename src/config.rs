//! Configuration management for taskweave.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required. Your OpenRouter API key.
//! - `DEFAULT_MODEL` - Optional. The model every bundled agent uses. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `OPENROUTER_API_URL` - Optional. Chat completions endpoint.
//!
//! Orchestration (all optional, see [`OrchestratorConfig`] for defaults):
//! - `SMART_DELEGATION` - Answer trivial inputs directly instead of delegating.
//! - `DELEGATION_PATTERN` - `single_agent`, `orchestrator`, `collaborative` or `hierarchical`.
//! - `COORDINATOR_AGENT` - Name of the coordinator agent.
//! - `RAG_ENABLED`, `RAG_TOP_K`, `RAG_RECENT_MESSAGES` - Retrieval during context isolation.
//! - `MAX_RETRIES`, `RETRY_BACKOFF_MS`, `MAX_BACKOFF_MS` - Subtask retries.
//! - `MAX_CONCURRENCY` - Parallel subtasks per group. Unset means one per distinct agent.
//! - `CONTEXT_TOKEN_BUDGET`, `RESERVED_SYSTEM_TOKENS`, `RESERVED_OUTPUT_TOKENS`, `TOKEN_FLOOR` - Per-subtask budget.
//! - `SYNTHESIS_TOKEN_BUDGET`, `SUMMARY_THRESHOLD_TOKENS` - Synthesis limits.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::budget::{TokenBudgetGuard, DEFAULT_TOKEN_FLOOR};
use crate::llm::OPENROUTER_API_URL;
use crate::memory::IsolationConfig;
use crate::orchestrator::{DelegationPattern, SynthesisConfig};
use crate::scheduler::{RetryPolicy, SchedulerConfig};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Orchestration settings, passed to the orchestrator at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub smart_delegation: bool,
    pub pattern: DelegationPattern,
    pub coordinator_agent: String,

    pub rag_enabled: bool,
    pub rag_top_k: usize,
    pub rag_recent_messages: usize,

    /// Retries after the first attempt
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub max_concurrency: Option<usize>,

    pub context_token_budget: usize,
    pub reserved_system_tokens: usize,
    pub reserved_output_tokens: usize,
    pub token_floor: usize,

    pub synthesis_token_budget: usize,
    pub summary_threshold_tokens: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            smart_delegation: true,
            pattern: DelegationPattern::Orchestrator,
            coordinator_agent: "coordinator".to_string(),
            rag_enabled: false,
            rag_top_k: 5,
            rag_recent_messages: 6,
            max_retries: 2,
            retry_backoff_ms: 500,
            max_backoff_ms: 10_000,
            max_concurrency: None,
            context_token_budget: 8_000,
            reserved_system_tokens: 1_000,
            reserved_output_tokens: 1_000,
            token_floor: DEFAULT_TOKEN_FLOOR,
            synthesis_token_budget: 6_000,
            summary_threshold_tokens: 1_000,
        }
    }
}

fn env_or<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{}", e))),
        Err(_) => Ok(default),
    }
}

fn env_bool(name: &str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(raw) => match raw.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            other => Err(ConfigError::InvalidValue(
                name.to_string(),
                format!("expected a boolean, got '{}'", other),
            )),
        },
        Err(_) => Ok(default),
    }
}

impl OrchestratorConfig {
    /// Load from environment variables, falling back to [`Default`].
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let max_concurrency = match std::env::var("MAX_CONCURRENCY") {
            Ok(raw) => {
                let value: usize = raw.trim().parse().map_err(|e| {
                    ConfigError::InvalidValue("MAX_CONCURRENCY".to_string(), format!("{}", e))
                })?;
                if value == 0 {
                    return Err(ConfigError::InvalidValue(
                        "MAX_CONCURRENCY".to_string(),
                        "must be at least 1".to_string(),
                    ));
                }
                Some(value)
            }
            Err(_) => defaults.max_concurrency,
        };

        let config = Self {
            smart_delegation: env_bool("SMART_DELEGATION", defaults.smart_delegation)?,
            pattern: env_or("DELEGATION_PATTERN", defaults.pattern)?,
            coordinator_agent: std::env::var("COORDINATOR_AGENT")
                .unwrap_or(defaults.coordinator_agent),
            rag_enabled: env_bool("RAG_ENABLED", defaults.rag_enabled)?,
            rag_top_k: env_or("RAG_TOP_K", defaults.rag_top_k)?,
            rag_recent_messages: env_or("RAG_RECENT_MESSAGES", defaults.rag_recent_messages)?,
            max_retries: env_or("MAX_RETRIES", defaults.max_retries)?,
            retry_backoff_ms: env_or("RETRY_BACKOFF_MS", defaults.retry_backoff_ms)?,
            max_backoff_ms: env_or("MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            max_concurrency,
            context_token_budget: env_or("CONTEXT_TOKEN_BUDGET", defaults.context_token_budget)?,
            reserved_system_tokens: env_or("RESERVED_SYSTEM_TOKENS", defaults.reserved_system_tokens)?,
            reserved_output_tokens: env_or("RESERVED_OUTPUT_TOKENS", defaults.reserved_output_tokens)?,
            token_floor: env_or("TOKEN_FLOOR", defaults.token_floor)?,
            synthesis_token_budget: env_or("SYNTHESIS_TOKEN_BUDGET", defaults.synthesis_token_budget)?,
            summary_threshold_tokens: env_or(
                "SUMMARY_THRESHOLD_TOKENS",
                defaults.summary_threshold_tokens,
            )?,
        };

        if config.token_floor == 0 {
            return Err(ConfigError::InvalidValue(
                "TOKEN_FLOOR".to_string(),
                "must be at least 1".to_string(),
            ));
        }
        Ok(config)
    }

    /// Budget for one subtask's context.
    pub fn context_budget(&self) -> TokenBudgetGuard {
        TokenBudgetGuard::new(
            self.context_token_budget,
            self.reserved_system_tokens,
            self.reserved_output_tokens,
            self.token_floor,
        )
    }

    pub fn isolation_config(&self) -> IsolationConfig {
        IsolationConfig {
            rag_enabled: self.rag_enabled,
            rag_top_k: self.rag_top_k,
            recent_messages: self.rag_recent_messages,
            ..IsolationConfig::default()
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            retry: RetryPolicy::new(self.max_retries, self.retry_backoff_ms, self.max_backoff_ms),
            max_concurrency: self.max_concurrency,
            budget: self.context_budget(),
        }
    }

    pub fn synthesis_config(&self) -> SynthesisConfig {
        SynthesisConfig {
            summary_threshold_tokens: self.summary_threshold_tokens,
            budget: TokenBudgetGuard::new(self.synthesis_token_budget, 0, 0, self.token_floor),
        }
    }
}

/// Process configuration: gateway credentials plus orchestration settings.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key
    pub api_key: String,

    /// Model used by every bundled agent
    pub default_model: String,

    /// Chat completions endpoint
    pub api_url: String,

    pub orchestrator: OrchestratorConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `OPENROUTER_API_KEY` is not set,
    /// `ConfigError::InvalidValue` if any orchestration variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))?;

        let default_model = std::env::var("DEFAULT_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());

        let api_url =
            std::env::var("OPENROUTER_API_URL").unwrap_or_else(|_| OPENROUTER_API_URL.to_string());

        Ok(Self {
            api_key,
            default_model,
            api_url,
            orchestrator: OrchestratorConfig::from_env()?,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn new(api_key: String, default_model: String) -> Self {
        Self {
            api_key,
            default_model,
            api_url: OPENROUTER_API_URL.to_string(),
            orchestrator: OrchestratorConfig::default(),
        }
    }
}
