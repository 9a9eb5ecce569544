use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TuttiError};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub engine: ExecutorConfig,
    #[serde(default)]
    pub scoring: ScoringDefaults,
    #[serde(default)]
    pub suspend: Option<SuspendConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently running graph nodes.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// Broadcast buffer size for the event bus.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
    /// Default timeout applied to unit steps without an explicit policy.
    #[serde(default)]
    pub default_timeout_ms: Option<u64>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            event_capacity: default_event_capacity(),
            default_timeout_ms: None,
        }
    }
}

fn default_max_concurrency() -> usize { 8 }
fn default_event_capacity() -> usize { 256 }

/// Fallback scoring values for steps that omit them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoringDefaults {
    #[serde(default = "default_threshold")]
    pub threshold: f64,
    #[serde(default = "default_retry_limit")]
    pub retry_limit: u32,
}

impl Default for ScoringDefaults {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            retry_limit: default_retry_limit(),
        }
    }
}

fn default_threshold() -> f64 { 0.7 }
fn default_retry_limit() -> u32 { 2 }

/// Durable suspend store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuspendConfig {
    /// Path to the SQLite database file.
    pub db_path: String,
}

impl EngineConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TuttiError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| TuttiError::Config(e.to_string()))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}
