use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Result, TesseraError};
use crate::types::OperatingMode;

/// Top-level Tessera configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    /// Runtime logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

/// Executor settings shared by every run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound on stages running at the same time.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,
    /// `low_latency` forces fallback retries off for every capability stage.
    #[serde(default)]
    pub mode: OperatingMode,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: default_max_concurrency(),
            mode: OperatingMode::default(),
        }
    }
}

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: ./logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Logging level: 1 = run summary only, 2 = per-stage, 3 = per-route (default: 2).
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_dir: None,
            level: 2,
        }
    }
}

impl LogConfig {
    /// Resolve the log directory (expand ~).
    pub fn resolved_dir(&self) -> PathBuf {
        let dir = self.log_dir.as_deref().unwrap_or("logs");
        if let Some(rest) = dir.strip_prefix("~/") {
            if let Some(home) = dirs_home() {
                return home.join(rest);
            }
        }
        PathBuf::from(dir)
    }
}

/// Round settings for the bundled research pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_rounds")]
    pub max_debate_rounds: usize,
    #[serde(default = "default_rounds")]
    pub max_risk_rounds: usize,
    /// Rounds unrolled into the graph; runtime round counts are capped here.
    #[serde(default = "default_round_ceiling")]
    pub round_ceiling: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_debate_rounds: default_rounds(),
            max_risk_rounds: default_rounds(),
            round_ceiling: default_round_ceiling(),
        }
    }
}

fn default_max_concurrency() -> usize { 8 }
fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }
fn default_rounds() -> usize { 1 }
fn default_round_ceiling() -> usize { 3 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| TesseraError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        let config: Self =
            toml::from_str(&expanded).map_err(|e| TesseraError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the executor cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrency == 0 {
            return Err(TesseraError::Config(
                "engine.max_concurrency must be at least 1".into(),
            ));
        }
        if self.pipeline.round_ceiling == 0 {
            return Err(TesseraError::Config(
                "pipeline.round_ceiling must be at least 1".into(),
            ));
        }
        Ok(())
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

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_TESSERA_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_TESSERA_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_TESSERA_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_TESSERA_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_TESSERA_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.engine.max_concurrency, 8);
        assert_eq!(config.engine.mode, OperatingMode::Standard);
        assert!(config.log.is_none());
        assert_eq!(config.pipeline.max_debate_rounds, 1);
        assert_eq!(config.pipeline.round_ceiling, 3);
    }

    #[test]
    fn test_low_latency_mode() {
        let toml_str = r#"
[engine]
mode = "low_latency"
max_concurrency = 2
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.mode, OperatingMode::LowLatency);
        assert_eq!(config.engine.max_concurrency, 2);
    }

    #[test]
    fn test_log_section_defaults() {
        let config: AppConfig = toml::from_str("[log]\n").unwrap();
        let log = config.log.unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 2);
        assert_eq!(log.resolved_dir(), PathBuf::from("logs"));
    }

    #[test]
    fn test_validate_rejects_zero_concurrency() {
        let mut config = AppConfig::default();
        config.engine.max_concurrency = 0;
        assert!(config.validate().is_err());
    }
}
