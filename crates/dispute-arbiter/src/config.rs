//! Runtime configuration for the arbitration pipeline.
//!
//! One `ArbiterConfig` is built by the caller and passed into the entry
//! point; nothing in the pipeline reads or writes process environment
//! after that.
//!
//! ## Precedence (highest to lowest)
//!
//! 1. Values in a TOML config file
//! 2. Environment variables (e.g. `ARBITER_MODEL`)
//! 3. Built-in defaults
//!
//! ```toml
//! prompts_dir = "./instructions"
//!
//! [llm]
//! model = "gpt-4o-2024-11-20"
//! timeout_secs = 60
//!
//! [tracing]
//! project = "disputes-staging"
//! ```

use std::env;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const DEFAULT_MODEL: &str = "gpt-4o-2024-11-20";
const DEFAULT_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PROJECT: &str = "dispute-arbiter";

const ENV_API_KEY: &str = "OPENAI_API_KEY";
const ENV_BASE_URL: &str = "ARBITER_BASE_URL";
const ENV_MODEL: &str = "ARBITER_MODEL";
const ENV_TRACING: &str = "ARBITER_TRACING";
const ENV_PROJECT: &str = "ARBITER_PROJECT";
const ENV_PROMPTS_DIR: &str = "ARBITER_PROMPTS_DIR";

/// OpenAI-compatible endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    /// Base URL, without the `/chat/completions` suffix.
    pub base_url: String,
    pub model: String,
    /// Bearer credential. Required before a run can start.
    pub api_key: Option<String>,
    /// Per-request HTTP timeout.
    pub timeout_secs: u64,
    /// Sampling temperature; omitted from requests when `None`.
    pub temperature: Option<f64>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: env::var(ENV_BASE_URL).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string()),
            model: env::var(ENV_MODEL).unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            api_key: env::var(ENV_API_KEY).ok(),
            timeout_secs: DEFAULT_TIMEOUT_SECS,
            temperature: None,
        }
    }
}

impl LlmConfig {
    pub fn validate(&self) -> Result<(), String> {
        if !(self.base_url.starts_with("http://") || self.base_url.starts_with("https://")) {
            return Err(format!(
                "llm.base_url must be an http(s) URL, got '{}'",
                self.base_url
            ));
        }
        if self.model.trim().is_empty() {
            return Err("llm.model must not be empty".to_string());
        }
        match self.api_key.as_deref() {
            Some(key) if !key.trim().is_empty() => {}
            _ => return Err(format!("llm.api_key is required (set {ENV_API_KEY})")),
        }
        if self.timeout_secs == 0 {
            return Err("llm.timeout_secs must be > 0".to_string());
        }
        if let Some(t) = self.temperature {
            if !(0.0..=2.0).contains(&t) {
                return Err(format!("llm.temperature must be in [0, 2], got {t}"));
            }
        }
        Ok(())
    }
}

/// Run tracing toggles.
///
/// When enabled, every run opens a span tagged with `project` and each node
/// emits an event carrying its reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    pub enabled: bool,
    pub project: String,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            enabled: env::var(ENV_TRACING)
                .map(|v| parse_bool(&v))
                .unwrap_or(true),
            project: env::var(ENV_PROJECT).unwrap_or_else(|_| DEFAULT_PROJECT.to_string()),
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ArbiterConfig {
    pub llm: LlmConfig,
    pub tracing: TraceConfig,
    /// Directory holding the instruction templates. Built-in templates are
    /// used when `None`.
    pub prompts_dir: Option<PathBuf>,
}

impl ArbiterConfig {
    /// Build from environment, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            prompts_dir: env::var(ENV_PROMPTS_DIR).ok().map(PathBuf::from),
            ..Self::default()
        }
    }

    /// Parse a TOML document. Missing keys take their environment/default value.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let mut config: Self = toml::from_str(raw).context("Failed to parse arbiter config")?;
        if config.prompts_dir.is_none() {
            config.prompts_dir = env::var(ENV_PROMPTS_DIR).ok().map(PathBuf::from);
        }
        Ok(config)
    }

    /// Load a TOML config file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        Self::from_toml_str(&raw).with_context(|| format!("Invalid config in {}", path.display()))
    }

    /// Validate all sub-configs.
    pub fn validate(&self) -> Result<(), String> {
        self.llm.validate()?;
        if self.tracing.project.trim().is_empty() {
            return Err("tracing.project must not be empty".to_string());
        }
        if let Some(ref dir) = self.prompts_dir {
            if dir.as_os_str().is_empty() {
                return Err("prompts_dir must not be empty when set".to_string());
            }
        }
        Ok(())
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> ArbiterConfig {
        ArbiterConfig {
            llm: LlmConfig {
                base_url: DEFAULT_BASE_URL.to_string(),
                model: DEFAULT_MODEL.to_string(),
                api_key: Some("sk-test".to_string()),
                timeout_secs: DEFAULT_TIMEOUT_SECS,
                temperature: None,
            },
            tracing: TraceConfig {
                enabled: true,
                project: DEFAULT_PROJECT.to_string(),
            },
            prompts_dir: None,
        }
    }

    #[test]
    fn valid_config_passes() {
        valid().validate().expect("config should be valid");
    }

    #[test]
    fn missing_api_key_rejected() {
        let mut cfg = valid();
        cfg.llm.api_key = None;
        let err = cfg.validate().unwrap_err();
        assert!(err.contains("OPENAI_API_KEY"));
    }

    #[test]
    fn non_http_base_url_rejected() {
        let mut cfg = valid();
        cfg.llm.base_url = "api.openai.com".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cfg = valid();
        cfg.llm.timeout_secs = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn out_of_range_temperature_rejected() {
        let mut cfg = valid();
        cfg.llm.temperature = Some(2.5);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn toml_overrides_selected_fields() {
        let cfg = ArbiterConfig::from_toml_str(
            r#"
prompts_dir = "/srv/instructions"

[llm]
model = "gpt-4o-mini"
api_key = "sk-file"
timeout_secs = 30
temperature = 0.0

[tracing]
enabled = false
project = "staging"
"#,
        )
        .unwrap();
        assert_eq!(cfg.llm.model, "gpt-4o-mini");
        assert_eq!(cfg.llm.api_key.as_deref(), Some("sk-file"));
        assert_eq!(cfg.llm.timeout_secs, 30);
        assert_eq!(cfg.llm.temperature, Some(0.0));
        assert!(!cfg.tracing.enabled);
        assert_eq!(cfg.tracing.project, "staging");
        assert_eq!(cfg.prompts_dir, Some(PathBuf::from("/srv/instructions")));
    }

    #[test]
    fn toml_missing_sections_use_defaults() {
        let cfg = ArbiterConfig::from_toml_str("[llm]\ntimeout_secs = 10\n").unwrap();
        assert_eq!(cfg.llm.timeout_secs, 10);
        assert!(!cfg.llm.model.is_empty());
        assert!(!cfg.tracing.project.is_empty());
    }

    #[test]
    fn malformed_toml_is_an_error() {
        assert!(ArbiterConfig::from_toml_str("[llm\nmodel = ").is_err());
    }

    #[test]
    fn from_file_reads_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("arbiter.toml");
        std::fs::write(&path, "[llm]\nmodel = \"local-model\"\napi_key = \"k\"\n").unwrap();
        let cfg = ArbiterConfig::from_file(&path).unwrap();
        assert_eq!(cfg.llm.model, "local-model");
    }

    #[test]
    fn parse_bool_variants() {
        assert!(parse_bool("true"));
        assert!(parse_bool(" ON "));
        assert!(parse_bool("1"));
        assert!(!parse_bool("false"));
        assert!(!parse_bool("0"));
    }
}
