//! Backend settings and credential lookup for cotflow.
//!
//! - [`Settings`] — Endpoints, models, and segmentation tuning, loaded from JSON
//! - [`BackendKind`] — Which backend a turn talks to
//! - [`CredentialProvider`] — Where the cloud API key comes from
//!
//! # Loading settings
//!
//! ```rust,ignore
//! use cotflow_config::Settings;
//!
//! // Reads COTFLOW_CONFIG (or ./cotflow.json if present), then env overrides.
//! let settings = Settings::load()?;
//! ```
//!
//! Every field has a default, so an empty JSON object is a valid config:
//!
//! ```rust
//! use cotflow_config::Settings;
//!
//! let settings = Settings::from_json("{}").unwrap();
//! assert_eq!(settings.local.host, "http://localhost:11434");
//! assert_eq!(settings.cloud.model, "deepseek-reasoner");
//! ```

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

mod credentials;

pub use credentials::{CredentialProvider, EnvCredentials, StaticCredential, CREDENTIAL_ENV_VARS};

const DEFAULT_CONFIG_FILE: &str = "cotflow.json";

/// Errors that can occur when loading or parsing configuration.
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse JSON configuration.
    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    /// A setting has an unusable value.
    #[error("Invalid setting '{field}': {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    /// Creates an IO error with path context.
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }

    /// Creates a validation error.
    pub fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// The two interchangeable text-generation backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Hosted API that needs a credential.
    Cloud,
    /// Model server on this machine.
    Local,
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cloud" | "deepseek" => Ok(Self::Cloud),
            "local" | "ollama" => Ok(Self::Local),
            other => Err(ConfigError::invalid("backend", format!("unknown backend '{other}'"))),
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Cloud => "cloud",
            Self::Local => "local",
        };
        write!(f, "{}", s)
    }
}

/// Cloud backend (OpenAI-compatible chat completions with reasoning fields).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CloudSettings {
    pub api_base: String,
    pub model: String,
    pub max_tokens: u32,
    pub timeout_secs: u64,
}

impl Default for CloudSettings {
    fn default() -> Self {
        Self {
            api_base: "https://api.deepseek.com/v1".into(),
            model: "deepseek-reasoner".into(),
            max_tokens: 8192,
            timeout_secs: 120,
        }
    }
}

/// Local backend (Ollama native API).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalSettings {
    pub host: String,
    /// Used when the caller does not pick a model and discovery is unavailable.
    pub default_model: Option<String>,
    /// Ask reasoning-capable models to return thinking in a separate field.
    pub think: bool,
    /// Most recent messages kept in a request.
    pub max_context: usize,
    pub timeout_secs: u64,
    pub discovery_timeout_secs: u64,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            host: "http://localhost:11434".into(),
            default_model: None,
            think: true,
            max_context: 12,
            timeout_secs: 300,
            discovery_timeout_secs: 5,
        }
    }
}

/// Tuning for the reasoning segmenter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterSettings {
    /// Upper bound on steps per turn; `None` means unbounded.
    pub max_steps: Option<usize>,
    /// Literal separator some backends emit between reasoning steps.
    pub boundary_marker: Option<String>,
    /// Characters shown in a flowchart box before abbreviating.
    pub preview_chars: usize,
}

impl Default for SegmenterSettings {
    fn default() -> Self {
        Self {
            max_steps: Some(30),
            boundary_marker: None,
            preview_chars: 16,
        }
    }
}

/// HTTP front-end.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub bind: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { bind: "127.0.0.1:8000".into() }
    }
}

/// Complete application settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub cloud: CloudSettings,
    pub local: LocalSettings,
    pub segmenter: SegmenterSettings,
    pub server: ServerSettings,
}

impl Settings {
    /// Loads settings from the config file (if any) and applies env overrides.
    ///
    /// `COTFLOW_CONFIG` names the file explicitly and must exist. Without it,
    /// `./cotflow.json` is used when present and defaults otherwise.
    pub fn load() -> Result<Self, ConfigError> {
        let mut settings = match config_path() {
            Some(path) => Self::from_file(&path)?,
            None => {
                debug!("No config file found, using defaults");
                Self::default()
            }
        };
        settings.apply_overrides(|key| env::var(key).ok());
        settings.validate()?;
        Ok(settings)
    }

    /// Loads settings from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::io(path.display().to_string(), e))?;
        let settings = Self::from_json(&content)?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    /// Parses settings from a JSON string.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Applies overrides from a key lookup (the process environment in [`Settings::load`]).
    ///
    /// Blank values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        if let Some(v) = get("COTFLOW_CLOUD_API_BASE") {
            self.cloud.api_base = v;
        }
        if let Some(v) = get("COTFLOW_CLOUD_MODEL") {
            self.cloud.model = v;
        }
        if let Some(v) = get("OLLAMA_HOST") {
            self.local.host = normalize_host(&v);
        }
        if let Some(v) = get("COTFLOW_LOCAL_MODEL") {
            self.local.default_model = Some(v);
        }
        if let Some(v) = get("COTFLOW_BIND") {
            self.server.bind = v;
        }
    }

    /// Rejects settings that cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cloud.api_base.trim().is_empty() {
            return Err(ConfigError::invalid("cloud.api_base", "must not be empty"));
        }
        if self.local.host.trim().is_empty() {
            return Err(ConfigError::invalid("local.host", "must not be empty"));
        }
        if self.local.max_context == 0 {
            return Err(ConfigError::invalid("local.max_context", "must be at least 1"));
        }
        if self.segmenter.max_steps == Some(0) {
            return Err(ConfigError::invalid("segmenter.max_steps", "must be at least 1"));
        }
        if self
            .segmenter
            .boundary_marker
            .as_deref()
            .is_some_and(|m| m.is_empty())
        {
            return Err(ConfigError::invalid("segmenter.boundary_marker", "must not be empty"));
        }
        Ok(())
    }
}

/// Resolves the config file path from `COTFLOW_CONFIG` or the working directory.
fn config_path() -> Option<PathBuf> {
    if let Ok(path) = env::var("COTFLOW_CONFIG") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return Some(PathBuf::from(trimmed));
        }
    }

    let fallback = PathBuf::from(DEFAULT_CONFIG_FILE);
    fallback.is_file().then_some(fallback)
}

/// `OLLAMA_HOST` is often given as `host:port` without a scheme.
fn normalize_host(host: &str) -> String {
    let host = host.trim_end_matches('/');
    match host.starts_with("http://") || host.starts_with("https://") {
        true => host.to_string(),
        false => format!("http://{host}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    #[test]
    fn partial_json_keeps_other_defaults() {
        let settings = Settings::from_json(r#"{"local": {"host": "http://gpu:11434", "think": false}}"#).unwrap();
        assert_eq!(settings.local.host, "http://gpu:11434");
        assert!(!settings.local.think);
        assert_eq!(settings.local.max_context, 12);
        assert_eq!(settings.cloud, CloudSettings::default());
        assert_eq!(settings.segmenter.max_steps, Some(30));
    }

    #[test]
    fn from_file_reads_json() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"cloud": {{"model": "deepseek-chat"}}, "segmenter": {{"max_steps": null}}}}"#).unwrap();

        let settings = Settings::from_file(file.path()).unwrap();
        assert_eq!(settings.cloud.model, "deepseek-chat");
        assert_eq!(settings.segmenter.max_steps, None);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Settings::from_file(Path::new("/nonexistent/cotflow.json")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(Settings::from_json("{not json"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn overrides_apply_and_ignore_blank_values() {
        let env: HashMap<&str, &str> = [
            ("OLLAMA_HOST", "127.0.0.1:11500"),
            ("COTFLOW_CLOUD_MODEL", "  "),
            ("COTFLOW_BIND", "0.0.0.0:9000"),
        ]
        .into_iter()
        .collect();

        let mut settings = Settings::default();
        settings.apply_overrides(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(settings.local.host, "http://127.0.0.1:11500");
        assert_eq!(settings.cloud.model, "deepseek-reasoner");
        assert_eq!(settings.server.bind, "0.0.0.0:9000");
    }

    #[test]
    fn validate_rejects_zero_limits() {
        let mut settings = Settings::default();
        settings.segmenter.max_steps = Some(0);
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid { .. })));

        let mut settings = Settings::default();
        settings.local.max_context = 0;
        assert!(settings.validate().is_err());

        assert!(Settings::default().validate().is_ok());
    }

    #[test]
    fn backend_kind_parses_aliases() {
        assert_eq!("Cloud".parse::<BackendKind>().unwrap(), BackendKind::Cloud);
        assert_eq!("ollama".parse::<BackendKind>().unwrap(), BackendKind::Local);
        assert!("gemini".parse::<BackendKind>().is_err());
        assert_eq!(BackendKind::Local.to_string(), "local");
    }
}
