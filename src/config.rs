//! Runtime configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then the
//! environment (`API_KEY`, `MODEL_NAME`, `MOUTHPIECE_API_URL`), then whatever
//! the CLI overrides on top.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{MouthpieceError, Result};

pub const DEFAULT_API_URL: &str = "https://api.siliconflow.cn/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "deepseek-ai/DeepSeek-V3.1-Terminus";

pub const ENV_API_KEY: &str = "API_KEY";
pub const ENV_MODEL: &str = "MODEL_NAME";
pub const ENV_API_URL: &str = "MOUTHPIECE_API_URL";

/// How the arena turns are requested from the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ArenaMode {
    /// Actor stream, monologue stream and judge call in parallel; game-ending
    /// turns are re-requested with the verdict injected.
    #[default]
    ThreeChannel,
    /// One streamed call whose envelope carries the verdict ahead of the dialogue.
    Combined,
}

impl std::fmt::Display for ArenaMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArenaMode::ThreeChannel => write!(f, "three-channel"),
            ArenaMode::Combined => write!(f, "combined"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api_url: String,
    pub model: String,
    /// Usually supplied through `API_KEY` rather than written to disk.
    pub api_key: Option<String>,
    pub connect_timeout_secs: u64,
    pub request_timeout_secs: u64,
    pub arena_mode: ArenaMode,
    /// Default `tracing` filter when `RUST_LOG` is unset.
    pub log_level: String,
    /// Capacity of the per-controller turn event queue.
    pub event_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api_url: DEFAULT_API_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            connect_timeout_secs: 10,
            request_timeout_secs: 120,
            arena_mode: ArenaMode::ThreeChannel,
            log_level: "warn".to_string(),
            event_buffer: 256,
        }
    }
}

impl Config {
    /// Parse a TOML document. Missing keys keep their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| MouthpieceError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            MouthpieceError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    /// Defaults, optionally overlaid with `path`, then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => Config::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Overlay values from an environment lookup. Empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        if let Some(key) = get(ENV_API_KEY) {
            self.api_key = Some(key);
        }
        if let Some(model) = get(ENV_MODEL) {
            self.model = model;
        }
        if let Some(url) = get(ENV_API_URL) {
            self.api_url = url;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.api_url.starts_with("http://") || self.api_url.starts_with("https://")) {
            return Err(MouthpieceError::Config(format!(
                "api_url must be an http(s) URL, got '{}'",
                self.api_url
            )));
        }
        if self.model.trim().is_empty() {
            return Err(MouthpieceError::Config("model must not be empty".into()));
        }
        if self.event_buffer == 0 {
            return Err(MouthpieceError::Config("event_buffer must be at least 1".into()));
        }
        Ok(())
    }

    pub fn api_key(&self) -> Result<&str> {
        self.api_key
            .as_deref()
            .ok_or_else(|| MouthpieceError::MissingApiKey(ENV_API_KEY.to_string()))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let c = Config::default();
        assert_eq!(c.api_url, DEFAULT_API_URL);
        assert_eq!(c.model, DEFAULT_MODEL);
        assert_eq!(c.arena_mode, ArenaMode::ThreeChannel);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let c = Config::from_toml_str("model = \"qwen\"\narena_mode = \"combined\"\n")
            .expect("parse");
        assert_eq!(c.model, "qwen");
        assert_eq!(c.arena_mode, ArenaMode::Combined);
        assert_eq!(c.request_timeout_secs, 120);
    }

    #[test]
    fn test_bad_toml_is_config_error() {
        let err = Config::from_toml_str("model = [").unwrap_err();
        assert!(matches!(err, MouthpieceError::Config(_)));
    }

    #[test]
    fn test_env_overrides_file() {
        let mut c = Config::from_toml_str("model = \"from-file\"").expect("parse");
        let env: HashMap<&str, &str> =
            [(ENV_MODEL, "from-env"), (ENV_API_KEY, "sk-1"), (ENV_API_URL, "")].into();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.model, "from-env");
        assert_eq!(c.api_key.as_deref(), Some("sk-1"));
        assert_eq!(c.api_url, DEFAULT_API_URL);
    }

    #[test]
    fn test_missing_api_key() {
        let c = Config::default();
        assert!(matches!(c.api_key(), Err(MouthpieceError::MissingApiKey(_))));
    }

    #[test]
    fn test_validate_rejects_bad_url() {
        let c = Config { api_url: "ftp://x".into(), ..Config::default() };
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let mut f = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(f, "api_url = \"http://127.0.0.1:9/v1/chat/completions\"").unwrap();
        writeln!(f, "connect_timeout_secs = 2").unwrap();
        let c = Config::from_file(f.path()).expect("load");
        assert_eq!(c.connect_timeout(), Duration::from_secs(2));
        assert!(c.api_url.starts_with("http://127.0.0.1"));
    }

    #[test]
    fn test_from_missing_file() {
        let err = Config::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(err.to_string().contains("cannot read"));
    }
}
