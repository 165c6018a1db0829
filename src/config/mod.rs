//! Configuration management for agent-relay
//!
//! Implements a hierarchical configuration system:
//! 1. Global config (`<config dir>/agent-relay/config.json`)
//! 2. Project config (`./.agent-relay.json`)
//! 3. Environment variables (a `.env` file is honoured by the binary)
//! 4. CLI parameters (highest priority)
//!
//! Files may be partial; each layer only overrides the keys it names.

pub mod settings;

use std::{
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use self::settings::{
    CorsSettings, ResendMatch, ServerSettings, StreamSettings, UpstreamSettings, DEFAULT_AUTHOR,
};
use crate::error::{RelayError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
    pub stream: StreamSettings,
}

impl RelayConfig {
    /// Load configuration from files and environment
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration file cannot be read or parsed, or
    /// an environment override is malformed
    pub fn load() -> Result<Self> {
        let mut config = Self::load_layers(&[
            Self::global_config_path(),
            Self::project_config_path(),
        ])?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Merge the given files in order over the defaults.
    ///
    /// Missing files are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be read or parsed
    pub fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = serde_json::to_value(Self::default())?;

        for path in paths {
            if let Some(layer) = Self::read_layer(path)? {
                merge_values(&mut merged, layer);
            }
        }

        serde_json::from_value(merged).map_err(|e| RelayError::ConfigValidation(e.to_string()))
    }

    fn read_layer(path: &Path) -> Result<Option<Value>> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = fs::read_to_string(path).map_err(|e| RelayError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        let value = serde_json::from_str(&contents).map_err(|e| RelayError::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

        tracing::debug!(path = %path.display(), "loaded config layer");
        Ok(Some(value))
    }

    /// Apply `RELAY_*` environment overrides through `lookup`
    ///
    /// # Errors
    ///
    /// Returns an error if a numeric override does not parse
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(listen) = lookup("RELAY_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(url) = lookup("RELAY_UPSTREAM_URL") {
            self.upstream.url = Some(url);
        }
        if let Some(token) = lookup("RELAY_UPSTREAM_TOKEN") {
            self.upstream.bearer_token = Some(token);
        }
        if let Some(deadline) = lookup("RELAY_DEADLINE_MS") {
            self.stream.deadline_ms = deadline.parse().map_err(|_| {
                RelayError::ConfigValidation(format!("RELAY_DEADLINE_MS is not a number: {deadline}"))
            })?;
        }
        if let Some(author) = lookup("RELAY_DEFAULT_AUTHOR") {
            self.stream.default_author = author;
        }
        Ok(())
    }

    /// Check that the settings can drive a session
    ///
    /// # Errors
    ///
    /// Returns the first problem found
    pub fn validate(&self) -> Result<()> {
        let stream = &self.stream;
        if stream.default_author.trim().is_empty() {
            return Err(RelayError::ConfigValidation(
                "stream.default_author must not be empty".to_string(),
            ));
        }
        if stream.deadline_ms == 0 {
            return Err(RelayError::ConfigValidation(
                "stream.deadline_ms must be positive".to_string(),
            ));
        }
        if stream.channel_capacity == 0 {
            return Err(RelayError::ConfigValidation(
                "stream.channel_capacity must be positive".to_string(),
            ));
        }
        if stream.fingerprint_prefix_chars == 0 {
            return Err(RelayError::ConfigValidation(
                "stream.fingerprint_prefix_chars must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the configuration directory path
    #[must_use]
    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("agent-relay")
    }

    /// Get the global config file path
    #[must_use]
    pub fn global_config_path() -> PathBuf {
        Self::config_dir().join("config.json")
    }

    /// Get the project config file path in the current directory
    #[must_use]
    pub fn project_config_path() -> PathBuf {
        PathBuf::from(".agent-relay.json")
    }
}

/// Recursively overlay `layer` onto `base`; objects merge, anything else replaces
fn merge_values(base: &mut Value, layer: Value) {
    match (base, layer) {
        (Value::Object(base), Value::Object(layer)) => {
            for (key, value) in layer {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, layer) => *base = layer,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_config_paths() {
        let global_path = RelayConfig::global_config_path();
        assert!(global_path.ends_with("agent-relay/config.json"));

        let project_path = RelayConfig::project_config_path();
        assert_eq!(project_path, PathBuf::from(".agent-relay.json"));
    }

    #[test]
    fn test_missing_files_give_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = RelayConfig::load_layers(&[temp_dir.path().join("nope.json")]).unwrap();
        assert_eq!(config, RelayConfig::default());
    }

    #[test]
    fn test_project_layer_overrides_global() {
        let temp_dir = TempDir::new().unwrap();
        let global = temp_dir.path().join("config.json");
        let project = temp_dir.path().join(".agent-relay.json");

        fs::write(
            &global,
            r#"{"upstream": {"url": "http://global"}, "stream": {"deadline_ms": 1000}}"#,
        )
        .unwrap();
        fs::write(&project, r#"{"stream": {"deadline_ms": 2000}}"#).unwrap();

        let config = RelayConfig::load_layers(&[global, project]).unwrap();
        assert_eq!(config.upstream.url.as_deref(), Some("http://global"));
        assert_eq!(config.stream.deadline_ms, 2000);
        assert_eq!(config.stream.default_author, DEFAULT_AUTHOR);
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("config.json");
        fs::write(&path, "{not json").unwrap();

        let err = RelayConfig::load_layers(&[path]).unwrap_err();
        assert!(matches!(err, RelayError::ConfigParse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("RELAY_UPSTREAM_URL", "http://agent/run_sse"),
            ("RELAY_DEADLINE_MS", "42"),
            ("RELAY_DEFAULT_AUTHOR", "planner"),
        ]
        .into_iter()
        .collect();

        let mut config = RelayConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| (*v).to_string()))
            .unwrap();

        assert_eq!(config.upstream.url.as_deref(), Some("http://agent/run_sse"));
        assert_eq!(config.stream.deadline_ms, 42);
        assert_eq!(config.stream.default_author, "planner");
    }

    #[test]
    fn test_bad_numeric_env_override() {
        let mut config = RelayConfig::default();
        let result = config.apply_env(|key| (key == "RELAY_DEADLINE_MS").then(|| "soon".to_string()));
        assert!(result.is_err());
    }

    #[test]
    fn test_validate() {
        assert!(RelayConfig::default().validate().is_ok());

        let mut config = RelayConfig::default();
        config.stream.channel_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = RelayConfig::default();
        config.stream.default_author = "  ".to_string();
        assert!(config.validate().is_err());
    }
}
