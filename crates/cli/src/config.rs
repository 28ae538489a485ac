//! Configuration management for the CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Namespace used when neither the flag nor the config file sets one
pub const FALLBACK_NAMESPACE: &str = "stable-diffusion-multiplayer";

/// Contents of `~/.config/canvasctl/config.json`
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub default_namespace: Option<String>,
    pub kubeconfig: Option<String>,
}

impl Config {
    /// Load the user config; a missing file yields defaults
    pub fn load() -> Result<Self> {
        match Self::config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        serde_json::from_str(&content).context("Failed to parse config file")
    }

    /// Flag value, then config file, then the operator's default namespace
    pub fn namespace(&self, flag: Option<String>) -> String {
        flag.or_else(|| self.default_namespace.clone())
            .unwrap_or_else(|| FALLBACK_NAMESPACE.to_string())
    }

    fn config_path() -> Option<PathBuf> {
        dirs_next::home_dir().map(|home| home.join(".config").join("canvasctl").join("config.json"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load_from(&dir.path().join("config.json")).unwrap();
        assert!(config.default_namespace.is_none());
        assert_eq!(config.namespace(None), FALLBACK_NAMESPACE);
    }

    #[test]
    fn test_namespace_precedence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"default_namespace":"canvas-staging"}"#).unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.namespace(None), "canvas-staging");
        assert_eq!(config.namespace(Some("other".to_string())), "other");
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(Config::load_from(&path).is_err());
    }
}
