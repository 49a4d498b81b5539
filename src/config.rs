use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{DuofsError, Result};

fn default_ttl_secs() -> u64 {
    1
}

/// Mount defaults, overridable per-invocation from the CLI.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MountConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_secs: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_other: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_unmount: Option<bool>,
}

impl MountConfig {
    pub fn get_ttl_secs(&self) -> u64 {
        self.ttl_secs.unwrap_or_else(default_ttl_secs)
    }

    pub fn get_allow_other(&self) -> bool {
        self.allow_other.unwrap_or(false)
    }

    pub fn get_auto_unmount(&self) -> bool {
        self.auto_unmount.unwrap_or(true)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub mount: MountConfig,
}

/// Path of the user config file (`~/.config/duofs/config.toml` on Linux).
pub fn get_config_path() -> Result<PathBuf> {
    directories::ProjectDirs::from("", "", "duofs")
        .map(|dirs| dirs.config_dir().join("config.toml"))
        .ok_or_else(|| DuofsError::Config("could not determine config directory".to_string()))
}

/// Load the config file; a missing file yields the defaults.
pub fn load_config() -> Result<Config> {
    let path = get_config_path()?;
    if !path.exists() {
        return Ok(Config::default());
    }
    let text = std::fs::read_to_string(&path)
        .map_err(|e| DuofsError::Config(format!("failed to read {}: {}", path.display(), e)))?;
    toml::from_str(&text)
        .map_err(|e| DuofsError::Config(format!("failed to parse {}: {}", path.display(), e)))
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(base) = directories::BaseDirs::new() {
            return base.home_dir().join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.mount.get_ttl_secs(), 1);
        assert!(!config.mount.get_allow_other());
        assert!(config.mount.get_auto_unmount());
    }

    #[test]
    fn test_parse_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [mount]
            ttl_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.mount.get_ttl_secs(), 5);
        assert!(!config.mount.get_allow_other());
    }

    #[test]
    fn test_expand_tilde_passthrough() {
        assert_eq!(expand_tilde("/abs/path"), PathBuf::from("/abs/path"));
        assert_eq!(expand_tilde("rel/path"), PathBuf::from("rel/path"));
    }
}
