//! Engine configuration management.

use anyhow::{Context, Result, anyhow, bail};
use kiln_core::pipeline::Shell;
use kiln_trace::LogFormat;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Keys accepted by `kiln config set`.
pub const KEYS: &[&str] = &[
    "workspace_root",
    "cache_dir",
    "concurrency_limit",
    "default_timeout_minutes",
    "default_shell",
    "log_level",
    "log_format",
    "keep_workspaces",
];

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory under which instance workspaces are created.
    pub workspace_root: PathBuf,
    /// Root of the local cache store.
    pub cache_dir: PathBuf,
    /// Upper bound on concurrently running instances across the run.
    pub concurrency_limit: Option<usize>,
    pub default_timeout_minutes: u64,
    /// Shell for `run` steps that name none.
    pub default_shell: Option<Shell>,
    pub log_level: String,
    pub log_format: LogFormat,
    pub keep_workspaces: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("kiln"),
            cache_dir: project_dirs()
                .map(|dirs| dirs.cache_dir().to_path_buf())
                .unwrap_or_else(|| std::env::temp_dir().join("kiln-cache")),
            concurrency_limit: None,
            default_timeout_minutes: 360,
            default_shell: None,
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            keep_workspaces: false,
        }
    }
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("dev", "kiln", "kiln")
}

impl EngineConfig {
    /// Load the configuration file, then apply environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::config_path()?)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read `path`, falling back to defaults when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_yaml::from_str(&content).with_context(|| format!("Invalid config file {}", path.display()))
    }

    /// Save configuration to file.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content).with_context(|| format!("Failed to write {}", path.display()))?;
        Ok(())
    }

    /// Get the configuration file path.
    pub fn config_path() -> Result<PathBuf> {
        let dirs = project_dirs().ok_or_else(|| anyhow!("Could not determine config directory"))?;
        Ok(dirs.config_dir().join("config.yaml"))
    }

    /// Override file values from `KILN_CACHE_DIR`, `KILN_WORKSPACE_ROOT` and
    /// `KILN_CONCURRENCY`, looked up through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        for (var, key) in [
            ("KILN_CACHE_DIR", "cache_dir"),
            ("KILN_WORKSPACE_ROOT", "workspace_root"),
            ("KILN_CONCURRENCY", "concurrency_limit"),
        ] {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                self.set(key, &value).with_context(|| format!("Invalid {var}"))?;
            }
        }
        Ok(())
    }

    /// Set a configuration value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "workspace_root" => self.workspace_root = PathBuf::from(value),
            "cache_dir" => self.cache_dir = PathBuf::from(value),
            "concurrency_limit" => {
                self.concurrency_limit = match value {
                    "" | "none" | "unlimited" => None,
                    n => Some(parse_positive(n)?),
                };
            }
            "default_timeout_minutes" => self.default_timeout_minutes = parse_positive(value)? as u64,
            "default_shell" => {
                self.default_shell = match value {
                    "" | "none" => None,
                    shell => Some(shell.parse()?),
                };
            }
            "log_level" => self.log_level = value.to_string(),
            "log_format" => self.log_format = value.parse()?,
            "keep_workspaces" => {
                self.keep_workspaces = value
                    .parse()
                    .map_err(|_| anyhow!("Expected true or false, got '{}'", value))?;
            }
            _ => bail!("Unknown config key: {} (expected one of: {})", key, KEYS.join(", ")),
        }
        Ok(())
    }

    /// Key/value pairs for `kiln config show`.
    pub fn entries(&self) -> Vec<(&'static str, String)> {
        vec![
            ("workspace_root", self.workspace_root.display().to_string()),
            ("cache_dir", self.cache_dir.display().to_string()),
            (
                "concurrency_limit",
                self.concurrency_limit
                    .map_or_else(|| "unlimited".to_string(), |n| n.to_string()),
            ),
            ("default_timeout_minutes", self.default_timeout_minutes.to_string()),
            (
                "default_shell",
                self.default_shell
                    .map_or_else(|| "platform default".to_string(), |s| s.to_string()),
            ),
            ("log_level", self.log_level.clone()),
            ("log_format", self.log_format.to_string()),
            ("keep_workspaces", self.keep_workspaces.to_string()),
        ]
    }

    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_minutes * 60)
    }
}

fn parse_positive(value: &str) -> Result<usize> {
    match value.trim().parse::<usize>() {
        Ok(0) | Err(_) => bail!("Expected a positive integer, got '{}'", value),
        Ok(n) => Ok(n),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.concurrency_limit, None);
        assert_eq!(config.default_timeout(), Duration::from_secs(360 * 60));
        assert_eq!(config.default_shell, None);
        assert!(!config.keep_workspaces);
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::load_from(&dir.path().join("config.yaml")).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.yaml");

        let mut config = EngineConfig::default();
        config.set("concurrency_limit", "4").unwrap();
        config.set("default_shell", "sh").unwrap();
        config.set("log_format", "json").unwrap();
        config.save_to(&path).unwrap();

        let loaded = EngineConfig::load_from(&path).unwrap();
        assert_eq!(loaded.concurrency_limit, Some(4));
        assert_eq!(loaded.default_shell, Some(Shell::Sh));
        assert_eq!(loaded.log_format, LogFormat::Json);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "keep_workspaces: true\n").unwrap();

        let config = EngineConfig::load_from(&path).unwrap();
        assert!(config.keep_workspaces);
        assert_eq!(config.default_timeout_minutes, 360);
    }

    #[test]
    fn test_env_overrides_file() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("KILN_CACHE_DIR", "/tmp/kiln-cache-override"),
            ("KILN_CONCURRENCY", "2"),
        ]);
        let mut config = EngineConfig {
            concurrency_limit: Some(8),
            ..Default::default()
        };
        config
            .apply_env(|key| vars.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.cache_dir, PathBuf::from("/tmp/kiln-cache-override"));
        assert_eq!(config.concurrency_limit, Some(2));
    }

    #[test]
    fn test_invalid_env_override_is_rejected() {
        let mut config = EngineConfig::default();
        let err = config
            .apply_env(|key| (key == "KILN_CONCURRENCY").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(err.to_string().contains("KILN_CONCURRENCY"));
    }

    #[test]
    fn test_set_validates() {
        let mut config = EngineConfig::default();
        assert!(config.set("concurrency_limit", "0").is_err());
        assert!(config.set("default_shell", "fish").is_err());
        assert!(config.set("keep_workspaces", "maybe").is_err());
        assert!(config.set("api_url", "http://localhost").is_err());

        config.set("concurrency_limit", "3").unwrap();
        config.set("concurrency_limit", "unlimited").unwrap();
        assert_eq!(config.concurrency_limit, None);
    }
}
