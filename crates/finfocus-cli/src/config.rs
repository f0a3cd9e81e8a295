//! Configuration file management for finfocus.
//!
//! Provides a TOML-based config file at `~/.config/finfocus/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use finfocus_core::{DispatchConfig, SupervisorConfig};

/// Environment override of the plugin install root.
pub const PLUGIN_DIR_ENV: &str = "FINFOCUS_PLUGIN_DIR";

/// Environment override of the default log level.
pub const LOG_LEVEL_ENV: &str = "FINFOCUS_LOG_LEVEL";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    #[serde(default)]
    pub plugins: PluginsSection,
    #[serde(default)]
    pub dispatch: DispatchSection,
    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PluginsSection {
    /// Plugin install root.
    pub dir: Option<PathBuf>,
    pub handshake_timeout_secs: Option<u64>,
    pub stop_grace_secs: Option<u64>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchSection {
    pub per_call_timeout_secs: Option<u64>,
    pub deadline_secs: Option<u64>,
    pub max_concurrency: Option<usize>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingSection {
    /// An `EnvFilter` directive such as `info` or `finfocus_core=debug`.
    pub level: Option<String>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the finfocus config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/finfocus` or
/// `~/.config/finfocus`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("finfocus");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("finfocus")
}

/// Return the path to the finfocus config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Default plugin install root: `~/.finfocus/plugins`.
pub fn default_plugin_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".finfocus")
        .join("plugins")
}

// -----------------------------------------------------------------------
// Read
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`. A missing file is `None`.
pub fn load_config(path: &Path) -> Result<Option<ConfigFile>> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(e)
                .with_context(|| format!("failed to read config file at {}", path.display()));
        }
    };
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(Some(config))
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct FinfocusConfig {
    pub plugin_dir: PathBuf,
    pub supervisor: SupervisorConfig,
    pub dispatch: DispatchConfig,
    /// Log filter when neither `RUST_LOG` nor a verbosity flag decides.
    pub log_level: String,
}

impl FinfocusConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Plugin dir: `cli_plugin_dir` > `FINFOCUS_PLUGIN_DIR` > `plugins.dir` >
    ///   `~/.finfocus/plugins`

    /// - Log level: `FINFOCUS_LOG_LEVEL` > `logging.level` > `info`
    pub fn resolve(cli_plugin_dir: Option<&Path>) -> Result<Self> {
        let file = load_config(&config_path())?;
        Ok(Self::from_sources(
            cli_plugin_dir,
            std::env::var(PLUGIN_DIR_ENV).ok(),
            std::env::var(LOG_LEVEL_ENV).ok(),
            file.unwrap_or_default(),
        ))
    }

    fn from_sources(
        cli_plugin_dir: Option<&Path>,
        env_plugin_dir: Option<String>,
        env_log_level: Option<String>,
        file: ConfigFile,
    ) -> Self {
        let plugin_dir = if let Some(dir) = cli_plugin_dir {
            dir.to_path_buf()
        } else if let Some(dir) = env_plugin_dir.filter(|d| !d.is_empty()) {
            PathBuf::from(dir)
        } else if let Some(dir) = file.plugins.dir {
            dir
        } else {
            default_plugin_dir()
        };

        let supervisor_defaults = SupervisorConfig::default();
        let supervisor = SupervisorConfig {
            handshake_timeout: file
                .plugins
                .handshake_timeout_secs
                .map_or(supervisor_defaults.handshake_timeout, Duration::from_secs),
            stop_grace: file
                .plugins
                .stop_grace_secs
                .map_or(supervisor_defaults.stop_grace, Duration::from_secs),
            ..supervisor_defaults
        };

        let dispatch_defaults = DispatchConfig::default();
        let dispatch = DispatchConfig {
            per_call_timeout: file
                .dispatch
                .per_call_timeout_secs
                .map_or(dispatch_defaults.per_call_timeout, Duration::from_secs),
            deadline: file
                .dispatch
                .deadline_secs
                .map_or(dispatch_defaults.deadline, Duration::from_secs),
            max_concurrency: file
                .dispatch
                .max_concurrency
                .unwrap_or(dispatch_defaults.max_concurrency),
        };

        let log_level = env_log_level
            .filter(|l| !l.is_empty())
            .or(file.logging.level)
            .unwrap_or_else(|| "info".to_string());

        Self {
            plugin_dir,
            supervisor,
            dispatch,
            log_level,
        }
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml: &str) -> ConfigFile {
        toml::from_str(toml).unwrap()
    }

    #[test]
    fn empty_file_resolves_to_defaults() {
        let config = FinfocusConfig::from_sources(None, None, None, ConfigFile::default());
        assert_eq!(config.plugin_dir, default_plugin_dir());
        assert_eq!(config.supervisor.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.dispatch.max_concurrency, DispatchConfig::default().max_concurrency);
        assert_eq!(config.log_level, "info");
    }

    #[test]
    fn file_values_apply() {
        let file = parse(
            r#"
            [plugins]
            dir = "/srv/plugins"
            handshake_timeout_secs = 12

            [dispatch]
            deadline_secs = 90
            max_concurrency = 2

            [logging]
            level = "debug"
            "#,
        );
        let config = FinfocusConfig::from_sources(None, None, None, file);
        assert_eq!(config.plugin_dir, PathBuf::from("/srv/plugins"));
        assert_eq!(config.supervisor.handshake_timeout, Duration::from_secs(12));
        assert_eq!(config.supervisor.stop_grace, SupervisorConfig::default().stop_grace);
        assert_eq!(config.dispatch.deadline, Duration::from_secs(90));
        assert_eq!(config.dispatch.max_concurrency, 2);
        assert_eq!(config.log_level, "debug");
    }

    #[test]
    fn cli_beats_env_beats_file() {
        let file = || parse("[plugins]\ndir = \"/from/file\"\n");

        let config = FinfocusConfig::from_sources(
            Some(Path::new("/from/cli")),
            Some("/from/env".into()),
            None,
            file(),
        );
        assert_eq!(config.plugin_dir, PathBuf::from("/from/cli"));

        let config = FinfocusConfig::from_sources(None, Some("/from/env".into()), None, file());
        assert_eq!(config.plugin_dir, PathBuf::from("/from/env"));

        let config = FinfocusConfig::from_sources(None, None, None, file());
        assert_eq!(config.plugin_dir, PathBuf::from("/from/file"));
    }

    #[test]
    fn env_log_level_overrides_file() {
        let file = parse("[logging]\nlevel = \"warn\"\n");
        let config = FinfocusConfig::from_sources(None, None, Some("trace".into()), file);
        assert_eq!(config.log_level, "trace");
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(load_config(&tmp.path().join("config.toml")).unwrap().is_none());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[plugins]\ndir = 42\n").unwrap();
        let err = load_config(&path).unwrap_err();
        assert!(format!("{err:#}").contains("failed to parse config file"));

        std::fs::write(&path, "[plugins]\nunknown_key = true\n").unwrap();
        assert!(load_config(&path).is_err());
    }
}
