//! Session configuration
//!
//! Sources, in increasing priority:
//! 1. Built-in defaults
//! 2. The first configuration file found (`.winecall.toml`, `.winecall.yaml`, ...)
//! 3. Environment variables (`WINECALL_*`)

use anyhow::{Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use winecall_abi::Arch;

/// Configuration of one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Session identifier
    pub id: String,
    /// Architecture of the Wine prefix and the server
    pub arch: Arch,
    /// Directory holding Wine prefixes and server builds
    pub dir: PathBuf,
    /// `winecall-server.exe`; derived from `dir` and `arch` when unset
    pub server_path: Option<PathBuf>,
    /// Version the server must report
    pub server_version: String,
    /// Log level handed to the server
    pub log_level: String,
    pub startup_timeout_secs: u64,
    pub poll_interval_ms: u64,
    /// Bound on joining the output reader threads at termination
    pub reader_join_timeout_ms: u64,
    /// `wine` for win32 and `wine64` for win64 when unset
    pub wine_command: Option<String>,
    pub wineserver_command: String,
    /// Drive Wine maps the unix root to
    pub native_drive: char,
    /// Terminate the session at process exit and on SIGINT/SIGTERM
    pub exit_hooks: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            arch: Arch::Win64,
            dir: default_dir(),
            server_path: None,
            server_version: crate::VERSION.to_string(),
            log_level: "info".to_string(),
            startup_timeout_secs: 30,
            poll_interval_ms: 10,
            reader_join_timeout_ms: 1000,
            wine_command: None,
            wineserver_command: "wineserver".to_string(),
            native_drive: 'Z',
            exit_hooks: true,
        }
    }
}

fn default_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(env::temp_dir)
        .join(".winecall")
}

impl SessionConfig {
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn reader_join_timeout(&self) -> Duration {
        Duration::from_millis(self.reader_join_timeout_ms)
    }

    pub fn wine_prefix(&self) -> PathBuf {
        self.dir.join(format!("{}-wine", self.arch))
    }

    pub fn server_path(&self) -> PathBuf {
        self.server_path.clone().unwrap_or_else(|| {
            self.dir
                .join(format!("{}-server", self.arch))
                .join("winecall-server.exe")
        })
    }

    pub fn wine_command(&self) -> &str {
        match (&self.wine_command, self.arch) {
            (Some(command), _) => command,
            (None, Arch::Win32) => "wine",
            (None, Arch::Win64) => "wine64",
        }
    }

    /// Checks values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            anyhow::bail!("session id cannot be empty");
        }
        if parse_log_level(&self.log_level).is_none() {
            anyhow::bail!("unknown log level '{}'", self.log_level);
        }
        if !self.native_drive.is_ascii_alphabetic() {
            anyhow::bail!("native drive must be a letter, got '{}'", self.native_drive);
        }
        if self.startup_timeout_secs == 0 {
            anyhow::bail!("startup timeout must be positive");
        }
        Ok(())
    }
}

/// Configuration loader with multiple source support
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from all sources with proper precedence
    pub fn load() -> Result<SessionConfig> {
        let mut config = Self::load_from_files()?;
        Self::apply_environment_variables(&mut config)?;
        config.validate()?;
        Ok(config)
    }

    fn load_from_files() -> Result<SessionConfig> {
        for path in Self::find_config_files() {
            if path.is_dir() {
                info!(
                    "Ignoring config directory path (expected file): {}",
                    path.display()
                );
                continue;
            }
            if path.exists() {
                info!("Loading configuration from: {}", path.display());
                return Self::load_from_file(&path);
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(SessionConfig::default())
    }

    /// Potential configuration file paths, most specific first
    fn find_config_files() -> Vec<PathBuf> {
        let mut paths = Vec::new();

        if let Ok(config_path) = env::var("WINECALL_CONFIG") {
            paths.push(PathBuf::from(config_path));
        }

        if let Ok(current_dir) = env::current_dir() {
            for name in [
                ".winecall.toml",
                ".winecall.yaml",
                ".winecall.yml",
                ".winecall.json",
            ] {
                paths.push(current_dir.join(name));
            }
        }

        if let Some(home_dir) = dirs::home_dir() {
            for name in ["config.toml", "config.yaml", "config.yml", "config.json"] {
                paths.push(home_dir.join(".winecall").join(name));
            }
        }

        #[cfg(unix)]
        {
            for name in ["config.toml", "config.yaml", "config.yml", "config.json"] {
                paths.push(Path::new("/etc/winecall").join(name));
            }
        }

        paths
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<SessionConfig> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?,
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display()))?,
            Some("toml") => toml::from_str(&content)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display()))?,
            _ => {
                if let Ok(config) = toml::from_str(&content) {
                    config
                } else if let Ok(config) = serde_yaml::from_str(&content) {
                    config
                } else if let Ok(config) = serde_json::from_str(&content) {
                    config
                } else {
                    return Err(anyhow::anyhow!(
                        "Could not parse config file {} (tried TOML, YAML, JSON)",
                        path.display()
                    ));
                }
            }
        };

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_environment_variables(config: &mut SessionConfig) -> Result<()> {
        if let Ok(arch) = env::var("WINECALL_ARCH") {
            config.arch = Arch::parse(&arch)
                .with_context(|| format!("WINECALL_ARCH: unknown architecture '{arch}'"))?;
        }

        if let Ok(dir) = env::var("WINECALL_DIR") {
            config.dir = PathBuf::from(dir);
        }

        if let Ok(level) = env::var("WINECALL_LOG_LEVEL") {
            if let Some(level) = parse_log_level(&level) {
                config.log_level = level.to_string();
            }
        }

        if let Ok(server) = env::var("WINECALL_SERVER") {
            let trimmed = server.trim();
            config.server_path = if trimmed.is_empty() {
                None
            } else {
                Some(PathBuf::from(trimmed))
            };
        }

        if let Ok(timeout) = env::var("WINECALL_TIMEOUT") {
            if let Ok(timeout) = timeout.trim().parse() {
                config.startup_timeout_secs = timeout;
            }
        }

        Ok(())
    }

    /// Save configuration to a file
    pub fn save_to_file(config: &SessionConfig, path: &Path) -> Result<()> {
        let content = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => {
                serde_yaml::to_string(config).context("Failed to serialize config to YAML")?
            }
            Some("json") => serde_json::to_string_pretty(config)
                .context("Failed to serialize config to JSON")?,
            _ => toml::to_string_pretty(config).context("Failed to serialize config to TOML")?,
        };

        fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }
}

fn parse_log_level(value: &str) -> Option<&'static str> {
    match value.trim().to_ascii_lowercase().as_str() {
        "error" => Some("error"),
        "warn" | "warning" => Some("warn"),
        "info" => Some("info"),
        "debug" => Some("debug"),
        "trace" => Some("trace"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use once_cell::sync::Lazy;
    use std::sync::Mutex;
    use tempfile::TempDir;

    static ENV_GUARD: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.arch, Arch::Win64);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.startup_timeout(), Duration::from_secs(30));
        assert_eq!(config.poll_interval(), Duration::from_millis(10));
        assert_eq!(config.wine_command(), "wine64");
        assert!(config.wine_prefix().ends_with("win64-wine"));
        assert!(config
            .server_path()
            .ends_with("win64-server/winecall-server.exe"));
        config.validate().unwrap();
    }

    #[test]
    fn test_wine_command_follows_arch() {
        let config = SessionConfig {
            arch: Arch::Win32,
            ..SessionConfig::default()
        };
        assert_eq!(config.wine_command(), "wine");
        assert!(config.wine_prefix().ends_with("win32-wine"));
    }

    #[test]
    fn test_file_loading() {
        let temp_dir = TempDir::new().unwrap();
        for name in ["session.toml", "session.yaml", "session.json"] {
            let path = temp_dir.path().join(name);
            let config = SessionConfig {
                arch: Arch::Win32,
                startup_timeout_secs: 5,
                server_path: Some(PathBuf::from("/opt/winecall/server.exe")),
                ..SessionConfig::default()
            };
            ConfigLoader::save_to_file(&config, &path).unwrap();
            let loaded = ConfigLoader::load_from_file(&path).unwrap();
            assert_eq!(loaded, config, "{name}");
        }
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("partial.toml");
        fs::write(&path, "arch = \"win32\"\nlog_level = \"debug\"\n").unwrap();
        let loaded = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(loaded.arch, Arch::Win32);
        assert_eq!(loaded.log_level, "debug");
        assert_eq!(loaded.reader_join_timeout_ms, 1000);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bad.yaml");
        fs::write(&path, "arch: win64\nwine_version: '9.0'\n").unwrap();
        assert!(ConfigLoader::load_from_file(&path).is_err());
    }

    #[test]
    fn test_validation() {
        let config = SessionConfig {
            log_level: "loud".into(),
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());

        let config = SessionConfig {
            native_drive: '1',
            ..SessionConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_environment_overrides() {
        let _lock = ENV_GUARD.lock().unwrap();
        env::set_var("WINECALL_ARCH", "win32");
        env::set_var("WINECALL_LOG_LEVEL", "TRACE");
        env::set_var("WINECALL_TIMEOUT", "7");
        env::set_var("WINECALL_SERVER", "/srv/winecall-server.exe");
        let mut config = SessionConfig::default();
        ConfigLoader::apply_environment_variables(&mut config).unwrap();
        assert_eq!(config.arch, Arch::Win32);
        assert_eq!(config.log_level, "trace");
        assert_eq!(config.startup_timeout_secs, 7);
        assert_eq!(
            config.server_path(),
            PathBuf::from("/srv/winecall-server.exe")
        );

        env::set_var("WINECALL_ARCH", "sparc");
        assert!(ConfigLoader::apply_environment_variables(&mut config).is_err());

        for name in [
            "WINECALL_ARCH",
            "WINECALL_LOG_LEVEL",
            "WINECALL_TIMEOUT",
            "WINECALL_SERVER",
        ] {
            env::remove_var(name);
        }
    }
}
