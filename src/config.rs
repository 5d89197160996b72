//! Configuration management for EMS credentials and server selection.
//!
//! Reads `~/.config/ems/settings.conf` (Linux), the equivalent application
//! support directory on macOS, or `%LOCALAPPDATA%\ems\settings.conf` (Windows).

use crate::types::{EmsError, Result};
use configparser::ini::Ini;
use std::path::{Path, PathBuf};

/// Known API servers.
pub const SERVERS: &[(&str, &str)] = &[
    ("prod", "https://ems.efoqa.com/api"),
    ("cluster", "https://ceod.efoqa.com/api"),
    ("stable", "https://emsapi.ausdig.com/api"),
    ("beta", "https://emsapibeta.ausdig.com/api"),
    ("nightly", "https://emsapitest.ausdig.com/api"),
];

/// Default number of reconnection attempts.
pub const DEFAULT_MAX_TRIALS: u32 = 3;

/// EMS client configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// EMS username
    pub username: Option<String>,
    /// EMS password
    pub password: Option<String>,
    /// Named server from [`SERVERS`] (defaults to `prod`)
    pub server: Option<String>,
    /// Explicit server URL, overrides `server`
    pub server_url: Option<String>,
    /// Maximum reconnection attempts
    pub max_trials: Option<u32>,
}

impl Config {
    /// Load configuration from the default config file.
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path.
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(EmsError::Config(format!(
                "Config file not found: {}. Run `ems config` to create it.",
                path.display()
            )));
        }

        let mut ini = Ini::new();
        ini.load(path).map_err(EmsError::Config)?;

        let max_trials = match ini.get("default", "max_trials").filter(|s| !s.is_empty()) {
            Some(s) => Some(s.parse::<u32>().map_err(|_| {
                EmsError::Config(format!("max_trials must be a positive integer, got '{}'", s))
            })?),
            None => None,
        };

        Ok(Config {
            username: ini.get("default", "username").filter(|s| !s.is_empty()),
            password: ini.get("default", "password").filter(|s| !s.is_empty()),
            server: ini.get("default", "server").filter(|s| !s.is_empty()),
            server_url: ini.get("default", "server_url").filter(|s| !s.is_empty()),
            max_trials,
        })
    }

    /// Write the configuration to a file in the same INI layout.
    pub fn save_to_path(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let value = |v: &Option<String>| Some(v.clone().unwrap_or_default());
        let mut ini = Ini::new();
        ini.set("default", "username", value(&self.username));
        ini.set("default", "password", value(&self.password));
        ini.set("default", "server", value(&self.server));
        ini.set("default", "server_url", value(&self.server_url));
        ini.set("default", "max_trials", value(&self.max_trials.map(|n| n.to_string())));
        ini.write(path)?;
        Ok(())
    }

    /// Get the platform-specific config directory for EMS.
    pub fn config_dir() -> Result<PathBuf> {
        #[cfg(target_os = "windows")]
        {
            dirs::data_local_dir()
                .map(|p| p.join("ems"))
                .ok_or_else(|| EmsError::Config("Could not determine config directory".into()))
        }

        #[cfg(any(target_os = "linux", target_os = "macos"))]
        {
            dirs::config_dir()
                .map(|p| p.join("ems"))
                .ok_or_else(|| EmsError::Config("Could not determine config directory".into()))
        }

        #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
        {
            dirs::home_dir()
                .map(|p| p.join(".ems"))
                .ok_or_else(|| EmsError::Config("Could not determine home directory".into()))
        }
    }

    /// Get the config file path.
    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("settings.conf"))
    }

    /// Check if credentials are configured.
    pub fn has_credentials(&self) -> bool {
        self.username.is_some() && self.password.is_some()
    }

    /// Get username or return error.
    pub fn require_username(&self) -> Result<&str> {
        self.username
            .as_deref()
            .ok_or_else(|| EmsError::Config("Username not configured".into()))
    }

    /// Get password or return error.
    pub fn require_password(&self) -> Result<&str> {
        self.password
            .as_deref()
            .ok_or_else(|| EmsError::Config("Password not configured".into()))
    }

    /// Reconnection budget.
    pub fn max_trials(&self) -> u32 {
        self.max_trials.unwrap_or(DEFAULT_MAX_TRIALS).max(1)
    }

    /// Resolve the API root URL.
    ///
    /// An explicit `server_url` wins and gets `/api` appended when missing;
    /// otherwise the named `server` is looked up.
    pub fn uri_root(&self) -> Result<String> {
        if let Some(url) = &self.server_url {
            if url.ends_with("/api") {
                return Ok(url.clone());
            }
            return Ok(format!("{}/api", url.trim_end_matches('/')));
        }

        let name = self.server.as_deref().unwrap_or("prod");
        SERVERS
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, url)| url.to_string())
            .ok_or_else(|| {
                EmsError::Config(format!(
                    "Unknown server '{}'. Use one of prod, cluster, stable, beta, nightly or set server_url",
                    name
                ))
            })
    }
}

/// Default config file content template.
pub const DEFAULT_CONFIG: &str = r#"[default]
username =
password =
server = prod
server_url =
max_trials = 3
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_config() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(
            temp_file,
            r#"[default]
username = testuser
password = testpass
server = beta
max_trials = 5
"#
        )
        .unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.username, Some("testuser".to_string()));
        assert_eq!(config.password, Some("testpass".to_string()));
        assert_eq!(config.max_trials(), 5);
        assert!(config.has_credentials());
        assert_eq!(config.uri_root().unwrap(), "https://emsapibeta.ausdig.com/api");
    }

    #[test]
    fn test_empty_values_treated_as_none() {
        let mut temp_file = NamedTempFile::new().unwrap();
        write!(temp_file, "{}", DEFAULT_CONFIG).unwrap();

        let config = Config::load_from_path(temp_file.path()).unwrap();
        assert_eq!(config.username, None);
        assert_eq!(config.password, None);
        assert!(!config.has_credentials());
        assert!(config.require_username().is_err());
    }

    #[test]
    fn test_bad_max_trials() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "[default]\nmax_trials = many").unwrap();
        assert!(matches!(
            Config::load_from_path(temp_file.path()),
            Err(EmsError::Config(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Config::load_from_path(&dir.path().join("settings.conf")).unwrap_err();
        assert!(matches!(err, EmsError::Config(_)));
    }

    #[test]
    fn test_uri_root() {
        let config = Config::default();
        assert_eq!(config.uri_root().unwrap(), "https://ems.efoqa.com/api");

        let config = Config {
            server_url: Some("https://ems.example.com/".into()),
            ..Default::default()
        };
        assert_eq!(config.uri_root().unwrap(), "https://ems.example.com/api");

        let config = Config {
            server_url: Some("https://ems.example.com/api".into()),
            ..Default::default()
        };
        assert_eq!(config.uri_root().unwrap(), "https://ems.example.com/api");

        let config = Config {
            server: Some("staging".into()),
            ..Default::default()
        };
        assert!(config.uri_root().is_err());
    }

    #[test]
    fn test_save_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ems").join("settings.conf");
        let config = Config {
            username: Some("pilot".into()),
            password: Some("secret".into()),
            server: Some("nightly".into()),
            server_url: None,
            max_trials: Some(2),
        };
        config.save_to_path(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.username.as_deref(), Some("pilot"));
        assert_eq!(loaded.server.as_deref(), Some("nightly"));
        assert_eq!(loaded.max_trials(), 2);
    }
}
