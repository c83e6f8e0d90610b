use serde::{Deserialize, Serialize};

use crate::liveness::DEFAULT_HEARTBEAT_TOLERANCE;
use crate::ui::PushMode;

/// Runtime configuration, loaded from TOML.
///
/// Every field has a default so a partial (or empty) file is valid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Prefix for attributes the runtime stores in transport sessions.
    pub service_name: String,
    /// Relax lock-discipline checks to debug assertions.
    pub production_mode: bool,
    /// Seconds between client heartbeats; zero or less disables UI expiry.
    pub heartbeat_interval_secs: i64,
    /// Missed-heartbeat factor applied to the interval.
    pub heartbeat_tolerance: f64,
    /// Close sessions that only receive heartbeats once the transport
    /// session's inactivity limit passes.
    pub close_idle_sessions: bool,
    /// Inactivity limit for new transport sessions, in seconds. Negative
    /// means never.
    pub max_inactive_interval_secs: i64,
    /// How often the background reaper looks for expired transport sessions.
    pub reaper_interval_secs: u64,
    /// Push mode given to newly created UIs.
    pub default_push_mode: PushMode,
    /// Locales the application supports, most preferred first.
    pub provided_locales: Vec<String>,
    /// Locale used when negotiation finds nothing better.
    pub default_locale: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            service_name: "session-runtime".into(),
            production_mode: false,
            heartbeat_interval_secs: 300,
            heartbeat_tolerance: DEFAULT_HEARTBEAT_TOLERANCE,
            close_idle_sessions: false,
            max_inactive_interval_secs: 1800,
            reaper_interval_secs: 60,
            default_push_mode: PushMode::Disabled,
            provided_locales: Vec::new(),
            default_locale: "en".into(),
        }
    }
}

impl RuntimeConfig {
    /// Load config from a TOML file path. Returns None if file doesn't exist.
    pub fn load(path: &std::path::Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.to_path_buf(), e))?;
        let config: Self =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseFailed(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(Some(config))
    }

    /// Load from `path` if given, else from the default location, falling
    /// back to defaults when no file exists.
    pub fn load_or_default(path: Option<&std::path::Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => default_config_path(),
        };
        match path {
            Some(p) => Ok(Self::load(&p)?.unwrap_or_default()),
            None => Ok(Self::default()),
        }
    }

    /// Save config to a TOML file path.
    pub fn save(&self, path: &std::path::Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        }
        let contents = self.to_toml()?;
        std::fs::write(path, contents)
            .map_err(|e| ConfigError::WriteFailed(path.to_path_buf(), e))?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::SerializeFailed)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.trim().is_empty() {
            return Err(ConfigError::Invalid("service_name must not be empty".into()));
        }
        if self.heartbeat_tolerance.is_nan() || self.heartbeat_tolerance <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "heartbeat_tolerance must be positive, got {}",
                self.heartbeat_tolerance
            )));
        }
        if self.reaper_interval_secs == 0 {
            return Err(ConfigError::Invalid("reaper_interval_secs must be at least 1".into()));
        }
        Ok(())
    }
}

/// `<config dir>/session-runtime/config.toml`, if the platform has a config dir.
pub fn default_config_path() -> Option<std::path::PathBuf> {
    dirs::config_dir().map(|d| d.join("session-runtime").join("config.toml"))
}

/// Errors that can occur when loading or saving config.
#[derive(Debug)]
pub enum ConfigError {
    ReadFailed(std::path::PathBuf, std::io::Error),
    ParseFailed(std::path::PathBuf, toml::de::Error),
    WriteFailed(std::path::PathBuf, std::io::Error),
    SerializeFailed(toml::ser::Error),
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ReadFailed(path, e) => {
                write!(f, "Failed to read config {}: {}", path.display(), e)
            }
            Self::ParseFailed(path, e) => {
                write!(f, "Failed to parse config {}: {}", path.display(), e)
            }
            Self::WriteFailed(path, e) => {
                write!(f, "Failed to write config {}: {}", path.display(), e)
            }
            Self::SerializeFailed(e) => write!(f, "Failed to serialize config: {}", e),
            Self::Invalid(msg) => write!(f, "Invalid config: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_empty_config() {
        let config: RuntimeConfig = toml::from_str("").unwrap();
        assert_eq!(config, RuntimeConfig::default());
        assert_eq!(config.heartbeat_interval_secs, 300);
        assert_eq!(config.max_inactive_interval_secs, 1800);
        assert!(!config.close_idle_sessions);
    }

    #[test]
    fn parse_partial_config() {
        let toml = r#"
            service_name = "shop"
            close_idle_sessions = true
            default_push_mode = "automatic"
            provided_locales = ["fi-FI", "en-US"]
        "#;
        let config: RuntimeConfig = toml::from_str(toml).unwrap();
        assert_eq!(config.service_name, "shop");
        assert!(config.close_idle_sessions);
        assert_eq!(config.default_push_mode, PushMode::Automatic);
        assert_eq!(config.provided_locales, vec!["fi-FI", "en-US"]);
        assert_eq!(config.heartbeat_tolerance, DEFAULT_HEARTBEAT_TOLERANCE);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut config = RuntimeConfig::default();
        assert!(config.validate().is_ok());

        config.heartbeat_tolerance = 0.0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config.heartbeat_tolerance = f64::NAN;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        config = RuntimeConfig::default();
        config.reaper_interval_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_missing_file_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nope.toml");
        assert!(RuntimeConfig::load(&path).unwrap().is_none());
        assert_eq!(
            RuntimeConfig::load_or_default(Some(&path)).unwrap(),
            RuntimeConfig::default()
        );
    }

    #[test]
    fn save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let config = RuntimeConfig {
            production_mode: true,
            heartbeat_interval_secs: 15,
            ..Default::default()
        };
        config.save(&path).unwrap();
        assert_eq!(RuntimeConfig::load(&path).unwrap(), Some(config));
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "heartbeat_interval_secs = \"soon\"").unwrap();
        let err = RuntimeConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::ParseFailed(..)));
        assert!(err.to_string().starts_with("Failed to parse config"));
    }

    #[test]
    fn load_rejects_invalid_values() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("invalid.toml");
        std::fs::write(&path, "reaper_interval_secs = 0").unwrap();
        assert!(matches!(RuntimeConfig::load(&path), Err(ConfigError::Invalid(_))));
    }
}
