use crate::sandbox::{DirectLauncher, Launcher, NamespaceLauncher};
use crate::security::policy::DEFAULT_ALLOWED_MODULES;
use crate::security::{CapabilityPolicy, PolicyError};
use crate::session::{RetentionError, RetentionPolicy, StoreOptions};
use crate::supervisor::{SupervisorOptions, TimeoutBounds};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Config {
    pub python: PythonConfig,
    pub limits: LimitsConfig,
    pub sessions: SessionsConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PythonConfig {
    pub interpreter: String,
    pub allowed_modules: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct LimitsConfig {
    pub default_timeout_secs: u64,
    pub min_timeout_secs: u64,
    pub max_timeout_secs: u64,
    /// 0 disables the address-space limit.
    pub memory_limit_mb: u64,
    pub max_output_bytes: usize,
    pub variable_byte_cap: usize,
    pub session_byte_cap: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SessionsConfig {
    pub database_path: String,
    pub inactive_after_hours: u64,
    pub delete_after_hours: u64,
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SandboxConfig {
    /// Run workers in their own network namespace when the host allows it.
    pub isolate_network: bool,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid [python] section: {0}")]
    Python(String),
    #[error("invalid [python] allowed_modules: {0}")]
    Policy(#[from] PolicyError),
    #[error("invalid [limits] section: {0}")]
    Limits(String),
    #[error("invalid [sessions] section: {0}")]
    Sessions(#[from] RetentionError),
}

impl Default for Config {
    fn default() -> Self {
        Self {
            python: PythonConfig {
                interpreter: "python3".to_string(),
                allowed_modules: DEFAULT_ALLOWED_MODULES.iter().map(|m| m.to_string()).collect(),
            },
            limits: LimitsConfig {
                default_timeout_secs: 30,
                min_timeout_secs: 1,
                max_timeout_secs: 300,
                memory_limit_mb: 1024,
                max_output_bytes: 1024 * 1024,
                variable_byte_cap: 4 * 1024 * 1024,
                session_byte_cap: 32 * 1024 * 1024,
            },
            sessions: SessionsConfig {
                database_path: "~/.sandpit/sessions.db".to_string(),
                inactive_after_hours: 24,
                delete_after_hours: 168,
                sweep_interval_secs: 600,
            },
            sandbox: SandboxConfig {
                isolate_network: true,
            },
        }
    }
}

impl Config {
    /// Parse config from a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".sandpit").join("config.toml"))
    }

    /// Load config from ~/.sandpit/config.toml, falling back to defaults.
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Self::default(),
        }
    }

    pub fn load_from(config_path: &Path) -> Self {
        if !config_path.exists() {
            return Self::default();
        }
        match std::fs::read_to_string(config_path) {
            Ok(contents) => match Self::from_toml(&contents) {
                Ok(config) => config,
                Err(e) => {
                    warn!(
                        "Failed to parse {}: {}. Using defaults.",
                        config_path.display(),
                        e
                    );
                    Self::default()
                }
            },
            Err(e) => {
                warn!(
                    "Failed to read {}: {}. Using defaults.",
                    config_path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Check every section. Run once at startup so a bad file fails before
    /// any request is served.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.policy()?;
        self.timeouts()?;
        self.store_options()?;
        if self.python.interpreter.trim().is_empty() {
            return Err(ConfigError::Python("interpreter is empty".to_string()));
        }
        if self.limits.max_output_bytes == 0 {
            return Err(ConfigError::Limits("max_output_bytes must be positive".to_string()));
        }
        Ok(())
    }

    pub fn policy(&self) -> Result<CapabilityPolicy, ConfigError> {
        Ok(CapabilityPolicy::new(&self.python.allowed_modules)?)
    }

    pub fn timeouts(&self) -> Result<TimeoutBounds, ConfigError> {
        let l = &self.limits;
        if l.min_timeout_secs == 0 {
            return Err(ConfigError::Limits("min_timeout_secs must be at least 1".to_string()));
        }
        if !(l.min_timeout_secs <= l.default_timeout_secs && l.default_timeout_secs <= l.max_timeout_secs) {
            return Err(ConfigError::Limits(format!(
                "timeouts must satisfy min ({}) <= default ({}) <= max ({})",
                l.min_timeout_secs, l.default_timeout_secs, l.max_timeout_secs
            )));
        }
        Ok(TimeoutBounds {
            default: Duration::from_secs(l.default_timeout_secs),
            min: Duration::from_secs(l.min_timeout_secs),
            max: Duration::from_secs(l.max_timeout_secs),
        })
    }

    pub fn retention(&self) -> Result<RetentionPolicy, ConfigError> {
        RetentionPolicy::from_hours(
            self.sessions.inactive_after_hours,
            self.sessions.delete_after_hours,
        )
        .map_err(ConfigError::from)
    }

    pub fn store_options(&self) -> Result<StoreOptions, ConfigError> {
        let l = &self.limits;
        if l.variable_byte_cap == 0 {
            return Err(ConfigError::Limits("variable_byte_cap must be positive".to_string()));
        }
        if (l.variable_byte_cap as u64) > l.session_byte_cap {
            return Err(ConfigError::Limits(format!(
                "variable_byte_cap ({}) exceeds session_byte_cap ({})",
                l.variable_byte_cap, l.session_byte_cap
            )));
        }
        let sweep_interval = match self.sessions.sweep_interval_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Ok(StoreOptions {
            variable_byte_cap: l.variable_byte_cap,
            session_byte_cap: l.session_byte_cap,
            retention: self.retention()?,
            sweep_interval,
        })
    }

    pub fn supervisor_options(&self) -> Result<SupervisorOptions, ConfigError> {
        let defaults = SupervisorOptions::default();
        // Room for printed output, bound values and a rendered figure.
        let max_reply_bytes = (self.limits.session_byte_cap as usize)
            .saturating_mul(2)
            .saturating_add(self.limits.max_output_bytes.saturating_mul(6))
            .max(defaults.max_reply_bytes);
        Ok(SupervisorOptions {
            interpreter: self.python.interpreter.clone(),
            timeouts: self.timeouts()?,
            memory_limit_mb: self.limits.memory_limit_mb,
            max_output_bytes: self.limits.max_output_bytes,
            max_reply_bytes,
            capture_artifacts: true,
        })
    }

    pub fn launcher(&self) -> Box<dyn Launcher> {
        if self.sandbox.isolate_network {
            Box::new(NamespaceLauncher::new())
        } else {
            Box::new(DirectLauncher)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CUSTOM: &str = r#"
[python]
interpreter = "/usr/bin/python3.12"
allowed_modules = ["math", "json"]

[limits]
default_timeout_secs = 10
min_timeout_secs = 2
max_timeout_secs = 60
memory_limit_mb = 512
max_output_bytes = 4096
variable_byte_cap = 1024
session_byte_cap = 8192

[sessions]
database_path = "/custom/path/sessions.db"
inactive_after_hours = 1
delete_after_hours = 2
sweep_interval_secs = 0

[sandbox]
isolate_network = false
"#;

    #[test]
    fn test_default_config_values() {
        let config = Config::default();
        assert_eq!(config.python.interpreter, "python3");
        assert!(config.python.allowed_modules.contains(&"pandas".to_string()));
        assert_eq!(config.limits.default_timeout_secs, 30);
        assert_eq!(config.limits.variable_byte_cap, 4 * 1024 * 1024);
        assert_eq!(config.sessions.database_path, "~/.sandpit/sessions.db");
        assert!(config.sandbox.isolate_network);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_roundtrip_toml() {
        let config = Config::default();
        let toml_str = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml_str).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_config_parse_custom_values() {
        let config = Config::from_toml(CUSTOM).unwrap();
        assert_eq!(config.python.allowed_modules, ["math", "json"]);
        assert_eq!(config.limits.max_timeout_secs, 60);
        assert_eq!(config.sessions.database_path, "/custom/path/sessions.db");
        assert!(!config.sandbox.isolate_network);
        config.validate().unwrap();

        let timeouts = config.timeouts().unwrap();
        assert_eq!(timeouts.clamp(Some(Duration::from_secs(600))), Duration::from_secs(60));
        assert_eq!(config.store_options().unwrap().sweep_interval, None);
    }

    #[test]
    fn test_config_parse_invalid_toml() {
        let result = Config::from_toml("this is not valid toml {{{");
        assert!(result.is_err());
    }

    #[test]
    fn test_config_parse_missing_section() {
        let without_sandbox = CUSTOM.replace("[sandbox]\nisolate_network = false\n", "");
        assert!(Config::from_toml(&without_sandbox).is_err());
    }

    #[test]
    fn test_config_parse_wrong_type() {
        let wrong = CUSTOM.replace("max_timeout_secs = 60", "max_timeout_secs = \"sixty\"");
        assert!(Config::from_toml(&wrong).is_err());
    }

    #[test]
    fn test_forbidden_module_fails_validation() {
        let mut config = Config::default();
        config.python.allowed_modules.push("subprocess".to_string());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Policy(PolicyError::Forbidden(_)))
        ));
    }

    #[test]
    fn test_bad_timeouts_fail_validation() {
        let mut config = Config::default();
        config.limits.default_timeout_secs = 500;
        assert!(matches!(config.validate(), Err(ConfigError::Limits(_))));

        let mut config = Config::default();
        config.limits.min_timeout_secs = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Limits(_))));
    }

    #[test]
    fn test_bad_caps_fail_validation() {
        let mut config = Config::default();
        config.limits.variable_byte_cap = 64 * 1024 * 1024;
        assert!(matches!(config.validate(), Err(ConfigError::Limits(_))));
    }

    #[test]
    fn test_bad_retention_fails_validation() {
        let mut config = Config::default();
        config.sessions.delete_after_hours = 12;
        assert!(matches!(config.validate(), Err(ConfigError::Sessions(_))));

        config.sessions.delete_after_hours = u64::MAX;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Sessions(RetentionError::OutOfRange(_)))
        ));
    }

    #[test]
    fn test_load_from_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("config.toml");
        assert_eq!(Config::load_from(&missing), Config::default());

        std::fs::write(&missing, "not toml {{{").unwrap();
        assert_eq!(Config::load_from(&missing), Config::default());

        std::fs::write(&missing, CUSTOM).unwrap();
        assert_eq!(Config::load_from(&missing).limits.memory_limit_mb, 512);
    }
}
