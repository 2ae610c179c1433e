use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use cloudbench_core::prelude::{ConfigurationError, WaitConfig, DEFAULT_RESOURCE_NAME_FORMAT};
use serde::{Deserialize, Serialize};

/// Credentials for one cloud identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub username: String,
    #[serde(default)]
    pub password: String,
    pub project: String,
    /// Set for identities created by the task, so they can be cleaned up.
    #[serde(default)]
    pub project_id: Option<String>,
}

/// The cloud the task runs against.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeploymentConfig {
    pub admin: Option<Credential>,
    /// Users that already exist and are used when no `users` context is configured.
    pub users: Vec<Credential>,
}

/// Runner configuration, usually loaded from a TOML file.
///
/// ```toml
/// abort_grace_s = 30.0
/// resource_name_format = "s_cb_XXXXXXXX_XXXXXXXX"
///
/// [wait]
/// timeout_s = 600.0
/// check_interval_s = 1.0
///
/// [deployment.admin]
/// username = "admin"
/// password = "secret"
/// project = "admin"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BenchConfig {
    pub wait: WaitConfig,
    /// How long to wait for in-flight iterations after an abort before giving up on them
    pub abort_grace_s: f64,
    pub resource_name_format: String,
    pub deployment: DeploymentConfig,
}

impl Default for BenchConfig {
    fn default() -> Self {
        Self {
            wait: WaitConfig::default(),
            abort_grace_s: 30.0,
            resource_name_format: DEFAULT_RESOURCE_NAME_FORMAT.to_string(),
            deployment: DeploymentConfig::default(),
        }
    }
}

impl BenchConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: BenchConfig = toml::from_str(&content)
            .map_err(|e| ConfigurationError(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_secs_f64(self.abort_grace_s.max(0.0))
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.wait.timeout_s.is_finite() || self.wait.timeout_s < 0.0 {
            return Err(ConfigurationError(format!(
                "wait.timeout_s must be a non-negative number, got {}",
                self.wait.timeout_s
            )));
        }
        if !self.wait.check_interval_s.is_finite() || self.wait.check_interval_s < 0.0 {
            return Err(ConfigurationError(format!(
                "wait.check_interval_s must be a non-negative number, got {}",
                self.wait.check_interval_s
            )));
        }
        if !self.abort_grace_s.is_finite() || self.abort_grace_s < 0.0 {
            return Err(ConfigurationError(format!(
                "abort_grace_s must be a non-negative number, got {}",
                self.abort_grace_s
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn load_partial_config() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
abort_grace_s = 5.0

[wait]
timeout_s = 120.0

[[deployment.users]]
username = "demo"
project = "demo"
"#
        )
        .unwrap();

        let config = BenchConfig::load(file.path()).unwrap();

        assert_eq!(Duration::from_secs(5), config.abort_grace());
        assert_eq!(120.0, config.wait.timeout_s);
        assert_eq!(1.0, config.wait.check_interval_s);
        assert_eq!(DEFAULT_RESOURCE_NAME_FORMAT, config.resource_name_format);
        assert_eq!("demo", config.deployment.users[0].username);
        assert_eq!(None, config.deployment.admin);
    }

    #[test]
    fn negative_timings_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "abort_grace_s = -1.0").unwrap();

        let err = BenchConfig::load(file.path()).unwrap_err();
        assert!(err.is::<ConfigurationError>());
    }
}
