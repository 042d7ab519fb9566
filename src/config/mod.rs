use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::resilience::{BreakerConfig, RateLimitConfig, RetryPolicy};
use crate::workflow::WorkflowConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Business Engine connection settings
    pub engine: EngineConfig,

    /// Retry behavior for engine requests
    pub retry: RetryPolicy,

    /// Circuit breaker thresholds
    pub circuit_breaker: BreakerConfig,

    /// Local request rate limit
    pub rate_limit: RateLimitConfig,

    /// Poll loop timing
    pub workflow: WorkflowConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Base URL of the Business Engine
    pub base_url: String,

    /// Shared secret for signing user credentials
    pub shared_secret: String,

    /// User identity carried in credentials and headers
    pub user_id: String,

    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,

    /// Health probe interval in seconds
    pub health_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            base_url: "https://engine.pluct.app".to_string(),
            shared_secret: String::new(),
            user_id: String::new(),
            request_timeout_secs: 30,
            health_interval_secs: 30,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            retry: RetryPolicy::default(),
            circuit_breaker: BreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            workflow: WorkflowConfig::default(),
        }
    }
}

/// The subset of [`Config`] the HTTP client needs, with durations resolved.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub base_url: String,
    pub shared_secret: String,
    pub user_id: String,
    pub request_timeout: Duration,
}

impl Config {
    /// Load configuration from file or create default
    pub async fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if config_path.exists() {
            let content = fs_err::read_to_string(&config_path)
                .context("Failed to read config file")?;

            let config: Config = serde_yaml::from_str(&content)
                .context("Failed to parse config file")?;

            config.validate()?;
            Ok(config)
        } else {
            let config = Self::default();
            config.save().await?;
            Ok(config)
        }
    }

    /// Save configuration to file
    pub async fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs_err::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(self)
            .context("Failed to serialize config")?;

        fs_err::write(&config_path, content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Get configuration file path
    fn config_path() -> Result<PathBuf> {
        // First try current directory for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(local_config);
        }

        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?;

        Ok(config_dir.join("pluct").join("config.yaml"))
    }

    /// Where the vended service token is persisted across runs
    pub fn token_store_path() -> Result<PathBuf> {
        let data_dir = dirs::data_dir()
            .context("Could not determine data directory")?;
        Ok(data_dir.join("pluct").join("service_token.json"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.engine.base_url.is_empty() {
            anyhow::bail!("Engine base URL must be configured");
        }
        if self.engine.shared_secret.is_empty() {
            anyhow::bail!("Engine shared secret must be configured (engine.shared_secret)");
        }
        if self.engine.user_id.is_empty() {
            anyhow::bail!("User id must be configured (engine.user_id)");
        }
        if self.retry.max_attempts == 0 {
            anyhow::bail!("retry.max_attempts must be at least 1");
        }
        if self.workflow.max_poll_attempts == 0 {
            anyhow::bail!("workflow.max_poll_attempts must be at least 1");
        }
        Ok(())
    }

    /// Display current configuration
    pub fn display(&self) {
        println!("Current Configuration:");
        println!("  Engine URL: {}", self.engine.base_url);
        println!("  User Id: {}", self.engine.user_id);
        println!(
            "  Shared Secret: {}",
            if self.engine.shared_secret.is_empty() { "(unset)" } else { "(set)" }
        );
        println!("  Request Timeout: {}s", self.engine.request_timeout_secs);
        println!("  Retry Attempts: {}", self.retry.max_attempts);
        println!(
            "  Rate Limit: {} requests / {}s",
            self.rate_limit.max_requests, self.rate_limit.window_secs
        );
        println!(
            "  Polling: every {}s, up to {} attempts",
            self.workflow.poll_interval_secs, self.workflow.max_poll_attempts
        );
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            base_url: self.engine.base_url.clone(),
            shared_secret: self.engine.shared_secret.clone(),
            user_id: self.engine.user_id.clone(),
            request_timeout: Duration::from_secs(self.engine.request_timeout_secs),
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.engine.health_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configured() -> Config {
        let mut config = Config::default();
        config.engine.shared_secret = "secret".to_string();
        config.engine.user_id = "user-1".to_string();
        config
    }

    #[test]
    fn default_config_round_trips_through_yaml() {
        let config = configured();
        let yaml = serde_yaml::to_string(&config).expect("serialize");
        let parsed: Config = serde_yaml::from_str(&yaml).expect("parse");
        assert_eq!(parsed.engine.base_url, config.engine.base_url);
        assert_eq!(parsed.retry.max_attempts, config.retry.max_attempts);
        assert_eq!(parsed.rate_limit.max_requests, config.rate_limit.max_requests);
    }

    #[test]
    fn partial_yaml_fills_in_defaults() {
        let yaml = r#"
engine:
  base_url: "https://engine.example.com"
  shared_secret: "s"
  user_id: "u"
retry:
  max_attempts: 5
"#;
        let config: Config = serde_yaml::from_str(yaml).expect("parse");
        assert_eq!(config.engine.base_url, "https://engine.example.com");
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.workflow.poll_interval_secs, 3);
        config.validate().expect("valid");
    }

    #[test]
    fn validation_rejects_missing_secret() {
        let mut config = configured();
        config.engine.shared_secret.clear();
        assert!(config.validate().is_err());
    }
}
