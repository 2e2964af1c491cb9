//! Configuration shared across the switchyard crates.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::intent::IntentConfig;
use crate::orchestrator::SessionConfig;
use crate::planner::PlannerConfig;
use crate::providers::{GuardrailConfig, RouterConfig};
use crate::resilience::{BreakerConfig, RateLimitConfig, RetryPolicy};

/// Environment variable naming the configuration file (without or with `.toml`).
pub const CONFIG_ENV: &str = "SWITCHYARD_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "config/switchyard";

/// Global configuration. Every section falls back to documented defaults so an empty
/// file (or no file at all) yields a working setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Deployment identity used in logs.
    pub app_name: String,
    /// Base directory for the sled database.
    pub storage_path: String,

    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub guardrails: GuardrailConfig,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub session: SessionConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            app_name: "Switchyard".to_string(),
            storage_path: "./data".to_string(),
            breaker: BreakerConfig::default(),
            retry: RetryPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            router: RouterConfig::default(),
            guardrails: GuardrailConfig::default(),
            planner: PlannerConfig::default(),
            intent: IntentConfig::default(),
            session: SessionConfig::default(),
        }
    }
}

impl CoreConfig {
    /// Load config from file and environment. Precedence: env `SWITCHYARD__*` overrides >
    /// file named by `SWITCHYARD_CONFIG` (or `config/switchyard.toml`) > defaults.
    pub fn load() -> Result<Self, config::ConfigError> {
        let config_path =
            std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let builder = config::Config::builder()
            .set_default("app_name", "Switchyard")?
            .set_default("storage_path", "./data")?;

        let path = Path::new(&config_path);
        let with_ext = path.with_extension("toml");
        let builder = if path.is_file() {
            builder.add_source(config::File::from(path))
        } else if with_ext.is_file() {
            builder.add_source(config::File::from(with_ext.as_path()))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("SWITCHYARD").separator("__"))
            .build()?;

        let config: Self = built.try_deserialize()?;
        config.check()?;
        Ok(config)
    }

    /// Rejects settings the components would read inconsistently. The intent router
    /// and the planner must agree on what counts as a confident classification.
    pub fn check(&self) -> Result<(), config::ConfigError> {
        let routed = self.intent.confidence_threshold;
        let planned = self.planner.confidence_threshold;
        if (routed - planned).abs() > f64::EPSILON {
            return Err(config::ConfigError::Message(format!(
                "intent.confidence_threshold ({routed}) and planner.confidence_threshold ({planned}) must match"
            )));
        }
        Ok(())
    }

    /// Sets the confidence threshold used by both the intent router and the planner.
    pub fn with_confidence_threshold(mut self, threshold: f64) -> Self {
        self.intent.confidence_threshold = threshold;
        self.planner.confidence_threshold = threshold;
        self
    }

    /// Parses a TOML document on top of the defaults (used by tests and embedders).
    pub fn from_toml_str(toml: &str) -> Result<Self, config::ConfigError> {
        let config: Self = config::Config::builder()
            .set_default("app_name", "Switchyard")?
            .set_default("storage_path", "./data")?
            .add_source(config::File::from_str(toml, config::FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.check()?;
        Ok(config)
    }
}
