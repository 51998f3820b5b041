//! Experiment configuration file.
//!
//! ```yaml
//! name: snap-pilot
//! design:
//!   models: [openai/gpt-4o-mini]
//!   items: { moral: [M01, M02] }
//!   paraphrases: [P1]
//!   system_prompts: [NEU]
//!   temperatures: [0.0]
//!   contexts: { moral: [C0] }
//!   runs: 3
//! settings:
//!   concurrency: 5
//!   requests_per_minute: 60
//! cache:
//!   dir: data/cache
//! pricing:
//!   model_tiers: { openai/gpt-4o-mini: budget }
//!   tier_costs: { budget: 0.00015 }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::{DEFAULT_TTL_DAYS, MAX_TTL_DAYS};
use crate::checkpoint::CheckpointPolicy;
use crate::condition::ExperimentDesign;
use crate::errors::{SnapError, SnapResult};
use crate::estimate::PricingConfig;
use crate::executor::RetryPolicy;
use crate::providers::llm::OpenRouterConfig;
use crate::rate_limit::AdaptiveConfig;

fn default_concurrency() -> usize {
    5
}

fn default_requests_per_minute() -> f64 {
    60.0
}

fn default_burst() -> u32 {
    5
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_attempts() -> u32 {
    RetryPolicy::default().max_attempts
}

fn default_base_delay_ms() -> u64 {
    RetryPolicy::default().base_delay_ms
}

fn default_max_delay_ms() -> u64 {
    RetryPolicy::default().max_delay_ms
}

fn default_jitter() -> f64 {
    RetryPolicy::default().jitter
}

fn default_max_tokens() -> u32 {
    150
}

fn default_checkpoint_every() -> usize {
    10
}

fn default_checkpoint_interval_secs() -> u64 {
    60
}

fn default_true() -> bool {
    true
}

fn default_cache_dir() -> Option<PathBuf> {
    Some(PathBuf::from("data/cache"))
}

fn default_ttl_days() -> i64 {
    DEFAULT_TTL_DAYS
}

/// Execution knobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Worker tasks. Independent of the rate limit.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: f64,
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default)]
    pub adaptive_rate_limit: bool,
    /// Per-call timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_checkpoint_every")]
    pub checkpoint_every: usize,
    #[serde(default = "default_checkpoint_interval_secs")]
    pub checkpoint_interval_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            requests_per_minute: default_requests_per_minute(),
            burst: default_burst(),
            adaptive_rate_limit: false,
            timeout_secs: default_timeout_secs(),
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_tokens: default_max_tokens(),
            checkpoint_every: default_checkpoint_every(),
            checkpoint_interval_secs: default_checkpoint_interval_secs(),
        }
    }
}

impl Settings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            base_delay_ms: self.base_delay_ms,
            max_delay_ms: self.max_delay_ms,
            jitter: self.jitter,
        }
    }

    pub fn checkpoint_policy(&self) -> CheckpointPolicy {
        CheckpointPolicy {
            every_n: self.checkpoint_every,
            interval: Duration::from_secs(self.checkpoint_interval_secs),
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Adaptive limiter tuning, when enabled.
    pub fn adaptive(&self) -> Option<AdaptiveConfig> {
        self.adaptive_rate_limit.then(AdaptiveConfig::default)
    }
}

/// Response cache section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Persistent directory; `null` keeps the cache in memory only.
    #[serde(default = "default_cache_dir")]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_ttl_days")]
    pub ttl_days: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dir: default_cache_dir(),
            ttl_days: default_ttl_days(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::days(self.ttl_days.clamp(1, MAX_TTL_DAYS))
    }
}

/// Endpoint section. The API key only ever comes from the environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    pub name: String,
    pub design: ExperimentDesign,
    #[serde(default)]
    pub settings: Settings,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub pricing: PricingConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
}

impl ExperimentConfig {
    /// Read, apply environment overrides, and validate.
    pub fn load(path: &Path) -> SnapResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            SnapError::config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_yaml(&content)
            .map_err(|e| SnapError::config(format!("{}: {}", path.display(), e)))?
            .apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse without validating.
    pub fn from_yaml(content: &str) -> SnapResult<Self> {
        serde_yaml::from_str(content).map_err(|e| SnapError::config(e.to_string()))
    }

    /// Apply overrides from the process environment.
    ///
    /// | Variable | Description |
    /// |----------|-------------|
    /// | `SNAP_CONCURRENCY` | Worker count |
    /// | `SNAP_REQUESTS_PER_MINUTE` | Rate ceiling |
    /// | `SNAP_BASE_URL` | Endpoint base URL |
    pub fn apply_env(self) -> Self {
        self.apply_env_from(|name| std::env::var(name).ok())
    }

    /// Apply overrides from `lookup`. Unparseable values are ignored.
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = lookup("SNAP_CONCURRENCY").and_then(|v| v.parse().ok()) {
            self.settings.concurrency = n;
        }
        if let Some(rpm) = lookup("SNAP_REQUESTS_PER_MINUTE").and_then(|v| v.parse().ok()) {
            self.settings.requests_per_minute = rpm;
        }
        if let Some(url) = lookup("SNAP_BASE_URL").filter(|v| !v.trim().is_empty()) {
            self.provider.base_url = Some(url);
        }
        self
    }

    pub fn validate(&self) -> SnapResult<()> {
        if self.name.trim().is_empty() {
            return Err(SnapError::config("name must not be empty"));
        }
        self.design.validate()?;

        let s = &self.settings;
        if s.concurrency == 0 {
            return Err(SnapError::config("settings.concurrency must be at least 1"));
        }
        if !(s.requests_per_minute.is_finite() && s.requests_per_minute > 0.0) {
            return Err(SnapError::config(
                "settings.requests_per_minute must be positive",
            ));
        }
        if s.burst == 0 {
            return Err(SnapError::config("settings.burst must be at least 1"));
        }
        if s.timeout_secs == 0 {
            return Err(SnapError::config("settings.timeout_secs must be at least 1"));
        }
        s.retry_policy().validate()?;

        if !(1..=MAX_TTL_DAYS).contains(&self.cache.ttl_days) {
            return Err(SnapError::config(format!(
                "cache.ttl_days must be between 1 and {MAX_TTL_DAYS}, got {}",
                self.cache.ttl_days
            )));
        }
        if let Some((tier, cost)) = self
            .pricing
            .tier_costs
            .iter()
            .find(|(_, c)| !(c.is_finite() && **c >= 0.0))
        {
            return Err(SnapError::config(format!(
                "pricing.tier_costs.{tier} is invalid: {cost}"
            )));
        }
        Ok(())
    }

    /// Transport settings: config file values, then `SNAP_API_KEY` /
    /// `OPENROUTER_API_KEY` from the environment.
    pub fn transport_config(&self) -> OpenRouterConfig {
        let mut config = OpenRouterConfig::from_env().with_max_tokens(self.settings.max_tokens);
        if let Some(url) = &self.provider.base_url {
            config = config.with_base_url(url.clone());
        }
        config.timeout_secs = self.settings.timeout_secs;
        config
    }

    /// Snapshot stored in checkpoints. Carries no secrets.
    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const MINIMAL: &str = r#"
name: snap-test
design:
  models: [model-a]
  items: { moral: [M01] }
  paraphrases: [P1]
  system_prompts: [NEU]
  temperatures: [0.0]
  contexts: { moral: [C0] }
  runs: 2
"#;

    #[test]
    fn minimal_config_gets_defaults() {
        let config = ExperimentConfig::from_yaml(MINIMAL).unwrap();
        config.validate().unwrap();
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.settings.concurrency, 5);
        assert!(config.cache.enabled);
        assert_eq!(config.cache.dir, Some(PathBuf::from("data/cache")));
        assert_eq!(config.pricing.tokens_per_call, 300);
        assert_eq!(config.settings.retry_policy(), RetryPolicy::default());
        assert_eq!(config.settings.checkpoint_policy(), CheckpointPolicy::default());
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let yaml = format!("{MINIMAL}\nextra: 1\n");
        let err = ExperimentConfig::from_yaml(&yaml).unwrap_err();
        assert!(matches!(err, SnapError::Config { .. }));

        let yaml = format!("{MINIMAL}\nsettings:\n  concurrancy: 3\n");
        assert!(ExperimentConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("SNAP_CONCURRENCY", "12"),
            ("SNAP_REQUESTS_PER_MINUTE", "300"),
            ("SNAP_BASE_URL", "http://localhost:9999/v1"),
        ]);
        let config = ExperimentConfig::from_yaml(MINIMAL)
            .unwrap()
            .apply_env_from(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.settings.concurrency, 12);
        assert_eq!(config.settings.requests_per_minute, 300.0);
        assert_eq!(
            config.provider.base_url.as_deref(),
            Some("http://localhost:9999/v1")
        );
    }

    #[test]
    fn unparseable_env_values_are_ignored() {
        let config = ExperimentConfig::from_yaml(MINIMAL)
            .unwrap()
            .apply_env_from(|k| (k == "SNAP_CONCURRENCY").then(|| "many".to_string()));
        assert_eq!(config.settings.concurrency, 5);
    }

    #[test]
    fn invalid_settings_fail_validation() {
        let mut config = ExperimentConfig::from_yaml(MINIMAL).unwrap();
        config.settings.concurrency = 0;
        assert_eq!(config.validate().unwrap_err().exit_code(), 2);

        let mut config = ExperimentConfig::from_yaml(MINIMAL).unwrap();
        config.settings.jitter = 1.5;
        assert!(config.validate().is_err());

        let mut config = ExperimentConfig::from_yaml(MINIMAL).unwrap();
        config.cache.ttl_days = 100_000_000;
        assert_eq!(config.validate().unwrap_err().exit_code(), 2);
        assert_eq!(config.cache.ttl(), chrono::Duration::days(MAX_TTL_DAYS));

        let mut config = ExperimentConfig::from_yaml(MINIMAL).unwrap();
        config.design.runs = 0;
        assert!(matches!(
            config.validate().unwrap_err(),
            SnapError::InvalidDesign { .. }
        ));
    }

    #[test]
    fn load_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("snap.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        let config = ExperimentConfig::load(&path).unwrap();
        assert_eq!(config.name, "snap-test");
        assert_eq!(config.design.runs, 2);

        let err = ExperimentConfig::load(&dir.path().join("missing.yaml")).unwrap_err();
        assert!(err.to_string().contains("missing.yaml"));
    }

    #[test]
    fn snapshot_has_no_api_key() {
        let config = ExperimentConfig::from_yaml(MINIMAL).unwrap();
        let value = config.to_value();
        assert_eq!(value["name"], "snap-test");
        assert!(!value.to_string().contains("api_key"));
    }
}
