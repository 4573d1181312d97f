//! Load driver configuration types

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::endpoint::Category;
use crate::error::{LoadTestError, Result};
use crate::generators;
use crate::scheduler::{default_scenarios, StageDefinition};

/// Complete load test configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoadTestConfig {
    /// Target API settings
    #[serde(default)]
    pub target: TargetSettings,

    /// Test account and registration data
    #[serde(default)]
    pub credentials: Credentials,

    /// Session bootstrap retry policy
    #[serde(default)]
    pub session: SessionSettings,

    /// Pause after a rate-limited response, per category
    #[serde(default)]
    pub backoff: BackoffPolicy,

    /// Activation probability overrides keyed by endpoint name
    #[serde(default)]
    pub activation: HashMap<String, f64>,

    /// Nominal per-minute budgets of the target, used for reporting
    #[serde(default)]
    pub budgets: RateBudgets,

    /// Pass/fail criteria evaluated at the end of the run
    #[serde(default)]
    pub thresholds: Thresholds,

    /// Run-wide settings
    #[serde(default)]
    pub run: RunSettings,

    /// Traffic stages
    #[serde(default = "default_scenarios")]
    pub scenarios: Vec<StageDefinition>,
}

impl Default for LoadTestConfig {
    fn default() -> Self {
        Self {
            target: TargetSettings::default(),
            credentials: Credentials::default(),
            session: SessionSettings::default(),
            backoff: BackoffPolicy::default(),
            activation: HashMap::new(),
            budgets: RateBudgets::default(),
            thresholds: Thresholds::default(),
            run: RunSettings::default(),
            scenarios: default_scenarios(),
        }
    }
}

impl LoadTestConfig {
    /// Parse a TOML config file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).map_err(|source| LoadTestError::ConfigRead {
                path: path.display().to_string(),
                source,
            })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Defaults, or the given file when present
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(p) => Self::from_file(p),
            None => Ok(Self::default()),
        }
    }

    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Reject configurations the driver cannot run
    pub fn validate(&self) -> Result<()> {
        let url = self.target.base_url.trim();
        if url.is_empty() {
            return Err(LoadTestError::InvalidConfig("target.base_url is empty".into()));
        }
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Err(LoadTestError::InvalidConfig(format!(
                "target.base_url must be http(s): {}",
                url
            )));
        }
        if self.session.max_attempts == 0 {
            return Err(LoadTestError::InvalidConfig(
                "session.max_attempts must be at least 1".into(),
            ));
        }
        for (name, p) in &self.activation {
            if !(0.0..=1.0).contains(p) {
                return Err(LoadTestError::InvalidConfig(format!(
                    "activation.{} must be within [0, 1]",
                    name
                )));
            }
        }
        for category in Category::ALL {
            let j = self.backoff.for_category(category);
            if !j.is_bounded() {
                return Err(LoadTestError::InvalidConfig(format!(
                    "backoff.{} must be finite, non-negative and at most {}s in total",
                    category, MAX_JITTER_SECS
                )));
            }
        }
        if self.scenarios.is_empty() {
            return Err(LoadTestError::InvalidConfig("no scenarios defined".into()));
        }
        for stage in &self.scenarios {
            stage.validate()?;
        }
        Ok(())
    }

    /// Keep only the named scenarios
    pub fn select_scenarios(&mut self, names: &[String]) -> Result<()> {
        if names.is_empty() {
            return Ok(());
        }
        if let Some(unknown) = names
            .iter()
            .find(|n| !self.scenarios.iter().any(|s| &s.name == *n))
        {
            return Err(LoadTestError::InvalidConfig(format!(
                "unknown scenario '{}'",
                unknown
            )));
        }
        self.scenarios.retain(|s| names.contains(&s.name));
        Ok(())
    }
}

/// Target API settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TargetSettings {
    /// Base URL including the API prefix
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Idle connections kept per host
    #[serde(default = "default_max_idle_per_host")]
    pub max_idle_per_host: usize,
}

fn default_base_url() -> String {
    "http://localhost:8080/api".to_string()
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_max_idle_per_host() -> usize {
    32
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout_secs(),
            max_idle_per_host: default_max_idle_per_host(),
        }
    }
}

impl TargetSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Fixed test account and registration data
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Credentials {
    /// Login phone number of the shared test account
    #[serde(default = "default_number")]
    pub number: String,

    /// Password of the test account, also used for registered users
    #[serde(default = "default_password")]
    pub password: String,

    /// Referral code sent on registration
    #[serde(default = "default_referral_code")]
    pub referral_code: String,
}

fn default_number() -> String {
    "8123456789".to_string()
}

fn default_password() -> String {
    "123456".to_string()
}

fn default_referral_code() -> String {
    "VLAREFF".to_string()
}

impl Credentials {
    /// Body of a login request for the shared test account
    pub fn login_body(&self) -> serde_json::Value {
        serde_json::json!({
            "number": self.number,
            "password": self.password,
        })
    }
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            number: default_number(),
            password: default_password(),
            referral_code: default_referral_code(),
        }
    }
}

/// Session bootstrap retry policy
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Wait after a rate-limited login, seconds
    #[serde(default = "default_rate_limited_wait_secs")]
    pub rate_limited_wait_secs: u64,

    /// Wait after any other failed login, seconds
    #[serde(default = "default_retry_wait_secs")]
    pub retry_wait_secs: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_rate_limited_wait_secs() -> u64 {
    15
}

fn default_retry_wait_secs() -> u64 {
    10
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            rate_limited_wait_secs: default_rate_limited_wait_secs(),
            retry_wait_secs: default_retry_wait_secs(),
        }
    }
}

/// Longest pause a [`Jitter`] may describe
pub const MAX_JITTER_SECS: f64 = 3600.0;

/// Uniform random pause in `[base, base + spread)` seconds
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Jitter {
    pub base_secs: f64,
    pub spread_secs: f64,
}

impl Jitter {
    pub const fn new(base_secs: f64, spread_secs: f64) -> Self {
        Self {
            base_secs,
            spread_secs,
        }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        generators::jitter(rng, self.base_secs, self.spread_secs)
    }

    /// Finite, non-negative, and never longer than [`MAX_JITTER_SECS`]
    pub fn is_bounded(&self) -> bool {
        self.base_secs.is_finite()
            && self.spread_secs.is_finite()
            && self.base_secs >= 0.0
            && self.spread_secs >= 0.0
            && self.base_secs + self.spread_secs <= MAX_JITTER_SECS
    }

    pub fn contains(&self, d: Duration) -> bool {
        let s = d.as_secs_f64();
        s >= self.base_secs && s < self.base_secs + self.spread_secs.max(f64::EPSILON)
    }
}

/// Backoff after rate-limited responses. Costlier categories shed more load.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackoffPolicy {
    #[serde(default = "default_auth_backoff")]
    pub auth: Jitter,
    #[serde(default = "default_read_backoff")]
    pub read: Jitter,
    #[serde(default = "default_write_backoff")]
    pub write: Jitter,
}

fn default_auth_backoff() -> Jitter {
    Jitter::new(2.0, 5.0)
}

fn default_read_backoff() -> Jitter {
    Jitter::new(1.0, 3.0)
}

fn default_write_backoff() -> Jitter {
    Jitter::new(2.0, 4.0)
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            auth: default_auth_backoff(),
            read: default_read_backoff(),
            write: default_write_backoff(),
        }
    }
}

impl BackoffPolicy {
    pub fn for_category(&self, category: Category) -> Jitter {
        match category {
            Category::Auth => self.auth,
            Category::Read => self.read,
            Category::Write => self.write,
        }
    }
}

/// Nominal per-minute limits enforced by the target
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RateBudgets {
    #[serde(default = "default_auth_per_min")]
    pub auth_per_min: u32,
    #[serde(default = "default_read_per_min")]
    pub read_per_min: u32,
    #[serde(default = "default_write_per_min")]
    pub write_per_min: u32,
}

fn default_auth_per_min() -> u32 {
    10
}

fn default_read_per_min() -> u32 {
    120
}

fn default_write_per_min() -> u32 {
    60
}

impl Default for RateBudgets {
    fn default() -> Self {
        Self {
            auth_per_min: default_auth_per_min(),
            read_per_min: default_read_per_min(),
            write_per_min: default_write_per_min(),
        }
    }
}

impl RateBudgets {
    pub fn for_category(&self, category: Category) -> u32 {
        match category {
            Category::Auth => self.auth_per_min,
            Category::Read => self.read_per_min,
            Category::Write => self.write_per_min,
        }
    }
}

/// End-of-run pass/fail criteria
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Thresholds {
    #[serde(default = "default_http_req_duration_p95_ms")]
    pub http_req_duration_p95_ms: f64,
    #[serde(default = "default_http_req_failed_rate")]
    pub http_req_failed_rate: f64,
    #[serde(default = "default_rate_limit_errors_rate")]
    pub rate_limit_errors_rate: f64,
    #[serde(default = "default_login_duration_p95_ms")]
    pub login_duration_p95_ms: f64,
    #[serde(default = "default_register_duration_p95_ms")]
    pub register_duration_p95_ms: f64,
}

fn default_http_req_duration_p95_ms() -> f64 {
    2000.0
}

fn default_http_req_failed_rate() -> f64 {
    0.3
}

fn default_rate_limit_errors_rate() -> f64 {
    0.5
}

fn default_login_duration_p95_ms() -> f64 {
    800.0
}

fn default_register_duration_p95_ms() -> f64 {
    1000.0
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            http_req_duration_p95_ms: default_http_req_duration_p95_ms(),
            http_req_failed_rate: default_http_req_failed_rate(),
            rate_limit_errors_rate: default_rate_limit_errors_rate(),
            login_duration_p95_ms: default_login_duration_p95_ms(),
            register_duration_p95_ms: default_register_duration_p95_ms(),
        }
    }
}

/// Run-wide settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunSettings {
    /// Seed for every virtual user's random source; random when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// JSON summary artifact
    #[serde(default = "default_artifact_path")]
    pub artifact_path: String,

    /// Prometheus text dump of the final metrics
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prometheus_path: Option<String>,
}

fn default_artifact_path() -> String {
    "rate-limit-analysis.json".to_string()
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            seed: None,
            artifact_path: default_artifact_path(),
            prometheus_path: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = LoadTestConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.scenarios.len(), 3);
        assert_eq!(config.session.max_attempts, 3);
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = LoadTestConfig::from_toml(
            r#"
            [target]
            base_url = "https://staging.example.com/api"

            [credentials]
            referral_code = "STAGING"

            [activation]
            products = 0.9
            "#,
        )
        .unwrap();

        assert_eq!(config.target.base_url, "https://staging.example.com/api");
        assert_eq!(config.target.request_timeout_secs, 60);
        assert_eq!(config.credentials.referral_code, "STAGING");
        assert_eq!(config.credentials.number, "8123456789");
        assert_eq!(config.activation["products"], 0.9);
        assert_eq!(config.scenarios.len(), 3);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut config = LoadTestConfig::default();
        config.run.seed = Some(42);
        let text = config.to_toml().unwrap();
        assert_eq!(LoadTestConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[run]\nseed = 9").unwrap();

        let config = LoadTestConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.run.seed, Some(9));
    }

    #[test]
    fn test_missing_file_is_error() {
        let err = LoadTestConfig::load(Some(Path::new("/nonexistent/surge.toml"))).unwrap_err();
        assert!(err.is_config_error());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let mut config = LoadTestConfig::default();
        config.target.base_url = "localhost:8080".into();
        assert!(config.validate().is_err());

        let mut config = LoadTestConfig::default();
        config.activation.insert("products".into(), 1.5);
        assert!(config.validate().is_err());

        let mut config = LoadTestConfig::default();
        config.scenarios.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_select_scenarios() {
        let mut config = LoadTestConfig::default();
        config.select_scenarios(&["smoke".to_string()]).unwrap();
        assert_eq!(config.scenarios.len(), 1);

        let mut config = LoadTestConfig::default();
        assert!(config.select_scenarios(&["soak".to_string()]).is_err());
    }

    #[test]
    fn test_unbounded_backoff_is_rejected() {
        let config = LoadTestConfig::from_toml(
            "[backoff.read]\nbase_secs = inf\nspread_secs = 1.0\n",
        )
        .unwrap();
        assert!(config.validate().unwrap_err().is_config_error());

        let config = LoadTestConfig::from_toml(
            "[backoff.write]\nbase_secs = 1e300\nspread_secs = 0.0\n",
        )
        .unwrap();
        assert!(config.validate().is_err());

        let config = LoadTestConfig::from_toml(
            "[backoff.auth]\nbase_secs = 1.0\nspread_secs = nan\n",
        )
        .unwrap();
        assert!(config.validate().is_err());

        assert!(Jitter::new(3000.0, 600.0).is_bounded());
        assert!(!Jitter::new(3000.0, 601.0).is_bounded());
    }

    #[test]
    fn test_backoff_windows() {
        let policy = BackoffPolicy::default();
        assert!(policy.write.contains(Duration::from_secs_f64(2.0)));
        assert!(policy.write.contains(Duration::from_secs_f64(5.99)));
        assert!(!policy.write.contains(Duration::from_secs_f64(6.0)));
        assert!(policy.auth.contains(Duration::from_secs_f64(6.5)));
    }
}
