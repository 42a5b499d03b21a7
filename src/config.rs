//! Configuration for the worker and the gateway.
//!
//! Loads configuration from a TOML file with `${VAR}` environment
//! substitution, then applies a small set of environment overrides.
//!
//! # Example
//!
//! ```toml
//! [redis]
//! url = "${REDIS_URL}"
//!
//! [consumer]
//! tenant_id = "4f1c2a9e-8b7d-4e6f-a5c3-1d2e3f4a5b6c"
//! batch_size = 10
//!
//! [breaker.store]
//! failure_threshold = 3
//!
//! [[streams]]
//! key = "crm:sync:user:user_created"
//! stream_type = "user-events"
//! ```

use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::breaker::CircuitBreakerConfig;
use crate::coordinator::CoordinatorSettings;
use crate::engine::{EngineConfig, ReconnectPolicy};
use crate::ledger::{DEFAULT_LEDGER_PREFIX, DEFAULT_LEDGER_TTL};
use crate::streams::{StreamDefinition, StreamTable};

/// Default config file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/crm-sync.toml";

static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
});

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),
}

/// Root configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct CrmSyncConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub redis: RedisConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    #[serde(default)]
    pub reconnect: ReconnectConfig,

    #[serde(default)]
    pub breaker: BreakersConfig,

    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Stream table; empty means the built-in CRM streams.
    #[serde(default)]
    pub streams: Vec<StreamDefinition>,
}

/// Gateway configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            api_key: None,
        }
    }
}

fn default_port() -> u16 {
    3000
}

/// Redis configuration
#[derive(Debug, Deserialize, Clone)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

/// Stream consumer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConsumerConfig {
    /// Tenant served by this worker; required to run the engine
    #[serde(default)]
    pub tenant_id: String,

    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default = "default_app_name")]
    pub base_group: String,

    /// Falls back to the hostname when unset
    #[serde(default)]
    pub instance_id: Option<String>,

    /// Position new groups start reading from
    #[serde(default = "default_start_id")]
    pub start_id: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_block_ms")]
    pub block_ms: u64,

    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,

    #[serde(default = "default_claim_idle_ms")]
    pub claim_idle_ms: u64,

    #[serde(default = "default_true")]
    pub validate: bool,

    #[serde(default = "default_grace_period_ms")]
    pub grace_period_ms: u64,

    #[serde(default = "default_ledger_prefix")]
    pub ledger_prefix: String,

    #[serde(default = "default_ledger_ttl_secs")]
    pub ledger_ttl_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            app_name: default_app_name(),
            base_group: default_app_name(),
            instance_id: None,
            start_id: default_start_id(),
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
            claim_idle_ms: default_claim_idle_ms(),
            validate: true,
            grace_period_ms: default_grace_period_ms(),
            ledger_prefix: default_ledger_prefix(),
            ledger_ttl_secs: default_ledger_ttl_secs(),
        }
    }
}

fn default_app_name() -> String {
    "crm-sync".to_string()
}

fn default_start_id() -> String {
    "0".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_block_ms() -> u64 {
    2000
}

fn default_idle_sleep_ms() -> u64 {
    1000
}

fn default_claim_idle_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

fn default_grace_period_ms() -> u64 {
    5000
}

fn default_ledger_prefix() -> String {
    DEFAULT_LEDGER_PREFIX.to_string()
}

fn default_ledger_ttl_secs() -> u64 {
    DEFAULT_LEDGER_TTL.as_secs()
}

/// Initial connection backoff
#[derive(Debug, Deserialize, Clone)]
pub struct ReconnectConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    30_000
}

/// One breaker guards broker calls, the other handler/store calls.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct BreakersConfig {
    #[serde(default)]
    pub broker: CircuitBreakerConfig,

    #[serde(default)]
    pub store: CircuitBreakerConfig,
}

/// Periodic health checks, trimming and idle consumer cleanup
#[derive(Debug, Deserialize, Clone)]
pub struct MaintenanceConfig {
    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,

    #[serde(default = "default_trim_interval_secs")]
    pub trim_interval_secs: u64,

    #[serde(default = "default_trim_max_len")]
    pub trim_max_len: usize,

    #[serde(default = "default_idle_consumer_threshold_secs")]
    pub idle_consumer_threshold_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            health_interval_secs: default_health_interval_secs(),
            trim_interval_secs: default_trim_interval_secs(),
            trim_max_len: default_trim_max_len(),
            idle_consumer_threshold_secs: default_idle_consumer_threshold_secs(),
        }
    }
}

fn default_health_interval_secs() -> u64 {
    30
}

fn default_trim_interval_secs() -> u64 {
    24 * 60 * 60
}

fn default_trim_max_len() -> usize {
    100_000
}

fn default_idle_consumer_threshold_secs() -> u64 {
    2 * 60 * 60
}

/// Gateway-side publishing
#[derive(Debug, Deserialize, Clone)]
pub struct PublisherConfig {
    #[serde(default = "default_source_app")]
    pub source_app: String,

    /// Approximate cap applied on every append; unset means uncapped
    #[serde(default)]
    pub max_len: Option<usize>,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            source_app: default_source_app(),
            max_len: None,
        }
    }
}

fn default_source_app() -> String {
    "crm".to_string()
}

impl CrmSyncConfig {
    /// Load configuration from the default path or CRM_SYNC_CONFIG env var.
    pub fn load() -> Result<Self, ConfigError> {
        let config_path =
            env::var("CRM_SYNC_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());

        let mut config = Self::load_from(&config_path)?;
        config.apply_overrides(|name| env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific path, without environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::parse(&content)?;

        info!(
            streams = config.streams.len(),
            tenant_id = %config.consumer.tenant_id,
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse TOML text after `${VAR}` substitution.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);
        debug!("Parsing TOML configuration");
        let config: CrmSyncConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides. `lookup` returns the value of a variable.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("REDIS_URL") {
            self.redis.url = url;
        }
        if let Some(tenant) = lookup("CRM_SYNC_TENANT_ID") {
            self.consumer.tenant_id = tenant;
        }
        if let Some(instance) = lookup("CRM_SYNC_INSTANCE_ID") {
            self.consumer.instance_id = Some(instance);
        }
        if let Some(key) = lookup("CRM_SYNC_API_KEY") {
            self.server.api_key = Some(key);
        }
        if let Some(port) = lookup("PORT") {
            match port.parse() {
                Ok(port) => self.server.port = port,
                Err(_) => warn!(value = %port, "Ignoring invalid PORT"),
            }
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
            return Err(ConfigError::ValidationError(
                "redis.url must start with redis:// or rediss://".to_string(),
            ));
        }

        if self.consumer.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "consumer.batch_size must be at least 1".to_string(),
            ));
        }

        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::ValidationError(
                "reconnect.max_attempts must be at least 1".to_string(),
            ));
        }

        for (name, breaker) in [("broker", &self.breaker.broker), ("store", &self.breaker.store)] {
            if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
                return Err(ConfigError::ValidationError(format!(
                    "breaker.{} thresholds must be at least 1",
                    name
                )));
            }
        }

        let mut seen = HashSet::new();
        for stream in &self.streams {
            if stream.key.is_empty() || stream.stream_type.is_empty() {
                return Err(ConfigError::ValidationError(
                    "streams entries need a key and a stream_type".to_string(),
                ));
            }
            if !seen.insert(stream.key.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "stream '{}' is listed twice",
                    stream.key
                )));
            }
        }

        if let Some(key) = &self.server.api_key {
            if key.contains("${") {
                warn!("server.api_key contains unsubstituted environment variable");
            }
        }

        Ok(())
    }

    /// The configured stream table, or the built-in one.
    pub fn stream_table(&self) -> StreamTable {
        if self.streams.is_empty() {
            StreamTable::standard()
        } else {
            StreamTable::new(self.streams.clone())
        }
    }

    /// `default_instance` is used when no instance ID is configured.
    pub fn coordinator_settings(&self, default_instance: &str) -> CoordinatorSettings {
        CoordinatorSettings {
            base_group: self.consumer.base_group.clone(),
            app_name: self.consumer.app_name.clone(),
            instance_id: self
                .consumer
                .instance_id
                .clone()
                .unwrap_or_else(|| default_instance.to_string()),
            start_id: self.consumer.start_id.clone(),
        }
    }

    /// Engine settings. Fails when no tenant is configured.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        if self.consumer.tenant_id.trim().is_empty() {
            return Err(ConfigError::MissingField("consumer.tenant_id".to_string()));
        }

        let c = &self.consumer;
        let m = &self.maintenance;
        Ok(EngineConfig {
            tenant_id: c.tenant_id.clone(),
            batch_size: c.batch_size,
            block: Duration::from_millis(c.block_ms),
            idle_sleep: Duration::from_millis(c.idle_sleep_ms),
            claim_idle: Duration::from_millis(c.claim_idle_ms),
            validate: c.validate,
            grace_period: Duration::from_millis(c.grace_period_ms),
            reconnect: ReconnectPolicy {
                max_attempts: self.reconnect.max_attempts,
                initial_delay: Duration::from_millis(self.reconnect.initial_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
            },
            health_interval: Duration::from_secs(m.health_interval_secs),
            maintenance_interval: Duration::from_secs(m.trim_interval_secs),
            trim_max_len: m.trim_max_len,
            idle_consumer_threshold: Duration::from_secs(m.idle_consumer_threshold_secs),
        })
    }

    pub fn ledger_ttl(&self) -> Duration {
        Duration::from_secs(self.consumer.ledger_ttl_secs)
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    ENV_VAR
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("CRM_SYNC_TEST_VAR", "substituted_value");
        let input = "url = \"${CRM_SYNC_TEST_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"substituted_value\"");
        env::remove_var("CRM_SYNC_TEST_VAR");
    }

    #[test]
    fn test_env_var_not_set() {
        let input = "url = \"${NONEXISTENT_VAR}\"";
        let output = substitute_env_vars(input);
        assert_eq!(output, "url = \"${NONEXISTENT_VAR}\"");
    }

    #[test]
    fn test_default_config() {
        let config = CrmSyncConfig::default();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.redis.url, "redis://localhost:6379");
        assert_eq!(config.consumer.base_group, "crm-sync");
        assert_eq!(config.consumer.batch_size, 10);
        assert_eq!(config.breaker.store.failure_threshold, 5);
        assert_eq!(config.stream_table().len(), StreamTable::standard().len());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r#"
            [server]
            port = 4000

            [consumer]
            tenant_id = "4f1c2a9e-8b7d-4e6f-a5c3-1d2e3f4a5b6c"
            instance_id = "pod-1"
            batch_size = 25
            claim_idle_ms = 60000

            [breaker.store]
            failure_threshold = 3
            reset_timeout_ms = 1000

            [maintenance]
            trim_max_len = 5000

            [[streams]]
            key = "crm:sync:user:user_created"
            stream_type = "user-events"

            [[streams]]
            key = "tenant-a:private"
            stream_type = "private-events"
            shared = false
        "#;

        let config = CrmSyncConfig::parse(toml).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.breaker.store.failure_threshold, 3);
        assert_eq!(config.breaker.broker.failure_threshold, 5);

        let table = config.stream_table();
        assert_eq!(table.len(), 2);
        assert!(!table.is_shared("tenant-a:private"));

        let settings = config.coordinator_settings("host-1");
        assert_eq!(settings.instance_id, "pod-1");
        assert_eq!(settings.base_group, "crm-sync");

        let engine = config.engine_config().unwrap();
        assert_eq!(engine.batch_size, 25);
        assert_eq!(engine.claim_idle, Duration::from_secs(60));
        assert_eq!(engine.trim_max_len, 5000);
    }

    #[test]
    fn test_engine_config_requires_tenant() {
        let config = CrmSyncConfig::default();
        assert!(matches!(
            config.engine_config(),
            Err(ConfigError::MissingField(field)) if field == "consumer.tenant_id"
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("REDIS_URL", "redis://cache:6380"),
            ("CRM_SYNC_TENANT_ID", "tenant-x"),
            ("CRM_SYNC_API_KEY", "secret"),
            ("PORT", "8080"),
        ]
        .into_iter()
        .collect();

        let mut config = CrmSyncConfig::default();
        config.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(config.redis.url, "redis://cache:6380");
        assert_eq!(config.consumer.tenant_id, "tenant-x");
        assert_eq!(config.server.api_key.as_deref(), Some("secret"));
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.coordinator_settings("host-1").instance_id, "host-1");
    }

    #[test]
    fn test_invalid_port_override_is_ignored() {
        let mut config = CrmSyncConfig::default();
        config.apply_overrides(|name| (name == "PORT").then(|| "not-a-port".to_string()));
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let bad = [
            "[redis]\nurl = \"http://localhost\"",
            "[consumer]\nbatch_size = 0",
            "[reconnect]\nmax_attempts = 0",
            "[breaker.broker]\nfailure_threshold = 0",
            "[[streams]]\nkey = \"a\"\nstream_type = \"x\"\n[[streams]]\nkey = \"a\"\nstream_type = \"y\"",
        ];
        for toml in bad {
            assert!(
                matches!(CrmSyncConfig::parse(toml), Err(ConfigError::ValidationError(_))),
                "expected validation error for {}",
                toml
            );
        }
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = CrmSyncConfig::load_from("does/not/exist.toml").unwrap();
        assert_eq!(config.server.port, 3000);
    }
}
