//! Configuration management for Bouncer.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::SocketAddr;

use crate::error::{BouncerError, Result};
use crate::ratelimit::RuleConfig;

/// Main configuration for the Bouncer service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BouncerConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Log output configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Client identification
    #[serde(default)]
    pub client: ClientConfig,

    /// CPU load sampling
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Load-aware budget scaling
    #[serde(default)]
    pub adaptive: AdaptiveConfig,

    /// Repeat offender bans
    #[serde(default)]
    pub offenders: OffenderConfig,

    /// Shared (Redis) counter backend
    #[serde(default)]
    pub shared_store: SharedStoreConfig,

    /// Per-rule overrides, merged onto the built-in rules by name
    #[serde(default)]
    pub rules: BTreeMap<String, RuleConfig>,

    /// Which rules guard which routes
    #[serde(default)]
    pub chain: ChainConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// How often stale counters and expired bans are swept, in seconds
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            maintenance_interval_secs: default_maintenance_interval(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 3000))
}

fn default_maintenance_interval() -> u64 {
    60
}

/// Log output configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Client identification settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Prefer the left-most `X-Forwarded-For` hop over the peer address
    #[serde(default)]
    pub trust_proxy: bool,

    /// Prefix length IPv6 clients are grouped under
    #[serde(default = "default_ipv6_prefix_len")]
    pub ipv6_prefix_len: u8,

    /// Proxy headers appended to client keys, in this order
    #[serde(default = "default_proxy_headers")]
    pub proxy_headers: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            trust_proxy: false,
            ipv6_prefix_len: default_ipv6_prefix_len(),
            proxy_headers: default_proxy_headers(),
        }
    }
}

fn default_ipv6_prefix_len() -> u8 {
    56
}

fn default_proxy_headers() -> Vec<String> {
    vec![
        "x-forwarded-for".to_string(),
        "x-real-ip".to_string(),
        "cf-connecting-ip".to_string(),
    ]
}

/// CPU load sampling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Minimum time between two CPU samples, in milliseconds
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    /// Number of samples kept for smoothing
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval(),
            history_capacity: default_history_capacity(),
        }
    }
}

fn default_sample_interval() -> u64 {
    5000
}

fn default_history_capacity() -> usize {
    10
}

/// Load-aware budget scaling settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdaptiveConfig {
    /// Load above which budgets are cut hardest
    #[serde(default = "default_load_threshold")]
    pub load_threshold: f64,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            load_threshold: default_load_threshold(),
        }
    }
}

fn default_load_threshold() -> f64 {
    0.8
}

/// Repeat offender ban settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OffenderConfig {
    /// Rejections that turn into a ban
    #[serde(default = "default_violation_threshold")]
    pub violation_threshold: u32,

    /// How long a ban lasts, in milliseconds
    #[serde(default = "default_ban_duration")]
    pub ban_duration_ms: u64,

    /// Forget violations after this much quiet time. Unset means never.
    #[serde(default)]
    pub violation_decay_ms: Option<u64>,
}

impl Default for OffenderConfig {
    fn default() -> Self {
        Self {
            violation_threshold: default_violation_threshold(),
            ban_duration_ms: default_ban_duration(),
            violation_decay_ms: None,
        }
    }
}

fn default_violation_threshold() -> u32 {
    5
}

fn default_ban_duration() -> u64 {
    60 * 60 * 1000
}

/// What shared-mode limiters do while the shared backend is unreachable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Keep counting in-process until the backend is back
    #[default]
    FailOpen,
    /// Reject requests on shared-mode limiters
    FailClosed,
}

/// Shared counter backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedStoreConfig {
    /// Redis URL. Unset means in-process counting only.
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix for every counter key written to Redis
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single connect + increment round trip, in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Delay between reconnect probes while the backend is down, in milliseconds
    #[serde(default = "default_retry_interval")]
    pub retry_interval_ms: u64,

    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for SharedStoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            command_timeout_ms: default_command_timeout(),
            retry_interval_ms: default_retry_interval(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

fn default_key_prefix() -> String {
    "bouncer:rl:".to_string()
}

fn default_command_timeout() -> u64 {
    250
}

fn default_retry_interval() -> u64 {
    5000
}

/// Binds a set of limiters to a route class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteBinding {
    /// Path prefix this binding covers
    pub prefix: String,

    /// Restrict to one HTTP method (case-insensitive)
    #[serde(default)]
    pub method: Option<String>,

    /// Names of the rules applied, in order
    pub rules: Vec<String>,
}

impl RouteBinding {
    fn new(prefix: &str, method: Option<&str>, rules: &[&str]) -> Self {
        Self {
            prefix: prefix.to_string(),
            method: method.map(str::to_string),
            rules: rules.iter().map(|r| r.to_string()).collect(),
        }
    }
}

/// Admission chain layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainConfig {
    /// Cheap, bare-response limiter run right after the ban check
    #[serde(default = "default_ddos_guard")]
    pub ddos_guard: Option<String>,

    /// Broad limiter applied to every route
    #[serde(default = "default_safety_net")]
    pub safety_net: Option<String>,

    /// Route classes; the first matching binding wins
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteBinding>,
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            ddos_guard: default_ddos_guard(),
            safety_net: default_safety_net(),
            routes: default_routes(),
        }
    }
}

fn default_ddos_guard() -> Option<String> {
    Some("ddos_guard".to_string())
}

fn default_safety_net() -> Option<String> {
    Some("global".to_string())
}

fn default_routes() -> Vec<RouteBinding> {
    vec![
        RouteBinding::new("/api/auth/login", Some("POST"), &["auth"]),
        RouteBinding::new("/api/auth/register", Some("POST"), &["registration"]),
        RouteBinding::new("/api/users", Some("POST"), &["registration"]),
        RouteBinding::new("/api/public/menus", None, &["public_menu"]),
        RouteBinding::new("/api/qr", None, &["qr_scan"]),
        RouteBinding::new("/api", None, &["api"]),
    ]
}

impl BouncerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: BouncerConfig = serde_yaml::from_str(&contents)
            .map_err(|e| BouncerError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered with `BOUNCER__*`
    /// environment overrides.
    ///
    /// `REDIS_URL` is honored when no shared store URL was set otherwise.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("BOUNCER")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: BouncerConfig = settings.try_deserialize()?;
        if config.shared_store.url.is_none() {
            config.shared_store.url = std::env::var("REDIS_URL").ok().filter(|u| !u.is_empty());
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would break the admission invariants.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.adaptive.load_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            return Err(BouncerError::Config(format!(
                "adaptive.load_threshold must be in (0, 1], got {}",
                threshold
            )));
        }
        if self.offenders.violation_threshold == 0 {
            return Err(BouncerError::Config(
                "offenders.violation_threshold must be at least 1".to_string(),
            ));
        }
        if self.client.ipv6_prefix_len > 128 {
            return Err(BouncerError::Config(format!(
                "client.ipv6_prefix_len must be at most 128, got {}",
                self.client.ipv6_prefix_len
            )));
        }
        if self.sampler.history_capacity < 2 {
            return Err(BouncerError::Config(
                "sampler.history_capacity must hold at least 2 samples".to_string(),
            ));
        }
        if self.shared_store.command_timeout_ms == 0 {
            return Err(BouncerError::Config(
                "shared_store.command_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
