//! Rate limit rules and their configuration.
//!
//! Every route class has a named rule. The built-in rules below can be tuned
//! per field from configuration, and new rules can be added by name.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{BouncerError, Result};

const MINUTE_MS: u64 = 60 * 1000;

/// How a rule derives the counter key for a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyStrategy {
    /// Coarsened address plus proxy headers
    Client,
    /// Coarsened address only
    Address,
}

/// How a rule answers when it rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RejectionStyle {
    /// JSON error body with retry hint
    Json,
    /// Status code only, no body
    Bare,
}

/// Optional per-field settings for a rule.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    /// Window length in milliseconds
    #[serde(default)]
    pub window_ms: Option<u64>,
    /// Requests allowed per window
    #[serde(default)]
    pub max: Option<u64>,
    /// Scale `max` by current load
    #[serde(default)]
    pub adaptive: Option<bool>,
    /// Count in the shared backend when one is configured
    #[serde(default)]
    pub shared: Option<bool>,
    #[serde(default)]
    pub key: Option<KeyStrategy>,
    #[serde(default)]
    pub style: Option<RejectionStyle>,
    /// Error message returned with JSON rejections
    #[serde(default)]
    pub message: Option<String>,
}

/// An immutable rate limit rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitRule {
    pub name: String,
    pub window: Duration,
    /// Requests allowed per window before load scaling
    pub max: u64,
    pub adaptive: bool,
    pub shared: bool,
    pub key: KeyStrategy,
    pub style: RejectionStyle,
    pub message: String,
}

impl RateLimitRule {
    /// A JSON-rejecting, client-keyed, local rule.
    pub fn new(name: impl Into<String>, window: Duration, max: u64) -> Self {
        Self {
            name: name.into(),
            window,
            max,
            adaptive: false,
            shared: false,
            key: KeyStrategy::Client,
            style: RejectionStyle::Json,
            message: "Too many requests, please try again later.".to_string(),
        }
    }

    pub fn adaptive(mut self, adaptive: bool) -> Self {
        self.adaptive = adaptive;
        self
    }

    pub fn shared(mut self, shared: bool) -> Self {
        self.shared = shared;
        self
    }

    pub fn key(mut self, key: KeyStrategy) -> Self {
        self.key = key;
        self
    }

    pub fn style(mut self, style: RejectionStyle) -> Self {
        self.style = style;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Seconds a rejected client is told to wait: the window, rounded up.
    pub fn retry_after_secs(&self) -> u64 {
        (self.window.as_millis() as u64).div_ceil(1000)
    }

    /// Minutes a rejected client is told to wait: the window, rounded up.
    pub fn retry_after_minutes(&self) -> u64 {
        (self.window.as_millis() as u64).div_ceil(MINUTE_MS)
    }

    fn apply(&mut self, config: &RuleConfig) {
        if let Some(window_ms) = config.window_ms {
            self.window = Duration::from_millis(window_ms);
        }
        if let Some(max) = config.max {
            self.max = max;
        }
        if let Some(adaptive) = config.adaptive {
            self.adaptive = adaptive;
        }
        if let Some(shared) = config.shared {
            self.shared = shared;
        }
        if let Some(key) = config.key {
            self.key = key;
        }
        if let Some(style) = config.style {
            self.style = style;
        }
        if let Some(ref message) = config.message {
            self.message = message.clone();
        }
    }
}

/// The built-in rules, one per route class.
pub fn default_rules() -> BTreeMap<String, RateLimitRule> {
    let rules = [
        RateLimitRule::new("ddos_guard", Duration::from_secs(1), 50)
            .key(KeyStrategy::Address)
            .style(RejectionStyle::Bare),
        RateLimitRule::new("global", Duration::from_millis(15 * MINUTE_MS), 1000)
            .message("Too many requests from this IP, please try again later."),
        RateLimitRule::new("api", Duration::from_millis(15 * MINUTE_MS), 100)
            .adaptive(true)
            .message("Too many API requests, please try again later."),
        RateLimitRule::new("auth", Duration::from_millis(15 * MINUTE_MS), 5)
            .shared(true)
            .message("Too many authentication attempts, please try again later."),
        RateLimitRule::new("registration", Duration::from_millis(60 * MINUTE_MS), 3)
            .shared(true)
            .message("Too many accounts created from this IP, please try again later."),
        RateLimitRule::new("public_menu", Duration::from_millis(MINUTE_MS), 60)
            .adaptive(true)
            .message("Too many menu requests, please slow down."),
        RateLimitRule::new("qr_scan", Duration::from_millis(MINUTE_MS), 30)
            .adaptive(true)
            .message("Too many QR code scans, please try again later."),
    ];

    rules.into_iter().map(|r| (r.name.clone(), r)).collect()
}

/// Merge configured overrides onto the built-in rules.
///
/// Overrides for unknown names define new rules and must set both
/// `window_ms` and `max`.
pub fn resolve_rules(
    overrides: &BTreeMap<String, RuleConfig>,
) -> Result<BTreeMap<String, RateLimitRule>> {
    let mut rules = default_rules();

    for (name, config) in overrides {
        let rule = rules.entry(name.clone()).or_insert_with(|| {
            RateLimitRule::new(
                name.clone(),
                Duration::from_millis(config.window_ms.unwrap_or(0)),
                config.max.unwrap_or(0),
            )
        });
        rule.apply(config);

        if rule.window.is_zero() {
            return Err(BouncerError::Config(format!(
                "rule '{}' needs a positive window_ms",
                name
            )));
        }
        if rule.max == 0 {
            return Err(BouncerError::Config(format!(
                "rule '{}' needs a positive max",
                name
            )));
        }
    }

    Ok(rules)
}
