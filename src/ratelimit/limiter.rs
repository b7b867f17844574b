//! Rule-driven request filters.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::CounterStore;
use super::client::{ClientIdentifier, ClientKey};
use super::local::LocalCounterStore;
use super::rules::{KeyStrategy, RateLimitRule};
use crate::error::Result;
use crate::load::AdaptiveBudgetCalculator;

/// The parts of a request admission decisions look at.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: Method,
    pub path: String,
    pub headers: HeaderMap,
    /// Transport peer address
    pub remote: Option<IpAddr>,
}

impl RequestInfo {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            headers: HeaderMap::new(),
            remote: None,
        }
    }

    pub fn with_remote(mut self, remote: IpAddr) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &'static str) -> Self {
        self.headers
            .insert(HeaderName::from_static(name), HeaderValue::from_static(value));
        self
    }
}

/// Outcome of one filter check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow {
        /// Effective budget for this window
        limit: u64,
        remaining: u64,
        reset_after: Duration,
    },
    Reject {
        /// Effective budget for this window
        limit: u64,
        retry_after: Duration,
    },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow { .. })
    }
}

/// A configured limiter for one rule.
#[derive(Clone)]
pub struct RequestFilter {
    rule: Arc<RateLimitRule>,
    store: Arc<dyn CounterStore>,
    identifier: Arc<ClientIdentifier>,
    adaptive: Option<Arc<AdaptiveBudgetCalculator>>,
}

impl std::fmt::Debug for RequestFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestFilter")
            .field("rule", &self.rule.name)
            .field("store", &self.store.name())
            .field("adaptive", &self.adaptive.is_some())
            .finish()
    }
}

impl RequestFilter {
    pub fn rule(&self) -> &RateLimitRule {
        &self.rule
    }

    /// Client key this rule counts the request under.
    pub fn key_for(&self, request: &RequestInfo) -> ClientKey {
        match self.rule.key {
            KeyStrategy::Client => self.identifier.identify(&request.headers, request.remote),
            KeyStrategy::Address => self
                .identifier
                .identify_address(&request.headers, request.remote),
        }
    }

    /// Budget in force for the next request.
    pub fn budget(&self) -> u64 {
        let budget = match self.adaptive {
            Some(ref adaptive) => adaptive.effective_budget(self.rule.max),
            None => self.rule.max,
        };
        budget.max(1)
    }

    /// Count the request and decide whether it fits the budget.
    ///
    /// Errors only surface when the counter store refuses to count, which
    /// happens for shared rules under a fail-closed outage policy.
    pub async fn check(&self, request: &RequestInfo) -> Result<Decision> {
        let client = self.key_for(request);
        let budget = self.budget();
        let key = format!("{}:{}", self.rule.name, client);

        let hit = self.store.increment(&key, self.rule.window).await?;

        trace!(
            rule = %self.rule.name,
            key = %client,
            count = hit.count,
            budget,
            "Checked rate limit"
        );

        if hit.count > budget {
            warn!(
                rule = %self.rule.name,
                key = %client,
                route = %request.path,
                method = %request.method,
                count = hit.count,
                budget,
                backend = self.store.name(),
                "Rate limit exceeded"
            );
            return Ok(Decision::Reject {
                limit: budget,
                retry_after: Duration::from_secs(self.rule.retry_after_secs()),
            });
        }

        Ok(Decision::Allow {
            limit: budget,
            remaining: budget - hit.count,
            reset_after: hit.reset_after,
        })
    }
}

/// Builds request filters wired to the right counter store.
#[derive(Clone)]
pub struct RateLimiterFactory {
    identifier: Arc<ClientIdentifier>,
    adaptive: Arc<AdaptiveBudgetCalculator>,
    local: Arc<LocalCounterStore>,
    shared: Option<Arc<dyn CounterStore>>,
}

impl RateLimiterFactory {
    /// Create a factory. Without a `shared` store every rule counts
    /// in-process.
    pub fn new(
        identifier: Arc<ClientIdentifier>,
        adaptive: Arc<AdaptiveBudgetCalculator>,
        local: Arc<LocalCounterStore>,
        shared: Option<Arc<dyn CounterStore>>,
    ) -> Self {
        Self {
            identifier,
            adaptive,
            local,
            shared,
        }
    }

    pub fn build(&self, rule: RateLimitRule) -> RequestFilter {
        let store: Arc<dyn CounterStore> = match (rule.shared, &self.shared) {
            (true, Some(shared)) => shared.clone(),
            _ => self.local.clone() as Arc<dyn CounterStore>,
        };

        debug!(
            rule = %rule.name,
            window_ms = rule.window.as_millis() as u64,
            max = rule.max,
            adaptive = rule.adaptive,
            store = store.name(),
            "Built rate limiter"
        );

        RequestFilter {
            adaptive: rule.adaptive.then(|| self.adaptive.clone()),
            rule: Arc::new(rule),
            store,
            identifier: self.identifier.clone(),
        }
    }

    pub fn identifier(&self) -> &Arc<ClientIdentifier> {
        &self.identifier
    }
}
