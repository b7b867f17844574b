//! Ordered admission checks.

use axum::http::Method;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{ChainConfig, RouteBinding};
use crate::error::{BouncerError, Result};
use crate::load::AdaptiveBudgetCalculator;
use crate::offender::OffenderTracker;
use crate::ratelimit::{
    ClientIdentifier, ClientKey, Decision, RateLimitRule, RateLimiterFactory, RejectionStyle,
    RequestFilter, RequestInfo,
};

/// Budget state reported on admitted responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    pub reset_after: Duration,
}

/// Why a limiter turned a request away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub rule: String,
    pub message: String,
    pub style: RejectionStyle,
    pub limit: u64,
    pub retry_after: Duration,
    /// Window length in minutes, rounded up
    pub retry_after_minutes: u64,
}

impl Rejection {
    fn new(rule: &RateLimitRule, limit: u64, retry_after: Duration) -> Self {
        Self {
            rule: rule.name.clone(),
            message: rule.message.clone(),
            style: rule.style,
            limit,
            retry_after,
            retry_after_minutes: rule.retry_after_minutes(),
        }
    }
}

/// Outcome of running a request through the chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Pass to the protected handler; `quota` is the tightest route budget
    Admit { quota: Option<Quota> },
    /// The client is serving a ban
    Banned,
    /// A limiter rejected the request
    Limited(Rejection),
    /// A shared limiter cannot count and fails closed
    Unavailable,
}

/// Limiters bound to one route class.
#[derive(Debug)]
struct RouteLimiter {
    prefix: String,
    method: Option<Method>,
    filters: Vec<RequestFilter>,
}

impl RouteLimiter {
    fn matches(&self, request: &RequestInfo) -> bool {
        if let Some(ref method) = self.method {
            if *method != request.method {
                return false;
            }
        }
        path_has_prefix(&request.path, &self.prefix)
    }
}

/// Segment-aware prefix match: `/api` covers `/api` and `/api/x`, not `/apix`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || prefix.ends_with('/') || rest.starts_with('/'),
        None => false,
    }
}

enum Step {
    Pass(Quota),
    Stop(Verdict),
}

/// The admission chain: offender gate, DDoS guard, safety net, then the
/// first matching route class.
///
/// Every limiter rejection counts as a violation for the caller's address
/// key. Proxy headers are left out of it so that rotating a forged header
/// cannot shake off a ban.
pub struct AdmissionChain {
    identifier: Arc<ClientIdentifier>,
    offenders: Arc<OffenderTracker>,
    adaptive: Arc<AdaptiveBudgetCalculator>,
    ddos_guard: Option<RequestFilter>,
    safety_net: Option<RequestFilter>,
    routes: Vec<RouteLimiter>,
}

impl std::fmt::Debug for AdmissionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionChain")
            .field("ddos_guard", &self.ddos_guard)
            .field("safety_net", &self.safety_net)
            .field("routes", &self.routes)
            .finish()
    }
}

impl AdmissionChain {
    /// Assemble the chain from its layout and the resolved rules.
    pub fn from_config(
        config: &ChainConfig,
        rules: &BTreeMap<String, RateLimitRule>,
        factory: &RateLimiterFactory,
        offenders: Arc<OffenderTracker>,
        adaptive: Arc<AdaptiveBudgetCalculator>,
    ) -> Result<Self> {
        let build = |name: &str| -> Result<RequestFilter> {
            rules
                .get(name)
                .cloned()
                .map(|rule| factory.build(rule))
                .ok_or_else(|| BouncerError::Config(format!("unknown rate limit rule '{}'", name)))
        };

        let ddos_guard = config.ddos_guard.as_deref().map(&build).transpose()?;
        let safety_net = config.safety_net.as_deref().map(&build).transpose()?;

        let routes = config
            .routes
            .iter()
            .map(|binding| Self::route(binding, &build))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            identifier: factory.identifier().clone(),
            offenders,
            adaptive,
            ddos_guard,
            safety_net,
            routes,
        })
    }

    fn route<F>(binding: &RouteBinding, build: &F) -> Result<RouteLimiter>
    where
        F: Fn(&str) -> Result<RequestFilter>,
    {
        let method = binding
            .method
            .as_deref()
            .map(|m| {
                Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| {
                    BouncerError::Config(format!("invalid method '{}' for route {}", m, binding.prefix))
                })
            })
            .transpose()?;

        Ok(RouteLimiter {
            prefix: binding.prefix.clone(),
            method,
            filters: binding
                .rules
                .iter()
                .map(|name| build(name.as_str()))
                .collect::<Result<Vec<_>>>()?,
        })
    }

    pub fn adaptive(&self) -> &Arc<AdaptiveBudgetCalculator> {
        &self.adaptive
    }

    pub fn offenders(&self) -> &Arc<OffenderTracker> {
        &self.offenders
    }

    /// Run the request through every stage.
    ///
    /// Errors are unexpected failures; callers let the request through.
    pub async fn admit(&self, request: &RequestInfo) -> Result<Verdict> {
        let client = self
            .identifier
            .identify_address(&request.headers, request.remote);

        if self.offenders.is_banned(&client) {
            debug!(key = %client, route = %request.path, "Rejected banned client");
            return Ok(Verdict::Banned);
        }

        if let Some(ref guard) = self.ddos_guard {
            if let Step::Stop(verdict) = self.apply(guard, request, &client).await? {
                return Ok(verdict);
            }
        }

        let route_filters = self
            .routes
            .iter()
            .find(|route| route.matches(request))
            .map(|route| route.filters.as_slice())
            .unwrap_or_default();

        let mut quota: Option<Quota> = None;
        for filter in self.safety_net.iter().chain(route_filters) {
            match self.apply(filter, request, &client).await? {
                Step::Stop(verdict) => return Ok(verdict),
                Step::Pass(q) => {
                    if quota.map_or(true, |current| q.remaining < current.remaining) {
                        quota = Some(q);
                    }
                }
            }
        }

        Ok(Verdict::Admit { quota })
    }

    async fn apply(
        &self,
        filter: &RequestFilter,
        request: &RequestInfo,
        client: &ClientKey,
    ) -> Result<Step> {
        let decision = match filter.check(request).await {
            Ok(decision) => decision,
            Err(BouncerError::BackendUnavailable(reason)) => {
                warn!(
                    rule = %filter.rule().name,
                    key = %client,
                    reason = %reason,
                    "Shared limiter failing closed"
                );
                return Ok(Step::Stop(Verdict::Unavailable));
            }
            Err(e) => return Err(e),
        };

        match decision {
            Decision::Allow {
                limit,
                remaining,
                reset_after,
            } => Ok(Step::Pass(Quota {
                limit,
                remaining,
                reset_after,
            })),
            Decision::Reject { limit, retry_after } => {
                self.offenders.record_violation(client);
                Ok(Step::Stop(Verdict::Limited(Rejection::new(
                    filter.rule(),
                    limit,
                    retry_after,
                ))))
            }
        }
    }
}
