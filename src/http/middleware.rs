//! Tower layer that runs the admission chain in front of every handler.

use axum::{
    body::Body,
    extract::{ConnectInfo, Request},
    response::Response,
};
use futures::future::{BoxFuture, FutureExt};
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::task::{Context, Poll};
use tower::{Layer, Service};
use tracing::{info_span, warn, Instrument};

use super::chain::{AdmissionChain, Verdict};
use super::response;
use crate::ratelimit::RequestInfo;

fn request_info(request: &Request<Body>) -> RequestInfo {
    RequestInfo {
        method: request.method().clone(),
        path: request.uri().path().to_string(),
        headers: request.headers().clone(),
        remote: request
            .extensions()
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ci| ci.0.ip()),
    }
}

/// Admission control layer.
#[derive(Debug, Clone)]
pub struct AdmissionLayer {
    chain: Arc<AdmissionChain>,
}

impl AdmissionLayer {
    pub fn new(chain: Arc<AdmissionChain>) -> Self {
        Self { chain }
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AdmissionService {
            inner,
            chain: self.chain.clone(),
        }
    }
}

/// Admission control service.
#[derive(Debug, Clone)]
pub struct AdmissionService<S> {
    inner: S,
    chain: Arc<AdmissionChain>,
}

impl<S> Service<Request<Body>> for AdmissionService<S>
where
    S: Service<Request<Body>, Response = Response> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, request: Request<Body>) -> Self::Future {
        let chain = self.chain.clone();
        // Use the instance that was polled ready
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let info = request_info(&request);
        let span = info_span!("admission", method = %info.method, path = %info.path);

        Box::pin(
            async move {
                let outcome = AssertUnwindSafe(chain.admit(&info)).catch_unwind().await;

                match outcome {
                    Ok(Ok(Verdict::Admit { quota })) => {
                        let mut response = inner.call(request).await?;
                        if let Some(ref quota) = quota {
                            response::apply_quota(response.headers_mut(), quota);
                        }
                        Ok(response)
                    }
                    Ok(Ok(Verdict::Banned)) => Ok(response::banned()),
                    Ok(Ok(Verdict::Limited(rejection))) => Ok(response::limited(&rejection)),
                    Ok(Ok(Verdict::Unavailable)) => Ok(response::unavailable()),
                    Ok(Err(e)) => {
                        warn!(error = %e, "Admission check failed, allowing request");
                        inner.call(request).await
                    }
                    Err(_) => {
                        warn!("Admission check panicked, allowing request");
                        inner.call(request).await
                    }
                }
            }
            .instrument(span),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AdaptiveConfig, BouncerConfig, ChainConfig, FailurePolicy, OffenderConfig, RouteBinding,
    };
    use crate::error::{BouncerError, Result};
    use crate::http::response::{LIMIT_HEADER, REMAINING_HEADER};
    use crate::load::{AdaptiveBudgetCalculator, LoadSource, StaticLoad};
    use crate::offender::OffenderTracker;
    use crate::ratelimit::{
        ClientIdentifier, CounterHit, CounterStore, LocalCounterStore, RateLimitRule,
        RateLimiterFactory, RuleConfig,
    };
    use crate::runtime::Bouncer;
    use async_trait::async_trait;
    use axum::{body::to_bytes, http::StatusCode, routing::get, Router};
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tower::ServiceExt;

    struct PanickingLoad;

    impl LoadSource for PanickingLoad {
        fn current_load(&self) -> f64 {
            panic!("load reading failed")
        }
    }

    /// Shared store whose round trips always time out.
    struct TimingOutStore;

    #[async_trait]
    impl CounterStore for TimingOutStore {
        async fn increment(&self, _key: &str, _window: Duration) -> Result<CounterHit> {
            Err(BouncerError::Timeout(250))
        }

        fn name(&self) -> &'static str {
            "timing-out"
        }
    }

    fn rule(window_ms: u64, max: u64, adaptive: bool) -> RuleConfig {
        RuleConfig {
            window_ms: Some(window_ms),
            max: Some(max),
            adaptive: Some(adaptive),
            ..RuleConfig::default()
        }
    }

    /// One `/api` route guarded by the `api` rule, nothing else.
    fn api_only(rule_config: RuleConfig) -> BouncerConfig {
        let mut config = BouncerConfig::default();
        config.rules.insert("api".to_string(), rule_config);
        config.chain = ChainConfig {
            ddos_guard: None,
            safety_net: None,
            routes: vec![RouteBinding {
                prefix: "/api".to_string(),
                method: None,
                rules: vec!["api".to_string()],
            }],
        };
        config
    }

    fn app(bouncer: &Bouncer) -> Router {
        Router::new()
            .route("/api/menus", get(|| async { "menus" }))
            .layer(bouncer.layer())
    }

    async fn send(app: &Router, ip: [u8; 4]) -> Response {
        let mut request = Request::builder()
            .uri("/api/menus")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from((ip, 40000))));
        app.clone().oneshot(request).await.unwrap()
    }

    #[tokio::test]
    async fn test_adaptive_budget_under_load() {
        let bouncer =
            Bouncer::with_load_source(api_only(rule(60_000, 100, true)), Arc::new(StaticLoad::new(0.9)))
                .unwrap();
        let app = app(&bouncer);

        for i in 0..30 {
            let response = send(&app, [192, 0, 2, 1]).await;
            assert_eq!(response.status(), StatusCode::OK, "request {}", i + 1);
            assert_eq!(response.headers()[LIMIT_HEADER], "30");
        }

        let response = send(&app, [192, 0, 2, 1]).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["details"]["retryAfter"], 1);
    }

    #[tokio::test]
    async fn test_full_budget_when_idle() {
        let bouncer =
            Bouncer::with_load_source(api_only(rule(60_000, 100, true)), Arc::new(StaticLoad::new(0.3)))
                .unwrap();
        let app = app(&bouncer);

        let response = send(&app, [192, 0, 2, 1]).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[LIMIT_HEADER], "100");
        assert_eq!(response.headers()[REMAINING_HEADER], "99");
        assert_eq!(bouncer.chain().adaptive().current_multiplier(), 1.0);
    }

    #[tokio::test]
    async fn test_shared_rule_keeps_counting_when_backend_down() {
        let mut config = api_only(RuleConfig {
            shared: Some(true),
            ..rule(60_000, 3, false)
        });
        config.shared_store.url = Some("redis://127.0.0.1:1/".to_string());
        config.shared_store.command_timeout_ms = 200;
        config.shared_store.retry_interval_ms = 60_000;
        config.shared_store.failure_policy = FailurePolicy::FailOpen;

        let bouncer = Bouncer::with_load_source(config, Arc::new(StaticLoad::new(0.0))).unwrap();
        let app = app(&bouncer);

        for _ in 0..3 {
            assert_eq!(send(&app, [192, 0, 2, 1]).await.status(), StatusCode::OK);
        }
        assert_eq!(
            send(&app, [192, 0, 2, 1]).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
    }

    #[tokio::test]
    async fn test_fail_closed_rejects_when_backend_down() {
        let mut config = api_only(RuleConfig {
            shared: Some(true),
            ..rule(60_000, 3, false)
        });
        config.shared_store.url = Some("redis://127.0.0.1:1/".to_string());
        config.shared_store.command_timeout_ms = 200;
        config.shared_store.retry_interval_ms = 60_000;
        config.shared_store.failure_policy = FailurePolicy::FailClosed;

        let bouncer = Bouncer::with_load_source(config, Arc::new(StaticLoad::new(0.0))).unwrap();
        let app = app(&bouncer);

        assert_eq!(
            send(&app, [192, 0, 2, 1]).await.status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_repeat_offender_is_banned_until_expiry() {
        let mut config = api_only(rule(60_000, 1, false));
        config.offenders.violation_threshold = 5;
        config.offenders.ban_duration_ms = 200;

        let bouncer = Bouncer::with_load_source(config, Arc::new(StaticLoad::new(0.0))).unwrap();
        let app = app(&bouncer);
        let client = [192, 0, 2, 1];

        assert_eq!(send(&app, client).await.status(), StatusCode::OK);
        for _ in 0..5 {
            assert_eq!(send(&app, client).await.status(), StatusCode::TOO_MANY_REQUESTS);
        }

        let response = send(&app, client).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "Access denied");

        // Other clients are unaffected
        assert_eq!(send(&app, [192, 0, 2, 2]).await.status(), StatusCode::OK);

        tokio::time::sleep(Duration::from_millis(300)).await;

        // Ban over; the window is still exhausted so the budget decides
        assert_eq!(
            send(&app, client).await.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(bouncer.chain().offenders().banned_count(), 0);
    }

    #[tokio::test]
    async fn test_panicking_chain_fails_open() {
        let bouncer =
            Bouncer::with_load_source(api_only(rule(60_000, 1, true)), Arc::new(PanickingLoad))
                .unwrap();
        let app = app(&bouncer);

        // Every request would be over budget if the chain got that far
        for _ in 0..3 {
            let response = send(&app, [192, 0, 2, 1]).await;
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(LIMIT_HEADER).is_none());
        }
    }

    #[tokio::test]
    async fn test_store_error_fails_open() {
        let adaptive = Arc::new(AdaptiveBudgetCalculator::new(
            Arc::new(StaticLoad::new(0.0)),
            &AdaptiveConfig::default(),
        ));
        let factory = RateLimiterFactory::new(
            Arc::new(ClientIdentifier::default()),
            adaptive.clone(),
            Arc::new(LocalCounterStore::new()),
            Some(Arc::new(TimingOutStore)),
        );
        let mut rules = BTreeMap::new();
        rules.insert(
            "auth".to_string(),
            RateLimitRule::new("auth", Duration::from_secs(60), 1).shared(true),
        );
        let layout = ChainConfig {
            ddos_guard: None,
            safety_net: None,
            routes: vec![RouteBinding {
                prefix: "/api".to_string(),
                method: None,
                rules: vec!["auth".to_string()],
            }],
        };
        let offenders = Arc::new(OffenderTracker::new(&OffenderConfig::default()));
        let chain = Arc::new(
            AdmissionChain::from_config(&layout, &rules, &factory, offenders.clone(), adaptive)
                .unwrap(),
        );
        let app = Router::new()
            .route("/api/menus", get(|| async { "menus" }))
            .layer(AdmissionLayer::new(chain));

        for _ in 0..3 {
            assert_eq!(send(&app, [192, 0, 2, 1]).await.status(), StatusCode::OK);
        }
        assert_eq!(offenders.banned_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_routes_pass_without_headers() {
        let bouncer = Bouncer::with_load_source(
            api_only(rule(60_000, 1, false)),
            Arc::new(StaticLoad::new(0.0)),
        )
        .unwrap();
        let app = Router::new()
            .route("/health", get(|| async { "ok" }))
            .layer(bouncer.layer());

        for _ in 0..3 {
            let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
            let response = app.clone().oneshot(request).await.unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            assert!(response.headers().get(LIMIT_HEADER).is_none());
        }
    }
}
