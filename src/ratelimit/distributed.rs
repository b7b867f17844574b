//! Distributed counter store backed by Redis.
//!
//! Counters are shared by every instance pointed at the same Redis. Each
//! increment is a single server-side script (`INCR` plus `PEXPIRE` on the
//! first hit), so concurrent instances never lose updates.
//!
//! The store wraps the backend in a circuit breaker. When a round trip fails
//! or times out the breaker opens and requests are served according to the
//! configured [`FailurePolicy`]. A single background probe pings the backend
//! until it answers again, then the breaker closes and counting moves back to
//! Redis.

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use redis::aio::MultiplexedConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::backend::CounterStore;
use super::counter::CounterHit;
use super::local::LocalCounterStore;
use crate::config::{FailurePolicy, SharedStoreConfig};
use crate::error::{BouncerError, Result};

/// Increments `KEYS[1]` and arms its expiry on the first hit of a window.
///
/// Returns `{count, pttl}`. A key that somehow lost its TTL is re-armed so it
/// can never count forever.
const INCREMENT_SCRIPT: &str = r#"
local current = redis.call('INCR', KEYS[1])
if current == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
local ttl = redis.call('PTTL', KEYS[1])
if ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {current, ttl}
"#;

/// Open/closed state of the shared backend.
#[derive(Debug)]
struct CircuitBreaker {
    /// Backend considered reachable
    closed: AtomicBool,
    /// A recovery probe is running
    probing: AtomicBool,
}

impl CircuitBreaker {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(true),
            probing: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Open the breaker. Returns `true` only for the caller that flipped it.
    fn trip(&self) -> bool {
        self.closed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// End the running probe and close the breaker.
    ///
    /// `probing` is cleared first: a request that trips the breaker right
    /// after it closes must be able to start the next probe.
    fn recover(&self) {
        self.probing.store(false, Ordering::Release);
        self.close();
    }
}

struct Shared {
    client: redis::Client,
    connection: Mutex<Option<MultiplexedConnection>>,
    script: redis::Script,
    key_prefix: String,
    timeout: Duration,
    retry_interval: Duration,
    policy: FailurePolicy,
    breaker: CircuitBreaker,
    fallback: LocalCounterStore,
}

impl Shared {
    async fn connection(&self) -> Result<MultiplexedConnection> {
        let cached = self.connection.lock().clone();
        if let Some(conn) = cached {
            return Ok(conn);
        }

        let conn = self.client.get_multiplexed_async_connection().await?;
        *self.connection.lock() = Some(conn.clone());
        Ok(conn)
    }

    /// Run `op` with the store's deadline.
    async fn bounded<T, F>(&self, op: F) -> Result<T>
    where
        F: std::future::Future<Output = Result<T>>,
    {
        match tokio::time::timeout(self.timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(BouncerError::Timeout(self.timeout.as_millis() as u64)),
        }
    }

    async fn increment_remote(&self, key: &str, window: Duration) -> Result<CounterHit> {
        let full_key = format!("{}{}", self.key_prefix, key);
        let window_ms = (window.as_millis() as u64).max(1);

        self.bounded(async {
            let mut conn = self.connection().await?;
            let (count, ttl_ms): (u64, i64) = self
                .script
                .key(&full_key)
                .arg(window_ms)
                .invoke_async(&mut conn)
                .await?;

            trace!(key = %full_key, count, ttl_ms, "Counted request in shared store");

            Ok(CounterHit {
                count,
                reset_after: Duration::from_millis(ttl_ms.max(0) as u64),
            })
        })
        .await
    }

    async fn ping(&self) -> Result<()> {
        self.bounded(async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            *self.connection.lock() = Some(conn);
            Ok(())
        })
        .await
    }
}

/// Counter store shared across instances through Redis.
#[derive(Clone)]
pub struct DistributedCounterStore {
    inner: Arc<Shared>,
}

impl std::fmt::Debug for DistributedCounterStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedCounterStore")
            .field("key_prefix", &self.inner.key_prefix)
            .field("policy", &self.inner.policy)
            .field("available", &self.inner.breaker.is_closed())
            .finish()
    }
}

impl DistributedCounterStore {
    /// Create a store for the configured Redis URL.
    ///
    /// No connection is made here; the first increment connects lazily, so
    /// an unreachable backend at startup only opens the breaker.
    pub fn new(config: &SharedStoreConfig) -> Result<Self> {
        let url = config.url.as_deref().ok_or_else(|| {
            BouncerError::Config("shared_store.url is required for the shared backend".to_string())
        })?;
        let client = redis::Client::open(url)?;

        info!(
            key_prefix = %config.key_prefix,
            timeout_ms = config.command_timeout_ms,
            policy = ?config.failure_policy,
            "Shared counter backend configured"
        );

        Ok(Self {
            inner: Arc::new(Shared {
                client,
                connection: Mutex::new(None),
                script: redis::Script::new(INCREMENT_SCRIPT),
                key_prefix: config.key_prefix.clone(),
                timeout: Duration::from_millis(config.command_timeout_ms),
                retry_interval: Duration::from_millis(config.retry_interval_ms),
                policy: config.failure_policy,
                breaker: CircuitBreaker::new(),
                fallback: LocalCounterStore::new(),
            }),
        })
    }

    /// Whether requests are currently counted in Redis.
    pub fn is_available(&self) -> bool {
        self.inner.breaker.is_closed()
    }

    /// Counters kept in-process while the backend is down.
    pub fn fallback(&self) -> &LocalCounterStore {
        &self.inner.fallback
    }

    fn demote(&self, error: &BouncerError) {
        if !self.inner.breaker.trip() {
            return;
        }

        warn!(
            error = %error,
            policy = ?self.inner.policy,
            "Shared counter backend unavailable, demoting shared limiters"
        );
        self.inner.connection.lock().take();
        Self::spawn_probe(Arc::downgrade(&self.inner), self.inner.retry_interval);
    }

    fn spawn_probe(inner: Weak<Shared>, retry_interval: Duration) {
        match inner.upgrade() {
            Some(shared) if !shared.breaker.probing.swap(true, Ordering::AcqRel) => {}
            _ => return,
        }

        tokio::spawn(async move {
            let spread = (retry_interval.as_millis() as u64 / 5).max(1);
            loop {
                let jitter = rand::thread_rng().gen_range(0..spread);
                tokio::time::sleep(retry_interval + Duration::from_millis(jitter)).await;

                let Some(shared) = inner.upgrade() else {
                    return;
                };

                match shared.ping().await {
                    Ok(()) => {
                        shared.breaker.recover();
                        info!("Shared counter backend recovered, promoting shared limiters");
                        return;
                    }
                    Err(e) => {
                        debug!(error = %e, "Shared counter backend still unavailable");
                    }
                }
            }
        });
    }

    fn serve_degraded(&self, key: &str, window: Duration) -> Result<CounterHit> {
        match self.inner.policy {
            FailurePolicy::FailOpen => Ok(self.inner.fallback.hit(key, window)),
            FailurePolicy::FailClosed => Err(BouncerError::BackendUnavailable(
                "shared counter backend is down".to_string(),
            )),
        }
    }
}

#[async_trait]
impl CounterStore for DistributedCounterStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterHit> {
        if self.inner.breaker.is_closed() {
            match self.inner.increment_remote(key, window).await {
                Ok(hit) => return Ok(hit),
                Err(e) => self.demote(&e),
            }
        }

        self.serve_degraded(key, window)
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::SocketAddr;
    use std::time::Instant;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::tcp::OwnedReadHalf;
    use tokio::net::{TcpListener, TcpStream};
    use tokio_test::{assert_err, assert_ok};

    /// Count the script reports for every increment served by `serve_resp`.
    const REMOTE_COUNT: u64 = 7;

    /// Read one RESP command (an array of bulk strings).
    async fn read_command(reader: &mut BufReader<OwnedReadHalf>) -> Option<Vec<String>> {
        let mut line = String::new();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let count: usize = line.trim_end().strip_prefix('*')?.parse().ok()?;

        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            line.clear();
            reader.read_line(&mut line).await.ok()?;
            let len: usize = line.trim_end().strip_prefix('$')?.parse().ok()?;
            let mut buf = vec![0u8; len + 2];
            reader.read_exact(&mut buf).await.ok()?;
            buf.truncate(len);
            parts.push(String::from_utf8(buf).ok()?);
        }
        Some(parts)
    }

    /// Minimal Redis stand-in: PONG for PING, a fixed `{count, pttl}` for
    /// scripts, OK for anything else.
    async fn serve_resp(socket: TcpStream) {
        let (read, mut write) = socket.into_split();
        let mut reader = BufReader::new(read);
        while let Some(command) = read_command(&mut reader).await {
            let name = command
                .first()
                .map(|c| c.to_ascii_uppercase())
                .unwrap_or_default();
            let reply = match name.as_str() {
                "PING" => "+PONG\r\n".to_string(),
                "EVALSHA" | "EVAL" => format!("*2\r\n:{}\r\n:60000\r\n", REMOTE_COUNT),
                _ => "+OK\r\n".to_string(),
            };
            if write.write_all(reply.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    async fn spawn_resp_server(addr: SocketAddr) {
        let listener = TcpListener::bind(addr).await.unwrap();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_resp(socket));
            }
        });
    }

    fn test_config(url: &str, policy: FailurePolicy) -> SharedStoreConfig {
        SharedStoreConfig {
            url: Some(url.to_string()),
            key_prefix: "test:".to_string(),
            command_timeout_ms: 200,
            retry_interval_ms: 60_000,
            failure_policy: policy,
        }
    }

    #[test]
    fn test_requires_url() {
        let config = SharedStoreConfig::default();
        assert!(matches!(
            DistributedCounterStore::new(&config),
            Err(BouncerError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_malformed_url() {
        let config = test_config("not a url", FailurePolicy::FailOpen);
        assert_err!(DistributedCounterStore::new(&config));
    }

    #[test]
    fn test_breaker_trips_once() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.is_closed());
        assert!(breaker.trip());
        assert!(!breaker.trip());
        assert!(!breaker.is_closed());
        breaker.close();
        assert!(breaker.is_closed());
    }

    #[test]
    fn test_trip_after_recovery_restarts_health_checks() {
        let breaker = CircuitBreaker::new();
        assert!(breaker.trip());
        assert!(!breaker.probing.swap(true, Ordering::AcqRel));

        breaker.recover();
        assert!(breaker.is_closed());

        // The next outage must be free to start its own health check
        assert!(breaker.trip());
        assert!(!breaker.probing.swap(true, Ordering::AcqRel));
    }

    #[tokio::test]
    async fn test_recovers_when_backend_returns() {
        // Reserve a port, then leave it closed for the outage
        let addr = TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap()
            .local_addr()
            .unwrap();

        let store = DistributedCounterStore::new(&SharedStoreConfig {
            retry_interval_ms: 100,
            ..test_config(&format!("redis://{}/", addr), FailurePolicy::FailOpen)
        })
        .unwrap();
        let window = Duration::from_secs(60);

        let degraded = store.increment("client", window).await.unwrap();
        assert_eq!(degraded.count, 1);
        assert!(!store.is_available());

        spawn_resp_server(addr).await;
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(store.is_available());

        // Counting is back in the shared backend
        let hit = store.increment("client", window).await.unwrap();
        assert_eq!(hit.count, REMOTE_COUNT);
        assert_eq!(store.fallback().count("client"), Some(1));
    }

    #[tokio::test]
    async fn test_unreachable_backend_falls_back_to_local() {
        let store = assert_ok!(DistributedCounterStore::new(&test_config(
            "redis://127.0.0.1:1/",
            FailurePolicy::FailOpen,
        )));
        let window = Duration::from_secs(60);

        let started = Instant::now();
        let first = assert_ok!(store.increment("client", window).await);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(first.count, 1);
        assert!(!store.is_available());

        // Later hits skip the backend and keep counting locally
        assert_eq!(store.increment("client", window).await.unwrap().count, 2);
        assert_eq!(store.increment("client", window).await.unwrap().count, 3);
        assert_eq!(store.fallback().count("client"), Some(3));
    }

    #[tokio::test]
    async fn test_fail_closed_reports_unavailable() {
        let store = DistributedCounterStore::new(&test_config(
            "redis://127.0.0.1:1/",
            FailurePolicy::FailClosed,
        ))
        .unwrap();

        let result = store.increment("client", Duration::from_secs(60)).await;
        assert!(matches!(result, Err(BouncerError::BackendUnavailable(_))));
        assert!(store.fallback().is_empty());
    }

    #[tokio::test]
    async fn test_silent_backend_is_bounded_by_timeout() {
        // Accepts connections and never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let store = DistributedCounterStore::new(&test_config(
            &format!("redis://{}/", addr),
            FailurePolicy::FailOpen,
        ))
        .unwrap();

        let started = Instant::now();
        let hit = store.increment("client", Duration::from_secs(60)).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(hit.count, 1);
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_secs(2), "took {:?}", elapsed);
        assert!(!store.is_available());
    }
}
