//! Counter store trait for abstracting local and distributed implementations.

use async_trait::async_trait;
use std::time::Duration;

use super::counter::CounterHit;
use crate::error::Result;

/// Trait for request counter implementations.
///
/// This trait abstracts over the in-process `LocalCounterStore` and the
/// Redis-backed `DistributedCounterStore` so limiters can work with either.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Count one request for `key` and return the post-increment count for
    /// the key's current window of length `window`.
    async fn increment(&self, key: &str, window: Duration) -> Result<CounterHit>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}
