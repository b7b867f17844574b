//! Rate limiting logic and counter state.

mod backend;
mod client;
mod counter;
mod distributed;
mod limiter;
mod local;
mod rules;

pub use backend::CounterStore;
pub use client::{coarsen_ip, ClientIdentifier, ClientKey, UNKNOWN_CLIENT};
pub use counter::{CounterEntry, CounterHit};
pub use distributed::DistributedCounterStore;
pub use limiter::{Decision, RateLimiterFactory, RequestFilter, RequestInfo};
pub use local::LocalCounterStore;
pub use rules::{default_rules, resolve_rules, KeyStrategy, RateLimitRule, RejectionStyle, RuleConfig};
