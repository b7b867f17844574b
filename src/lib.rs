//! Bouncer - Adaptive Admission Control
//!
//! This crate guards an HTTP API with per-client rate limits whose budgets
//! shrink as process CPU load rises. Clients that keep hitting their limits
//! are banned for a while. Counters live in-process or, for rules marked
//! shared, in Redis with an in-process fallback while Redis is unreachable.

pub mod config;
pub mod error;
pub mod http;
pub mod load;
pub mod offender;
pub mod ratelimit;
pub mod runtime;
