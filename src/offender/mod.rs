//! Offender tracking: escalates repeat rate limit violators to timed bans.

mod tracker;

pub use tracker::{OffenderStatus, OffenderTracker};
