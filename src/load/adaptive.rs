//! Load-aware request budgets.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::sampler::LoadSource;
use crate::config::AdaptiveConfig;

/// Multiplier applied above the threshold.
const SEVERE_MULTIPLIER: f64 = 0.3;
/// Multiplier applied between 60% of the threshold and the threshold.
const MODERATE_MULTIPLIER: f64 = 0.6;
/// Fraction of the threshold where moderate throttling starts.
const MODERATE_FRACTION: f64 = 0.6;

/// Budget multiplier for a load reading.
pub fn multiplier_for(load: f64, threshold: f64) -> f64 {
    if load > threshold {
        SEVERE_MULTIPLIER
    } else if load > threshold * MODERATE_FRACTION {
        MODERATE_MULTIPLIER
    } else {
        1.0
    }
}

/// Adaptive limiter state for dashboards.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdaptiveStatus {
    pub current_multiplier: f64,
    pub cpu_load: f64,
    pub load_threshold: f64,
    pub history_length: usize,
    pub last_check: Option<DateTime<Utc>>,
}

/// Shrinks request budgets while the process is under load.
pub struct AdaptiveBudgetCalculator {
    load: Arc<dyn LoadSource>,
    threshold: f64,
    /// Multiplier from the most recent budget calculation
    current_multiplier: AtomicU64,
}

impl std::fmt::Debug for AdaptiveBudgetCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveBudgetCalculator")
            .field("threshold", &self.threshold)
            .field("current_multiplier", &self.current_multiplier())
            .finish()
    }
}

impl AdaptiveBudgetCalculator {
    pub fn new(load: Arc<dyn LoadSource>, config: &AdaptiveConfig) -> Self {
        Self {
            load,
            threshold: config.load_threshold,
            current_multiplier: AtomicU64::new(1f64.to_bits()),
        }
    }

    /// Scale `base` by the current load.
    ///
    /// Never returns less than 1, so a route is never closed outright by a
    /// bad load reading.
    pub fn effective_budget(&self, base: u64) -> u64 {
        let load = self.load.current_load();
        let multiplier = multiplier_for(load, self.threshold);

        let previous = f64::from_bits(
            self.current_multiplier
                .swap(multiplier.to_bits(), Ordering::Relaxed),
        );
        if previous != multiplier {
            debug!(load, multiplier, previous, "Adaptive multiplier changed");
        }

        ((base as f64 * multiplier).floor() as u64).max(1)
    }

    /// Multiplier from the most recent budget calculation.
    pub fn current_multiplier(&self) -> f64 {
        f64::from_bits(self.current_multiplier.load(Ordering::Relaxed))
    }

    pub fn load_threshold(&self) -> f64 {
        self.threshold
    }

    pub fn status(&self) -> AdaptiveStatus {
        AdaptiveStatus {
            current_multiplier: self.current_multiplier(),
            cpu_load: self.load.current_load(),
            load_threshold: self.threshold,
            history_length: self.load.history_len(),
            last_check: self.load.last_check(),
        }
    }
}
