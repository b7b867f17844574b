//! Process CPU load estimation.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::config::SamplerConfig;

/// A source of the current load, normalized to `[0, 1]`.
pub trait LoadSource: Send + Sync {
    fn current_load(&self) -> f64;

    /// Number of samples currently smoothing the reading.
    fn history_len(&self) -> usize {
        0
    }

    /// When the source last took a sample.
    fn last_check(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// A load reading that only changes when told to.
#[derive(Debug)]
pub struct StaticLoad(AtomicU64);

impl StaticLoad {
    pub fn new(load: f64) -> Self {
        Self(AtomicU64::new(clamp_unit(load).to_bits()))
    }

    pub fn set(&self, load: f64) {
        self.0.store(clamp_unit(load).to_bits(), Ordering::Relaxed);
    }
}

impl LoadSource for StaticLoad {
    fn current_load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// One CPU utilization sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub value: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct SamplerState {
    /// Process CPU time at the last check
    last_cpu: Option<Duration>,
    last_check: Instant,
    last_check_at: DateTime<Utc>,
    history: VecDeque<LoadSample>,
}

/// Estimates process CPU utilization from `getrusage` deltas.
///
/// A fresh sample is taken at most once per interval, on the first call
/// after it elapses. Readings are the mean of the recent samples; until two
/// samples exist the OS one-minute load average per core is used instead.
#[derive(Debug)]
pub struct LoadSampler {
    state: Mutex<SamplerState>,
    /// Last value handed out, returned when the state is contended
    cached: AtomicU64,
    interval: Duration,
    capacity: usize,
}

impl LoadSampler {
    pub fn new(config: &SamplerConfig) -> Self {
        let capacity = config.history_capacity.max(2);
        Self {
            state: Mutex::new(SamplerState {
                last_cpu: process_cpu_time(),
                last_check: Instant::now(),
                last_check_at: Utc::now(),
                history: VecDeque::with_capacity(capacity),
            }),
            cached: AtomicU64::new(0f64.to_bits()),
            interval: Duration::from_millis(config.sample_interval_ms),
            capacity,
        }
    }

    /// Snapshot of the smoothing window, oldest first.
    pub fn history(&self) -> Vec<LoadSample> {
        self.state.lock().history.iter().copied().collect()
    }

    fn sample(&self, state: &mut SamplerState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_check);
        let cpu = process_cpu_time();

        if let (Some(cpu), Some(last)) = (cpu, state.last_cpu) {
            if !elapsed.is_zero() {
                let value = cpu.saturating_sub(last).as_secs_f64() / elapsed.as_secs_f64();
                self.push(state, clamp_unit(value));
            }
        }

        state.last_cpu = cpu;
        state.last_check = now;
        state.last_check_at = Utc::now();
    }

    fn push(&self, state: &mut SamplerState, value: f64) {
        if state.history.len() >= self.capacity {
            state.history.pop_front();
        }
        state.history.push_back(LoadSample {
            value,
            at: Utc::now(),
        });
        trace!(value, samples = state.history.len(), "Recorded CPU sample");
    }

    fn reading(state: &SamplerState) -> f64 {
        if state.history.len() >= 2 {
            let sum: f64 = state.history.iter().map(|s| s.value).sum();
            clamp_unit(sum / state.history.len() as f64)
        } else {
            load_average_per_core()
        }
    }
}

impl LoadSource for LoadSampler {
    fn current_load(&self) -> f64 {
        let Some(mut state) = self.state.try_lock() else {
            return f64::from_bits(self.cached.load(Ordering::Relaxed));
        };

        let now = Instant::now();
        if now.saturating_duration_since(state.last_check) >= self.interval {
            self.sample(&mut state, now);
        }

        let load = Self::reading(&state);
        self.cached.store(load.to_bits(), Ordering::Relaxed);
        load
    }

    fn history_len(&self) -> usize {
        self.state.lock().history.len()
    }

    fn last_check(&self) -> Option<DateTime<Utc>> {
        Some(self.state.lock().last_check_at)
    }
}

fn clamp_unit(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.0
    }
}

/// One-minute load average divided by logical cores, or 0 when unavailable.
fn load_average_per_core() -> f64 {
    let Some(load) = one_minute_load_average() else {
        debug!("OS load average unavailable, assuming idle");
        return 0.0;
    };
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    clamp_unit(load / cores as f64)
}

#[cfg(unix)]
fn process_cpu_time() -> Option<Duration> {
    let mut usage = std::mem::MaybeUninit::<libc::rusage>::zeroed();
    // SAFETY: getrusage only writes into the provided struct.
    let rc = unsafe { libc::getrusage(libc::RUSAGE_SELF, usage.as_mut_ptr()) };
    if rc != 0 {
        return None;
    }
    // SAFETY: zero-initialized and filled by a successful getrusage call.
    let usage = unsafe { usage.assume_init() };

    let to_duration = |tv: libc::timeval| {
        Duration::from_secs(tv.tv_sec.max(0) as u64) + Duration::from_micros(tv.tv_usec.max(0) as u64)
    };
    Some(to_duration(usage.ru_utime) + to_duration(usage.ru_stime))
}

#[cfg(not(unix))]
fn process_cpu_time() -> Option<Duration> {
    None
}

#[cfg(unix)]
fn one_minute_load_average() -> Option<f64> {
    let mut loads = [0f64; 3];
    // SAFETY: the buffer holds the three requested values.
    let n = unsafe { libc::getloadavg(loads.as_mut_ptr(), 3) };
    (n >= 1).then_some(loads[0])
}

#[cfg(not(unix))]
fn one_minute_load_average() -> Option<f64> {
    None
}
