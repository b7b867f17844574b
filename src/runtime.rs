//! Wiring of the admission components from configuration.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::BouncerConfig;
use crate::error::Result;
use crate::http::{AdmissionChain, AdmissionLayer};
use crate::load::{AdaptiveBudgetCalculator, LoadSampler, LoadSource};
use crate::offender::OffenderTracker;
use crate::ratelimit::{
    resolve_rules, ClientIdentifier, CounterStore, DistributedCounterStore, LocalCounterStore,
    RateLimiterFactory,
};

/// Every admission component built from one configuration.
#[derive(Debug)]
pub struct Bouncer {
    config: BouncerConfig,
    local: Arc<LocalCounterStore>,
    shared: Option<DistributedCounterStore>,
    offenders: Arc<OffenderTracker>,
    chain: Arc<AdmissionChain>,
}

impl Bouncer {
    /// Build with the process CPU sampler as load source.
    pub fn from_config(config: BouncerConfig) -> Result<Self> {
        let sampler = Arc::new(LoadSampler::new(&config.sampler));
        Self::with_load_source(config, sampler)
    }

    pub fn with_load_source(config: BouncerConfig, load: Arc<dyn LoadSource>) -> Result<Self> {
        config.validate()?;

        let rules = resolve_rules(&config.rules)?;
        let identifier = Arc::new(ClientIdentifier::new(&config.client));
        let adaptive = Arc::new(AdaptiveBudgetCalculator::new(load, &config.adaptive));
        let local = Arc::new(LocalCounterStore::new());

        let shared = match config.shared_store.url {
            Some(_) => Some(DistributedCounterStore::new(&config.shared_store)?),
            None => {
                info!("No shared counter backend configured, all limiters count in-process");
                None
            }
        };

        let factory = RateLimiterFactory::new(
            identifier,
            adaptive.clone(),
            local.clone(),
            shared
                .clone()
                .map(|store| Arc::new(store) as Arc<dyn CounterStore>),
        );
        let offenders = Arc::new(OffenderTracker::new(&config.offenders));
        let chain = Arc::new(AdmissionChain::from_config(
            &config.chain,
            &rules,
            &factory,
            offenders.clone(),
            adaptive,
        )?);

        info!(rules = rules.len(), routes = config.chain.routes.len(), "Admission chain ready");

        Ok(Self {
            config,
            local,
            shared,
            offenders,
            chain,
        })
    }

    pub fn config(&self) -> &BouncerConfig {
        &self.config
    }

    pub fn chain(&self) -> &Arc<AdmissionChain> {
        &self.chain
    }

    pub fn layer(&self) -> AdmissionLayer {
        AdmissionLayer::new(self.chain.clone())
    }

    /// Drop expired counters and bans. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let counters = self.local.purge_expired();
        let fallback = self
            .shared
            .as_ref()
            .map(|store| store.fallback().purge_expired())
            .unwrap_or(0);
        let offenders = self.offenders.purge_expired();

        debug!(counters, fallback, offenders, "Maintenance sweep finished");
        counters + fallback + offenders
    }

    /// Run [`sweep`](Self::sweep) on the configured interval.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let bouncer = Arc::clone(self);
        let period = Duration::from_secs(self.config.server.maintenance_interval_secs.max(1));

        tokio::spawn(async move {
            let mut timer = tokio::time::interval(period);
            // The first tick fires immediately
            timer.tick().await;
            loop {
                timer.tick().await;
                bouncer.sweep();
            }
        })
    }
}
