use crate::config::Config;
use crate::metrics::Metrics;
use crate::proxy::executor::Executor;
use crate::proxy::layer::{self, Layer};
use crate::stats::Stats;
use crate::tls::MitmAuthority;
use anyhow::Result;
use std::sync::Arc;

/// Shared proxy state, cheaply cloneable. Everything inside is immutable
/// configuration or internally synchronized.
#[derive(Clone)]
pub struct ProxyState {
    pub config: Arc<Config>,
    pub metrics: Metrics,
    pub stats: Arc<Stats>,
    /// The fixed layer pipeline, built once at startup.
    pub layers: Arc<Vec<Layer>>,
    /// The main upstream executor.
    pub executor: Executor,
    pub tls: Arc<MitmAuthority>,
}

impl ProxyState {
    /// Build all shared components. Must run inside the tokio runtime — the
    /// ad-block loader task is spawned from here.
    pub fn new(config: Config) -> Result<Self> {
        let tls = Arc::new(MitmAuthority::load(&config)?);
        let stats = Arc::new(Stats::new());
        let metrics = Metrics::install();

        let executor = Executor::upstream(config.crawlera_addr(), stats.clone());
        let layers = Arc::new(layer::build_layers(&config, &stats, &executor)?);

        Ok(Self {
            config: Arc::new(config),
            metrics,
            stats,
            layers,
            executor,
            tls,
        })
    }
}
