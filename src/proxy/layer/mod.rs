pub mod adblock;
pub mod auth;
pub mod base;
pub mod direct_access;
pub mod headers;
pub mod rate_limit;
pub mod referer;
pub mod session;

pub use adblock::AdblockLayer;
pub use auth::AuthLayer;
pub use base::BaseLayer;
pub use direct_access::DirectAccessLayer;
pub use headers::HeadersLayer;
pub use rate_limit::RateLimitLayer;
pub use referer::RefererLayer;
pub use session::SessionsLayer;

use crate::adblock::RuleSet;
use crate::config::Config;
use crate::error::ProxyError;
use crate::proxy::context::RequestContext;
use crate::proxy::executor::Executor;
use crate::stats::Stats;
use anyhow::Result;
use std::sync::Arc;

/// One layer of the request pipeline. Enum-based — static dispatch,
/// exhaustive match, each variant holding its own immutable configuration.
///
/// `on_request` hooks run in construction order before the upstream
/// dispatch; `on_response` hooks run in reverse order afterwards. A layer
/// that returns an error from `on_request` short-circuits the remaining
/// request hooks, and its own `on_response` is the authority on whether that
/// error is swallowed (sentinels) or surfaced.
pub enum Layer {
    Base(BaseLayer),
    Auth(AuthLayer),
    Adblock(AdblockLayer),
    DirectAccess(DirectAccessLayer),
    RateLimit(RateLimitLayer),
    Headers(HeadersLayer),
    Referer(RefererLayer),
    Sessions(SessionsLayer),
}

impl Layer {
    pub async fn on_request(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        match self {
            Layer::Base(layer) => layer.on_request(ctx),
            Layer::Auth(layer) => layer.on_request(ctx),
            Layer::Adblock(layer) => layer.on_request(ctx).await,
            Layer::DirectAccess(layer) => layer.on_request(ctx),
            Layer::RateLimit(layer) => layer.on_request(ctx).await,
            Layer::Headers(layer) => layer.on_request(ctx),
            Layer::Referer(layer) => layer.on_request(ctx),
            Layer::Sessions(layer) => layer.on_request(ctx).await,
        }
    }

    pub async fn on_response(
        &self,
        ctx: &mut RequestContext,
        err: Option<ProxyError>,
    ) -> Option<ProxyError> {
        match self {
            Layer::Base(layer) => layer.on_response(ctx, err),
            Layer::Auth(_) => err,
            Layer::Adblock(layer) => layer.on_response(ctx, err),
            Layer::DirectAccess(layer) => layer.on_response(ctx, err).await,
            Layer::RateLimit(layer) => layer.on_response(ctx, err),
            Layer::Headers(_) => err,
            Layer::Referer(_) => err,
            Layer::Sessions(layer) => layer.on_response(ctx, err).await,
        }
    }
}

/// Build the pipeline in its fixed order. Optional layers are included only
/// when their configuration enables them.
pub fn build_layers(
    config: &Config,
    stats: &Arc<Stats>,
    upstream_executor: &Executor,
) -> Result<Vec<Layer>> {
    let mut layers = vec![
        Layer::Base(BaseLayer::new(stats.clone())),
        Layer::Auth(AuthLayer::new(&config.api_key)?),
    ];

    if !config.adblock_lists.is_empty() {
        let rules = RuleSet::spawn_load(config.adblock_lists.clone());
        layers.push(Layer::Adblock(AdblockLayer::new(rules, stats.clone())));
    }

    if !config.direct_access_hostpath_regexps.is_empty() {
        layers.push(Layer::DirectAccess(DirectAccessLayer::new(
            &config.direct_access_hostpath_regexps,
            &config.direct_access_except_hostpath_regexps,
            config.direct_access_proxy.as_deref(),
            !config.dont_verify_crawlera_cert,
        )?));
    }

    if config.concurrent_connections > 0 {
        layers.push(Layer::RateLimit(RateLimitLayer::new(
            config.concurrent_connections,
        )));
    }

    layers.push(Layer::Headers(HeadersLayer::new(&config.xheaders)?));
    layers.push(Layer::Referer(RefererLayer::new()));

    if !config.no_auto_sessions {
        layers.push(Layer::Sessions(SessionsLayer::new(
            config.api_key.clone(),
            config.crawlera_addr(),
            upstream_executor.clone(),
            stats.clone(),
        )));
    }

    Ok(layers)
}
