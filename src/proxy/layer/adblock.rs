use crate::adblock::{MatchRequest, RuleSet};
use crate::error::ProxyError;
use crate::proxy::context::RequestContext;
use crate::stats::Stats;
use http::StatusCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const MATCH_TIMEOUT: Duration = Duration::from_secs(2);

/// Short-circuits requests matched by the ad-block rule set.
///
/// Until the background loader finishes, requests wait on the load gate so
/// that nothing is matched against a partial rule set.
pub struct AdblockLayer {
    rules: Arc<RuleSet>,
    stats: Arc<Stats>,
}

impl AdblockLayer {
    pub fn new(rules: Arc<RuleSet>, stats: Arc<Stats>) -> Self {
        Self { rules, stats }
    }

    pub async fn on_request(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        self.rules.wait_loaded().await;
        let matcher = match self.rules.matcher() {
            Some(matcher) => matcher,
            None => return Ok(()),
        };

        let request = MatchRequest {
            url: ctx.uri.to_string(),
            domain: ctx.host(),
            content_type: header_value(ctx, http::header::CONTENT_TYPE.as_str()),
            origin_domain: referer_domain(ctx),
        };

        let verdict = tokio::time::timeout(
            MATCH_TIMEOUT,
            tokio::task::spawn_blocking(move || matcher.matches(&request)),
        )
        .await;

        let matched = match verdict {
            Ok(Ok(matched)) => matched,
            Ok(Err(e)) => {
                debug!(error = %e, "cannot match request");
                false
            }
            Err(_) => {
                debug!(url = %ctx.uri, "adblock match timed out");
                false
            }
        };

        if matched {
            return Err(ProxyError::Adblocked);
        }
        Ok(())
    }

    pub fn on_response(
        &self,
        ctx: &mut RequestContext,
        err: Option<ProxyError>,
    ) -> Option<ProxyError> {
        if err == Some(ProxyError::Adblocked) {
            self.stats.new_adblocked_request();
            metrics::counter!("headless_proxy_adblocked_total").increment(1);
            ctx.respond(StatusCode::FORBIDDEN, "Request was adblocked");
            debug!(url = %ctx.uri, "request was adblocked");
            return None;
        }
        err
    }
}

fn header_value(ctx: &RequestContext, name: &str) -> String {
    ctx.headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string()
}

/// Origin domain for third-party checks: the host part of the Referer.
fn referer_domain(ctx: &RequestContext) -> String {
    let referer = header_value(ctx, http::header::REFERER.as_str());
    if referer.is_empty() {
        return referer;
    }
    referer
        .parse::<http::Uri>()
        .ok()
        .and_then(|uri| uri.host().map(|h| h.to_string()))
        .unwrap_or(referer)
}
