use crate::error::ProxyError;
use crate::proxy::context::RequestContext;
use crate::stats::Stats;
use hmac::{Hmac, Mac};
use http::StatusCode;
use sha1::Sha1;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};

type HmacSha1 = Hmac<Sha1>;

const BAD_STATUS_CODE: u16 = 400;

/// First layer in, last layer out: assigns the client pseudonym, counts the
/// request, and on the way back classifies the outcome, records timings and
/// writes the access log line.
pub struct BaseLayer {
    stats: Arc<Stats>,
}

impl BaseLayer {
    pub fn new(stats: Arc<Stats>) -> Self {
        Self { stats }
    }

    pub fn on_request(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        ctx.client_id = client_id(ctx.peer_addr.ip(), ctx.user_agent());

        self.stats.new_request();
        metrics::counter!("headless_proxy_requests_total").increment(1);

        debug!(
            request_id = %ctx.request_id,
            client_id = %ctx.client_id,
            remote_addr = %ctx.peer_addr,
            method = %ctx.method,
            url = %ctx.uri,
            "new request"
        );

        Ok(())
    }

    pub fn on_response(
        &self,
        ctx: &mut RequestContext,
        err: Option<ProxyError>,
    ) -> Option<ProxyError> {
        if let Some(ref e) = err {
            self.stats.new_other_error();
            metrics::counter!("headless_proxy_errors_total").increment(1);
            ctx.respond(
                StatusCode::BAD_GATEWAY,
                &format!("cannot dispatch request: {}", e),
            );
        } else if ctx.is_upstream_error() {
            self.stats.new_upstream_error();
            metrics::counter!("headless_proxy_upstream_errors_total").increment(1);
        } else if ctx
            .response_status()
            .map(|s| s.as_u16() >= BAD_STATUS_CODE)
            .unwrap_or(false)
        {
            self.stats.new_other_error();
            metrics::counter!("headless_proxy_errors_total").increment(1);
        }

        if let Some(length) = ctx
            .response_header("content-length")
            .and_then(|v| v.parse::<u64>().ok())
        {
            self.stats.new_traffic(length);
        }

        let elapsed = ctx.start.elapsed();
        self.stats.new_overall_time(elapsed);
        metrics::histogram!("headless_proxy_request_duration_seconds")
            .record(elapsed.as_secs_f64());

        let status = ctx.response_status().map(|s| s.as_u16()).unwrap_or(0);
        info!(
            request_id = %ctx.request_id,
            client_id = %ctx.client_id,
            method = %ctx.method,
            url = %ctx.uri,
            status = status,
            latency_ms = elapsed.as_millis() as u64,
            upstream_ms = ctx.upstream_elapsed.map(|d| d.as_millis() as u64),
            "finish request"
        );

        None
    }
}

/// Stable pseudonym for a downstream client: HMAC-SHA1 of the user agent
/// keyed by the remote IP.
fn client_id(remote_ip: IpAddr, user_agent: &str) -> String {
    let mut mac = HmacSha1::new_from_slice(remote_ip.to_string().as_bytes())
        .expect("hmac accepts any key length");
    mac.update(user_agent.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_stable() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let first = client_id(ip, "Mozilla/5.0");
        let second = client_id(ip, "Mozilla/5.0");
        assert_eq!(first, second);
        assert_eq!(first.len(), 40);
    }

    #[test]
    fn test_client_id_varies() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        let other_ip: IpAddr = "10.0.0.2".parse().unwrap();
        assert_ne!(client_id(ip, "agent-a"), client_id(ip, "agent-b"));
        assert_ne!(client_id(ip, "agent-a"), client_id(other_ip, "agent-a"));
    }
}
