use crate::error::ProxyError;
use crate::proxy::context::RequestContext;
use dashmap::DashMap;
use http::header::REFERER;
use http::{HeaderValue, Uri};
use std::time::{Duration, Instant};

const REFERER_TTL: Duration = Duration::from_secs(10);

/// Synthesizes a plausible `Referer` for requests that lack one, remembering
/// the last value per (client, host) for a short window.
pub struct RefererLayer {
    cache: DashMap<(String, String), (String, Instant)>,
}

impl RefererLayer {
    pub fn new() -> Self {
        Self {
            cache: DashMap::new(),
        }
    }

    pub fn on_request(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        let host = ctx.host();
        let raw = ctx
            .headers
            .get(REFERER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");

        let mut referer = normalize(raw);
        if referer.is_empty() {
            referer = self.get(&ctx.client_id, &host);
        }
        if referer.is_empty() {
            referer = normalize(&ctx.uri.to_string());
        }

        self.set(&ctx.client_id, &host, referer.clone());
        if let Ok(value) = HeaderValue::from_str(&referer) {
            ctx.headers.insert(REFERER, value);
        }

        Ok(())
    }

    fn get(&self, client_id: &str, host: &str) -> String {
        let key = (client_id.to_string(), host.to_string());
        let cached = self.cache.get(&key).map(|entry| entry.value().clone());
        match cached {
            Some((value, deadline)) if deadline > Instant::now() => value,
            Some(_) => {
                self.cache.remove(&key);
                String::new()
            }
            None => String::new(),
        }
    }

    fn set(&self, client_id: &str, host: &str, referer: String) {
        self.cache.insert(
            (client_id.to_string(), host.to_string()),
            (referer, Instant::now() + REFERER_TTL),
        );
    }
}

impl Default for RefererLayer {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalize a referer: strip the fragment and query, drop the default port
/// for the scheme. Values that do not parse as absolute URLs are returned
/// unchanged.
pub(crate) fn normalize(referer: &str) -> String {
    let referer = referer.trim();
    if referer.is_empty() {
        return String::new();
    }

    let without_fragment = referer.split('#').next().unwrap_or(referer);
    let uri: Uri = match without_fragment.parse() {
        Ok(uri) => uri,
        Err(_) => return referer.to_string(),
    };

    let (scheme, authority) = match (uri.scheme_str(), uri.authority()) {
        (Some(scheme), Some(authority)) => (scheme, authority),
        _ => return without_fragment.to_string(),
    };

    let host = authority.host();
    let hostport = match authority.port_u16() {
        Some(80) if scheme == "http" => host.to_string(),
        Some(443) if scheme == "https" => host.to_string(),
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };

    format!("{}://{}{}", scheme, hostport, uri.path())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    fn context(uri: &str, client_id: &str) -> RequestContext {
        let mut ctx = RequestContext::new(
            Method::GET,
            uri.parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:40000".parse().unwrap(),
        );
        ctx.client_id = client_id.to_string();
        ctx
    }

    #[test]
    fn test_normalize_strips_query_and_fragment() {
        assert_eq!(normalize("https://h/p?x=1#f"), "https://h/p");
        assert_eq!(normalize("http://example.com/a/b?q=2"), "http://example.com/a/b");
    }

    #[test]
    fn test_normalize_strips_default_port() {
        assert_eq!(normalize("http://example.com:80/p"), "http://example.com/p");
        assert_eq!(normalize("https://example.com:443/p"), "https://example.com/p");
        assert_eq!(
            normalize("https://example.com:8443/p"),
            "https://example.com:8443/p"
        );
    }

    #[test]
    fn test_normalize_idempotent() {
        for input in [
            "https://h/p?x=1#f",
            "http://example.com:80/p",
            "not a url",
            "/relative/path",
        ] {
            let once = normalize(input);
            assert_eq!(normalize(&once), once);
        }
    }

    #[test]
    fn test_inbound_referer_normalized() {
        let layer = RefererLayer::new();
        let mut ctx = context("https://h/other", "client");
        ctx.headers.insert(
            REFERER,
            HeaderValue::from_static("https://h/p?x=1#f"),
        );

        layer.on_request(&mut ctx).unwrap();
        assert_eq!(ctx.headers.get(REFERER).unwrap(), "https://h/p");
    }

    #[test]
    fn test_backfill_from_url_then_cache() {
        let layer = RefererLayer::new();

        // No referer: fall back to the normalized request URL.
        let mut first = context("https://h/p?x=1", "client");
        layer.on_request(&mut first).unwrap();
        assert_eq!(first.headers.get(REFERER).unwrap(), "https://h/p");

        // Second bare request to the same host within the TTL gets the
        // cached value, not its own URL.
        let mut second = context("https://h/elsewhere", "client");
        layer.on_request(&mut second).unwrap();
        assert_eq!(second.headers.get(REFERER).unwrap(), "https://h/p");
    }

    #[test]
    fn test_cache_is_per_client() {
        let layer = RefererLayer::new();

        let mut first = context("https://h/p", "client-a");
        layer.on_request(&mut first).unwrap();

        let mut second = context("https://h/q", "client-b");
        layer.on_request(&mut second).unwrap();
        assert_eq!(second.headers.get(REFERER).unwrap(), "https://h/q");
    }
}
