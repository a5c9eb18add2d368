use crate::error::ProxyError;
use crate::proxy::context::RequestContext;
use anyhow::Result;
use http::{HeaderName, HeaderValue};
use std::collections::BTreeMap;

/// Headers the upstream replaces with realistic values when a device
/// profile is active; keeping the browser's own copies would contradict the
/// substituted fingerprint.
const PROFILE_HEADERS_TO_REMOVE: [&str; 5] = [
    "accept",
    "accept-language",
    "dnt",
    "upgrade-insecure-requests",
    "user-agent",
];

const PROFILE_HEADER: &str = "x-crawlera-profile";

/// Applies the configured upstream control headers to every request.
pub struct HeadersLayer {
    xheaders: Vec<(HeaderName, HeaderValue)>,
}

impl HeadersLayer {
    /// `xheaders` keys are already canonical (`X-Crawlera-*`) — the config
    /// layer owns that transformation.
    pub fn new(xheaders: &BTreeMap<String, String>) -> Result<Self> {
        let mut headers = Vec::with_capacity(xheaders.len());
        for (key, value) in xheaders {
            let name = HeaderName::from_bytes(key.as_bytes())
                .map_err(|e| anyhow::anyhow!("invalid xheader name '{}': {}", key, e))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| anyhow::anyhow!("invalid xheader value for '{}': {}", key, e))?;
            headers.push((name, value));
        }
        Ok(Self { xheaders: headers })
    }

    pub fn on_request(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        for (name, value) in &self.xheaders {
            ctx.headers.insert(name.clone(), value.clone());
        }

        let profile = ctx
            .headers
            .get(PROFILE_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if profile == "desktop" || profile == "mobile" {
            for header in PROFILE_HEADERS_TO_REMOVE {
                ctx.headers.remove(header);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    fn context() -> RequestContext {
        RequestContext::new(
            Method::GET,
            "https://example.com/".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:40000".parse().unwrap(),
        )
    }

    fn layer(pairs: &[(&str, &str)]) -> HeadersLayer {
        let map = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        HeadersLayer::new(&map).unwrap()
    }

    #[test]
    fn test_xheaders_applied() {
        let layer = layer(&[("X-Crawlera-Cookies", "disable")]);
        let mut ctx = context();

        layer.on_request(&mut ctx).unwrap();
        assert_eq!(ctx.headers.get("x-crawlera-cookies").unwrap(), "disable");
    }

    #[test]
    fn test_profile_strips_browser_headers() {
        let layer = layer(&[("X-Crawlera-Profile", "desktop")]);
        let mut ctx = context();
        ctx.headers
            .insert("user-agent", HeaderValue::from_static("Mozilla/5.0"));
        ctx.headers
            .insert("accept-language", HeaderValue::from_static("en"));
        ctx.headers
            .insert("cookie", HeaderValue::from_static("a=1"));

        layer.on_request(&mut ctx).unwrap();

        assert!(!ctx.headers.contains_key("user-agent"));
        assert!(!ctx.headers.contains_key("accept-language"));
        assert!(ctx.headers.contains_key("cookie"));
    }

    #[test]
    fn test_other_profile_keeps_headers() {
        let layer = layer(&[("X-Crawlera-Profile", "pass")]);
        let mut ctx = context();
        ctx.headers
            .insert("user-agent", HeaderValue::from_static("Mozilla/5.0"));

        layer.on_request(&mut ctx).unwrap();
        assert!(ctx.headers.contains_key("user-agent"));
    }
}
