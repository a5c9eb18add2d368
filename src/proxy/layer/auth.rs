use crate::error::ProxyError;
use crate::proxy::context::RequestContext;
use anyhow::Result;
use base64::Engine;
use http::header::PROXY_AUTHORIZATION;
use http::HeaderValue;

/// Injects the upstream credential as a basic `Proxy-Authorization` header.
pub struct AuthLayer {
    credential: HeaderValue,
}

impl AuthLayer {
    pub fn new(api_key: &str) -> Result<Self> {
        let encoded = base64::engine::general_purpose::STANDARD.encode(format!("{}:", api_key));
        let credential = HeaderValue::from_str(&format!("Basic {}", encoded))?;
        Ok(Self { credential })
    }

    pub fn on_request(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        ctx.headers
            .insert(PROXY_AUTHORIZATION, self.credential.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::context::RequestContext;
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    #[test]
    fn test_credential_injected() {
        let layer = AuthLayer::new("apikey").unwrap();
        let mut ctx = RequestContext::new(
            Method::GET,
            "http://example.com/".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:40000".parse().unwrap(),
        );

        layer.on_request(&mut ctx).unwrap();

        // base64("apikey:")
        assert_eq!(
            ctx.headers.get(PROXY_AUTHORIZATION).unwrap(),
            "Basic YXBpa2V5Og=="
        );
    }
}
