use crate::error::ProxyError;
use crate::proxy::context::RequestContext;
use crate::proxy::executor::Executor;
use anyhow::Result;
use regex::Regex;
use tracing::debug;

/// Routes selected URLs around the upstream: rules pick requests out of the
/// pipeline, exceptions force them back upstream, and matched requests are
/// re-dispatched through this layer's own executor on the response path.
pub struct DirectAccessLayer {
    rules: Vec<Regex>,
    exceptions: Vec<Regex>,
    executor: Executor,
}

impl DirectAccessLayer {
    pub fn new(
        rules: &[String],
        exceptions: &[String],
        proxy: Option<&str>,
        verify_tls: bool,
    ) -> Result<Self> {
        let executor = match proxy {
            Some(addr) => Executor::alternate_proxy(addr.to_string()),
            None => Executor::direct(verify_tls),
        };

        Ok(Self {
            rules: compile(rules)?,
            exceptions: compile(exceptions)?,
            executor,
        })
    }

    pub fn on_request(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        let hostpath = format!("{}{}", ctx.host(), ctx.uri.path());

        if self.exceptions.iter().any(|r| r.is_match(&hostpath)) {
            return Ok(());
        }
        if self.rules.iter().any(|r| r.is_match(&hostpath)) {
            return Err(ProxyError::DirectAccess);
        }
        Ok(())
    }

    pub async fn on_response(
        &self,
        ctx: &mut RequestContext,
        err: Option<ProxyError>,
    ) -> Option<ProxyError> {
        if err != Some(ProxyError::DirectAccess) {
            return err;
        }

        debug!(url = %ctx.uri, "dispatching request off the upstream");
        match self.executor.execute(ctx).await {
            Ok(()) => None,
            Err(e) => Some(e),
        }
    }
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(Into::into))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method};

    fn context(uri: &str) -> RequestContext {
        RequestContext::new(
            Method::GET,
            uri.parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:40000".parse().unwrap(),
        )
    }

    fn layer(rules: &[&str], exceptions: &[&str]) -> DirectAccessLayer {
        DirectAccessLayer::new(
            &rules.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            &exceptions.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
            None,
            true,
        )
        .unwrap()
    }

    #[test]
    fn test_rule_matches_hostpath() {
        let layer = layer(&[r"^internal\.example\.com/"], &[]);

        let mut ctx = context("https://internal.example.com/status");
        assert_eq!(
            layer.on_request(&mut ctx),
            Err(ProxyError::DirectAccess)
        );

        let mut ctx = context("https://example.com/internal.example.com");
        assert!(layer.on_request(&mut ctx).is_ok());
    }

    #[test]
    fn test_exception_wins() {
        let layer = layer(
            &[r"^internal\.example\.com/"],
            &[r"^internal\.example\.com/admin"],
        );

        let mut ctx = context("https://internal.example.com/admin/panel");
        assert!(layer.on_request(&mut ctx).is_ok());

        let mut ctx = context("https://internal.example.com/other");
        assert_eq!(
            layer.on_request(&mut ctx),
            Err(ProxyError::DirectAccess)
        );
    }

    #[tokio::test]
    async fn test_foreign_error_passes_through() {
        let layer = layer(&[r"^x/"], &[]);
        let mut ctx = context("https://example.com/");
        let err = layer
            .on_response(&mut ctx, Some(ProxyError::UpstreamTimeout))
            .await;
        assert_eq!(err, Some(ProxyError::UpstreamTimeout));
    }
}
