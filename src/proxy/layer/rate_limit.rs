use crate::error::ProxyError;
use crate::proxy::context::RequestContext;
use std::sync::Arc;
use tokio::sync::Semaphore;

/// Caps the number of requests concurrently past this layer. The owned
/// permit lives in the context, so it is released on every exit path —
/// including errors and client disconnects — when the context drops.
pub struct RateLimitLayer {
    semaphore: Arc<Semaphore>,
}

impl RateLimitLayer {
    pub fn new(concurrent_connections: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrent_connections)),
        }
    }

    pub async fn on_request(&self, ctx: &mut RequestContext) -> Result<(), ProxyError> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| ProxyError::Internal("rate limiter closed".to_string()))?;
        ctx.rate_limit_permit = Some(permit);
        Ok(())
    }

    pub fn on_response(
        &self,
        ctx: &mut RequestContext,
        err: Option<ProxyError>,
    ) -> Option<ProxyError> {
        ctx.rate_limit_permit.take();
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use http::{HeaderMap, Method};
    use std::time::Duration;

    fn context() -> RequestContext {
        RequestContext::new(
            Method::GET,
            "http://example.com/".parse().unwrap(),
            HeaderMap::new(),
            Bytes::new(),
            "127.0.0.1:40000".parse().unwrap(),
        )
    }

    #[tokio::test]
    async fn test_acquire_and_release() {
        let layer = RateLimitLayer::new(2);
        let mut ctx = context();

        layer.on_request(&mut ctx).await.unwrap();
        assert_eq!(layer.semaphore.available_permits(), 1);

        layer.on_response(&mut ctx, None);
        assert_eq!(layer.semaphore.available_permits(), 2);
    }

    #[tokio::test]
    async fn test_second_request_waits_for_release() {
        let layer = Arc::new(RateLimitLayer::new(1));
        let mut first = context();
        layer.on_request(&mut first).await.unwrap();

        let contender = {
            let layer = layer.clone();
            tokio::spawn(async move {
                let mut second = context();
                layer.on_request(&mut second).await.unwrap();
            })
        };

        // The second request must be parked while the first holds the permit.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!contender.is_finished());

        layer.on_response(&mut first, None);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("second request should pass after release")
            .unwrap();
    }
}
