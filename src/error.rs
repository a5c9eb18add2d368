use std::fmt;

/// Errors flowing through the layer pipeline.
///
/// `Adblocked` and `DirectAccess` are control-flow sentinels: the layer that
/// produced one recognizes it in its own `on_response` hook and converts it
/// into a synthetic or re-dispatched response. Every other variant surfaces
/// to the client as a 502-class response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyError {
    Adblocked,
    DirectAccess,
    UpstreamConnect(String),
    UpstreamTransport(String),
    UpstreamTimeout,
    Internal(String),
}

impl fmt::Display for ProxyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyError::Adblocked => write!(f, "request was adblocked"),
            ProxyError::DirectAccess => write!(f, "direct access to the url"),
            ProxyError::UpstreamConnect(msg) => write!(f, "upstream connect error: {}", msg),
            ProxyError::UpstreamTransport(msg) => write!(f, "upstream transport error: {}", msg),
            ProxyError::UpstreamTimeout => write!(f, "upstream timeout"),
            ProxyError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl std::error::Error for ProxyError {}
