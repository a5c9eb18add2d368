pub mod context;
pub mod executor;
pub mod layer;
pub mod session_manager;

use crate::server::ProxyState;
use context::{full_body, BoxBody, RequestContext};
use http::header::{HeaderName, CONNECTION, HOST, TRANSFER_ENCODING};
use http::{Response, StatusCode, Uri};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::Request;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Session token carried on requests to the upstream; `"create"` requests a
/// fresh session.
pub const X_CRAWLERA_SESSION: &str = "x-crawlera-session";
/// Non-empty value marks an upstream soft failure, regardless of the HTTP
/// status.
pub const X_CRAWLERA_ERROR: &str = "x-crawlera-error";

/// Run one request through the layer pipeline.
///
/// `tunnel_authority` is set for requests that arrived through a CONNECT
/// tunnel; their origin-form URIs are rebuilt as absolute `https://` URIs
/// before entering the pipeline.
pub async fn handle_request(
    req: Request<Incoming>,
    state: ProxyState,
    peer_addr: SocketAddr,
    tunnel_authority: Option<String>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let uri = match absolute_uri(&req, tunnel_authority.as_deref()) {
        Some(uri) => uri,
        None => {
            debug!(uri = %req.uri(), "cannot resolve absolute request URI");
            return Ok(synthetic_response(
                StatusCode::BAD_REQUEST,
                "cannot resolve request target",
            ));
        }
    };

    let mut headers = req.headers().clone();
    remove_hop_headers(&mut headers);

    // The body stays buffered so the Sessions layer can replay the request
    // on retry.
    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            warn!(error = %e, "cannot read request body");
            return Ok(synthetic_response(
                StatusCode::BAD_REQUEST,
                "cannot read request body",
            ));
        }
    };

    let mut ctx = RequestContext::new(method, uri, headers, body, peer_addr);

    state.stats.client_serving(true);
    run_pipeline(&state, &mut ctx).await;
    state.stats.client_serving(false);

    let mut response = ctx.response.take().unwrap_or_else(|| {
        synthetic_response(StatusCode::BAD_GATEWAY, "no response from the pipeline")
    });
    remove_hop_headers(response.headers_mut());
    Ok(response)
}

/// Apply the layers in order, dispatch upstream, unwind in reverse.
///
/// An error from an `on_request` hook skips the remaining request hooks and
/// the executor; the response unwind starts from the failing layer so every
/// entered layer sees its `on_response`.
async fn run_pipeline(state: &ProxyState, ctx: &mut RequestContext) {
    let layers = &state.layers;
    let mut error = None;
    let mut entered = 0;

    for layer in layers.iter() {
        entered += 1;
        if let Err(e) = layer.on_request(ctx).await {
            error = Some(e);
            break;
        }
    }

    if error.is_none() {
        error = state.executor.execute(ctx).await.err();
    }

    for layer in layers[..entered].iter().rev() {
        error = layer.on_response(ctx, error).await;
    }
}

/// The absolute target URI for the request: proxy-style requests already
/// carry one; tunneled requests are rebuilt from the CONNECT authority;
/// origin-form requests fall back to the Host header.
fn absolute_uri(req: &Request<Incoming>, tunnel_authority: Option<&str>) -> Option<Uri> {
    let uri = req.uri();
    if uri.scheme().is_some() && uri.authority().is_some() {
        return Some(uri.clone());
    }

    let path_and_query = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");

    if let Some(authority) = tunnel_authority {
        let host = authority
            .strip_suffix(":443")
            .unwrap_or(authority);
        return format!("https://{}{}", host, path_and_query).parse().ok();
    }

    let host = req.headers().get(HOST)?.to_str().ok()?;
    format!("http://{}{}", host, path_and_query).parse().ok()
}

fn synthetic_response(status: StatusCode, body: &str) -> Response<BoxBody> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(full_body(body.to_string()))
        .expect("static response")
}

/// Hop-by-hop headers never cross the proxy in either direction.
fn remove_hop_headers(headers: &mut http::HeaderMap) {
    let hop_headers: &[HeaderName] = &[
        CONNECTION,
        HeaderName::from_static("keep-alive"),
        HeaderName::from_static("proxy-connection"),
        HeaderName::from_static("proxy-authenticate"),
        HeaderName::from_static("proxy-authorization"),
        HeaderName::from_static("te"),
        HeaderName::from_static("trailers"),
        TRANSFER_ENCODING,
        HeaderName::from_static("upgrade"),
    ];

    for header in hop_headers {
        headers.remove(header);
    }
}
