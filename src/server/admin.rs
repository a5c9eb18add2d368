use super::ProxyState;
use crate::proxy::context::{full_body, BoxBody};
use hyper::body::Incoming;
use hyper::{Request, Response};

pub fn handle_admin(
    req: Request<Incoming>,
    state: ProxyState,
) -> Result<Response<BoxBody>, hyper::Error> {
    match req.uri().path() {
        "/health" | "/healthz" => Ok(Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(full_body(r#"{"status":"ok"}"#))
            .expect("static response")),

        "/stats" => {
            let body = serde_json::to_string_pretty(&state.stats.snapshot())
                .unwrap_or_else(|_| "{}".to_string());
            Ok(Response::builder()
                .status(200)
                .header("content-type", "application/json")
                .body(full_body(body))
                .expect("static response"))
        }

        "/metrics" => {
            let body = state.metrics.render();
            Ok(Response::builder()
                .status(200)
                .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
                .body(full_body(body))
                .expect("static response"))
        }

        _ => Ok(Response::builder()
            .status(404)
            .header("content-type", "application/json")
            .body(full_body(r#"{"error":"not found"}"#))
            .expect("static response")),
    }
}
