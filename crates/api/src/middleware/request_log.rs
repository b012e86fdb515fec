use std::time::Instant;

use axum::{body::Body, http::Request, middleware::Next, response::Response};
use tracing::{error, info, warn};

/// Log every request with method, path, status and latency. Level follows
/// the response class.
pub async fn request_log(req: Request<Body>, next: Next) -> Response {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let start = Instant::now();

    let response = next.run(req).await;

    let status = response.status().as_u16();
    let latency_ms = start.elapsed().as_millis() as u64;

    if status >= 500 {
        error!(%method, %path, status, latency_ms, "http request");
    } else if status >= 400 {
        warn!(%method, %path, status, latency_ms, "http request");
    } else {
        info!(%method, %path, status, latency_ms, "http request");
    }

    response
}
