//! HTTP to HTTPS redirect service for the plaintext listener

use axum::{
    body::Body,
    http::{header, HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::debug;

use crate::dispatch::strip_port;
use crate::response::{message, SERVER_NAME};

/// Router answering every request with a permanent redirect to HTTPS
pub fn router() -> Router {
    Router::new()
        .fallback(redirect_handler)
        .layer(SetResponseHeaderLayer::overriding(
            header::CONNECTION,
            HeaderValue::from_static("close"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::SERVER,
            HeaderValue::from_static(SERVER_NAME),
        ))
        .layer(TraceLayer::new_for_http())
}

/// HTTPS location for a plaintext request, if it names a host
pub fn https_location(req: &Request<Body>) -> Option<String> {
    let raw = match req.uri().authority() {
        Some(authority) => authority.host(),
        None => req.headers().get(header::HOST)?.to_str().ok()?,
    };

    let host = strip_port(raw)
        .trim_start_matches('[')
        .trim_end_matches(']');
    if host.is_empty() {
        return None;
    }

    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    if host.contains(':') {
        Some(format!("https://[{}]{}", host, path))
    } else {
        Some(format!("https://{}{}", host, path))
    }
}

async fn redirect_handler(req: Request<Body>) -> Response {
    match https_location(&req) {
        Some(location) => {
            debug!("Redirecting {} to {}", req.uri(), location);
            match HeaderValue::from_str(&location) {
                Ok(value) => {
                    (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, value)]).into_response()
                }
                Err(_) => message(StatusCode::BAD_REQUEST, "request host is invalid"),
            }
        }
        None => message(StatusCode::BAD_REQUEST, "request host is missing"),
    }
}
