//! Uniform JSON responses
//!
//! Every error the gateway produces itself is rendered as
//! `{"message": "..."}` with `nosniff` and the gateway's `Server` header.

use axum::{
    error_handling::HandleErrorLayer,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    BoxError, Json, Router,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tower::timeout::error::Elapsed;
use tower::ServiceBuilder;
use tracing::{error, warn};

/// Value of the `Server` header on gateway-generated responses
pub const SERVER_NAME: &str = "gateway-rs";

/// JSON body carrying a human readable message
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ApiMessage {
    pub message: String,
}

impl ApiMessage {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_string(),
        }
    }
}

/// Build a JSON message response with the gateway's identification headers
pub fn message(status: StatusCode, text: &str) -> Response {
    let mut response = (status, Json(ApiMessage::new(text))).into_response();
    let headers = response.headers_mut();
    headers.insert(header::SERVER, HeaderValue::from_static(SERVER_NAME));
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    response
}

/// Bound the time `router` may take to produce a response
///
/// Expiry answers `408` with a JSON message.
pub fn with_timeout(router: Router, timeout: Duration) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(HandleErrorLayer::new(handle_timeout_error))
            .timeout(timeout),
    )
}

async fn handle_timeout_error(err: BoxError) -> Response {
    if err.is::<Elapsed>() {
        warn!("Request timed out");
        message(StatusCode::REQUEST_TIMEOUT, "request timed out")
    } else {
        error!("Unhandled service error: {}", err);
        message(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, routing::get};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_message_headers_and_body() {
        let response = message(StatusCode::BAD_REQUEST, "nope");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(response.headers()[header::SERVER], SERVER_NAME);
        assert_eq!(response.headers()[header::X_CONTENT_TYPE_OPTIONS], "nosniff");
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: ApiMessage = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, ApiMessage::new("nope"));
    }

    #[tokio::test]
    async fn test_timeout_answers_json() {
        let slow = Router::new().route(
            "/",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "late"
            }),
        );
        let app = with_timeout(slow, Duration::from_millis(50));

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert_eq!(response.headers()[header::CONTENT_TYPE], "application/json");
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let parsed: ApiMessage = serde_json::from_slice(&body).unwrap();
        assert_eq!(parsed, ApiMessage::new("request timed out"));
    }

    #[tokio::test]
    async fn test_fast_response_passes_through() {
        let app = with_timeout(
            Router::new().route("/", get(|| async { "ok" })),
            Duration::from_secs(5),
        );

        let response = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
