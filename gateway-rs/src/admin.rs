//! Routing admin API
//!
//! Creates, reads and deletes routing entries. Every request passes the
//! bearer/allow-list gate first.

use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Path, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use subtle::ConstantTimeEq;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ApiConfig;
use crate::dispatch::parse_target;
use crate::error::{GatewayError, Result};
use crate::response::{message, SERVER_NAME};
use crate::store::{SharedStore, StoreError};

/// Admin API state
pub struct AdminState {
    store: SharedStore,
    token: String,
    allowed_ips: Vec<IpAddr>,
}

impl AdminState {
    pub fn new(store: SharedStore, config: &ApiConfig) -> Result<Self> {
        let allowed_ips = config
            .allowed_ips
            .iter()
            .map(|ip| {
                ip.parse::<IpAddr>()
                    .map_err(|_| GatewayError::Config(format!("Invalid allowed IP: {}", ip)))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            store,
            token: config.token.clone(),
            allowed_ips,
        })
    }
}

/// Create payload
#[derive(Debug, Deserialize)]
pub struct CreateSeed {
    pub name: String,
    pub target: String,
}

/// A routing entry as returned by read
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SeedEntry {
    pub name: String,
    pub target: String,
}

/// Build the admin router
pub fn router(state: Arc<AdminState>) -> Router {
    Router::new()
        .route("/", put(create_seed).fallback(not_found))
        .route("/:name", get(read_seed).delete(delete_seed).fallback(not_found))
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), auth_middleware))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            header::SERVER,
            HeaderValue::from_static(SERVER_NAME),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn unauthorized() -> Response {
    message(StatusCode::UNAUTHORIZED, "Unauthorized to access this endpoint.")
}

/// Authentication middleware - bearer token and caller allow-list
///
/// Checks run in a fixed order and every failure gets the same response.
async fn auth_middleware(
    State(state): State<Arc<AdminState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.split_once(' '))
        .and_then(|(scheme, token)| (scheme == "Bearer").then_some(token));

    let token = match presented {
        Some(token) => token,
        None => {
            warn!("Admin request without bearer token");
            return unauthorized();
        }
    };

    let caller = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_canonical());
    match caller {
        Some(ip) if state.allowed_ips.contains(&ip) => {}
        other => {
            warn!("Admin request from address not allowed: {:?}", other);
            return unauthorized();
        }
    }

    if state.token.is_empty() {
        warn!("Admin request refused, no API token configured");
        return unauthorized();
    }

    if !bool::from(token.as_bytes().ct_eq(state.token.as_bytes())) {
        warn!("Admin request with invalid token");
        return unauthorized();
    }

    next.run(req).await
}

async fn not_found() -> Response {
    message(StatusCode::NOT_FOUND, "Not found.")
}

/// PUT / - create a routing entry if the name is free
async fn create_seed(State(state): State<Arc<AdminState>>, body: Bytes) -> Response {
    let payload: CreateSeed = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            warn!("Malformed create payload: {}", e);
            return message(StatusCode::BAD_REQUEST, "Malformed JSON body was sent.");
        }
    };

    if payload.name.is_empty() {
        return message(StatusCode::BAD_REQUEST, "Name must not be empty.");
    }

    match state.store.seed(&payload.name).await {
        Ok(_) => {
            warn!("Refusing to overwrite seed {}", payload.name);
            return message(StatusCode::NOT_FOUND, "Name is unavailable.");
        }
        Err(StoreError::NotFound(_)) => {}
        Err(StoreError::Backend(e)) => {
            error!("Could not check seed {}: {}", payload.name, e);
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Could not check seed.");
        }
    }

    if parse_target(&payload.target).is_none() {
        warn!("Unusable target for {}: {:?}", payload.name, payload.target);
        return message(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Could not parse target URL.",
        );
    }

    if let Err(e) = state.store.put_seed(&payload.name, &payload.target).await {
        error!("Could not put seed {}: {}", payload.name, e);
        return message(StatusCode::INTERNAL_SERVER_ERROR, "Could not put seed.");
    }

    info!("Put seed {} -> {}", payload.name, payload.target);
    message(StatusCode::OK, "Successfully put seed to store.")
}

/// GET /:name - read a routing entry
async fn read_seed(State(state): State<Arc<AdminState>>, Path(name): Path<String>) -> Response {
    match state.store.seed(&name).await {
        Ok(target) => Json(SeedEntry { name, target }).into_response(),
        Err(StoreError::NotFound(_)) => message(StatusCode::NOT_FOUND, "Seed not found."),
        Err(StoreError::Backend(e)) => {
            error!("Could not get seed {}: {}", name, e);
            message(StatusCode::INTERNAL_SERVER_ERROR, "Could not get seed.")
        }
    }
}

/// DELETE /:name - remove an existing routing entry
async fn delete_seed(State(state): State<Arc<AdminState>>, Path(name): Path<String>) -> Response {
    // a missing name is a server error here, unlike create's 404
    match state.store.seed(&name).await {
        Ok(_) => {}
        Err(StoreError::NotFound(_)) => {
            warn!("Delete of unknown seed {}", name);
            return message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Could not find seed to delete.",
            );
        }
        Err(StoreError::Backend(e)) => {
            error!("Could not check seed {}: {}", name, e);
            return message(StatusCode::INTERNAL_SERVER_ERROR, "Could not check seed.");
        }
    }

    if let Err(e) = state.store.delete_seed(&name).await {
        error!("Could not delete seed {}: {}", name, e);
        return message(StatusCode::INTERNAL_SERVER_ERROR, "Could not delete seed.");
    }

    info!("Deleted seed {}", name);
    message(StatusCode::OK, "Successfully deleted seed from store.")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::response::ApiMessage;
    use crate::store::{MemoryStore, SeedStore};
    use axum::body::to_bytes;
    use tower::ServiceExt;

    const TOKEN: &str = "s3cret";

    fn api_config() -> ApiConfig {
        ApiConfig {
            token: TOKEN.to_string(),
            allowed_ips: vec!["127.0.0.1".to_string(), "::1".to_string()],
            ..ApiConfig::default()
        }
    }

    fn setup() -> (Router, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let state = AdminState::new(store.clone(), &api_config()).unwrap();
        (router(Arc::new(state)), store)
    }

    fn request(method: &str, uri: &str, auth: Option<&str>, from: &str, body: &str) -> Request<Body> {
        let mut builder = Request::builder()
            .method(method)
            .uri(uri)
            .extension(ConnectInfo(from.parse::<SocketAddr>().unwrap()));
        if let Some(auth) = auth {
            builder = builder.header(header::AUTHORIZATION, auth);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    fn authed(method: &str, uri: &str, body: &str) -> Request<Body> {
        request(method, uri, Some("Bearer s3cret"), "127.0.0.1:40000", body)
    }

    async fn message_of(response: Response) -> String {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice::<ApiMessage>(&body).unwrap().message
    }

    const CREATE: &str = r#"{"name":"a.example","target":"http://127.0.0.1:9000"}"#;

    #[tokio::test]
    async fn test_create_seed() {
        let (app, store) = setup();
        let response = app.oneshot(authed("PUT", "/", CREATE)).await.unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()[header::SERVER], SERVER_NAME);
        assert_eq!(message_of(response).await, "Successfully put seed to store.");
        assert_eq!(store.seed("a.example").await.unwrap(), "http://127.0.0.1:9000");
    }

    #[tokio::test]
    async fn test_create_taken_name_is_not_found() {
        let (app, store) = setup();
        store.put_seed("a.example", "http://127.0.0.1:8000").await.unwrap();

        let response = app.oneshot(authed("PUT", "/", CREATE)).await.unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(message_of(response).await, "Name is unavailable.");
        assert_eq!(store.seed("a.example").await.unwrap(), "http://127.0.0.1:8000");
    }

    #[tokio::test]
    async fn test_create_malformed_json() {
        let (app, store) = setup();
        let response = app.oneshot(authed("PUT", "/", "{not json")).await.unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(message_of(response).await, "Malformed JSON body was sent.");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_empty_name() {
        let (app, store) = setup();
        let response = app
            .oneshot(authed("PUT", "/", r#"{"name":"","target":"http://127.0.0.1:9000"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_create_bad_target() {
        let (app, store) = setup();
        let response = app
            .oneshot(authed("PUT", "/", r#"{"name":"a.example","target":"nope"}"#))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(message_of(response).await, "Could not parse target URL.");
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_read_seed() {
        let (app, store) = setup();
        store.put_seed("a.example", "http://127.0.0.1:9000").await.unwrap();

        let response = app
            .clone()
            .oneshot(authed("GET", "/a.example", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let entry: SeedEntry = serde_json::from_slice(&body).unwrap();
        assert_eq!(entry.target, "http://127.0.0.1:9000");

        let response = app.oneshot(authed("GET", "/b.example", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_delete_seed() {
        let (app, store) = setup();
        store.put_seed("a.example", "http://127.0.0.1:9000").await.unwrap();

        let response = app
            .clone()
            .oneshot(authed("DELETE", "/a.example", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            message_of(response).await,
            "Successfully deleted seed from store."
        );
        assert!(store.seed("a.example").await.unwrap_err().is_not_found());

        // second delete reports the missing name as a server error
        let response = app
            .oneshot(authed("DELETE", "/a.example", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_unknown_route_is_not_found() {
        let (app, _) = setup();

        let response = app
            .clone()
            .oneshot(authed("POST", "/", CREATE))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(message_of(response).await, "Not found.");

        let response = app.oneshot(authed("GET", "/a/b", "")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_unauthorized_requests_leave_store_unchanged() {
        let cases = [
            (None, "127.0.0.1:40000"),
            (Some("Bearer wrong"), "127.0.0.1:40000"),
            (Some("Basic s3cret"), "127.0.0.1:40000"),
            (Some("Bearers3cret"), "127.0.0.1:40000"),
            (Some("Bearer s3cret"), "10.0.0.1:40000"),
        ];

        for (auth, from) in cases {
            let (app, store) = setup();
            let response = app
                .oneshot(request("PUT", "/", auth, from, CREATE))
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::UNAUTHORIZED, "{:?} {}", auth, from);
            assert_eq!(
                message_of(response).await,
                "Unauthorized to access this endpoint."
            );
            assert!(store.is_empty().await);
        }
    }

    #[tokio::test]
    async fn test_unauthorized_before_not_found() {
        let (app, _) = setup();
        let response = app
            .oneshot(request("GET", "/nowhere/at/all", None, "127.0.0.1:1", ""))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_empty_configured_token_refuses_everything() {
        let store = Arc::new(MemoryStore::new());
        let config = ApiConfig {
            token: String::new(),
            ..api_config()
        };
        let app = router(Arc::new(AdminState::new(store.clone(), &config).unwrap()));

        let response = app
            .oneshot(request("PUT", "/", Some("Bearer "), "127.0.0.1:40000", CREATE))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_ipv6_loopback_allowed() {
        let (app, _) = setup();
        let response = app
            .oneshot(request("PUT", "/", Some("Bearer s3cret"), "[::1]:40000", CREATE))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_invalid_allowed_ip_rejected() {
        let config = ApiConfig {
            allowed_ips: vec!["localhost".to_string()],
            ..api_config()
        };
        let result = AdminState::new(Arc::new(MemoryStore::new()), &config);
        assert!(matches!(result, Err(GatewayError::Config(_))));
    }
}
