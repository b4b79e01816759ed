//! Forward dispatcher
//!
//! Resolves the requested hostname through the routing store and forwards
//! the request to the stored target as a single-origin reverse proxy.

use axum::{
    body::Body,
    extract::State,
    http::{header, HeaderMap, HeaderValue, Request, StatusCode, Uri},
    response::Response,
    Router,
};
use http_body_util::{LengthLimitError, Limited};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, warn};
use url::{Position, Url};

use crate::error::{GatewayError, Result};
use crate::response::{message, SERVER_NAME};
use crate::store::{SharedStore, StoreError};

/// Headers that only apply to a single connection
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Facts about the connection a request arrived on
///
/// Listeners attach this to every request as an extension.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Peer address
    pub remote_addr: SocketAddr,
    /// Whether the connection is TLS
    pub tls: bool,
    /// Server name the client sent during the TLS handshake
    pub server_name: Option<String>,
}

/// Shared dispatcher state
pub struct ForwardState {
    /// Routing store
    pub store: SharedStore,
    /// HTTP client for forwarding
    pub client: reqwest::Client,
    /// Request body cap in bytes
    pub max_body_bytes: usize,
    /// Require the request host to equal the TLS server name
    pub strict_identity: bool,
    /// Time allowed for the backend to send a response head
    pub response_timeout: Duration,
}

impl ForwardState {
    /// Create dispatcher state with a fresh forwarding client
    pub fn new(
        store: SharedStore,
        max_body_bytes: usize,
        strict_identity: bool,
        response_timeout: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .no_proxy()
            .connect_timeout(Duration::from_secs(10))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| GatewayError::Config(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            store,
            client,
            max_body_bytes,
            strict_identity,
            response_timeout,
        })
    }
}

/// Build the proxy router: every path and method goes to the dispatcher
pub fn router(state: Arc<ForwardState>) -> Router {
    Router::new()
        .fallback(forward_handler)
        .layer(SetResponseHeaderLayer::if_not_present(
            header::SERVER,
            HeaderValue::from_static(SERVER_NAME),
        ))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Strip the port from `host:port`, `[v6]:port` or `[v6%zone]:port`
///
/// Input that is not in one of those forms is returned unchanged.
pub fn strip_port(hostport: &str) -> &str {
    if let Some(rest) = hostport.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) if rest[end + 1..].starts_with(':') => &rest[..end],
            _ => hostport,
        };
    }

    match hostport.rsplit_once(':') {
        Some((host, _)) if !host.contains(':') => host,
        _ => hostport,
    }
}

/// Hostname the request is addressed to, without port
pub fn request_host(req: &Request<Body>) -> Option<String> {
    let raw = match req.uri().authority() {
        Some(authority) => authority.as_str().rsplit('@').next().unwrap_or_default(),
        None => req.headers().get(header::HOST)?.to_str().ok()?,
    };

    let host = strip_port(raw);
    (!host.is_empty()).then(|| host.to_string())
}

/// Parse a stored target; only absolute http(s) URLs with a host qualify
pub fn parse_target(target: &str) -> Option<Url> {
    Url::parse(target)
        .ok()
        .filter(|url| matches!(url.scheme(), "http" | "https") && url.host_str().is_some())
}

fn join_paths(base: &str, path: &str) -> String {
    match (base.ends_with('/'), path.starts_with('/')) {
        (true, true) => format!("{}{}", base, &path[1..]),
        (false, false) => format!("{}/{}", base, path),
        _ => format!("{}{}", base, path),
    }
}

/// URL the request is forwarded to: target origin, joined path, merged query
pub fn forward_url(target: &Url, uri: &Uri) -> String {
    let origin = &target[..Position::BeforePath];
    let path = join_paths(target.path(), uri.path());

    let query = match (target.query().filter(|q| !q.is_empty()), uri.query().filter(|q| !q.is_empty())) {
        (Some(t), Some(r)) => format!("?{}&{}", t, r),
        (Some(q), None) | (None, Some(q)) => format!("?{}", q),
        (None, None) => String::new(),
    };

    format!("{}{}{}", origin, path, query)
}

fn remove_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();
    for name in listed {
        headers.remove(name.as_str());
    }

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

fn add_forwarded_headers(headers: &mut HeaderMap, host: &str, conn: Option<&ConnectionInfo>) {
    if let Some(conn) = conn {
        let client_ip = conn.remote_addr.ip().to_string();
        let forwarded_for = match headers
            .get("x-forwarded-for")
            .and_then(|value| value.to_str().ok())
        {
            Some(prior) => format!("{}, {}", prior, client_ip),
            None => client_ip,
        };
        if let Ok(value) = HeaderValue::from_str(&forwarded_for) {
            headers.insert("x-forwarded-for", value);
        }
    }

    if let Ok(value) = HeaderValue::from_str(host) {
        headers.insert("x-forwarded-host", value);
    }

    let proto = if conn.map_or(false, |c| c.tls) { "https" } else { "http" };
    headers.insert("x-forwarded-proto", HeaderValue::from_static(proto));
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)?
        .to_str()
        .ok()?
        .parse()
        .ok()
}

fn body_limit_exceeded(err: &reqwest::Error) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = source {
        if e.is::<LengthLimitError>() {
            return true;
        }
        source = e.source();
    }
    false
}

/// Main dispatcher - resolves the host and forwards to its target
pub async fn forward_handler(State(state): State<Arc<ForwardState>>, req: Request<Body>) -> Response {
    let conn = req.extensions().get::<ConnectionInfo>().cloned();

    let host = match request_host(&req) {
        Some(host) => host,
        None => {
            debug!("Request without host");
            return message(StatusCode::BAD_REQUEST, "request host is missing");
        }
    };

    if state.strict_identity {
        if let Some(conn) = conn.as_ref().filter(|c| c.tls) {
            if conn.server_name.as_deref() != Some(host.as_str()) {
                warn!(
                    "Request host {} differs from TLS server name {:?}",
                    host, conn.server_name
                );
                return message(
                    StatusCode::BAD_REQUEST,
                    "request host and TLS server name differ",
                );
            }
        }
    }

    let target = match state.store.seed(&host).await {
        Ok(target) => target,
        Err(StoreError::NotFound(_)) => {
            warn!("No target found for {}", host);
            return message(StatusCode::INTERNAL_SERVER_ERROR, "no matching target found");
        }
        Err(StoreError::Backend(e)) => {
            error!("Routing store lookup for {} failed: {}", host, e);
            return message(
                StatusCode::INTERNAL_SERVER_ERROR,
                "could not reach routing store",
            );
        }
    };

    let target_url = match parse_target(&target) {
        Some(url) => url,
        None => {
            error!("Stored target for {} is not a usable URL: {:?}", host, target);
            return message(StatusCode::INTERNAL_SERVER_ERROR, "could not parse target URL");
        }
    };

    if declared_length(req.headers()).map_or(false, |len| len > state.max_body_bytes as u64) {
        warn!("Request body for {} exceeds {} bytes", host, state.max_body_bytes);
        return message(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
    }

    let url = forward_url(&target_url, req.uri());
    debug!("Forwarding {} {} to {}", req.method(), host, url);

    let (parts, body) = req.into_parts();
    let mut headers = parts.headers;
    remove_hop_by_hop(&mut headers);
    // the backend sees the client's Host; HTTP/2 carries it in the authority
    if !headers.contains_key(header::HOST) {
        if let Some(authority) = parts.uri.authority() {
            if let Ok(value) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(header::HOST, value);
            }
        }
    }
    add_forwarded_headers(&mut headers, &host, conn.as_ref());

    let body = Body::new(Limited::new(body, state.max_body_bytes));
    let request = state
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let upstream = match tokio::time::timeout(state.response_timeout, request.send()).await {
        Ok(Ok(upstream)) => upstream,
        Ok(Err(e)) if body_limit_exceeded(&e) => {
            warn!("Request body for {} exceeded {} bytes", host, state.max_body_bytes);
            return message(StatusCode::PAYLOAD_TOO_LARGE, "request body too large");
        }
        Ok(Err(e)) => {
            error!("Backend error for {}: {}", host, e);
            return message(StatusCode::BAD_GATEWAY, "bad gateway");
        }
        Err(_) => {
            error!("Backend for {} did not answer within {:?}", host, state.response_timeout);
            return message(StatusCode::GATEWAY_TIMEOUT, "gateway timeout");
        }
    };

    let status = upstream.status();
    let mut response_headers = upstream.headers().clone();
    remove_hop_by_hop(&mut response_headers);

    let mut response = Response::new(Body::from_stream(upstream.bytes_stream()));
    *response.status_mut() = status;
    *response.headers_mut() = response_headers;
    response
}
