//! Listener orchestration
//!
//! Binds the plaintext redirect listener, the TLS proxy listener and the
//! admin listener, then serves all three until one of them stops.

use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpListener;
use tokio::time::Instant;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use crate::admin::{self, AdminState};
use crate::certs::CertManager;
use crate::config::GatewayConfig;
use crate::dispatch::{self, ConnectionInfo, ForwardState};
use crate::error::{GatewayError, Result};
use crate::redirect;
use crate::response::with_timeout;
use crate::store::SharedStore;
use crate::tls::{self, Acceptor};

/// Smallest read buffer hyper accepts for HTTP/1
const MIN_BUF_SIZE: usize = 8192;

/// Pause after a failed accept before trying again
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Per-connection protocol settings shared by all listeners
#[derive(Debug, Clone)]
struct ConnSettings {
    read_timeout: Duration,
    idle_timeout: Duration,
    max_header_bytes: usize,
}

/// One bound listener with the service it runs
struct Endpoint {
    name: &'static str,
    listener: TcpListener,
    local_addr: SocketAddr,
    router: Router,
    tls: Option<Acceptor>,
}

impl Endpoint {
    async fn bind(
        name: &'static str,
        addr: &str,
        router: Router,
        tls: Option<Acceptor>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| GatewayError::Bind {
                name,
                addr: addr.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            name,
            listener,
            local_addr,
            router,
            tls,
        })
    }
}

/// The running gateway: three listeners over one routing store
pub struct Gateway {
    redirect: Endpoint,
    proxy: Endpoint,
    admin: Endpoint,
    settings: ConnSettings,
}

impl Gateway {
    /// Bind all listeners
    ///
    /// Fails if any address cannot be bound or the admin certificate cannot
    /// be loaded.
    pub async fn bind(
        config: &GatewayConfig,
        store: SharedStore,
        certs: Arc<CertManager>,
    ) -> Result<Self> {
        let write_timeout = config.server.write_timeout();

        let forward = ForwardState::new(
            store.clone(),
            config.max_body_bytes,
            config.server.strict_identity,
            write_timeout,
        )?;
        let proxy_router = dispatch::router(Arc::new(forward));

        let admin_router = with_timeout(
            admin::router(Arc::new(AdminState::new(store, &config.api)?)),
            write_timeout,
        );
        let redirect_router = with_timeout(redirect::router(), write_timeout);

        let admin_tls = if config.api.use_ssl {
            match (&config.api.cert_path, &config.api.key_path) {
                (Some(cert), Some(key)) => Some(Acceptor::Static(tls::load_static_config(
                    Path::new(cert),
                    Path::new(key),
                )?)),
                _ => Some(Acceptor::OnDemand(certs.clone())),
            }
        } else {
            None
        };

        let redirect = Endpoint::bind("redirect", &config.server.http_addr, redirect_router, None).await?;
        let proxy = Endpoint::bind(
            "proxy",
            &config.server.https_addr,
            proxy_router,
            Some(Acceptor::OnDemand(certs)),
        )
        .await?;
        let admin = Endpoint::bind("admin", &config.api.addr, admin_router, admin_tls).await?;

        Ok(Self {
            redirect,
            proxy,
            admin,
            settings: ConnSettings {
                read_timeout: config.server.read_timeout(),
                idle_timeout: config.server.idle_timeout(),
                max_header_bytes: config.max_header_bytes.max(MIN_BUF_SIZE),
            },
        })
    }

    /// Address of the plaintext redirect listener
    pub fn http_addr(&self) -> SocketAddr {
        self.redirect.local_addr
    }

    /// Address of the TLS proxy listener
    pub fn https_addr(&self) -> SocketAddr {
        self.proxy.local_addr
    }

    /// Address of the admin listener
    pub fn admin_addr(&self) -> SocketAddr {
        self.admin.local_addr
    }

    /// Serve all listeners
    ///
    /// Only returns once a listener has stopped, always with
    /// [`GatewayError::ListenerExited`].
    pub async fn run(self) -> Result<()> {
        let settings = Arc::new(self.settings);

        let mut redirect = tokio::spawn(serve(self.redirect, settings.clone()));
        let mut proxy = tokio::spawn(serve(self.proxy, settings.clone()));
        let mut admin = tokio::spawn(serve(self.admin, settings));

        let (name, outcome) = tokio::select! {
            outcome = &mut redirect => ("redirect", outcome),
            outcome = &mut proxy => ("proxy", outcome),
            outcome = &mut admin => ("admin", outcome),
        };

        if let Err(e) = outcome {
            error!("{} listener failed: {}", name, e);
        }

        redirect.abort();
        proxy.abort();
        admin.abort();

        Err(GatewayError::ListenerExited(name))
    }
}

/// Accept loop for one listener, one task per connection
async fn serve(endpoint: Endpoint, settings: Arc<ConnSettings>) {
    info!(
        "{} listener on {} ({})",
        endpoint.name,
        endpoint.local_addr,
        if endpoint.tls.is_some() { "TLS" } else { "plaintext" }
    );

    loop {
        let (stream, remote_addr) = match endpoint.listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!("{} listener accept error: {}", endpoint.name, e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        let name = endpoint.name;
        let router = endpoint.router.clone();
        let acceptor = endpoint.tls.clone();
        let settings = settings.clone();

        tokio::spawn(async move {
            let Some(acceptor) = acceptor else {
                let conn = ConnectionInfo {
                    remote_addr,
                    tls: false,
                    server_name: None,
                };
                serve_connection(stream, router, conn, &settings, name).await;
                return;
            };

            match tokio::time::timeout(settings.read_timeout, acceptor.accept(stream)).await {
                Ok(Ok((tls_stream, server_name))) => {
                    let conn = ConnectionInfo {
                        remote_addr,
                        tls: true,
                        server_name,
                    };
                    serve_connection(tls_stream, router, conn, &settings, name).await;
                }
                Ok(Err(e)) => {
                    warn!("TLS handshake failed from {} on {}: {}", remote_addr, name, e);
                }
                Err(_) => {
                    debug!("TLS handshake from {} on {} timed out", remote_addr, name);
                }
            }
        });
    }
}

/// Stream wrapper recording when bytes last moved in either direction
struct IdleTracked<I> {
    inner: I,
    last_active: Arc<Mutex<Instant>>,
}

impl<I> IdleTracked<I> {
    fn new(inner: I) -> (Self, Arc<Mutex<Instant>>) {
        let last_active = Arc::new(Mutex::new(Instant::now()));
        let tracked = Self {
            inner,
            last_active: last_active.clone(),
        };
        (tracked, last_active)
    }

    fn touch(&self) {
        *self.last_active.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }
}

impl<I: AsyncRead + Unpin> AsyncRead for IdleTracked<I> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut this.inner).poll_read(cx, buf);
        if matches!(poll, Poll::Ready(Ok(()))) && buf.filled().len() > before {
            this.touch();
        }
        poll
    }
}

impl<I: AsyncWrite + Unpin> AsyncWrite for IdleTracked<I> {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            this.touch();
        }
        poll
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let poll = Pin::new(&mut this.inner).poll_write_vectored(cx, bufs);
        if matches!(poll, Poll::Ready(Ok(n)) if n > 0) {
            this.touch();
        }
        poll
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

/// Serve HTTP/1.1 or HTTP/2 on one connection
///
/// The connection is shut down gracefully once no bytes have moved for the
/// idle timeout.
async fn serve_connection<I>(
    io: I,
    router: Router,
    conn: ConnectionInfo,
    settings: &ConnSettings,
    name: &'static str,
) where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let remote_addr = conn.remote_addr;
    let (io, last_active) = IdleTracked::new(io);

    let service = service_fn(move |mut req: Request<Incoming>| {
        req.extensions_mut().insert(conn.clone());
        req.extensions_mut().insert(ConnectInfo(remote_addr));
        router.clone().oneshot(req)
    });

    let mut builder = Builder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(settings.read_timeout)
        .max_buf_size(settings.max_header_bytes);
    builder.http2().timer(TokioTimer::new());

    let connection = builder.serve_connection(TokioIo::new(io), service);
    tokio::pin!(connection);

    let mut deadline = Instant::now() + settings.idle_timeout;
    let result = loop {
        tokio::select! {
            result = connection.as_mut() => break result,
            _ = tokio::time::sleep_until(deadline) => {
                let idle_since = *last_active.lock().unwrap_or_else(|e| e.into_inner());
                if idle_since.elapsed() >= settings.idle_timeout {
                    debug!("Closing idle {} connection from {}", name, remote_addr);
                    connection.as_mut().graceful_shutdown();
                    break connection.as_mut().await;
                }
                deadline = idle_since + settings.idle_timeout;
            }
        }
    };

    if let Err(e) = result {
        debug!("Error serving {} connection from {}: {}", name, remote_addr, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_idle_tracked_records_traffic() {
        let (client, server) = tokio::io::duplex(64);
        let (mut tracked, last_active) = IdleTracked::new(server);
        let mut client = client;
        let start = *last_active.lock().unwrap();

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        tracked.read_exact(&mut buf).await.unwrap();
        let after_read = *last_active.lock().unwrap();
        assert!(after_read > start);

        tokio::time::sleep(Duration::from_millis(20)).await;
        tracked.write_all(b"pong").await.unwrap();
        let after_write = *last_active.lock().unwrap();
        assert!(after_write > after_read);
    }

    #[tokio::test]
    async fn test_idle_tracked_ignores_empty_polls() {
        let (client, server) = tokio::io::duplex(64);
        let (mut tracked, last_active) = IdleTracked::new(server);
        let start = *last_active.lock().unwrap();

        drop(client);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut buf = Vec::new();
        tracked.read_to_end(&mut buf).await.unwrap();

        assert!(buf.is_empty());
        assert_eq!(*last_active.lock().unwrap(), start);
    }
}
