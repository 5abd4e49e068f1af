// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The ingest front end
//!
//! Every accepted connection has its request head read here first. `PUT`
//! and `SOURCE` requests become sources: the connection is answered by hand
//! and then owned by the proxy manager. Everything else is served by the
//! admin router over the same connection.

use crate::auth::{auth_middleware, authenticate, dj_middleware, require_dj, AuthError};
use crate::compat::{CompatListener, CompatStream};
use crate::config::ServerConfig;
use crate::handlers;
use crate::manager::ProxyManager;
use crate::source::SourceClient;
use crate::upstream::user_agent;
use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::get,
    Extension, Router,
};
use bytes::BytesMut;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use icegate_domain_types::UserStorage;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::{debug, info, warn};

const MAX_HEADERS: usize = 64;
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

/// Shared state for connection handlers and admin routes
#[derive(Clone)]
pub struct AppState {
    pub manager: ProxyManager,
    pub storage: Arc<dyn UserStorage>,
    pub config: Arc<ServerConfig>,
    /// Fires on shutdown; aborts pending manager submissions
    pub shutdown: CancellationToken,
}

/// Remote address of the connection a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddr(pub SocketAddr);

/// Build the admin router
///
/// Every route needs a valid active user; only metadata updates need a DJ.
/// Request ids, tracing and a timeout wrap the whole router.
pub fn router(state: AppState) -> Router {
    let middleware_stack = ServiceBuilder::new()
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(state.config.admin_request_timeout()));

    Router::new()
        .route(
            "/admin/metadata",
            get(handlers::update_metadata).route_layer(from_fn(dj_middleware)),
        )
        .route("/admin/listclients", get(handlers::list_clients))
        .fallback(handlers::method_not_allowed)
        .layer(from_fn_with_state(state.clone(), auth_middleware))
        .layer(middleware_stack)
        .with_state(state)
}

#[derive(Debug, thiserror::Error)]
enum HeadError {
    #[error("connection closed before the request head was complete")]
    Closed,

    #[error("request head exceeds {0} bytes")]
    TooLarge(usize),

    #[error("malformed request head: {0}")]
    Malformed(#[from] httparse::Error),

    #[error("timed out reading the request head")]
    Timeout,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Parsed request line and headers; header names are lowercased
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    /// Minor HTTP version: 0 for HTTP/1.0 (and rewritten ICE/1.0), 1 for HTTP/1.1
    pub version: u8,
    pub headers: Vec<(String, String)>,
    /// Length of the head in bytes, including the blank line
    pub len: usize,
}

impl RequestHead {
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, httparse::Error> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let len = match req.parse(buf)? {
            httparse::Status::Partial => return Ok(None),
            httparse::Status::Complete(len) => len,
        };

        Ok(Some(Self {
            method: req.method.unwrap_or_default().to_string(),
            target: req.path.unwrap_or("/").to_string(),
            version: req.version.unwrap_or(1),
            headers: req
                .headers
                .iter()
                .map(|h| {
                    (
                        h.name.to_ascii_lowercase(),
                        String::from_utf8_lossy(h.value).into_owned(),
                    )
                })
                .collect(),
            len,
        }))
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn is_source(&self) -> bool {
        self.method == "PUT" || self.method == "SOURCE"
    }

    /// Lowercased path; the `mount` parameter stands in for a bare `/`
    pub fn mount(&self) -> String {
        let (path, query) = self.target.split_once('?').unwrap_or((self.target.as_str(), ""));
        if path.is_empty() || path == "/" {
            let query = handlers::parse_query(query);
            if let Some(mount) = query.get("mount").filter(|m| !m.is_empty()) {
                return String::from_utf8_lossy(mount).to_lowercase();
            }
        }
        path.to_lowercase()
    }
}

async fn read_head<S: AsyncRead + Unpin>(
    stream: &mut S,
    max_bytes: usize,
) -> Result<(RequestHead, BytesMut), HeadError> {
    let mut buf = BytesMut::with_capacity(4096);
    loop {
        if let Some(head) = RequestHead::parse(&buf)? {
            return Ok((head, buf));
        }
        if buf.len() >= max_bytes {
            return Err(HeadError::TooLarge(max_bytes));
        }
        if stream.read_buf(&mut buf).await? == 0 {
            return Err(HeadError::Closed);
        }
    }
}

fn status_line(version: u8, status: u16, reason: &str) -> String {
    format!("HTTP/1.{} {} {}\r\n", version, status, reason)
}

async fn reject(
    stream: &mut CompatStream<TcpStream>,
    version: u8,
    status: u16,
    reason: &str,
    challenge: bool,
) -> io::Result<()> {
    let mut response = status_line(version, status, reason);
    response.push_str("Content-Type: text/plain\r\nConnection: close\r\n");
    if challenge {
        response.push_str("WWW-Authenticate: Basic realm=\"icegate\"\r\n");
    }
    response.push_str(&format!("Content-Length: {}\r\n\r\n{}", reason.len(), reason));
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

/// Accepts connections and dispatches them
#[derive(Clone)]
pub struct IngestServer {
    state: AppState,
    router: Router,
}

impl IngestServer {
    pub fn new(state: AppState) -> Self {
        let router = router(state.clone());
        Self { state, router }
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    /// Accept forever; dropping the future pauses accepting without closing the listener
    pub async fn serve(&self, listener: &CompatListener) {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "failed to accept connection");
                    tokio::time::sleep(ACCEPT_RETRY).await;
                    continue;
                }
            };

            let server = self.clone();
            tokio::spawn(async move {
                server.handle_connection(stream, peer).await;
            });
        }
    }

    async fn handle_connection(&self, mut stream: CompatStream<TcpStream>, peer: SocketAddr) {
        let config = &self.state.config;
        let head = tokio::time::timeout(
            config.header_read_timeout(),
            read_head(&mut stream, config.max_header_bytes),
        )
        .await
        .unwrap_or(Err(HeadError::Timeout));

        let (head, buf) = match head {
            Ok(head) => head,
            Err(HeadError::Closed) => return,
            Err(e) => {
                debug!(%peer, error = %e, "bad request head");
                let (status, reason) = match e {
                    HeadError::TooLarge(_) => (431, "Request Header Fields Too Large"),
                    HeadError::Timeout => (408, "Request Timeout"),
                    _ => (400, "Bad Request"),
                };
                let _ = reject(&mut stream, 1, status, reason, false).await;
                return;
            }
        };

        if head.is_source() {
            let leftover = &buf[head.len..];
            stream.unread(leftover);
            if let Err(e) = self.take_source(stream, peer, head).await {
                debug!(%peer, error = %e, "source connection ended during setup");
            }
        } else {
            stream.unread(&buf);
            self.serve_admin(stream, peer).await;
        }
    }

    async fn serve_admin(&self, stream: CompatStream<TcpStream>, peer: SocketAddr) {
        let router = self.router.clone().layer(Extension(PeerAddr(peer)));
        let service = TowerToHyperService::new(router);
        let conn = hyper::server::conn::http1::Builder::new().serve_connection(TokioIo::new(stream), service);

        tokio::select! {
            result = conn => {
                if let Err(e) = result {
                    debug!(%peer, error = %e, "admin connection failed");
                }
            }
            _ = self.state.shutdown.cancelled() => {}
        }
    }

    /// Authenticate, answer 200 and hand the raw connection to the manager
    async fn take_source(
        &self,
        mut stream: CompatStream<TcpStream>,
        peer: SocketAddr,
        head: RequestHead,
    ) -> io::Result<()> {
        let version = head.version;
        let user = match authenticate(self.state.storage.as_ref(), head.header("authorization")).await {
            Ok(user) => user,
            Err(e) => return self.refuse(&mut stream, version, peer, e).await,
        };
        if let Err(e) = require_dj(&user) {
            return self.refuse(&mut stream, version, peer, e).await;
        }

        let Some(content_type) = head.header("content-type").filter(|c| !c.is_empty()) else {
            info!(%peer, username = %user.username, "source request without content type");
            return reject(&mut stream, version, 400, "Bad Request", false).await;
        };

        let mount = head.mount();
        let client_agent = head.header("user-agent").unwrap_or_default().to_string();
        let content_type = content_type.to_string();

        // encoders wait for this before sending audio
        let mut response = status_line(version, 200, "OK");
        response.push_str(&format!("Server: {}\r\n", user_agent()));
        if version == 0 {
            response.push_str("\r\n\r\n");
        } else {
            response.push_str("Transfer-Encoding: chunked\r\n\r\n0\r\n\r\n");
        }
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;

        let client = SourceClient::new(
            Box::new(stream),
            user,
            mount,
            content_type,
            client_agent,
            peer.to_string(),
        );
        info!(
            %peer,
            mount = %client.mount,
            username = %client.user.username,
            source_id = %client.id,
            identifier = %client.identifier,
            "accepted source connection"
        );

        if let Err(e) = self
            .state
            .manager
            .add_source_client(client, &self.state.shutdown)
            .await
        {
            warn!(%peer, error = %e, "source not registered");
        }
        Ok(())
    }

    async fn refuse(
        &self,
        stream: &mut CompatStream<TcpStream>,
        version: u8,
        peer: SocketAddr,
        error: AuthError,
    ) -> io::Result<()> {
        info!(%peer, error = %error, "refusing source");
        let status = error.status();
        reject(
            stream,
            version,
            status.as_u16(),
            status.canonical_reason().unwrap_or("Error"),
            error.challenges(),
        )
        .await
    }
}
