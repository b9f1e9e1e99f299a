//! WebSocket tunnel between a client and its viewer
//!
//! The inbound side is a hyper upgrade answered with `101` by the proxy; the
//! outbound side is a fresh client connection to the viewer's socket endpoint.
//! Both relay directions run under one `select!`, so the first to finish cancels
//! the other. Whatever ends the relay, both sockets are closed and the viewer
//! is shut down.

use crate::error::ProxyErrorCode;
use crate::registry::ProcessRegistry;
use crate::routes::{Route, RouteTable};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::header::{
    HeaderMap, HeaderValue, CONNECTION, SEC_WEBSOCKET_ACCEPT, SEC_WEBSOCKET_KEY,
    SEC_WEBSOCKET_PROTOCOL, UPGRADE,
};
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};

/// Subprotocol spoken by Broadway viewers
pub const BROADWAY_SUBPROTOCOL: &str = "broadway";

/// Last path segment of a viewer's streaming endpoint
pub const SOCKET_SUFFIX: &str = "socket";

#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("invalid viewer socket url '{url}': {source}")]
    InvalidUrl {
        url: String,
        #[source]
        source: WsError,
    },

    #[error("viewer socket handshake failed: {0}")]
    Handshake(#[source] WsError),

    #[error("viewer socket did not answer within {}s", .0.as_secs())]
    ConnectTimeout(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Connecting,
    Relaying,
    Closing,
    Closed,
}

/// Why the relay stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    /// The client closed or failed
    Client,
    /// The viewer closed or failed
    Viewer,
    /// No traffic for the idle timeout
    Idle,
}

/// Whether the upgrade request offers the Broadway subprotocol
pub fn offers_subprotocol(headers: &HeaderMap) -> bool {
    headers
        .get_all(SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|protocol| protocol.trim() == BROADWAY_SUBPROTOCOL)
}

/// The `101` answer for an inbound upgrade, echoing the subprotocol
pub fn accept_response(
    headers: &HeaderMap,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ProxyErrorCode> {
    if !offers_subprotocol(headers) {
        return Err(ProxyErrorCode::SubprotocolRequired);
    }
    let key = headers
        .get(SEC_WEBSOCKET_KEY)
        .ok_or(ProxyErrorCode::BadUpgradeRequest)?;
    let is_websocket = headers
        .get(UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    if !is_websocket {
        return Err(ProxyErrorCode::BadUpgradeRequest);
    }

    let accept = HeaderValue::from_str(&derive_accept_key(key.as_bytes()))
        .map_err(|_| ProxyErrorCode::BadUpgradeRequest)?;

    Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(UPGRADE, "websocket")
        .header(CONNECTION, "Upgrade")
        .header(SEC_WEBSOCKET_ACCEPT, accept)
        .header(SEC_WEBSOCKET_PROTOCOL, BROADWAY_SUBPROTOCOL)
        .body(Empty::<Bytes>::new().map_err(|never| match never {}).boxed())
        .map_err(|_| ProxyErrorCode::InternalError)
}

/// `ws://{address}/{workspace}/socket`, each workspace segment percent-encoded
pub fn upstream_url(address: SocketAddr, workspace: &Path) -> String {
    let mut url = format!("ws://{}/", address);
    for segment in workspace.iter() {
        url.push_str(&urlencoding::encode(&segment.to_string_lossy()));
        url.push('/');
    }
    url.push_str(SOCKET_SUFFIX);
    url
}

/// Runs tunnels and tears their viewers down when they end
pub struct WebSocketTunnel {
    registry: Arc<ProcessRegistry>,
    routes: Arc<RouteTable>,
    connect_timeout: Duration,
    idle_timeout: Option<Duration>,
    active: AtomicUsize,
}

impl WebSocketTunnel {
    pub fn new(
        registry: Arc<ProcessRegistry>,
        routes: Arc<RouteTable>,
        connect_timeout: Duration,
        idle_timeout: Option<Duration>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            routes,
            connect_timeout,
            idle_timeout,
            active: AtomicUsize::new(0),
        })
    }

    /// Tunnels currently relaying or tearing down
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Take over the upgraded connection of `req` once the `101` is sent
    pub fn spawn(self: &Arc<Self>, req: Request<Incoming>, session: String, route: Route) {
        let tunnel = Arc::clone(self);
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let inbound =
                        WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
                            .await;
                    tunnel.run(inbound, &session, route).await;
                }
                Err(e) => {
                    warn!(session, error = %e, "Client upgrade failed");
                    tunnel.teardown(&session, &route).await;
                }
            }
        });
    }

    /// Connect to the viewer and relay until either side ends
    pub async fn run<S>(&self, inbound: WebSocketStream<S>, session: &str, route: Route)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.active.fetch_add(1, Ordering::SeqCst);
        let mut state = StateLog::new(session, &route.workspace);

        let relayed = AssertUnwindSafe(self.connect_and_relay(inbound, session, &route, &mut state))
            .catch_unwind()
            .await;
        if relayed.is_err() {
            error!(session, workspace = %route.workspace.display(), "Tunnel relay panicked");
            state.advance(TunnelState::Closing);
        }

        self.teardown(session, &route).await;
        state.advance(TunnelState::Closed);
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn connect_and_relay<S>(
        &self,
        mut inbound: WebSocketStream<S>,
        session: &str,
        route: &Route,
        state: &mut StateLog<'_>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let url = upstream_url(route.address(), &route.workspace);
        match connect_viewer(&url, self.connect_timeout).await {
            Ok(outbound) => {
                state.advance(TunnelState::Relaying);
                let end = relay(inbound, outbound, self.idle_timeout).await;
                info!(session, workspace = %route.workspace.display(), ?end, "Tunnel ended");
                state.advance(TunnelState::Closing);
            }
            Err(e) => {
                warn!(session, url, error = %e, "Could not reach viewer socket");
                state.advance(TunnelState::Closing);
                let _ = inbound.close(None).await;
            }
        }
    }

    async fn teardown(&self, session: &str, route: &Route) {
        self.routes
            .invalidate(session, &route.workspace, route.process.id());
        self.registry.shutdown(&route.process).await;
    }
}

struct StateLog<'a> {
    session: &'a str,
    workspace: &'a Path,
    state: TunnelState,
}

impl<'a> StateLog<'a> {
    fn new(session: &'a str, workspace: &'a Path) -> Self {
        debug!(session, workspace = %workspace.display(), state = ?TunnelState::Connecting, "Tunnel state");
        Self {
            session,
            workspace,
            state: TunnelState::Connecting,
        }
    }

    fn advance(&mut self, next: TunnelState) {
        debug!(
            session = self.session,
            workspace = %self.workspace.display(),
            from = ?self.state,
            to = ?next,
            "Tunnel state"
        );
        self.state = next;
    }
}

async fn connect_viewer(
    url: &str,
    timeout: Duration,
) -> Result<WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>, TunnelError> {
    let mut request = url.into_client_request().map_err(|source| TunnelError::InvalidUrl {
        url: url.to_string(),
        source,
    })?;
    request.headers_mut().insert(
        SEC_WEBSOCKET_PROTOCOL,
        HeaderValue::from_static(BROADWAY_SUBPROTOCOL),
    );

    let (stream, _response) = tokio::time::timeout(timeout, connect_async(request))
        .await
        .map_err(|_| TunnelError::ConnectTimeout(timeout))?
        .map_err(TunnelError::Handshake)?;

    debug!(url, "Connected to viewer socket");
    Ok(stream)
}

/// Relay messages both ways until one direction ends, then close both sockets
pub async fn relay<A, B>(
    inbound: WebSocketStream<A>,
    outbound: WebSocketStream<B>,
    idle_timeout: Option<Duration>,
) -> RelayEnd
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_tx, mut client_rx) = inbound.split();
    let (mut viewer_tx, mut viewer_rx) = outbound.split();
    let last_activity = Mutex::new(Instant::now());

    let end = tokio::select! {
        result = pump(&mut client_rx, &mut viewer_tx, &last_activity) => {
            if let Err(e) = result {
                debug!(error = %e, "Client side of tunnel failed");
            }
            RelayEnd::Client
        }
        result = pump(&mut viewer_rx, &mut client_tx, &last_activity) => {
            if let Err(e) = result {
                debug!(error = %e, "Viewer side of tunnel failed");
            }
            RelayEnd::Viewer
        }
        _ = idle(&last_activity, idle_timeout) => RelayEnd::Idle,
    };

    let _ = client_tx.close().await;
    let _ = viewer_tx.close().await;
    end
}

/// Copy messages from `rx` to `tx` in order until `rx` closes
async fn pump<R, W>(rx: &mut R, tx: &mut W, last_activity: &Mutex<Instant>) -> Result<(), WsError>
where
    R: Stream<Item = Result<Message, WsError>> + Unpin,
    W: Sink<Message, Error = WsError> + Unpin,
{
    while let Some(message) = rx.next().await {
        let message = message?;
        *last_activity.lock() = Instant::now();
        match message {
            // Answered per hop by tungstenite
            Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            Message::Close(frame) => {
                let _ = tx.send(Message::Close(frame)).await;
                return Ok(());
            }
            message => tx.send(message).await?,
        }
    }
    Ok(())
}

async fn idle(last_activity: &Mutex<Instant>, timeout: Option<Duration>) {
    let Some(timeout) = timeout else {
        return std::future::pending().await;
    };
    loop {
        let deadline = *last_activity.lock() + timeout;
        if Instant::now() >= deadline {
            return;
        }
        tokio::time::sleep_until(deadline).await;
    }
}
