use crate::config::Config;
use crate::error::{json_error_response, ProxyErrorCode};
use crate::forward::{ForwardError, ForwardStats, HttpForwarder};
use crate::jobs::{JobController, ProcessQuery};
use crate::pages::{self, html_response};
use crate::registry::{ProcessRegistry, ViewerFactory};
use crate::routes::RouteTable;
use crate::tunnel::{self, WebSocketTunnel, SOCKET_SUFFIX};
use crate::workspace;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Cookie carrying the session identity
pub const SESSION_COOKIE: &str = "session_id";

const WORKSPACES_PREFIX: &str = "/workspaces/";
const OPEN_PREFIX: &str = "/workspaces/open/";
const VIEW_PREFIX: &str = "/workspaces/view/";

type ProxyResponse = Response<BoxBody<Bytes, hyper::Error>>;

/// Everything request handlers share
pub struct ProxyContext {
    registry: Arc<ProcessRegistry>,
    routes: Arc<RouteTable>,
    factory: Arc<dyn ViewerFactory>,
    forwarder: HttpForwarder,
    tunnel: Arc<WebSocketTunnel>,
    jobs: JobController,
    workspace_dir: PathBuf,
}

impl ProxyContext {
    pub fn new(
        config: &Config,
        registry: Arc<ProcessRegistry>,
        factory: Arc<dyn ViewerFactory>,
        query: Arc<dyn ProcessQuery>,
    ) -> Arc<Self> {
        let routes = RouteTable::new();
        let tunnel = WebSocketTunnel::new(
            Arc::clone(&registry),
            Arc::clone(&routes),
            config.server.connect_timeout(),
            config.server.tunnel_idle_timeout(),
        );

        Arc::new(Self {
            registry,
            routes,
            factory,
            forwarder: HttpForwarder::new(config.server.request_timeout()),
            tunnel,
            jobs: JobController::new(&config.controller.job_dir, query),
            workspace_dir: config.browser.workspace_dir.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<ProcessRegistry> {
        &self.registry
    }

    pub fn routes(&self) -> &Arc<RouteTable> {
        &self.routes
    }

    pub fn tunnel(&self) -> &Arc<WebSocketTunnel> {
        &self.tunnel
    }

    pub fn forward_stats(&self) -> Arc<ForwardStats> {
        self.forwarder.stats()
    }
}

/// The public HTTP entry point
pub struct ProxyServer {
    bind_addr: SocketAddr,
    context: Arc<ProxyContext>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ProxyServer {
    pub fn new(
        bind_addr: SocketAddr,
        context: Arc<ProxyContext>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            context,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        info!(addr = %self.bind_addr, "Proxy server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let context = Arc::clone(&self.context);
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(stream, context).await {
                                    debug!(addr = %addr, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        let stats = self.context.forward_stats();
                        info!(
                            forwarded = stats.get_total_requests(),
                            unavailable = stats.get_unavailable(),
                            active_tunnels = self.context.tunnel.active_count(),
                            "Proxy server shutting down"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn handle_connection<S>(stream: S, context: Arc<ProxyContext>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let context = Arc::clone(&context);
        async move { handle_request(req, context).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .http1()
        .preserve_header_case(true)
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    context: Arc<ProxyContext>,
) -> Result<ProxyResponse, hyper::Error> {
    let path = req.uri().path().to_string();
    debug!(method = %req.method(), uri = %req.uri(), "Incoming request");

    if let Some(rest) = path.strip_prefix(VIEW_PREFIX) {
        return Ok(handle_view(req, rest, &context).await);
    }

    if req.method() != Method::GET && req.method() != Method::HEAD {
        return Ok(json_error_response(
            ProxyErrorCode::MethodNotAllowed,
            format!("{} not allowed on {}", req.method(), path),
        ));
    }

    let response = match path.as_str() {
        "/" => redirect(WORKSPACES_PREFIX),
        "/health" => text_response(StatusCode::OK, "OK"),
        "/workspaces" | WORKSPACES_PREFIX => {
            let root = context.workspace_dir.clone();
            let scan = tokio::task::spawn_blocking(move || workspace::list_all(&root));
            let workspaces = match scan.await {
                Ok(workspaces) => workspaces,
                Err(e) => {
                    warn!(error = %e, "Workspace scan failed");
                    Vec::new()
                }
            };
            html_response(StatusCode::OK, pages::workspace_list(&workspaces))
        }
        "/jobs" | "/jobs/" => {
            let overview = context.jobs.overview().await;
            html_response(StatusCode::OK, pages::jobs(&overview))
        }
        _ => match path.strip_prefix(OPEN_PREFIX) {
            Some(rest) => handle_open(session_from_headers(req.headers()), rest, &context).await,
            None => json_error_response(ProxyErrorCode::NotFound, format!("No such page: {}", path)),
        },
    };
    Ok(response)
}

/// Launch or reuse the session's viewer and serve the page embedding it
async fn handle_open(session: Option<String>, raw_workspace: &str, context: &ProxyContext) -> ProxyResponse {
    let workspace = match decode_path(raw_workspace) {
        Ok(decoded) => PathBuf::from(decoded),
        Err(response) => return response,
    };

    let session = session.unwrap_or_else(|| {
        let session = Uuid::new_v4().to_string();
        debug!(session, "New session");
        session
    });
    let absolute = context.workspace_dir.join(&workspace);

    let mut response = match context
        .registry
        .launch_or_reuse(&session, &absolute, context.factory.as_ref())
        .await
    {
        Ok(process) => {
            context.routes.record(&session, &workspace, process);
            html_response(StatusCode::OK, pages::workspace_view(&workspace))
        }
        Err(e) => {
            error!(session, workspace = %workspace.display(), error = %e, "Cannot open workspace");
            html_response(
                ProxyErrorCode::from(&e).status_code(),
                pages::launch_failed(&workspace),
            )
        }
    };

    if let Ok(cookie) = HeaderValue::from_str(&format!("{}={}; Path=/; SameSite=Lax", SESSION_COOKIE, session)) {
        response.headers_mut().insert(SET_COOKIE, cookie);
    }
    response
}

/// Forward a view request, or hand a socket upgrade to the tunnel
async fn handle_view(req: Request<Incoming>, raw_path: &str, context: &ProxyContext) -> ProxyResponse {
    let sub_path = match decode_path(raw_path) {
        Ok(decoded) => decoded,
        Err(response) => return response,
    };
    let path = PathBuf::from(&sub_path);
    let session = session_from_headers(req.headers()).unwrap_or_default();

    if is_upgrade_request(&req) {
        return handle_socket(req, session, &path, context);
    }

    let route = match context.routes.resolve_path(&session, &path) {
        Ok(route) => route,
        Err(e) => {
            debug!(error = %e, "View request without route");
            return json_error_response(ProxyErrorCode::from(&e), "No viewer for this session and workspace");
        }
    };

    match context.forwarder.forward(route.address(), &sub_path, req).await {
        Ok(response) => response,
        Err(e @ ForwardError::UpstreamUnavailable { .. }) => {
            warn!(session, workspace = %route.workspace.display(), error = %e, "Viewer unavailable");
            html_response(StatusCode::OK, pages::view_unavailable(&route.workspace))
        }
        Err(e) => json_error_response(ProxyErrorCode::from(&e), e.to_string()),
    }
}

/// Check the upgrade, resolve the route, then answer 101 and start the tunnel
fn handle_socket(req: Request<Incoming>, session: String, path: &Path, context: &ProxyContext) -> ProxyResponse {
    if !tunnel::offers_subprotocol(req.headers()) {
        return json_error_response(
            ProxyErrorCode::SubprotocolRequired,
            format!("WebSocket subprotocol '{}' required", tunnel::BROADWAY_SUBPROTOCOL),
        );
    }

    let workspace = match path.file_name() {
        Some(name) if name == SOCKET_SUFFIX => path.parent().unwrap_or(Path::new("")),
        _ => {
            return json_error_response(
                ProxyErrorCode::NotFound,
                format!("No socket endpoint at {}", path.display()),
            )
        }
    };

    let route = match context.routes.resolve(&session, workspace) {
        Ok(route) => route,
        Err(e) => {
            debug!(error = %e, "Socket request without route");
            return json_error_response(ProxyErrorCode::from(&e), "No viewer for this session and workspace");
        }
    };

    match tunnel::accept_response(req.headers()) {
        Ok(response) => {
            info!(session, workspace = %workspace.display(), address = %route.address(), "Opening tunnel");
            context.tunnel.spawn(req, session, route);
            response
        }
        Err(code) => json_error_response(code, "Invalid WebSocket upgrade request"),
    }
}

/// Percent-decode a workspace path and make sure it stays below the root
fn decode_path(raw: &str) -> Result<String, ProxyResponse> {
    let decoded = urlencoding::decode(raw).map_err(|_| {
        json_error_response(ProxyErrorCode::InvalidWorkspacePath, "Workspace path is not valid UTF-8")
    })?;
    if !workspace::is_safe_relative(Path::new(decoded.as_ref())) {
        return Err(json_error_response(
            ProxyErrorCode::InvalidWorkspacePath,
            format!("Invalid workspace path: {}", decoded),
        ));
    }
    Ok(decoded.into_owned())
}

/// The `session_id` cookie, if present and non-empty
pub fn session_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

/// Check if a request is a WebSocket upgrade request
fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);

    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn text_response(status: StatusCode, text: &'static str) -> ProxyResponse {
    let mut response = Response::new(Full::new(Bytes::from(text)).map_err(|never| match never {}).boxed());
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
    response
}

fn redirect(location: &'static str) -> ProxyResponse {
    let mut response = text_response(StatusCode::FOUND, "Redirecting");
    response
        .headers_mut()
        .insert(LOCATION, HeaderValue::from_static(location));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(cookie: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, HeaderValue::from_str(cookie).unwrap());
        headers
    }

    #[test]
    fn test_session_from_headers() {
        assert_eq!(
            session_from_headers(&headers("session_id=abc")),
            Some("abc".to_string())
        );
        assert_eq!(
            session_from_headers(&headers("theme=dark; session_id=abc; other=1")),
            Some("abc".to_string())
        );
        assert_eq!(session_from_headers(&headers("theme=dark")), None);
        assert_eq!(session_from_headers(&headers("session_id=")), None);
        assert_eq!(session_from_headers(&HeaderMap::new()), None);
    }

    #[test]
    fn test_decode_path() {
        assert_eq!(decode_path("a_workspace/").unwrap(), "a_workspace/");
        assert_eq!(decode_path("another%20workspace").unwrap(), "another workspace");
        assert_eq!(decode_path("nested/workspace").unwrap(), "nested/workspace");
    }

    #[test]
    fn test_decode_path_rejects_escapes() {
        for raw in ["../etc", "a/%2E%2E/%2E%2E/etc", "%2Fetc%2Fpasswd", "", "%FF"] {
            let response = decode_path(raw).unwrap_err();
            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "{}", raw);
            assert_eq!(
                response.headers().get("X-Proxy-Error").unwrap(),
                "INVALID_WORKSPACE_PATH"
            );
        }
    }

    #[test]
    fn test_is_upgrade_request() {
        let req = Request::builder()
            .header("Connection", "keep-alive, Upgrade")
            .header("Upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&req));

        let req = Request::builder().body(()).unwrap();
        assert!(!is_upgrade_request(&req));
    }

    #[test]
    fn test_redirect() {
        let response = redirect(WORKSPACES_PREFIX);
        assert_eq!(response.status(), StatusCode::FOUND);
        assert_eq!(response.headers().get(LOCATION).unwrap(), "/workspaces/");
    }
}
