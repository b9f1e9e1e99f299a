//! HTTP forwarding to viewer processes
//!
//! One outbound request per inbound view request, sent through a pooled client.
//! Connection failures and timeouts surface as [`ForwardError::UpstreamUnavailable`]
//! so the caller can show a fallback page instead of failing the request.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, CONNECTION, HOST, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Headers that only apply to a single hop
const HOP_BY_HOP: [HeaderName; 6] = [CONNECTION, HOST, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING];

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("viewer at {address} unavailable: {reason}")]
    UpstreamUnavailable { address: SocketAddr, reason: String },

    #[error("invalid forward target: {0}")]
    InvalidTarget(String),
}

/// Statistics for forwarded requests
#[derive(Debug, Default)]
pub struct ForwardStats {
    /// Requests sent to viewers
    pub total_requests: AtomicU64,
    /// Requests that ended in UpstreamUnavailable
    pub unavailable: AtomicU64,
}

impl ForwardStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_unavailable(&self) {
        self.unavailable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    pub fn get_unavailable(&self) -> u64 {
        self.unavailable.load(Ordering::Relaxed)
    }
}

/// Pooled HTTP client for viewer requests
pub struct HttpForwarder {
    client: Client<HttpConnector, Incoming>,
    request_timeout: Duration,
    stats: Arc<ForwardStats>,
}

impl HttpForwarder {
    pub fn new(request_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(90))
            .build(connector);

        debug!(
            request_timeout_secs = request_timeout.as_secs(),
            "HTTP forwarder initialized"
        );

        Self {
            client,
            request_timeout,
            stats: Arc::new(ForwardStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ForwardStats> {
        Arc::clone(&self.stats)
    }

    /// Send `req` to `http://{address}/{sub_path}` and return the viewer's response
    pub async fn forward(
        &self,
        address: SocketAddr,
        sub_path: &str,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, ForwardError> {
        let uri = target_uri(address, sub_path, req.uri().query());

        let (parts, body) = req.into_parts();
        let mut builder = Request::builder().method(parts.method).uri(&uri);

        for (key, value) in parts.headers.iter() {
            if is_hop_by_hop(key) {
                continue;
            }
            builder = builder.header(key, value);
        }

        let backend_req = builder
            .body(body)
            .map_err(|e| ForwardError::InvalidTarget(format!("{}: {}", uri, e)))?;

        self.stats.record_request();
        debug!(%address, uri, "Forwarding request to viewer");

        let result = tokio::time::timeout(self.request_timeout, self.client.request(backend_req)).await;

        let response = match result {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.stats.record_unavailable();
                warn!(%address, uri, error = %e, "Viewer request failed");
                return Err(ForwardError::UpstreamUnavailable {
                    address,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                self.stats.record_unavailable();
                warn!(
                    %address,
                    uri,
                    timeout_secs = self.request_timeout.as_secs(),
                    "Viewer request timed out"
                );
                return Err(ForwardError::UpstreamUnavailable {
                    address,
                    reason: format!("no response after {}s", self.request_timeout.as_secs()),
                });
            }
        };

        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

fn is_hop_by_hop(name: &HeaderName) -> bool {
    HOP_BY_HOP.contains(name) || *name == UPGRADE || name.as_str() == "keep-alive"
}

/// Build the viewer URI, keeping the sub-path's trailing slash
fn target_uri(address: SocketAddr, sub_path: &str, query: Option<&str>) -> String {
    let path = sub_path.trim_start_matches('/');
    match query {
        Some(q) if !q.is_empty() => format!("http://{}/{}?{}", address, encode_path(path), q),
        _ => format!("http://{}/{}", address, encode_path(path)),
    }
}

/// Percent-encode each path segment, keeping the separators
fn encode_path(path: &str) -> String {
    path.split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
