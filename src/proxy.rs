//! The per-request pipeline: route by Host, rewrite headers, obtain a
//! backend connection and stream the exchange.
//!
//! Every failure in here maps to a response status and is confined to the
//! request that hit it; the service never returns an error to hyper, so a
//! bad request cannot tear down the connection it arrived on, and nothing
//! a request does can affect other in-flight connections.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use http::header::HeaderValue;
use http::{Request, Response, StatusCode, Uri, Version, request};
use http_body_util::{BodyExt as _, Empty};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service as HyperService;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::ProxyBody;
use crate::error::ProxyError;
use crate::rewrite::{self, RewriteContext};
use crate::snapshot::{SharedSnapshot, Snapshot};

/// How long to wait for the backend to produce response headers before
/// answering 504. Body streaming afterwards is not time-bounded.
const RESPONSE_HEAD_TIMEOUT: Duration = Duration::from_secs(60);

/// Hyper service for one client connection.
#[derive(Clone)]
pub struct GatewayService {
    snapshot: SharedSnapshot,
    client: SocketAddr,
}

impl GatewayService {
    pub fn new(snapshot: SharedSnapshot, client: SocketAddr) -> Self {
        Self { snapshot, client }
    }
}

impl HyperService<Request<Incoming>> for GatewayService {
    type Response = Response<ProxyBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        // Pin the request to the snapshot that was current when it arrived;
        // a concurrent reload cannot change routing mid-request.
        let snapshot = self.snapshot.current();
        let client = self.client;

        Box::pin(async move {
            let method = req.method().clone();
            let uri = req.uri().clone();
            match handle_request(snapshot, client, req).await {
                Ok(response) => Ok(response),
                Err(err) => {
                    warn!("{method} {uri} from {client}: {err}");
                    Ok(status_response(err.status()))
                }
            }
        })
    }
}

async fn handle_request(
    snapshot: Arc<Snapshot>,
    client: SocketAddr,
    req: Request<Incoming>,
) -> Result<Response<ProxyBody>, ProxyError> {
    let (mut parts, body) = req.into_parts();

    let host = request_host(&parts).ok_or(ProxyError::MissingHost)?;
    let path = parts.uri.path();
    let route = snapshot
        .router
        .route(&host, path)
        .ok_or_else(|| ProxyError::NoRouteMatch(host.clone()))?;
    let upstream = snapshot
        .upstream(route.upstream)
        .ok_or_else(|| ProxyError::UpstreamUnavailable(route.upstream.to_string()))?;

    rewrite::strip_hop_by_hop(&mut parts.headers);
    rewrite::apply(
        &mut parts.headers,
        &RewriteContext {
            client,
            host: &host,
        },
        route.set_headers,
    );

    // The backend leg is always HTTP/1.1: origin-form URI, explicit Host.
    // HTTP/2 requests arrive with an authority and no Host header.
    parts.version = Version::HTTP_11;
    if parts.uri.authority().is_some() {
        let origin_form = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        parts.uri = origin_form
            .parse()
            .unwrap_or_else(|_| Uri::from_static("/"));
    }
    if !parts.headers.contains_key(http::header::HOST) {
        if let Ok(value) = HeaderValue::from_str(&host) {
            parts.headers.insert(http::header::HOST, value);
        }
    }

    let mut conn = upstream.acquire().await?;
    debug!(
        host = %host,
        upstream = upstream.name(),
        "forwarding request"
    );

    // The client body streams through; nothing is buffered whole.
    let request = Request::from_parts(parts, body.boxed());
    let response = match timeout(RESPONSE_HEAD_TIMEOUT, conn.send_request(request)).await {
        Ok(Ok(response)) => response,
        Ok(Err(source)) => {
            // The connection drops here, closing it instead of pooling it.
            return Err(ProxyError::Upstream {
                upstream: upstream.name().to_string(),
                source,
            });
        }
        Err(_) => return Err(ProxyError::UpstreamTimeout(upstream.name().to_string())),
    };

    // Safe before the body is drained: the pool re-admits the connection
    // only once hyper reports it ready again, and a backend that dies
    // mid-stream shows up as closed at the next checkout.
    conn.release();

    let (head, body) = response.into_parts();
    Ok(Response::from_parts(head, body.boxed()))
}

/// The client-supplied host: the `Host` header for HTTP/1.1, the request
/// authority for HTTP/2.
fn request_host(parts: &request::Parts) -> Option<String> {
    if let Some(value) = parts.headers.get(http::header::HOST) {
        if let Ok(host) = value.to_str() {
            return Some(host.to_string());
        }
    }
    parts.uri.authority().map(|a| a.as_str().to_string())
}

pub fn status_response(status: StatusCode) -> Response<ProxyBody> {
    let mut response = Response::new(
        Empty::<Bytes>::new()
            .map_err(|never| match never {})
            .boxed(),
    );
    *response.status_mut() = status;
    response
}
