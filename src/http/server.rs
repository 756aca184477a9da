//! HTTP server implementation.

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::AddrStream;
use hyper::service::make_service_fn;
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use tower::util::BoxCloneService;
use tower::ServiceBuilder;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::middleware::AdmissionLayer;
use crate::error::{Result, TurnstileError};
use crate::ratelimit::PeerAddr;

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// HTTP server with admission control in front of every route.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    admission: AdmissionLayer,
}

impl HttpServer {
    /// Create a new HTTP server.
    pub fn new(addr: SocketAddr, admission: AdmissionLayer) -> Self {
        Self { addr, admission }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let admission = self.admission;
        let make_service = make_service_fn(move |conn: &AddrStream| {
            let service = connection_service(&admission, conn.remote_addr());
            async move { Ok::<_, Infallible>(service) }
        });

        let server = Server::try_bind(&self.addr)
            .map_err(|e| {
                error!(addr = %self.addr, error = %e, "Failed to bind HTTP listener");
                TurnstileError::Http(e)
            })?
            .serve(make_service);

        info!(addr = %server.local_addr(), "HTTP server listening");

        server.with_graceful_shutdown(signal).await.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            TurnstileError::Http(e)
        })
    }
}

/// Build the service stack for one connection from `peer`.
///
/// Each request is tagged with its [`PeerAddr`] and a request id, then
/// passes admission before reaching the routes.
pub fn connection_service(
    admission: &AdmissionLayer,
    peer: SocketAddr,
) -> BoxCloneService<Request<Body>, Response<Body>, Infallible> {
    let service = ServiceBuilder::new()
        .map_request(move |req: Request<Body>| tag_request(req, peer))
        .layer(admission.clone())
        .service_fn(route);
    BoxCloneService::new(service)
}

fn tag_request(mut req: Request<Body>, peer: SocketAddr) -> Request<Body> {
    req.extensions_mut().insert(PeerAddr(peer));
    if !req.headers().contains_key(REQUEST_ID_HEADER) {
        if let Ok(id) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            req.headers_mut().insert(REQUEST_ID_HEADER, id);
        }
    }
    req
}

fn request_id(req: &Request<Body>) -> String {
    req.headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

async fn route(req: Request<Body>) -> std::result::Result<Response<Body>, Infallible> {
    let rid = request_id(&req);
    debug!(
        request_id = %rid,
        method = %req.method(),
        path = %req.uri().path(),
        "Handling request"
    );

    let (status, body) = match (req.method(), req.uri().path()) {
        (&Method::GET, "/ping") => {
            info!(request_id = %rid, "ping called");
            (
                StatusCode::OK,
                serde_json::json!({ "status": "ok", "request_id": rid }),
            )
        }
        _ => (
            StatusCode::NOT_FOUND,
            serde_json::json!({ "message": "not found", "request_id": rid }),
        ),
    };

    let mut response = Response::new(Body::from(body.to_string()));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    if let Ok(id) = HeaderValue::from_str(&rid) {
        headers.insert(REQUEST_ID_HEADER, id);
    }
    Ok(response)
}
