//! Prometheus scrape endpoint, served on its own listener.

use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::service::make_service_fn;
use hyper::{Body, Method, Request, Response, Server, StatusCode};
use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower::service_fn;
use tower::util::BoxCloneService;
use tracing::{error, info, warn};

use crate::error::{Result, TurnstileError};
use crate::metrics::AdmissionMetrics;
use crate::ratelimit::KeyedLimiterRegistry;

/// Path the scrape endpoint answers on.
pub const METRICS_PATH: &str = "/metrics";

/// HTTP listener exposing [`AdmissionMetrics`].
pub struct MetricsServer {
    addr: SocketAddr,
    metrics: AdmissionMetrics,
    registry: Arc<KeyedLimiterRegistry>,
}

impl MetricsServer {
    pub fn new(
        addr: SocketAddr,
        metrics: AdmissionMetrics,
        registry: Arc<KeyedLimiterRegistry>,
    ) -> Self {
        Self {
            addr,
            metrics,
            registry,
        }
    }

    /// Serve scrapes until `signal` resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let service = metrics_service(self.metrics, self.registry);
        let make_service = make_service_fn(move |_conn| {
            let service = service.clone();
            async move { Ok::<_, Infallible>(service) }
        });

        let server = Server::try_bind(&self.addr)
            .map_err(|e| {
                error!(addr = %self.addr, error = %e, "Failed to bind metrics listener");
                TurnstileError::Http(e)
            })?
            .serve(make_service);

        info!(addr = %server.local_addr(), path = METRICS_PATH, "Metrics server listening");

        server.with_graceful_shutdown(signal).await.map_err(|e| {
            error!(error = %e, "Metrics server failed");
            TurnstileError::Http(e)
        })
    }
}

/// The scrape service: `GET /metrics` renders every collector, anything
/// else is a 404.
///
/// The tracked-key gauge is refreshed from `registry` on each scrape, so it
/// also reflects evictions made between requests.
pub fn metrics_service(
    metrics: AdmissionMetrics,
    registry: Arc<KeyedLimiterRegistry>,
) -> BoxCloneService<Request<Body>, Response<Body>, Infallible> {
    BoxCloneService::new(service_fn(move |req: Request<Body>| {
        let response = scrape(&req, &metrics, &registry);
        async move { Ok::<_, Infallible>(response) }
    }))
}

fn scrape(
    req: &Request<Body>,
    metrics: &AdmissionMetrics,
    registry: &KeyedLimiterRegistry,
) -> Response<Body> {
    if req.method() != Method::GET || req.uri().path() != METRICS_PATH {
        return text_response(StatusCode::NOT_FOUND, "not found".to_string());
    }

    metrics.set_tracked_keys(registry.len());
    match metrics.render() {
        Ok(text) => {
            let mut response = text_response(StatusCode::OK, text);
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static(prometheus::TEXT_FORMAT),
            );
            response
        }
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            text_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn text_response(status: StatusCode, body: String) -> Response<Body> {
    let mut response = Response::new(Body::from(body));
    *response.status_mut() = status;
    response
}
