//! HTTP surface: the admission middleware, a small server hosting it, and
//! the metrics listener.

mod metrics;
mod middleware;
mod server;

pub use metrics::{metrics_service, MetricsServer, METRICS_PATH};
pub use middleware::{too_many_requests, AdmissionLayer, AdmissionService, RetryHint, REJECTION_CODE};
pub use server::{connection_service, HttpServer, REQUEST_ID_HEADER};
