//! Admission middleware: per-client token buckets in front of a service.

use futures::future::{self, Either, Ready};
use hyper::header::{HeaderValue, CONTENT_TYPE, RETRY_AFTER};
use hyper::{Request, Response, StatusCode};
use std::fmt;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tower_layer::Layer;
use tower_service::Service;
use tracing::debug;

use crate::config::{AdmissionConfig, RetryHintMode};
use crate::error::Result;
use crate::metrics::AdmissionMetrics;
use crate::ratelimit::{KeyExtractor, KeyedLimiterRegistry, RealIp};

/// Machine-readable reason carried in rejection bodies.
pub const REJECTION_CODE: &str = "rate_limited";

const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// How the `Retry-After` value on a rejection is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Always the same duration.
    Fixed(Duration),
    /// The rejected client's own wait until its next token.
    Computed,
}

impl Default for RetryHint {
    fn default() -> Self {
        RetryHint::Fixed(DEFAULT_RETRY_AFTER)
    }
}

impl RetryHint {
    pub fn from_config(config: &AdmissionConfig) -> Self {
        match config.retry_hint {
            RetryHintMode::Fixed => RetryHint::Fixed(Duration::from_secs(config.retry_after_secs)),
            RetryHintMode::Computed => RetryHint::Computed,
        }
    }
}

/// A layer that admits or rejects requests per client key.
#[derive(Clone)]
pub struct AdmissionLayer {
    registry: Arc<KeyedLimiterRegistry>,
    extractor: Arc<dyn KeyExtractor>,
    retry_hint: RetryHint,
    metrics: Option<AdmissionMetrics>,
}

impl AdmissionLayer {
    /// Create a layer over `registry`, keyed by [`RealIp`] with a fixed
    /// one second retry hint.
    pub fn new(registry: Arc<KeyedLimiterRegistry>) -> Self {
        Self {
            registry,
            extractor: Arc::new(RealIp),
            retry_hint: RetryHint::default(),
            metrics: None,
        }
    }

    /// Build a fresh registry and layer from configuration.
    pub fn from_config(config: &AdmissionConfig) -> Result<Self> {
        let registry = Arc::new(KeyedLimiterRegistry::new(config.rate_spec()?));
        Ok(Self::new(registry)
            .with_key_extractor(config.key.extractor())
            .with_retry_hint(RetryHint::from_config(config)))
    }

    pub fn with_key_extractor(mut self, extractor: Arc<dyn KeyExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn with_retry_hint(mut self, retry_hint: RetryHint) -> Self {
        self.retry_hint = retry_hint;
        self
    }

    /// Count every decision and the number of tracked keys in `metrics`.
    pub fn with_metrics(mut self, metrics: AdmissionMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Get the registry backing this layer.
    pub fn registry(&self) -> &Arc<KeyedLimiterRegistry> {
        &self.registry
    }
}

impl fmt::Debug for AdmissionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionLayer")
            .field("registry", &self.registry)
            .field("retry_hint", &self.retry_hint)
            .field("metrics", &self.metrics.is_some())
            .finish_non_exhaustive()
    }
}

impl<S> Layer<S> for AdmissionLayer {
    type Service = AdmissionService<S>;

    fn layer(&self, service: S) -> Self::Service {
        AdmissionService {
            inner: service,
            layer: self.clone(),
        }
    }
}

/// Middleware service that enforces per-key admission.
#[derive(Clone, Debug)]
pub struct AdmissionService<S> {
    inner: S,
    layer: AdmissionLayer,
}

impl<S> AdmissionService<S> {
    fn retry_after_secs(&self, key: &str) -> u64 {
        let wait = match self.layer.retry_hint {
            RetryHint::Fixed(wait) => wait,
            RetryHint::Computed => self
                .layer
                .registry
                .retry_after(key)
                .unwrap_or(DEFAULT_RETRY_AFTER),
        };
        whole_seconds(wait)
    }
}

impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for AdmissionService<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    ResBody: From<String>,
{
    type Response = Response<ResBody>;
    type Error = S::Error;
    type Future = Either<S::Future, Ready<std::result::Result<Self::Response, Self::Error>>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<std::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let (parts, body) = req.into_parts();
        let key = self.layer.extractor.extract(&parts);

        let admitted = self.layer.registry.decide(&key);
        if let Some(metrics) = &self.layer.metrics {
            metrics.record(admitted);
            metrics.set_tracked_keys(self.layer.registry.len());
        }

        if admitted {
            return Either::Left(self.inner.call(Request::from_parts(parts, body)));
        }

        let retry_after = self.retry_after_secs(&key);
        debug!(
            key = %key,
            method = %parts.method,
            path = %parts.uri.path(),
            retry_after_secs = retry_after,
            "Rate limit exceeded"
        );
        Either::Right(future::ready(Ok(too_many_requests(retry_after))))
    }
}

/// Round up to whole seconds, never below one.
fn whole_seconds(wait: Duration) -> u64 {
    let secs = wait
        .as_secs()
        .saturating_add(u64::from(wait.subsec_nanos() > 0));
    secs.max(1)
}

/// The `429 Too Many Requests` response sent to rejected clients.
pub fn too_many_requests<B: From<String>>(retry_after_secs: u64) -> Response<B> {
    let body = serde_json::json!({
        "code": REJECTION_CODE,
        "message": "rate limit exceeded",
        "retry_after_secs": retry_after_secs,
    });

    let mut response = Response::new(B::from(body.to_string()));
    *response.status_mut() = StatusCode::TOO_MANY_REQUESTS;
    let headers = response.headers_mut();
    headers.insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}
