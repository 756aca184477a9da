//! Prometheus metrics for admission decisions.
//! Bring your own `prometheus::Registry`; collectors are registered into it.

use prometheus::{IntCounterVec, IntGauge, Opts, Registry, TextEncoder};
use std::sync::Arc;

use crate::error::Result;

const ADMITTED: &str = "admitted";
const REJECTED: &str = "rejected";

/// Decision counters and the tracked-key gauge.
#[derive(Clone, Debug)]
pub struct AdmissionMetrics {
    registry: Arc<Registry>,
    decisions: IntCounterVec,
    tracked_keys: IntGauge,
}

impl AdmissionMetrics {
    /// Create the collectors and register them into `registry`.
    ///
    /// # Errors
    /// Returns an error if a metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self> {
        let registry = registry.into();
        let decisions = IntCounterVec::new(
            Opts::new(
                "turnstile_admission_decisions_total",
                "Admission decisions by outcome",
            ),
            &["outcome"],
        )?;
        let tracked_keys = IntGauge::new(
            "turnstile_tracked_keys",
            "Client keys currently holding a token bucket",
        )?;
        registry.register(Box::new(decisions.clone()))?;
        registry.register(Box::new(tracked_keys.clone()))?;

        Ok(Self {
            registry,
            decisions,
            tracked_keys,
        })
    }

    /// Count one decision.
    pub fn record(&self, admitted: bool) {
        let outcome = if admitted { ADMITTED } else { REJECTED };
        self.decisions.with_label_values(&[outcome]).inc();
    }

    pub fn set_tracked_keys(&self, keys: usize) {
        self.tracked_keys.set(i64::try_from(keys).unwrap_or(i64::MAX));
    }

    pub fn admitted(&self) -> u64 {
        self.decisions.with_label_values(&[ADMITTED]).get()
    }

    pub fn rejected(&self) -> u64 {
        self.decisions.with_label_values(&[REJECTED]).get()
    }

    pub fn tracked_keys(&self) -> i64 {
        self.tracked_keys.get()
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Everything in the registry, in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        Ok(TextEncoder::new().encode_to_string(&self.registry.gather())?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TurnstileError;

    #[test]
    fn test_record_counts_by_outcome() {
        let metrics = AdmissionMetrics::new(Registry::new()).unwrap();

        metrics.record(true);
        metrics.record(true);
        metrics.record(false);

        assert_eq!(metrics.admitted(), 2);
        assert_eq!(metrics.rejected(), 1);
    }

    #[test]
    fn test_render_text_format() {
        let metrics = AdmissionMetrics::new(Registry::new()).unwrap();
        metrics.record(false);
        metrics.set_tracked_keys(3);

        let text = metrics.render().unwrap();

        assert!(text.contains("# TYPE turnstile_admission_decisions_total counter"));
        assert!(text.contains(r#"turnstile_admission_decisions_total{outcome="rejected"} 1"#));
        assert!(text.contains("turnstile_tracked_keys 3"));
    }

    #[test]
    fn test_double_registration_fails() {
        let registry = Arc::new(Registry::new());
        AdmissionMetrics::new(registry.clone()).unwrap();

        let result = AdmissionMetrics::new(registry);
        assert!(matches!(result, Err(TurnstileError::Metrics(_))));
    }
}
