use std::sync::Arc;

use prometheus_client::encoding::{EncodeLabelSet, EncodeLabelValue};
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

// ---------------------------------------------------------------------------
// Label types
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PushLabels {
    pub outcome: PushOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum PushOutcome {
    Success,
    Malformed,
    Unauthorized,
    Uninitialized,
    Failed,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct CheckoutLabels {
    pub outcome: CheckoutOutcome,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelValue)]
pub enum CheckoutOutcome {
    Success,
    Failure,
}

// ---------------------------------------------------------------------------
// Metrics struct
// ---------------------------------------------------------------------------

/// Every Prometheus metric exposed by the gateway.
pub struct Metrics {
    pub push_total: Family<PushLabels, Counter>,
    pub push_duration_seconds: Histogram,
    pub checkout_total: Family<CheckoutLabels, Counter>,
    pub repositories_created_total: Counter,
    pub active_connections: Gauge,
}

impl Metrics {
    /// Create a new [`Metrics`] instance and register every metric with the
    /// supplied `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let push_total = Family::<PushLabels, Counter>::default();
        registry.register(
            "pushgate_push",
            "Push requests by outcome",
            push_total.clone(),
        );

        let push_duration_seconds = Histogram::new(exponential_buckets(0.05, 2.0, 12));
        registry.register(
            "pushgate_push_duration_seconds",
            "Time spent running git-receive-pack",
            push_duration_seconds.clone(),
        );

        let checkout_total = Family::<CheckoutLabels, Counter>::default();
        registry.register(
            "pushgate_checkout",
            "Revision checkouts by outcome",
            checkout_total.clone(),
        );

        let repositories_created_total = Counter::default();
        registry.register(
            "pushgate_repositories_created",
            "Repositories created through the control plane",
            repositories_created_total.clone(),
        );

        let active_connections: Gauge = Gauge::default();
        registry.register(
            "pushgate_active_ssh_connections",
            "Currently open SSH connections",
            active_connections.clone(),
        );

        Self {
            push_total,
            push_duration_seconds,
            checkout_total,
            repositories_created_total,
            active_connections,
        }
    }

    pub fn record_push(&self, outcome: PushOutcome) {
        self.push_total.get_or_create(&PushLabels { outcome }).inc();
    }

    pub fn record_checkout(&self, outcome: CheckoutOutcome) {
        self.checkout_total
            .get_or_create(&CheckoutLabels { outcome })
            .inc();
    }
}

// ---------------------------------------------------------------------------
// Shared handle
// ---------------------------------------------------------------------------

/// Thread-safe wrapper for the metrics registry, used in [`AppState`].
///
/// [`AppState`]: crate::AppState
#[derive(Clone)]
pub struct MetricsRegistry {
    pub registry: Arc<Registry>,
    pub metrics: Arc<Metrics>,
}

impl MetricsRegistry {
    /// Build a fresh registry and pre-register all gateway metrics.
    pub fn new() -> Self {
        let mut registry = Registry::default();
        let metrics = Metrics::new(&mut registry);
        Self {
            registry: Arc::new(registry),
            metrics: Arc::new(metrics),
        }
    }

    /// OpenMetrics text exposition of every registered metric.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        prometheus_client::encoding::text::encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encodes_recorded_outcomes() {
        let registry = MetricsRegistry::new();
        registry.metrics.record_push(PushOutcome::Unauthorized);
        registry.metrics.record_checkout(CheckoutOutcome::Success);

        let text = registry.encode().unwrap();

        assert!(text.contains("pushgate_push_total{outcome=\"Unauthorized\"} 1"));
        assert!(text.contains("pushgate_checkout_total{outcome=\"Success\"} 1"));
    }
}
