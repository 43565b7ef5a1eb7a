//! Per-proxy Prometheus metrics.
//!
//! Every proxy instance owns a registry whose metric names carry the
//! instance name (`kube_api_rewriter_client_requests_total`,
//! `kube_api_rewriter_webhook_requests_total`, ...), so the registries can be
//! gathered side by side on one `/metrics` endpoint.

use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

/// Metric name prefix shared by all instances.
pub const NAMESPACE: &str = "kube_api_rewriter";

/// Metrics for one proxy instance.
#[derive(Debug, Clone)]
pub struct ProxyMetrics {
    registry: Registry,
    requests: IntCounterVec,
    duration: HistogramVec,
    rewrites: IntCounterVec,
    errors: IntCounterVec,
}

impl ProxyMetrics {
    /// Creates and registers the metrics of proxy `instance`.
    pub fn new(instance: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some(format!("{NAMESPACE}_{instance}")), None)?;

        let requests = IntCounterVec::new(
            Opts::new("requests_total", "Proxied requests by method and response code"),
            &["method", "code"],
        )?;
        let duration = HistogramVec::new(
            HistogramOpts::new("request_duration_seconds", "Time to first response byte by method"),
            &["method"],
        )?;
        let rewrites = IntCounterVec::new(
            Opts::new("rewrites_total", "Bodies changed by the rewriter"),
            &["stage"],
        )?;
        let errors = IntCounterVec::new(Opts::new("errors_total", "Failed requests by error kind"), &["kind"])?;

        registry.register(Box::new(requests.clone()))?;
        registry.register(Box::new(duration.clone()))?;
        registry.register(Box::new(rewrites.clone()))?;
        registry.register(Box::new(errors.clone()))?;

        Ok(Self {
            registry,
            requests,
            duration,
            rewrites,
            errors,
        })
    }

    /// The instance registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Records a finished request.
    pub fn observe_request(&self, method: &str, code: u16, elapsed: Duration) {
        let code = code.to_string();
        self.requests.with_label_values(&[method, code.as_str()]).inc();
        self.duration.with_label_values(&[method]).observe(elapsed.as_secs_f64());
    }

    /// Records a body changed at `stage` (`request` or `response`).
    pub fn rewrite(&self, stage: &str) {
        self.rewrites.with_label_values(&[stage]).inc();
    }

    /// Records a failed request.
    pub fn error(&self, kind: &str) {
        self.errors.with_label_values(&[kind]).inc();
    }
}
