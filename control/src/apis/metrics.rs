//! Controller metrics
//!
//! One registry for the whole process, served on `/metrics`.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

lazy_static! {
    /// Controller metrics registry
    pub static ref CONTROLLER_METRICS_REGISTRY: Registry = Registry::new();

    /// Full sync pass duration
    static ref SYNC_DURATION: HistogramVec = {
        let opts = HistogramOpts::new(
            "tunnel_sync_duration_seconds",
            "Tunnel sync pass duration in seconds",
        );
        let histogram = HistogramVec::new(opts, &["result"])
            .expect("Failed to create histogram");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(histogram.clone()))
            .expect("Failed to register histogram");
        histogram
    };

    /// Sync passes total
    static ref SYNC_TOTAL: IntCounterVec = {
        let opts = Opts::new("tunnel_sync_total", "Total number of tunnel sync passes");
        let counter = IntCounterVec::new(opts, &["result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Rules in the last committed (or planned) ingress list, catch-all included
    static ref INGRESS_RULES: IntGauge = {
        let gauge = IntGauge::new("tunnel_ingress_rules", "Number of ingress rules on the tunnel")
            .expect("Failed to create gauge");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(gauge.clone()))
            .expect("Failed to register gauge");
        gauge
    };

    /// Rules added/removed by sync passes
    static ref RULE_CHANGES_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "tunnel_rule_changes_total",
            "Total number of ingress rules added or removed",
        );
        let counter = IntCounterVec::new(opts, &["change"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Remote tunnel API failures
    static ref API_ERRORS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "tunnel_api_errors_total",
            "Total number of tunnel API errors",
        );
        let counter = IntCounterVec::new(opts, &["operation", "class"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Route binding decisions
    static ref ROUTE_BINDING_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "route_binding_total",
            "Total number of route parent binding decisions",
        );
        let counter = IntCounterVec::new(opts, &["kind", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };

    /// Reconciler invocations per resource kind
    static ref RECONCILIATIONS_TOTAL: IntCounterVec = {
        let opts = Opts::new(
            "reconciliations_total",
            "Total number of reconciler invocations",
        );
        let counter = IntCounterVec::new(opts, &["kind", "result"])
            .expect("Failed to create counter");
        CONTROLLER_METRICS_REGISTRY
            .register(Box::new(counter.clone()))
            .expect("Failed to register counter");
        counter
    };
}

/// Record a finished sync pass
pub fn record_sync(duration_secs: f64, result: &str) {
    SYNC_DURATION
        .with_label_values(&[result])
        .observe(duration_secs);
    SYNC_TOTAL.with_label_values(&[result]).inc();
}

/// Record the size of the ingress list and the rule delta of a pass
pub fn record_rules(total: usize, added: usize, removed: usize) {
    INGRESS_RULES.set(i64::try_from(total).unwrap_or(i64::MAX));
    RULE_CHANGES_TOTAL
        .with_label_values(&["added"])
        .inc_by(added as u64);
    RULE_CHANGES_TOTAL
        .with_label_values(&["removed"])
        .inc_by(removed as u64);
}

/// Record a remote tunnel API failure
pub fn record_api_error(operation: &str, class: &str) {
    API_ERRORS_TOTAL.with_label_values(&[operation, class]).inc();
}

/// Record one route/parent binding decision
pub fn record_binding(kind: &str, result: &str) {
    ROUTE_BINDING_TOTAL.with_label_values(&[kind, result]).inc();
}

/// Record a reconciler invocation
pub fn record_reconciliation(kind: &str, result: &str) {
    RECONCILIATIONS_TOTAL.with_label_values(&[kind, result]).inc();
}

/// Gather controller metrics
pub fn gather_controller_metrics() -> Result<String, String> {
    let mut buffer = vec![];
    let encoder = TextEncoder::new();
    let metric_families = CONTROLLER_METRICS_REGISTRY.gather();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| format!("Failed to encode metrics: {}", e))?;

    String::from_utf8(buffer).map_err(|e| format!("Failed to convert to UTF-8: {}", e))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_metrics_are_exported() {
        record_sync(0.25, "applied");
        record_rules(3, 2, 1);

        let output = gather_controller_metrics().unwrap();
        assert!(output.contains("tunnel_sync_duration_seconds"));
        assert!(output.contains("tunnel_sync_total{result=\"applied\"}"));
        assert!(output.contains("tunnel_ingress_rules"));
        assert!(output.contains("tunnel_rule_changes_total{change=\"added\"}"));
    }

    #[test]
    fn test_api_error_and_binding_metrics() {
        record_api_error("get_configuration", "rate_limit");
        record_binding("HTTPRoute", "accepted");
        record_reconciliation("Gateway", "success");

        let output = gather_controller_metrics().unwrap();
        assert!(output.contains(
            "tunnel_api_errors_total{class=\"rate_limit\",operation=\"get_configuration\"}"
        ));
        assert!(output.contains("route_binding_total{kind=\"HTTPRoute\",result=\"accepted\"}"));
        assert!(output.contains("reconciliations_total{kind=\"Gateway\",result=\"success\"}"));
    }
}
