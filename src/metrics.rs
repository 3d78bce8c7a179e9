use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use once_cell::sync::OnceCell;
use tracing::{trace, warn};

// Counters are emitted as trace events; the Prometheus recorder only backs
// the /metrics rendering.

static RECORDER: OnceCell<Option<PrometheusHandle>> = OnceCell::new();

pub fn inc_requests(route: &'static str) {
    trace!(
        target = "wanderlust.metrics",
        route = route,
        "requests_total_inc"
    );
}

pub fn inc_operation(operation: &'static str) {
    trace!(
        target = "wanderlust.metrics",
        operation = operation,
        "operations_total_inc"
    );
}

/// Installs the global recorder on first call. Later calls return the same
/// handle. `None` if another recorder already owns the process.
pub fn install() -> Option<PrometheusHandle> {
    RECORDER
        .get_or_init(|| match PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!(
                    target = "wanderlust.metrics",
                    error = %err,
                    "prometheus recorder unavailable"
                );
                None
            }
        })
        .clone()
}
