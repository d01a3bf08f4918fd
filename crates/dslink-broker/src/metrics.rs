//! Prometheus recorder and `/metrics` rendering.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Only one recorder can exist per process; call this once, before the
/// broker starts, and pass the handle in [`BrokerConfig`](crate::BrokerConfig).
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Handshakes accepted at `/conn` (counter).
pub const HANDSHAKES_TOTAL: &str = "dslink_broker_handshakes_total";
/// Links currently mounted under `/conns` (gauge).
pub const SESSIONS_ACTIVE: &str = "dslink_broker_sessions";
/// Transports refused for a bad token (counter).
pub const REJECTED_TRANSPORTS_TOTAL: &str = "dslink_broker_rejected_transports_total";

#[cfg(test)]
mod tests {
    use super::*;
    use metrics::counter;

    #[test]
    fn local_recorder_renders_counters() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let handle = recorder.handle();
        metrics::with_local_recorder(&recorder, || counter!(HANDSHAKES_TOTAL).increment(2));
        assert!(handle.render().contains("dslink_broker_handshakes_total 2"));
    }

    #[test]
    fn metric_names_are_snake_case() {
        for name in [HANDSHAKES_TOTAL, SESSIONS_ACTIVE, REJECTED_TRANSPORTS_TOTAL] {
            assert!(
                name.chars().all(|c| c.is_ascii_lowercase() || c == '_'),
                "metric name '{name}' must be snake_case"
            );
        }
    }
}
