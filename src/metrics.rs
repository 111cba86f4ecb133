// metrics.rs - Prometheus counters and gauges for the channel stack
use prometheus::{IntCounter, IntGauge, Registry};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),
}

#[derive(Debug, Clone)]
pub struct Metrics {
    registry: Registry,
    pub connections_opened: IntCounter,
    pub connections_evicted: IntCounter,
    pub connections_closed: IntCounter,
    pub connections_live: IntGauge,
    pub protocol_violations: IntCounter,
    pub chunks_sent: IntCounter,
    pub messages_reassembled: IntCounter,
    pub sequence_gaps: IntCounter,
    pub token_renewals: IntCounter,
    pub token_validation_failures: IntCounter,
    pub requests_timed_out: IntCounter,
    pub unmatched_responses: IntCounter,
    pub pending_requests: IntGauge,
    pub sessions_created: IntCounter,
    pub sessions_active: IntGauge,
    pub sessions_expired: IntCounter,
    pub auth_failures: IntCounter,
    pub session_lockouts: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new_custom(Some("opcport".into()), None)?;

        macro_rules! register_counter {
            ($name:expr, $help:expr) => {{
                let counter = IntCounter::new($name, $help)?;
                registry.register(Box::new(counter.clone()))?;
                counter
            }};
        }

        macro_rules! register_gauge {
            ($name:expr, $help:expr) => {{
                let gauge = IntGauge::new($name, $help)?;
                registry.register(Box::new(gauge.clone()))?;
                gauge
            }};
        }

        let connections_opened =
            register_counter!("connections_opened", "Connection slots claimed");
        let connections_evicted = register_counter!(
            "connections_evicted",
            "Stalled connections evicted to admit new ones"
        );
        let connections_closed =
            register_counter!("connections_closed", "Connections closed, any reason");
        let connections_live = register_gauge!("connections_live", "Connections not yet draining");
        let protocol_violations = register_counter!(
            "protocol_violations",
            "Fatal sequencing, size, or handshake violations"
        );
        let chunks_sent = register_counter!("chunks_sent", "Chunks handed to the transport");
        let messages_reassembled =
            register_counter!("messages_reassembled", "Complete messages reassembled");
        let sequence_gaps = register_counter!("sequence_gaps", "Inbound sequence gaps detected");
        let token_renewals = register_counter!("token_renewals", "Security tokens renewed");
        let token_validation_failures = register_counter!(
            "token_validation_failures",
            "Chunks rejected for unknown or expired tokens"
        );
        let requests_timed_out =
            register_counter!("requests_timed_out", "Pending requests resolved by timeout");
        let unmatched_responses = register_counter!(
            "unmatched_responses",
            "Responses without a matching pending request"
        );
        let pending_requests =
            register_gauge!("pending_requests", "Outstanding requests across channels");
        let sessions_created = register_counter!("sessions_created", "Sessions created");
        let sessions_active = register_gauge!("sessions_active", "Live sessions");
        let sessions_expired =
            register_counter!("sessions_expired", "Sessions closed by timeout sweep");
        let auth_failures =
            register_counter!("auth_failures", "Failed session activation attempts");
        let session_lockouts = register_counter!(
            "session_lockouts",
            "Channels placed under session creation lockout"
        );

        Ok(Self {
            registry,
            connections_opened,
            connections_evicted,
            connections_closed,
            connections_live,
            protocol_violations,
            chunks_sent,
            messages_reassembled,
            sequence_gaps,
            token_renewals,
            token_validation_failures,
            requests_timed_out,
            unmatched_responses,
            pending_requests,
            sessions_created,
            sessions_active,
            sessions_expired,
            auth_failures,
            session_lockouts,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_metrics_registry() {
        let metrics = Metrics::new().expect("metrics");
        metrics.connections_opened.inc();
        metrics.connections_live.set(1);
        metrics.sequence_gaps.inc();
        metrics.sessions_active.set(3);
        assert!(!metrics.gather().is_empty());
    }
}
