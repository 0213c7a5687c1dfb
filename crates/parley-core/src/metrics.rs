//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade; nothing is exported unless
//! the binary installs a recorder.

use metrics::{counter, gauge, histogram};

/// Metric names.
pub mod names {
    pub const CONNECTIONS_TOTAL: &str = "parley_connections_total";
    pub const CONNECTIONS_ACTIVE: &str = "parley_connections_active";
    pub const SUBMISSIONS_TOTAL: &str = "parley_submissions_total";
    pub const DELIVERIES_TOTAL: &str = "parley_deliveries_total";
    pub const ENVELOPES_DROPPED_TOTAL: &str = "parley_envelopes_dropped_total";
    pub const ATTACHMENT_EVENTS_TOTAL: &str = "parley_attachment_events_total";
    pub const RECONCILE_WAIT_SECONDS: &str = "parley_reconcile_wait_seconds";
    pub const ERRORS_TOTAL: &str = "parley_errors_total";
    pub const ENVELOPES_PARKED: &str = "parley_envelopes_parked";
    pub const REPUBLISHED_TOTAL: &str = "parley_republished_total";
}

/// Describe every metric to the installed recorder.
pub fn describe() {
    metrics::describe_counter!(
        names::CONNECTIONS_TOTAL,
        "Total number of authenticated connections since start"
    );
    metrics::describe_gauge!(
        names::CONNECTIONS_ACTIVE,
        "Current number of authenticated connections"
    );
    metrics::describe_counter!(
        names::SUBMISSIONS_TOTAL,
        "Message submissions processed, by outcome"
    );
    metrics::describe_counter!(
        names::DELIVERIES_TOTAL,
        "Per-receiver deliveries, by mode (local or notification)"
    );
    metrics::describe_counter!(
        names::ENVELOPES_DROPPED_TOTAL,
        "Envelopes dropped by the fan-out relays, by reason"
    );
    metrics::describe_counter!(
        names::ATTACHMENT_EVENTS_TOTAL,
        "Attachment-ready events consumed, by outcome"
    );
    metrics::describe_histogram!(
        names::RECONCILE_WAIT_SECONDS,
        "Time spent waiting for media parts"
    );
    metrics::describe_counter!(names::ERRORS_TOTAL, "Total number of errors, by kind");
    metrics::describe_gauge!(
        names::ENVELOPES_PARKED,
        "Persisted envelopes waiting for the bus"
    );
    metrics::describe_counter!(
        names::REPUBLISHED_TOTAL,
        "Parked envelopes published after all, by path (worker or resubmit)"
    );
}

/// Record an authenticated connection.
pub fn record_connection() {
    counter!(names::CONNECTIONS_TOTAL).increment(1);
    gauge!(names::CONNECTIONS_ACTIVE).increment(1.0);
}

/// Record a closed authenticated connection.
pub fn record_disconnection() {
    gauge!(names::CONNECTIONS_ACTIVE).decrement(1.0);
}

/// Record a processed submission.
pub fn record_submission(outcome: &'static str) {
    counter!(names::SUBMISSIONS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record a delivery to one receiver.
pub fn record_delivery(mode: &'static str) {
    counter!(names::DELIVERIES_TOTAL, "mode" => mode).increment(1);
}

/// Record a dropped envelope.
pub fn record_dropped(reason: &'static str) {
    counter!(names::ENVELOPES_DROPPED_TOTAL, "reason" => reason).increment(1);
}

/// Record a consumed attachment event.
pub fn record_attachment_event(outcome: &'static str) {
    counter!(names::ATTACHMENT_EVENTS_TOTAL, "outcome" => outcome).increment(1);
}

/// Record time spent waiting for media.
pub fn record_reconcile_wait(seconds: f64) {
    histogram!(names::RECONCILE_WAIT_SECONDS).record(seconds);
}

/// Record an error.
pub fn record_error(kind: &'static str) {
    counter!(names::ERRORS_TOTAL, "kind" => kind).increment(1);
}

/// Record the current size of the outbox.
pub fn record_parked(count: usize) {
    gauge!(names::ENVELOPES_PARKED).set(count as f64);
}

/// Record a parked envelope that reached the bus.
pub fn record_republished(path: &'static str) {
    counter!(names::REPUBLISHED_TOTAL, "path" => path).increment(1);
}

/// Guard that records a disconnection on drop.
pub struct ConnectionMetricsGuard;

impl ConnectionMetricsGuard {
    /// Create a new metrics guard, recording a connection.
    #[must_use]
    pub fn new() -> Self {
        record_connection();
        Self
    }
}

impl Default for ConnectionMetricsGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ConnectionMetricsGuard {
    fn drop(&mut self) {
        record_disconnection();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_without_recorder() {
        // Without an installed recorder every call is a no-op
        let _guard = ConnectionMetricsGuard::new();
        record_submission("accepted");
        record_delivery("local");
        record_reconcile_wait(0.5);
    }
}
