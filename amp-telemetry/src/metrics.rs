//! Runtime counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use amp_primitives::ErrorCode;
use serde::Serialize;

/// Lock-free counters updated by the dispatcher.
#[derive(Debug)]
pub struct RuntimeMetrics {
    received: AtomicU64,
    responses: AtomicU64,
    errors: [AtomicU64; ErrorCode::ALL.len()],
    handler_invocations: AtomicU64,
    orphaned_results: AtomicU64,
    forwarded: AtomicU64,
    delegations_accepted: AtomicU64,
}

impl Default for RuntimeMetrics {
    fn default() -> Self {
        Self {
            received: AtomicU64::new(0),
            responses: AtomicU64::new(0),
            errors: std::array::from_fn(|_| AtomicU64::new(0)),
            handler_invocations: AtomicU64::new(0),
            orphaned_results: AtomicU64::new(0),
            forwarded: AtomicU64::new(0),
            delegations_accepted: AtomicU64::new(0),
        }
    }
}

impl RuntimeMetrics {
    /// Creates zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an inbound message.
    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an outbound success or accepted response.
    pub fn record_response(&self) {
        self.responses.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an outbound error payload.
    pub fn record_error(&self, code: ErrorCode) {
        if let Some(slot) = ErrorCode::ALL.iter().position(|known| *known == code) {
            self.errors[slot].fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Counts a handler invocation.
    pub fn record_invocation(&self) {
        self.handler_invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a handler result that arrived after its deadline.
    pub fn record_orphaned(&self) {
        self.orphaned_results.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts a message forwarded to another agent.
    pub fn record_forwarded(&self) {
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Counts an accepted delegation.
    pub fn record_delegation(&self) {
        self.delegations_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Errors emitted with `code` so far.
    #[must_use]
    pub fn errors(&self, code: ErrorCode) -> u64 {
        ErrorCode::ALL
            .iter()
            .position(|known| *known == code)
            .map_or(0, |slot| self.errors[slot].load(Ordering::Relaxed))
    }

    /// Point-in-time copy of every counter.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors = ErrorCode::ALL
            .iter()
            .zip(&self.errors)
            .filter_map(|(code, count)| {
                let count = count.load(Ordering::Relaxed);
                (count > 0).then(|| (code.as_str().to_owned(), count))
            })
            .collect();
        MetricsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            responses: self.responses.load(Ordering::Relaxed),
            errors,
            handler_invocations: self.handler_invocations.load(Ordering::Relaxed),
            orphaned_results: self.orphaned_results.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            delegations_accepted: self.delegations_accepted.load(Ordering::Relaxed),
        }
    }
}

/// Serializable copy of [`RuntimeMetrics`].
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Inbound messages.
    pub received: u64,
    /// Response messages produced.
    pub responses: u64,
    /// Error messages produced, keyed by wire code.
    pub errors: BTreeMap<String, u64>,
    /// Handler invocations started.
    pub handler_invocations: u64,
    /// Late results discarded after a timeout.
    pub orphaned_results: u64,
    /// Messages forwarded to remote agents.
    pub forwarded: u64,
    /// Delegated requests accepted.
    pub delegations_accepted: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_nonzero_error_codes() {
        let metrics = RuntimeMetrics::new();
        metrics.record_received();
        metrics.record_received();
        metrics.record_response();
        metrics.record_error(ErrorCode::Timeout);
        metrics.record_error(ErrorCode::Timeout);
        metrics.record_orphaned();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.received, 2);
        assert_eq!(snapshot.responses, 1);
        assert_eq!(snapshot.orphaned_results, 1);
        assert_eq!(snapshot.errors.len(), 1);
        assert_eq!(snapshot.errors["TIMEOUT"], 2);
        assert_eq!(metrics.errors(ErrorCode::Timeout), 2);
        assert_eq!(metrics.errors(ErrorCode::InternalError), 0);

        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["errors"]["TIMEOUT"], 2);
    }
}
