// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication decision metrics.
//!
//! Every guard reports exactly one `(kind, success, reason, elapsed)` tuple
//! per request, including the success path (`reason = "ok"`). Operators use
//! the reason to tell attack traffic (`signature_mismatch`, `nonce_replay`)
//! apart from outages (`*_unavailable`).
//!
//! [`CounterMetrics`] feeds the `metrics` facade; [`install_prometheus`]
//! installs the Prometheus recorder that `/metrics` renders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use ::metrics::{counter, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

/// Decisions by `kind`, `reason` and `success`.
pub const DECISIONS_TOTAL: &str = "auth_decisions_total";

/// Decision latency by `kind`.
pub const DECISION_SECONDS: &str = "auth_decision_seconds";

/// JWKS fetch attempts by `outcome`.
pub const JWKS_REFRESH_TOTAL: &str = "jwks_refresh_total";

static PROMETHEUS: OnceLock<PrometheusHandle> = OnceLock::new();

/// Reason reported on the success path.
pub const REASON_OK: &str = "ok";

/// Sink for authentication decisions.
pub trait MetricsRecorder: Send + Sync {
    fn record(&self, kind: &'static str, success: bool, reason: &str, elapsed: Duration);
}

/// Shared recorder handle.
pub type SharedMetrics = Arc<dyn MetricsRecorder>;

/// Reports through the `metrics` facade. Without an installed recorder the
/// macros are no-ops.
#[derive(Debug, Clone, Copy, Default)]
pub struct CounterMetrics;

impl MetricsRecorder for CounterMetrics {
    fn record(&self, kind: &'static str, success: bool, reason: &str, elapsed: Duration) {
        counter!(
            DECISIONS_TOTAL,
            "kind" => kind,
            "reason" => reason.to_string(),
            "success" => if success { "true" } else { "false" }
        )
        .increment(1);
        histogram!(DECISION_SECONDS, "kind" => kind).record(elapsed.as_secs_f64());
    }
}

/// Install the process-wide Prometheus recorder. Later calls return the
/// handle from the first.
pub fn install_prometheus() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new().install_recorder()?;
    Ok(PROMETHEUS.get_or_init(|| handle).clone())
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsRecorder for NoopMetrics {
    fn record(&self, _kind: &'static str, _success: bool, _reason: &str, _elapsed: Duration) {}
}

/// A single recorded decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub kind: &'static str,
    pub success: bool,
    pub reason: String,
    pub elapsed: Duration,
}

/// Keeps every decision in memory.
#[derive(Debug, Clone, Default)]
pub struct RecordingMetrics {
    decisions: Arc<Mutex<Vec<Decision>>>,
}

impl RecordingMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decisions(&self) -> Vec<Decision> {
        self.decisions
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    /// The most recent decision, if any.
    pub fn last(&self) -> Option<Decision> {
        self.decisions.lock().ok().and_then(|d| d.last().cloned())
    }

    /// Count of decisions per `(kind, reason)`.
    pub fn counts(&self) -> HashMap<(&'static str, String), usize> {
        let mut counts = HashMap::new();
        for decision in self.decisions() {
            *counts.entry((decision.kind, decision.reason)).or_insert(0) += 1;
        }
        counts
    }
}

impl MetricsRecorder for RecordingMetrics {
    fn record(&self, kind: &'static str, success: bool, reason: &str, elapsed: Duration) {
        if let Ok(mut decisions) = self.decisions.lock() {
            decisions.push(Decision {
                kind,
                success,
                reason: reason.to_string(),
                elapsed,
            });
        }
    }
}
