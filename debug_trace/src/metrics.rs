use std::fmt;
use std::time::Duration;

use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use serde::{Deserialize, Serialize};

/// Why the access window rejected a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RejectionReason {
    Lookback,
    Pruned,
}

impl RejectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectionReason::Lookback => "lookback",
            RejectionReason::Pruned => "pruned",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport the request arrived on, used as a metrics label.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    #[default]
    Http,
    Websocket,
}

impl ConnectionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionType::Http => "http",
            ConnectionType::Websocket => "websocket",
        }
    }
}

/// Sink for trace telemetry.
#[cfg_attr(test, mockall::automock)]
pub trait TraceMetrics: Send + Sync {
    fn increment_rejection(&self, reason: RejectionReason);

    fn record_request(
        &self,
        endpoint: &'static str,
        connection: ConnectionType,
        elapsed: Duration,
        success: bool,
    );
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl TraceMetrics for NoopMetrics {
    fn increment_rejection(&self, _reason: RejectionReason) {}

    fn record_request(&self, _: &'static str, _: ConnectionType, _: Duration, _: bool) {}
}

/// [`TraceMetrics`] backed by collectors registered on a caller supplied
/// [`Registry`].
#[derive(Clone, Debug)]
pub struct PrometheusMetrics {
    rejected: IntCounterVec,
    requests: HistogramVec,
}

impl PrometheusMetrics {
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let rejected = IntCounterVec::new(
            Opts::new(
                "debug_trace_rejected_total",
                "Trace requests rejected by the access window",
            ),
            &["reason"],
        )?;
        let requests = HistogramVec::new(
            HistogramOpts::new(
                "debug_trace_request_duration_seconds",
                "Latency of served trace requests",
            ),
            &["endpoint", "connection", "success"],
        )?;
        registry.register(Box::new(rejected.clone()))?;
        registry.register(Box::new(requests.clone()))?;
        Ok(Self { rejected, requests })
    }
}

impl TraceMetrics for PrometheusMetrics {
    fn increment_rejection(&self, reason: RejectionReason) {
        self.rejected.with_label_values(&[reason.as_str()]).inc();
    }

    fn record_request(
        &self,
        endpoint: &'static str,
        connection: ConnectionType,
        elapsed: Duration,
        success: bool,
    ) {
        self.requests
            .with_label_values(&[
                endpoint,
                connection.as_str(),
                if success { "true" } else { "false" },
            ])
            .observe(elapsed.as_secs_f64());
    }
}
