//! Metrics events emitted to an external sink
//!
//! Timescape only writes to the sink; it never reads events back.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::transform::{Direction, PayloadKind};
use crate::version::Tsv;

/// One metrics record
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum MetricsEvent {
    VersionRequest {
        handler_path: String,
        client_version: Tsv,
        handler_version: Tsv,
        transformed: bool,
        latency_ms: u64,
    },
    TransformApplied {
        handler_path: String,
        from: Tsv,
        to: Tsv,
        hops: usize,
        direction: Direction,
        payload: PayloadKind,
    },
    VersionDeactivated {
        handler_path: String,
        tsv: Tsv,
        request_count: u64,
        reason: String,
    },
}

impl MetricsEvent {
    pub fn name(&self) -> &'static str {
        match self {
            MetricsEvent::VersionRequest { .. } => "version_request",
            MetricsEvent::TransformApplied { .. } => "transform_applied",
            MetricsEvent::VersionDeactivated { .. } => "version_deactivated",
        }
    }
}

/// Destination for metrics events
pub trait MetricsSink: Send + Sync {
    fn emit(&self, event: MetricsEvent);
}

/// Discards every event
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn emit(&self, _event: MetricsEvent) {}
}

/// Logs every event as JSON through `tracing`
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn emit(&self, event: MetricsEvent) {
        match serde_json::to_string(&event) {
            Ok(json) => tracing::info!(target: "timescape::metrics", "{}", json),
            Err(e) => tracing::warn!("Could not encode {} event: {}", event.name(), e),
        }
    }
}

/// Forwards events to a channel consumed by an exporter task
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<MetricsEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MetricsEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl MetricsSink for ChannelSink {
    fn emit(&self, event: MetricsEvent) {
        // A closed receiver means nobody exports metrics any more.
        let _ = self.tx.send(event);
    }
}
