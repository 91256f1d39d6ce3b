//! Block stream metrics.
//!
//! Connections report through the [`BlockStreamMetrics`] capability. Recording
//! is fire-and-forget and never fails the caller.
//!
//! # Metrics
//!
//! - `block_stream_acknowledgements_total`
//! - `block_stream_end_of_streams_total{status}`
//! - `block_stream_skipped_blocks_total`
//! - `block_stream_resent_blocks_total`
//! - `block_stream_blocks_sent_total`
//! - `block_stream_rate_limited_total`
//! - `block_stream_transport_errors_total`
//! - `block_stream_handshake_failures_total`
//! - `block_stream_retries_scheduled_total{plan}`

use core::fmt::Debug;
use std::sync::atomic::AtomicU64;

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

use crate::messages::StatusCode;

/// Sink for connection events.
pub trait BlockStreamMetrics: Send + Sync + Debug {
    fn record_acknowledgement(&self);

    fn record_end_of_stream(&self, status: StatusCode);

    fn record_skip_block(&self);

    fn record_resend_block(&self);

    fn record_block_sent(&self);

    fn record_rate_limited(&self);

    fn record_transport_error(&self);

    fn record_handshake_failure(&self);

    fn record_retry_scheduled(&self, plan: &'static str);
}

/// Discards everything.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopMetrics;

impl BlockStreamMetrics for NoopMetrics {
    fn record_acknowledgement(&self) {}

    fn record_end_of_stream(&self, _status: StatusCode) {}

    fn record_skip_block(&self) {}

    fn record_resend_block(&self) {}

    fn record_block_sent(&self) {}

    fn record_rate_limited(&self) {}

    fn record_transport_error(&self) {}

    fn record_handshake_failure(&self) {}

    fn record_retry_scheduled(&self, _plan: &'static str) {}
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct StatusLabels {
    status: &'static str,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct PlanLabels {
    plan: &'static str,
}

/// Prometheus-backed [`BlockStreamMetrics`].
#[derive(Debug)]
pub struct PrometheusBlockStreamMetrics {
    acknowledgements: Counter<u64, AtomicU64>,
    end_of_streams: Family<StatusLabels, Counter>,
    skipped_blocks: Counter<u64, AtomicU64>,
    resent_blocks: Counter<u64, AtomicU64>,
    blocks_sent: Counter<u64, AtomicU64>,
    rate_limited: Counter<u64, AtomicU64>,
    transport_errors: Counter<u64, AtomicU64>,
    handshake_failures: Counter<u64, AtomicU64>,
    retries_scheduled: Family<PlanLabels, Counter>,
}

impl PrometheusBlockStreamMetrics {
    /// Creates the metrics and registers them with `registry`.
    pub fn new(registry: &mut Registry) -> Self {
        let metrics = Self {
            acknowledgements: Counter::default(),
            end_of_streams: Family::default(),
            skipped_blocks: Counter::default(),
            resent_blocks: Counter::default(),
            blocks_sent: Counter::default(),
            rate_limited: Counter::default(),
            transport_errors: Counter::default(),
            handshake_failures: Counter::default(),
            retries_scheduled: Family::default(),
        };

        registry.register(
            "block_stream_acknowledgements",
            "Acknowledgements received from block nodes",
            metrics.acknowledgements.clone(),
        );
        registry.register(
            "block_stream_end_of_streams",
            "End-of-stream responses by status",
            metrics.end_of_streams.clone(),
        );
        registry.register(
            "block_stream_skipped_blocks",
            "Skip-block requests received",
            metrics.skipped_blocks.clone(),
        );
        registry.register(
            "block_stream_resent_blocks",
            "Resend-block requests received",
            metrics.resent_blocks.clone(),
        );
        registry.register(
            "block_stream_blocks_sent",
            "Blocks published to block nodes",
            metrics.blocks_sent.clone(),
        );
        registry.register(
            "block_stream_rate_limited",
            "End-of-stream responses over the configured rate",
            metrics.rate_limited.clone(),
        );
        registry.register(
            "block_stream_transport_errors",
            "Streams torn down by transport errors",
            metrics.transport_errors.clone(),
        );
        registry.register(
            "block_stream_handshake_failures",
            "Failed attempts to open a stream",
            metrics.handshake_failures.clone(),
        );
        registry.register(
            "block_stream_retries_scheduled",
            "Retries scheduled by plan",
            metrics.retries_scheduled.clone(),
        );

        metrics
    }
}

impl BlockStreamMetrics for PrometheusBlockStreamMetrics {
    fn record_acknowledgement(&self) {
        self.acknowledgements.inc();
    }

    fn record_end_of_stream(&self, status: StatusCode) {
        let labels = StatusLabels {
            status: status.as_str(),
        };
        self.end_of_streams.get_or_create(&labels).inc();
    }

    fn record_skip_block(&self) {
        self.skipped_blocks.inc();
    }

    fn record_resend_block(&self) {
        self.resent_blocks.inc();
    }

    fn record_block_sent(&self) {
        self.blocks_sent.inc();
    }

    fn record_rate_limited(&self) {
        self.rate_limited.inc();
    }

    fn record_transport_error(&self) {
        self.transport_errors.inc();
    }

    fn record_handshake_failure(&self) {
        self.handshake_failures.inc();
    }

    fn record_retry_scheduled(&self, plan: &'static str) {
        self.retries_scheduled.get_or_create(&PlanLabels { plan }).inc();
    }
}
