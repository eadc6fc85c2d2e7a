//! Fire-and-forget metrics sink.
//!
//! Handlers emit counters and timings without back-pressure; the sink
//! decides where they go. The default sink drops everything.

use std::time::Duration;

/// A telemetry sink. Implementations must never block the caller.
pub trait Metrics: Send + Sync {
    fn incr_counter(&self, name: &'static str, value: u64);
    fn timing(&self, name: &'static str, elapsed: Duration);
}

/// Discards all measurements.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl Metrics for NoopMetrics {
    fn incr_counter(&self, _name: &'static str, _value: u64) {}
    fn timing(&self, _name: &'static str, _elapsed: Duration) {}
}

/// Emits measurements as trace events. Useful until a real sink is wired.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl Metrics for TracingMetrics {
    fn incr_counter(&self, name: &'static str, value: u64) {
        tracing::trace!(metric = name, value, "counter");
    }

    fn timing(&self, name: &'static str, elapsed: Duration) {
        tracing::trace!(metric = name, elapsed_ms = elapsed.as_millis() as u64, "timing");
    }
}
