use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::{Result, Timestamp};

/// Prometheus metrics owned by one run.
///
/// Every run registers into its own [`Registry`], so concurrent runs in one
/// process never share counters.
#[derive(Clone)]
pub struct RunnerMetrics {
    registry: Registry,
    pub elements_processed: IntCounterVec,
    pub bundles_committed: IntCounterVec,
    pub output_watermark_ms: IntGaugeVec,
    pub dropped_late: IntCounterVec,
    pub user_counters: IntCounterVec,
    pub task_latency_ms: HistogramVec,
}

impl RunnerMetrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new();
        let elements_processed = IntCounterVec::new(
            Opts::new("eddy_elements_processed_total", "Input elements processed per step"),
            &["step"],
        )?;
        let bundles_committed = IntCounterVec::new(
            Opts::new("eddy_bundles_committed_total", "Output bundles committed per step"),
            &["step"],
        )?;
        let output_watermark_ms = IntGaugeVec::new(
            Opts::new("eddy_output_watermark_ms", "Output watermark per step in epoch ms"),
            &["step"],
        )?;
        let dropped_late = IntCounterVec::new(
            Opts::new("eddy_dropped_late_elements_total", "Elements dropped because their window expired"),
            &["step"],
        )?;
        let user_counters = IntCounterVec::new(
            Opts::new("eddy_user_counter_total", "Counters incremented by user functions"),
            &["step", "name"],
        )?;
        let task_latency_ms = HistogramVec::new(
            HistogramOpts::new("eddy_task_latency_ms", "Wall time of one evaluator task (ms)").buckets(vec![
                0.1, 0.5, 1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0,
            ]),
            &["step"],
        )?;
        registry.register(Box::new(elements_processed.clone()))?;
        registry.register(Box::new(bundles_committed.clone()))?;
        registry.register(Box::new(output_watermark_ms.clone()))?;
        registry.register(Box::new(dropped_late.clone()))?;
        registry.register(Box::new(user_counters.clone()))?;
        registry.register(Box::new(task_latency_ms.clone()))?;
        Ok(Self {
            registry,
            elements_processed,
            bundles_committed,
            output_watermark_ms,
            dropped_late,
            user_counters,
            task_latency_ms,
        })
    }

    pub fn record_watermark(&self, step: &str, wm: Timestamp) {
        let ms = match wm {
            Timestamp::MIN => i64::MIN,
            Timestamp::MAX => i64::MAX,
            other => other.millis(),
        };
        self.output_watermark_ms.with_label_values(&[step]).set(ms);
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn render(&self) -> String {
        let mut buffer = Vec::new();
        let encoder = TextEncoder::new();
        encoder.encode(&self.registry.gather(), &mut buffer).ok();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl std::fmt::Debug for RunnerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerMetrics").finish_non_exhaustive()
    }
}
