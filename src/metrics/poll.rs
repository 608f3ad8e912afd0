use anyhow::Result;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Tracks the outcome of every poll cycle, per metric definition.
///
/// # Metrics Exported
///
/// - `jira_exporter_poll_duration_seconds{metric}` (Histogram)
///   - Time spent on one cycle: request, decode and publish
///
/// - `jira_exporter_poll_errors_total{metric,stage}` (Counter)
///   - Failed cycles; `stage` is one of `url`, `transport`, `status`, `decode`
///   - Example: `rate(jira_exporter_poll_errors_total[15m]) > 0`
///
/// - `jira_exporter_last_poll_timestamp_seconds{metric}` (Gauge)
///   - Unix timestamp of the last cycle attempt
///   - Example: `time() - jira_exporter_last_poll_timestamp_seconds > 900`
///
/// - `jira_exporter_last_poll_success{metric}` (Gauge)
///   - 1 = last cycle published fresh values, 0 = the gauge family is stale
#[derive(Clone)]
pub struct PollStats {
    poll_duration_seconds: HistogramVec,
    poll_errors_total: CounterVec,
    last_poll_timestamp: GaugeVec,
    last_poll_success: GaugeVec,
}

impl PollStats {
    /// # Errors
    ///
    /// Returns an error if a metric descriptor is invalid
    pub fn new() -> Result<Self> {
        let poll_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "jira_exporter_poll_duration_seconds",
                "Time spent on one poll cycle in seconds",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["metric"],
        )?;

        let poll_errors_total = CounterVec::new(
            Opts::new(
                "jira_exporter_poll_errors_total",
                "Total number of failed poll cycles per metric and stage",
            ),
            &["metric", "stage"],
        )?;

        let last_poll_timestamp = GaugeVec::new(
            Opts::new(
                "jira_exporter_last_poll_timestamp_seconds",
                "Unix timestamp of the last poll attempt per metric",
            ),
            &["metric"],
        )?;

        let last_poll_success = GaugeVec::new(
            Opts::new(
                "jira_exporter_last_poll_success",
                "Whether the last poll was successful (1=success, 0=failure)",
            ),
            &["metric"],
        )?;

        Ok(Self {
            poll_duration_seconds,
            poll_errors_total,
            last_poll_timestamp,
            last_poll_success,
        })
    }

    /// # Errors
    ///
    /// Returns an error if any of the metrics is already registered
    pub fn register(&self, registry: &Registry) -> Result<()> {
        registry.register(Box::new(self.poll_duration_seconds.clone()))?;
        registry.register(Box::new(self.poll_errors_total.clone()))?;
        registry.register(Box::new(self.last_poll_timestamp.clone()))?;
        registry.register(Box::new(self.last_poll_success.clone()))?;
        Ok(())
    }

    /// Start timing a poll cycle for `metric`.
    #[must_use]
    pub fn start_poll(&self, metric: &str) -> PollTimer {
        PollTimer {
            metric: metric.to_string(),
            start: Instant::now(),
            stats: self.clone(),
            finished: false,
        }
    }

    fn record_success(&self, metric: &str, duration: f64) {
        self.poll_duration_seconds
            .with_label_values(&[metric])
            .observe(duration);
        self.last_poll_timestamp
            .with_label_values(&[metric])
            .set(unix_now());
        self.last_poll_success.with_label_values(&[metric]).set(1.0);
    }

    fn record_error(&self, metric: &str, stage: &str, duration: f64) {
        self.poll_duration_seconds
            .with_label_values(&[metric])
            .observe(duration);
        self.poll_errors_total
            .with_label_values(&[metric, stage])
            .inc();
        self.last_poll_timestamp
            .with_label_values(&[metric])
            .set(unix_now());
        self.last_poll_success.with_label_values(&[metric]).set(0.0);
    }
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// RAII timer for one poll cycle.
///
/// A timer dropped without `success()` or `error()` counts as an aborted cycle.
pub struct PollTimer {
    metric: String,
    start: Instant,
    stats: PollStats,
    finished: bool,
}

impl PollTimer {
    pub fn success(mut self) {
        self.finished = true;
        let duration = self.start.elapsed().as_secs_f64();
        self.stats.record_success(&self.metric, duration);
    }

    pub fn error(mut self, stage: &str) {
        self.finished = true;
        let duration = self.start.elapsed().as_secs_f64();
        self.stats.record_error(&self.metric, stage, duration);
    }
}

impl Drop for PollTimer {
    fn drop(&mut self) {
        if !self.finished {
            let duration = self.start.elapsed().as_secs_f64();
            self.stats.record_error(&self.metric, "aborted", duration);
        }
    }
}
