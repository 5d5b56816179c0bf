// Prometheus metrics for the Lean Farm worker

use leanfarm_common::queue::QueueDepth;
use prometheus::{
    Encoder, Gauge, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};

use crate::state::{JobOutcome, StateSnapshot};

/// Worker metrics on a registry owned by the worker
///
/// Counters are bumped as events happen; gauges derived from `WorkerState`
/// are refreshed from a snapshot when scraped.
pub struct Metrics {
    registry: Registry,
    jobs_claimed: IntCounter,
    jobs_completed: IntCounterVec,
    job_failures: IntCounterVec,
    job_duration: Histogram,
    jobs_in_flight: IntGauge,
    concurrency_ceiling: IntGauge,
    utilization: Gauge,
    success_ratio: Gauge,
    queue_depth: IntGaugeVec,
    lease_lost: IntCounter,
    heartbeat_age: Gauge,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let metrics = Self {
            registry: Registry::new(),
            jobs_claimed: IntCounter::new("leanfarm_jobs_claimed_total", "Total number of jobs claimed")?,
            jobs_completed: IntCounterVec::new(
                Opts::new("leanfarm_jobs_completed_total", "Total number of claimed jobs by outcome"),
                &["outcome"],
            )?,
            job_failures: IntCounterVec::new(
                Opts::new("leanfarm_job_failures_total", "Failed attempts by failure reason"),
                &["reason"],
            )?,
            job_duration: Histogram::with_opts(
                HistogramOpts::new("leanfarm_job_duration_seconds", "Sandbox wall-clock time in seconds")
                    .buckets(vec![0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1800.0]),
            )?,
            jobs_in_flight: IntGauge::new("leanfarm_jobs_in_flight", "Jobs currently held by this worker")?,
            concurrency_ceiling: IntGauge::new(
                "leanfarm_concurrency_ceiling",
                "Maximum simultaneous sandboxes for this worker",
            )?,
            utilization: Gauge::new(
                "leanfarm_worker_utilization",
                "In-flight jobs divided by the concurrency ceiling",
            )?,
            success_ratio: Gauge::new(
                "leanfarm_job_success_ratio",
                "Succeeded over settled jobs since start",
            )?,
            queue_depth: IntGaugeVec::new(
                Opts::new("leanfarm_queue_depth", "Jobs in the shared queue by state"),
                &["state"],
            )?,
            lease_lost: IntCounter::new(
                "leanfarm_lease_lost_total",
                "Executions aborted because the lease was reassigned",
            )?,
            heartbeat_age: Gauge::new(
                "leanfarm_heartbeat_age_seconds",
                "Seconds since the control loop last advanced",
            )?,
        };

        metrics.registry.register(Box::new(metrics.jobs_claimed.clone()))?;
        metrics.registry.register(Box::new(metrics.jobs_completed.clone()))?;
        metrics.registry.register(Box::new(metrics.job_failures.clone()))?;
        metrics.registry.register(Box::new(metrics.job_duration.clone()))?;
        metrics.registry.register(Box::new(metrics.jobs_in_flight.clone()))?;
        metrics.registry.register(Box::new(metrics.concurrency_ceiling.clone()))?;
        metrics.registry.register(Box::new(metrics.utilization.clone()))?;
        metrics.registry.register(Box::new(metrics.success_ratio.clone()))?;
        metrics.registry.register(Box::new(metrics.queue_depth.clone()))?;
        metrics.registry.register(Box::new(metrics.lease_lost.clone()))?;
        metrics.registry.register(Box::new(metrics.heartbeat_age.clone()))?;
        Ok(metrics)
    }

    pub fn record_claimed(&self) {
        self.jobs_claimed.inc();
    }

    pub fn record_outcome(&self, outcome: JobOutcome) {
        self.jobs_completed.with_label_values(&[outcome.as_str()]).inc();
        if outcome == JobOutcome::LeaseLost {
            self.lease_lost.inc();
        }
    }

    pub fn record_failure(&self, reason: &str) {
        self.job_failures.with_label_values(&[reason]).inc();
    }

    pub fn record_duration(&self, seconds: f64) {
        self.job_duration.observe(seconds);
    }

    pub fn record_queue_depth(&self, depth: &QueueDepth) {
        self.queue_depth.with_label_values(&["pending"]).set(depth.pending as i64);
        self.queue_depth.with_label_values(&["leased"]).set(depth.leased as i64);
        self.queue_depth
            .with_label_values(&["dead_lettered"])
            .set(depth.dead_lettered as i64);
    }

    /// Render in Prometheus text format
    pub fn render(&self, snapshot: &StateSnapshot) -> Result<String, prometheus::Error> {
        self.jobs_in_flight.set(snapshot.in_flight as i64);
        self.concurrency_ceiling.set(snapshot.concurrency_ceiling as i64);
        self.utilization.set(snapshot.utilization());
        self.success_ratio.set(snapshot.success_ratio());
        self.heartbeat_age.set(snapshot.heartbeat_age_seconds);

        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
