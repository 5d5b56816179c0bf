use serde::Serialize;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// How one claimed job left this worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Failed and requeued for another attempt
    Failed,
    DeadLettered,
    /// Another worker owns the job now
    LeaseLost,
    /// Handed back during shutdown
    Released,
    /// Could not be settled; the lease will expire
    Abandoned,
}

impl JobOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            JobOutcome::Succeeded => "succeeded",
            JobOutcome::Failed => "failed",
            JobOutcome::DeadLettered => "dead_lettered",
            JobOutcome::LeaseLost => "lease_lost",
            JobOutcome::Released => "released",
            JobOutcome::Abandoned => "abandoned",
        }
    }
}

#[derive(Debug)]
struct Counters {
    in_flight: usize,
    peak_in_flight: usize,
    processed: u64,
    succeeded: u64,
    failed: u64,
    dead_lettered: u64,
    lease_lost: u64,
    released: u64,
    last_beat: Instant,
    draining: bool,
}

/// Point-in-time copy of the worker's counters
#[derive(Debug, Clone, Serialize)]
pub struct StateSnapshot {
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub concurrency_ceiling: usize,
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    pub lease_lost: u64,
    pub released: u64,
    pub heartbeat_age_seconds: f64,
    pub draining: bool,
}

impl StateSnapshot {
    pub fn utilization(&self) -> f64 {
        if self.concurrency_ceiling == 0 {
            return 0.0;
        }
        self.in_flight as f64 / self.concurrency_ceiling as f64
    }

    /// Succeeded over jobs that reached an outcome; 1.0 before the first one
    pub fn success_ratio(&self) -> f64 {
        let settled = self.succeeded + self.failed + self.dead_lettered;
        if settled == 0 {
            return 1.0;
        }
        self.succeeded as f64 / settled as f64
    }
}

/// Process-wide worker state, owned by `main` and shared by reference
///
/// Every update goes through one mutex; a poisoned lock is recovered since
/// the counters stay meaningful after a panicked holder.
#[derive(Debug)]
pub struct WorkerState {
    concurrency_ceiling: usize,
    counters: Mutex<Counters>,
}

impl WorkerState {
    pub fn new(concurrency_ceiling: usize) -> Self {
        Self {
            concurrency_ceiling,
            counters: Mutex::new(Counters {
                in_flight: 0,
                peak_in_flight: 0,
                processed: 0,
                succeeded: 0,
                failed: 0,
                dead_lettered: 0,
                lease_lost: 0,
                released: 0,
                last_beat: Instant::now(),
                draining: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Counters> {
        self.counters.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Called by the control loop on every iteration
    pub fn beat(&self) {
        self.lock().last_beat = Instant::now();
    }

    pub fn job_started(&self) {
        let mut counters = self.lock();
        counters.in_flight += 1;
        counters.peak_in_flight = counters.peak_in_flight.max(counters.in_flight);
    }

    pub fn job_finished(&self, outcome: JobOutcome) {
        let mut counters = self.lock();
        counters.in_flight = counters.in_flight.saturating_sub(1);
        counters.processed += 1;
        match outcome {
            JobOutcome::Succeeded => counters.succeeded += 1,
            JobOutcome::Failed => counters.failed += 1,
            JobOutcome::DeadLettered => counters.dead_lettered += 1,
            JobOutcome::LeaseLost => counters.lease_lost += 1,
            JobOutcome::Released => counters.released += 1,
            JobOutcome::Abandoned => {}
        }
    }

    pub fn set_draining(&self) {
        self.lock().draining = true;
    }

    pub fn snapshot(&self) -> StateSnapshot {
        let counters = self.lock();
        StateSnapshot {
            in_flight: counters.in_flight,
            peak_in_flight: counters.peak_in_flight,
            concurrency_ceiling: self.concurrency_ceiling,
            processed: counters.processed,
            succeeded: counters.succeeded,
            failed: counters.failed,
            dead_lettered: counters.dead_lettered,
            lease_lost: counters.lease_lost,
            released: counters.released,
            heartbeat_age_seconds: counters.last_beat.elapsed().as_secs_f64(),
            draining: counters.draining,
        }
    }

    /// Liveness: the control loop beat within `stale_after`
    pub fn is_live(&self, stale_after: Duration) -> bool {
        self.lock().last_beat.elapsed() <= stale_after
    }

    /// Readiness: spare claim capacity and not shutting down
    pub fn has_capacity(&self) -> bool {
        let counters = self.lock();
        !counters.draining && counters.in_flight < self.concurrency_ceiling
    }
}
