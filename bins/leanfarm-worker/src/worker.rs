/// Worker control loop
///
/// **Flow per job:**
/// claim → build sandbox spec → mark running → fetch bundle → execute →
/// upload outputs → complete (or release / abandon)
///
/// **Concurrency:** one semaphore permit per in-flight job. The loop only
/// polls the queue while it holds a free permit, so a full worker simply
/// stops claiming.
///
/// **Leases:** a keeper task heartbeats every job's lease. Losing the lease
/// or receiving shutdown publishes a `KillReason` that the executor's
/// watchdog picks up.
use futures_util::FutureExt;
use leanfarm_common::artifact::put_content;
use leanfarm_common::{
    build_sandbox_spec, ArtifactKey, ArtifactStore, Backoff, Completion, FailureReason, JobQueue, Lease,
    LeasedJob, QueueError, RetryPolicy, SecurityPolicy, Settlement, StorageError,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::engine::SandboxBackend;
use crate::executor::{ExecutionReport, KillReason, SandboxExecutor, Termination};
use crate::metrics::Metrics;
use crate::state::{JobOutcome, WorkerState};

/// Longest the loop waits for a permit before beating again
const BEAT_INTERVAL: Duration = Duration::from_secs(1);
const DEPTH_REFRESH: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub concurrency_ceiling: usize,
    pub heartbeat_interval: Duration,
    pub artifact_prefix: String,
    pub poll_backoff: RetryPolicy,
    /// Retries for settling a job when the queue is briefly unreachable
    pub settle_retry: RetryPolicy,
}

pub struct WorkerContext<B: SandboxBackend> {
    pub settings: WorkerSettings,
    pub queue: Arc<dyn JobQueue>,
    pub store: Arc<dyn ArtifactStore>,
    pub executor: SandboxExecutor<B>,
    pub policy: SecurityPolicy,
    pub state: Arc<WorkerState>,
    pub metrics: Arc<Metrics>,
}

/// Resolves when shutdown is requested; never if the sender is gone
pub(crate) async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Run until shutdown, then drain in-flight jobs
pub async fn run<B: SandboxBackend>(ctx: Arc<WorkerContext<B>>, mut shutdown: watch::Receiver<bool>) {
    let permits = Arc::new(Semaphore::new(ctx.settings.concurrency_ceiling));
    let mut tasks = JoinSet::new();
    let mut idle = Backoff::new(ctx.settings.poll_backoff.clone());
    let mut depth_refreshed: Option<Instant> = None;

    info!(
        worker_id = %ctx.settings.worker_id,
        concurrency = ctx.settings.concurrency_ceiling,
        backend = ctx.executor.backend().name(),
        profile = %ctx.policy.profile,
        "Worker loop started"
    );

    loop {
        ctx.state.beat();
        while let Some(Some(joined)) = tasks.join_next().now_or_never() {
            reap(&ctx, joined);
        }
        if depth_refreshed.map_or(true, |at| at.elapsed() >= DEPTH_REFRESH) {
            refresh_depth(&ctx).await;
            depth_refreshed = Some(Instant::now());
        }

        // Backpressure: no free permit, no poll
        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = tokio::time::sleep(BEAT_INTERVAL) => continue,
            _ = shutdown_requested(&mut shutdown) => break,
        };
        if *shutdown.borrow() {
            break;
        }

        match ctx.queue.claim_next(&ctx.settings.worker_id).await {
            Ok(Some(leased)) => {
                idle.reset();
                ctx.metrics.record_claimed();
                ctx.state.job_started();

                let job_ctx = ctx.clone();
                let job_shutdown = shutdown.clone();
                tasks.spawn(async move {
                    let _permit = permit;
                    let outcome = process_job(&job_ctx, leased, job_shutdown).await;
                    job_ctx.state.job_finished(outcome);
                    job_ctx.metrics.record_outcome(outcome);
                });
            }
            Ok(None) => {
                drop(permit);
                let delay = idle.next_delay();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
            Err(e) => {
                drop(permit);
                let delay = idle.next_delay();
                warn!(error = %e, delay_ms = delay.as_millis() as u64, "Claim failed, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown_requested(&mut shutdown) => break,
                }
            }
        }
    }

    ctx.state.set_draining();
    info!(in_flight = tasks.len(), "Draining in-flight jobs");
    while let Some(joined) = tasks.join_next().await {
        reap(&ctx, joined);
    }
    info!(
        active_sandboxes = ctx.executor.active(),
        peak_sandboxes = ctx.executor.peak_active(),
        "Worker loop stopped"
    );
}

fn reap<B: SandboxBackend>(ctx: &WorkerContext<B>, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Job task panicked");
        ctx.state.job_finished(JobOutcome::Abandoned);
        ctx.metrics.record_outcome(JobOutcome::Abandoned);
    }
}

async fn refresh_depth<B: SandboxBackend>(ctx: &WorkerContext<B>) {
    match ctx.queue.depth().await {
        Ok(depth) => ctx.metrics.record_queue_depth(&depth),
        Err(e) => debug!(error = %e, "Queue depth unavailable"),
    }
}

/// Heartbeat the lease until aborted; publish a kill reason on loss or shutdown
async fn keep_lease(
    queue: Arc<dyn JobQueue>,
    mut lease: Lease,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
    kill: watch::Sender<Option<KillReason>>,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately and the lease is fresh
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => match queue.heartbeat(&mut lease).await {
                Ok(()) => debug!(job_id = %lease.job_id, expires_at = %lease.expires_at, "Lease extended"),
                Err(QueueError::LeaseLost { job_id }) => {
                    warn!(job_id = %job_id, "Lease lost, aborting execution");
                    let _ = kill.send(Some(KillReason::LeaseLost));
                    return;
                }
                Err(e) => warn!(job_id = %lease.job_id, error = %e, "Heartbeat failed, retrying next tick"),
            },
            _ = shutdown_requested(&mut shutdown) => {
                let _ = kill.send(Some(KillReason::Shutdown));
                return;
            }
        }
    }
}

/// Drive one claimed job to an outcome
pub async fn process_job<B: SandboxBackend>(
    ctx: &WorkerContext<B>,
    leased: LeasedJob,
    shutdown: watch::Receiver<bool>,
) -> JobOutcome {
    let span = info_span!(
        "job",
        job_id = %leased.job.id,
        attempt = leased.job.attempts + 1,
        worker_id = %ctx.settings.worker_id
    );
    run_job(ctx, leased, shutdown).instrument(span).await
}

async fn run_job<B: SandboxBackend>(
    ctx: &WorkerContext<B>,
    mut leased: LeasedJob,
    shutdown: watch::Receiver<bool>,
) -> JobOutcome {
    let spec = match build_sandbox_spec(&leased.job, &ctx.policy) {
        Ok(spec) => spec,
        Err(violation) => {
            warn!(error = %violation, "Policy violation, no sandbox launched");
            let reason = FailureReason::PolicyViolation {
                message: violation.to_string(),
            };
            return settle(ctx, leased, Completion::Failed { reason, result: None }).await;
        }
    };

    match ctx.queue.mark_running(&mut leased).await {
        Ok(()) => {}
        Err(QueueError::LeaseLost { .. }) => {
            warn!("Lease lost before the job started");
            return JobOutcome::LeaseLost;
        }
        Err(e) => {
            error!(error = %e, "Failed to mark job running, leaving it to lease expiry");
            return JobOutcome::Abandoned;
        }
    }

    let (kill_tx, mut kill_rx) = watch::channel(None);
    let keeper = tokio::spawn(keep_lease(
        ctx.queue.clone(),
        leased.lease.clone(),
        ctx.settings.heartbeat_interval,
        shutdown,
        kill_tx,
    ));

    let outcome = execute_and_settle(ctx, leased, &spec, &mut kill_rx).await;
    keeper.abort();
    outcome
}

async fn execute_and_settle<B: SandboxBackend>(
    ctx: &WorkerContext<B>,
    leased: LeasedJob,
    spec: &leanfarm_common::SandboxSpec,
    kill_rx: &mut watch::Receiver<Option<KillReason>>,
) -> JobOutcome {
    let bundle = match fetch_bundle(ctx.store.as_ref(), &leased.job.bundle).await {
        Ok(bundle) => bundle,
        Err(e) => {
            warn!(bundle = %leased.job.bundle, error = %e, "Bundle unavailable");
            let reason = FailureReason::Storage { message: e.to_string() };
            return settle(ctx, leased, Completion::Failed { reason, result: None }).await;
        }
    };

    let report = match ctx
        .executor
        .execute(spec, &leased.job.command, &bundle, kill_rx)
        .await
    {
        Ok(report) => report,
        Err(e) => {
            warn!(error = %e, "Sandbox could not be started");
            let reason = FailureReason::SandboxFailure {
                exit_code: None,
                message: e.to_string(),
            };
            return settle(ctx, leased, Completion::Failed { reason, result: None }).await;
        }
    };

    ctx.metrics
        .record_duration(Duration::from_millis(report.result.duration_ms).as_secs_f64());
    if !report.reaped {
        error!("Sandbox was not confirmed dead, it may have leaked");
    }
    if !report.scratch_removed {
        error!("Scratch directory could not be removed");
    }

    match report.termination {
        Termination::Killed(KillReason::LeaseLost) => JobOutcome::LeaseLost,
        Termination::Killed(KillReason::Shutdown) => release(ctx, leased).await,
        _ => {
            let completion = completion_for(ctx, spec, report).await;
            settle(ctx, leased, completion).await
        }
    }
}

async fn fetch_bundle(store: &dyn ArtifactStore, key: &ArtifactKey) -> Result<Vec<u8>, StorageError> {
    let bytes = store.get(key).await?;
    key.verify(&bytes)?;
    Ok(bytes)
}

/// Map a finished execution onto the failure taxonomy, uploading outputs on success
async fn completion_for<B: SandboxBackend>(
    ctx: &WorkerContext<B>,
    spec: &leanfarm_common::SandboxSpec,
    report: ExecutionReport,
) -> Completion {
    let ExecutionReport {
        termination,
        mut result,
        outputs,
        ..
    } = report;

    let reason = match termination {
        Termination::TimedOut => FailureReason::TimedOut {
            timeout_seconds: spec.timeout.as_secs(),
        },
        Termination::Crashed(message) => FailureReason::SandboxFailure {
            exit_code: None,
            message,
        },
        Termination::Killed(reason) => FailureReason::SandboxFailure {
            exit_code: None,
            message: format!("killed: {:?}", reason),
        },
        Termination::QuotaExceeded { used_bytes } => FailureReason::ScratchQuotaExceeded {
            used_bytes,
            quota_bytes: spec.scratch_quota_bytes,
        },
        Termination::Exited { .. } if outputs.quota_exceeded => FailureReason::ScratchQuotaExceeded {
            used_bytes: outputs.total_bytes,
            quota_bytes: spec.scratch_quota_bytes,
        },
        Termination::Exited { exit_code: 0 } => {
            let mut artifacts = Vec::with_capacity(outputs.files.len());
            for (name, bytes) in &outputs.files {
                match put_content(ctx.store.as_ref(), &ctx.settings.artifact_prefix, bytes).await {
                    Ok(key) => {
                        debug!(file = %name, key = %key, "Stored output artifact");
                        artifacts.push(key);
                    }
                    Err(e) => {
                        warn!(file = %name, error = %e, "Failed to store output artifact");
                        return Completion::Failed {
                            reason: FailureReason::Storage { message: e.to_string() },
                            result: Some(result),
                        };
                    }
                }
            }
            result.artifacts = artifacts;
            return Completion::Succeeded(result);
        }
        Termination::Exited { exit_code } => FailureReason::SandboxFailure {
            exit_code: Some(exit_code),
            message: exit_message(&result.stderr),
        },
    };
    Completion::Failed {
        reason,
        result: Some(result),
    }
}

/// Last non-blank stderr line, short enough for a job record
fn exit_message(stderr: &str) -> String {
    stderr
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .unwrap_or("payload exited with a non-zero status")
        .chars()
        .take(200)
        .collect()
}

async fn settle<B: SandboxBackend>(ctx: &WorkerContext<B>, leased: LeasedJob, completion: Completion) -> JobOutcome {
    if let Completion::Failed { reason, .. } = &completion {
        ctx.metrics.record_failure(reason.label());
    }

    let mut backoff = Backoff::new(ctx.settings.settle_retry.clone());
    let max_attempts = ctx.settings.settle_retry.max_attempts().max(1);
    let mut attempt = 0;
    loop {
        attempt += 1;
        match ctx.queue.complete(leased.clone(), completion.clone()).await {
            Ok(Settlement::Succeeded) => {
                info!(outcome = "succeeded", "Job succeeded");
                return JobOutcome::Succeeded;
            }
            Ok(Settlement::Requeued { ready_at }) => {
                info!(outcome = "requeued", ready_at = %ready_at, "Job failed, requeued");
                return JobOutcome::Failed;
            }
            Ok(Settlement::DeadLettered) => {
                warn!(outcome = "dead_lettered", "Job dead-lettered");
                return JobOutcome::DeadLettered;
            }
            Err(QueueError::LeaseLost { .. }) => {
                warn!("Lease lost before settlement, result discarded");
                return JobOutcome::LeaseLost;
            }
            Err(e) if attempt < max_attempts && matches!(e, QueueError::Redis(_)) => {
                let delay = backoff.next_delay();
                warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "Settlement failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(error = %e, "Failed to settle job, leaving it to lease expiry");
                return JobOutcome::Abandoned;
            }
        }
    }
}

async fn release<B: SandboxBackend>(ctx: &WorkerContext<B>, leased: LeasedJob) -> JobOutcome {
    match ctx.queue.release(leased).await {
        Ok(()) => {
            info!(outcome = "released", "Job handed back for shutdown");
            JobOutcome::Released
        }
        Err(QueueError::LeaseLost { .. }) => JobOutcome::LeaseLost,
        Err(e) => {
            warn!(error = %e, "Failed to release job, leaving it to lease expiry");
            JobOutcome::Abandoned
        }
    }
}
