mod engine;
mod executor;
mod health;
mod metrics;
mod scratch;
mod state;
mod worker;

#[cfg(test)]
mod test_support;

use anyhow::{anyhow, Context};
use leanfarm_common::artifact::open_store;
use leanfarm_common::config::SandboxBackendKind;
use leanfarm_common::queue::RedisJobQueue;
use leanfarm_common::{Config, SecurityPolicy, SecurityProfile};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use engine::{DockerEngine, ProcessEngine, SandboxBackend};
use executor::SandboxExecutor;
use health::HealthState;
use metrics::Metrics;
use state::WorkerState;
use worker::{WorkerContext, WorkerSettings};

const EXIT_OK: i32 = 0;
const EXIT_FATAL: i32 = 1;
const EXIT_CONFIG: i32 = 2;

#[tokio::main]
async fn main() {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Lean Farm worker booting...");

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            std::process::exit(EXIT_CONFIG);
        }
    };
    let policy = match SecurityPolicy::from_config(&config) {
        Ok(policy) => policy,
        Err(e) => {
            error!(error = %e, "Invalid security policy");
            std::process::exit(EXIT_CONFIG);
        }
    };

    let code = match config.sandbox_backend {
        SandboxBackendKind::Docker => match DockerEngine::connect(config.sandbox_image.clone()).await {
            Ok(engine) => start(config, policy, engine).await,
            Err(e) => {
                error!(error = %e, "Docker sandbox backend unavailable");
                EXIT_FATAL
            }
        },
        SandboxBackendKind::Process => start(config, policy, ProcessEngine::new()).await,
    };
    std::process::exit(code);
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);
    match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => subscriber.json().init(),
        _ => subscriber.init(),
    }
}

/// Check the profile against the backend, then run until shutdown
async fn start<B: SandboxBackend>(config: Config, policy: SecurityPolicy, backend: B) -> i32 {
    if let Err(e) = backend.verify_profile(policy.profile).await {
        error!(
            error = %e,
            profile = %policy.profile,
            backend = backend.name(),
            "Security profile cannot be enforced by this backend"
        );
        return EXIT_CONFIG;
    }
    if policy.profile == SecurityProfile::Local {
        warn!("Running with the local profile: no syscall filter and no network isolation, development only");
    }

    match run_worker(config, policy, backend).await {
        Ok(()) => {
            info!("Worker shutdown complete");
            EXIT_OK
        }
        Err(e) => {
            error!(error = ?e, "Worker stopped on a fatal error");
            EXIT_FATAL
        }
    }
}

async fn run_worker<B: SandboxBackend>(config: Config, policy: SecurityPolicy, backend: B) -> anyhow::Result<()> {
    let queue = RedisJobQueue::connect(
        &config.redis_url,
        config.lease_ttl,
        config.max_attempts,
        config.retry_policy(),
    )
    .await
    .context("Failed to connect to the Redis job queue")?;
    let store = open_store(&config)
        .await
        .context("Failed to open the artifact store")?;
    tokio::fs::create_dir_all(&config.scratch_root)
        .await
        .with_context(|| format!("Failed to create scratch root {}", config.scratch_root.display()))?;

    let state = Arc::new(WorkerState::new(config.concurrency_ceiling));
    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

    info!(
        worker_id = %config.worker_id,
        backend = backend.name(),
        profile = %policy.profile,
        concurrency = config.concurrency_ceiling,
        max_attempts = config.max_attempts,
        lease_ttl_secs = config.lease_ttl.as_secs(),
        "Worker configured"
    );

    let ctx = Arc::new(WorkerContext {
        settings: WorkerSettings {
            worker_id: config.worker_id.clone(),
            concurrency_ceiling: config.concurrency_ceiling,
            heartbeat_interval: config.heartbeat_interval,
            artifact_prefix: config.artifact_key_prefix.clone(),
            poll_backoff: config.poll_backoff_policy(),
            settle_retry: config.storage_retry_policy(),
        },
        queue: Arc::new(queue),
        store,
        executor: SandboxExecutor::new(
            backend,
            config.scratch_root.clone(),
            config.output_capture_bytes,
            config.termination_grace,
        ),
        policy,
        state: state.clone(),
        metrics: metrics.clone(),
    });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health_state = Arc::new(HealthState {
        worker: state,
        metrics,
        stale_after: config.health_stale_after,
    });
    let mut health_task = tokio::spawn(health::serve(config.http_bind_addr, health_state, shutdown_rx.clone()));
    let worker_task = tokio::spawn(worker::run(ctx, shutdown_rx));

    let health_failure = tokio::select! {
        received = shutdown_signal() => {
            let name = received.context("Failed to install signal handlers")?;
            info!(signal = name, "Shutdown requested, draining");
            None
        }
        served = &mut health_task => Some(served),
    };

    let _ = shutdown_tx.send(true);
    worker_task.await.context("Worker loop panicked")?;

    let served = match health_failure {
        Some(served) => {
            served
                .context("Health server panicked")?
                .context("Health server failed")?;
            return Err(anyhow!("Health server stopped unexpectedly"));
        }
        None => health_task.await.context("Health server panicked")?,
    };
    served.context("Health server failed")
}

async fn shutdown_signal() -> std::io::Result<&'static str> {
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}
