//! fleet Scheduler
//!
//! Runs the scheduler against an in-process simulated cluster. A handful of
//! workers is requested through the command session; the process exits once
//! the supervisor has torn the framework session down, or on ctrl-c.
//!
//! ## Environment
//!
//! - `FLEET_*`: scheduler configuration, see `Config::from_env`
//! - `FLEET_DEMO_WORKERS`: workers to request (default 3)
//! - `FLEET_DEMO_AGENTS`: simulated agents (default 2)

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use fleet_id::TaskId;
use fleet_scheduler::{
    CommandSession, Config, CoreFlow, FrameworkSession, Scheduler, StateEvent, Supervisor,
    WorkerSpec,
};
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod simulation;

use simulation::{run_cluster_events, SimulatedCluster};

const DEFAULT_DEMO_WORKERS: usize = 3;
const DEFAULT_DEMO_AGENTS: usize = 2;
const DEMO_TASK_RUNTIME: Duration = Duration::from_secs(2);

fn env_count(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str())),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting fleet scheduler");
    info!(
        master_url = %config.master_url,
        framework = %config.framework_name,
        role = %config.role,
        multi_threaded = config.multi_threaded,
        "Configuration loaded"
    );

    let workers = env_count("FLEET_DEMO_WORKERS", DEFAULT_DEMO_WORKERS)?;
    let agents = env_count("FLEET_DEMO_AGENTS", DEFAULT_DEMO_AGENTS)?;

    // Create the simulated cluster; it also reports the host's worker nodes
    let (cluster, cluster_events) = SimulatedCluster::new(agents, DEMO_TASK_RUNTIME)?;

    let session = Arc::new(FrameworkSession::new(
        cluster.clone(),
        config.framework_info(),
    ));
    let supervisor = Arc::new(Supervisor::new(cluster.clone()));
    let scheduler = Scheduler::new(config.scheduler_settings(), session, supervisor);

    let mut cluster_handle = tokio::spawn(run_cluster_events(
        Arc::clone(&scheduler),
        cluster,
        cluster_events,
    ));

    // Start the command session
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();
    let commands = CommandSession::spawn(
        CoreFlow::new(Arc::clone(&scheduler), config.session.clone()),
        move |event: StateEvent| {
            let _ = event_tx.send(event);
        },
        &config.session,
    );

    let mut expected = 0usize;
    for _ in 0..workers {
        let spec = WorkerSpec::new(TaskId::generate("fleet-worker"), 1.0, 1024).with_label("linux");
        let name = spec.name.clone();
        match commands.launch(spec) {
            Ok(()) => {
                expected += 1;
                info!(worker = %name, "Requested worker");
            }
            Err(e) => warn!(worker = %name, error = %e, "Worker request rejected"),
        }
    }

    let mut ended = 0usize;
    let mut outcome = Ok(());
    let mut check = tokio::time::interval(Duration::from_millis(500));
    loop {
        if ended >= expected && !scheduler.is_framework_active() {
            info!(workers = expected, "All workers ended and the framework session is down");
            break;
        }

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                break;
            }
            result = &mut cluster_handle => {
                match result {
                    Ok(Ok(())) => info!("Cluster event loop exited"),
                    Ok(Err(e)) => {
                        error!(error = %e, "Cluster event loop failed");
                        outcome = Err(e);
                    }
                    Err(e) => error!(error = %e, "Cluster event task panicked"),
                }
                break;
            }
            Some(event) = event_rx.recv() => {
                match &event {
                    StateEvent::Running(worker) => info!(
                        worker = %worker.name,
                        agent_id = ?worker.agent_id,
                        "Worker running"
                    ),
                    StateEvent::Finished(worker) | StateEvent::Failed(worker) => {
                        ended += 1;
                        info!(worker = %worker.name, event = ?event, ended, "Worker ended");
                    }
                    other => info!(event = ?other, "State event"),
                }
            }
            _ = check.tick() => {}
        }
    }

    // Signal shutdown to all workers
    commands.shutdown();
    scheduler.stop();
    cluster_handle.abort();

    info!("Fleet scheduler shutdown complete");
    outcome
}
