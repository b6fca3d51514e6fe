//! In-process simulated cluster for local runs.
//!
//! Each agent offers its whole capacity while idle, has at most one offer
//! outstanding, and runs one task at a time. Launched tasks walk through
//! STAGING, RUNNING and FINISHED. Events are delivered from a tokio task,
//! never from inside a driver call.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use anyhow::Result;
use fleet_id::{AgentId, FrameworkId, OfferId, TaskId};
use fleet_scheduler::driver::{ClusterDriver, DriverError, FrameworkInfo};
use fleet_scheduler::launcher::TaskSpec;
use fleet_scheduler::offer::{names, Range, ResourceOffer};
use fleet_scheduler::supervisor::NodeRegistry;
use fleet_scheduler::{Scheduler, TaskState, TaskStatus};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

const STAGING_DELAY: Duration = Duration::from_millis(50);
const RUNNING_DELAY: Duration = Duration::from_millis(300);

/// Events the cluster delivers to the scheduler.
#[derive(Debug)]
pub enum ClusterEvent {
    Registered(FrameworkId),
    /// Offer idle agents, or one agent, that have no offer outstanding.
    OfferIdle(Option<AgentId>),
    Status(TaskStatus),
}

#[derive(Debug)]
struct SimAgent {
    id: AgentId,
    hostname: String,
    offered: Option<OfferId>,
    task: Option<TaskId>,
}

#[derive(Debug, Default)]
struct SimState {
    agents: Vec<SimAgent>,
    registered: bool,
    framework_id: Option<FrameworkId>,
    next_offer: u64,
}

/// A fake cluster resource manager.
pub struct SimulatedCluster {
    runtime: Handle,
    events: mpsc::UnboundedSender<ClusterEvent>,
    task_runtime: Duration,
    state: Mutex<SimState>,
}

impl SimulatedCluster {
    /// Must be called from within a tokio runtime.
    pub fn new(
        agents: usize,
        task_runtime: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ClusterEvent>)> {
        let (events, rx) = mpsc::unbounded_channel();
        let agents = (0..agents)
            .map(|i| -> Result<SimAgent> {
                Ok(SimAgent {
                    id: AgentId::parse(format!("agent-{i}"))?,
                    hostname: format!("sim-host-{i}"),
                    offered: None,
                    task: None,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let cluster = Arc::new(Self {
            runtime: Handle::current(),
            events,
            task_runtime,
            state: Mutex::new(SimState {
                agents,
                ..SimState::default()
            }),
        });
        Ok((cluster, rx))
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn send_later(&self, delay: Duration, event: ClusterEvent) {
        let events = self.events.clone();
        self.runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }

    /// Build offers for idle agents without an outstanding offer.
    fn take_offers(&self, only: Option<&AgentId>) -> Result<Vec<ResourceOffer>> {
        let mut state = self.state();
        if !state.registered {
            return Ok(Vec::new());
        }

        let mut offers = Vec::new();
        let mut next = state.next_offer;
        for agent in state.agents.iter_mut() {
            if agent.task.is_some() || agent.offered.is_some() {
                continue;
            }
            if only.is_some_and(|id| id != &agent.id) {
                continue;
            }
            next += 1;
            let offer_id = OfferId::parse(format!("offer-{next}"))?;
            agent.offered = Some(offer_id.clone());
            offers.push(
                ResourceOffer::new(offer_id, agent.id.clone())
                    .with_hostname(agent.hostname.clone())
                    .with_scalar(names::CPUS, 4.0)
                    .with_scalar(names::MEM, 8192.0)
                    .with_scalar(names::DISK, 20_000.0)
                    .with_ranges(names::PORTS, vec![Range::new(31000, 32000)])
                    .with_attribute("os", "linux"),
            );
        }
        state.next_offer = next;
        Ok(offers)
    }

    /// Applies a status to the agent table. Returns false if the task is no
    /// longer on any agent and the status must not be delivered.
    pub fn observe(&self, status: &TaskStatus) -> bool {
        let freed = {
            let mut state = self.state();
            let Some(agent) = state
                .agents
                .iter_mut()
                .find(|a| a.task.as_ref() == Some(&status.task_id))
            else {
                return false;
            };
            if !status.state.is_terminal() {
                return true;
            }
            agent.task = None;
            agent.id.clone()
        };

        self.send_later(Duration::ZERO, ClusterEvent::OfferIdle(Some(freed)));
        true
    }
}

/// One worker node per agent with a task assigned.
impl NodeRegistry for SimulatedCluster {
    fn worker_node_count(&self) -> usize {
        self.state().agents.iter().filter(|a| a.task.is_some()).count()
    }
}

impl ClusterDriver for SimulatedCluster {
    fn register(&self, info: &FrameworkInfo) -> Result<(), DriverError> {
        let framework_id = {
            let mut state = self.state();
            state.registered = true;
            *state
                .framework_id
                .get_or_insert_with(|| info.id.unwrap_or_else(FrameworkId::new))
        };
        info!(framework = %info.name, "Simulated cluster accepted registration");
        self.send_later(Duration::ZERO, ClusterEvent::Registered(framework_id));
        self.send_later(STAGING_DELAY, ClusterEvent::OfferIdle(None));
        Ok(())
    }

    fn launch_task(&self, offer_id: &OfferId, task: &TaskSpec) -> Result<(), DriverError> {
        {
            let mut state = self.state();
            let agent = state
                .agents
                .iter_mut()
                .find(|a| a.offered.as_ref() == Some(offer_id))
                .ok_or_else(|| DriverError::new(format!("offer {offer_id} is no longer valid")))?;
            agent.offered = None;
            agent.task = Some(task.task_id.clone());
        }

        debug!(task_id = %task.task_id, command = %task.command.value, "Simulated launch");
        let id = task.task_id.clone();
        self.send_later(
            STAGING_DELAY,
            ClusterEvent::Status(TaskStatus::new(id.clone(), TaskState::Staging)),
        );
        self.send_later(
            RUNNING_DELAY,
            ClusterEvent::Status(TaskStatus::new(id.clone(), TaskState::Running)),
        );
        self.send_later(
            RUNNING_DELAY + self.task_runtime,
            ClusterEvent::Status(
                TaskStatus::new(id, TaskState::Finished).with_message("Agent exited"),
            ),
        );
        Ok(())
    }

    fn kill_task(&self, task_id: &TaskId) -> Result<(), DriverError> {
        self.send_later(
            Duration::ZERO,
            ClusterEvent::Status(
                TaskStatus::new(task_id.clone(), TaskState::Killed).with_message("Killed"),
            ),
        );
        Ok(())
    }

    fn decline_offer(&self, offer_id: &OfferId, refuse: Duration) -> Result<(), DriverError> {
        let agent_id = {
            let mut state = self.state();
            let Some(agent) = state
                .agents
                .iter_mut()
                .find(|a| a.offered.as_ref() == Some(offer_id))
            else {
                return Ok(());
            };
            agent.offered = None;
            agent.id.clone()
        };
        debug!(offer_id = %offer_id, agent_id = %agent_id, "Offer declined");
        self.send_later(refuse, ClusterEvent::OfferIdle(Some(agent_id)));
        Ok(())
    }

    fn revive_offers(&self) -> Result<(), DriverError> {
        self.send_later(Duration::ZERO, ClusterEvent::OfferIdle(None));
        Ok(())
    }

    fn stop(&self) -> Result<(), DriverError> {
        let mut state = self.state();
        state.registered = false;
        for agent in state.agents.iter_mut() {
            agent.offered = None;
        }
        info!("Simulated cluster disconnected framework");
        Ok(())
    }
}

/// Deliver cluster events to the scheduler until the channel closes.
///
/// Returns an error on a status for a task the scheduler never launched.
pub async fn run_cluster_events(
    scheduler: Arc<Scheduler>,
    cluster: Arc<SimulatedCluster>,
    mut rx: mpsc::UnboundedReceiver<ClusterEvent>,
) -> Result<()> {
    while let Some(event) = rx.recv().await {
        match event {
            ClusterEvent::Registered(framework_id) => scheduler.registered(framework_id),
            ClusterEvent::OfferIdle(agent_id) => {
                let offers = cluster.take_offers(agent_id.as_ref())?;
                if offers.is_empty() {
                    continue;
                }
                let scheduler = Arc::clone(&scheduler);
                tokio::task::spawn_blocking(move || scheduler.resource_offers(offers)).await?;
            }
            ClusterEvent::Status(status) => {
                if !cluster.observe(&status) {
                    debug!(task_id = %status.task_id, "Dropping status for released task");
                    continue;
                }
                let scheduler = Arc::clone(&scheduler);
                if let Err(e) =
                    tokio::task::spawn_blocking(move || scheduler.status_update(status)).await?
                {
                    error!(error = %e, "Fatal status update");
                    return Err(e.into());
                }
            }
        }
    }
    Ok(())
}
