//! The scheduler core.
//!
//! Worker requests from the host and offers from the cluster meet here. All
//! request queue and tracker mutations happen under one lock per scheduler;
//! callbacks to the host are collected under that lock and fired after it is
//! released, so a callback may safely call back into the scheduler.
//!
//! ## Flow
//!
//! ```text
//! request_worker ──► RequestQueue ──┐
//!                                   ├─► Matcher ─► TaskLauncher ─► StatusTracker
//! resource_offers ─► OfferBuffer ───┘                                   │
//!                                                                       ▼
//! status_update ─────────────────────────────────────► callbacks ─► Supervisor
//! ```
//!
//! The cluster driver must not call back into the scheduler from inside a
//! driver call; events are delivered from the driver's own thread.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use fleet_id::{AgentId, FrameworkId, OfferId, TaskId};
use tracing::{debug, error, info, warn};

use crate::config::{SchedulerSettings, SHORT_DECLINE};
use crate::error::{SchedulerError, WaitError};
use crate::framework::FrameworkSession;
use crate::launcher::TaskLauncher;
use crate::matcher::{log_mismatch, Matcher};
use crate::offer::ResourceOffer;
use crate::offer_buffer::OfferBuffer;
use crate::online::{wait_until_online, Readiness};
use crate::request::{
    Notification, NotificationKind, RequestQueue, WorkerCallback, WorkerInfo, WorkerRequest,
};
use crate::spec::WorkerSpec;
use crate::supervisor::{NodeRegistry, Settled, Supervised, Supervisor};
use crate::tracker::{StatusOutcome, StatusTracker, TaskState, TaskStatus};

#[derive(Debug, Default)]
struct State {
    requests: RequestQueue,
    tracker: StatusTracker,
    /// Agents that recently accepted a task, most recent first.
    affinity: VecDeque<AgentId>,
    /// Labels of requests left unmatched by the last offer batch.
    unmatched_labels: BTreeSet<String>,
}

impl State {
    fn touch_affinity(&mut self, agent_id: &AgentId, capacity: usize) {
        if capacity == 0 {
            return;
        }
        self.affinity.retain(|a| a != agent_id);
        self.affinity.push_front(agent_id.clone());
        self.affinity.truncate(capacity);
    }

    /// Moves offers from recently used agents to the front, most recent
    /// first.
    fn arrange_by_affinity(&self, offers: &mut Vec<ResourceOffer>) {
        for agent_id in self.affinity.iter().rev() {
            if let Some(index) = offers.iter().position(|o| &o.agent_id == agent_id) {
                if index > 0 {
                    debug!(agent_id = %agent_id, "Rearranging offers based on affinity");
                    let offer = offers.remove(index);
                    offers.insert(0, offer);
                }
            }
        }
    }
}

/// Matches worker requests against cluster offers and tracks the launched
/// tasks.
pub struct Scheduler {
    settings: SchedulerSettings,
    session: Arc<FrameworkSession>,
    supervisor: Arc<Supervisor>,
    matcher: Matcher,
    launcher: TaskLauncher,
    offers: Arc<OfferBuffer>,
    state: Mutex<State>,
    processing: Mutex<Option<JoinHandle<()>>>,
    /// Bumped whenever the session stops; a processing loop started under an
    /// older generation exits.
    generation: AtomicU64,
    /// Notifications from a supervision pass, fired once the pass is over.
    deferred: Mutex<Vec<Notification>>,
}

impl Scheduler {
    pub fn new(
        settings: SchedulerSettings,
        session: Arc<FrameworkSession>,
        supervisor: Arc<Supervisor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            matcher: Matcher::new(settings.role.clone()),
            launcher: TaskLauncher::new(settings.controller_url.clone(), settings.role.clone()),
            offers: Arc::new(OfferBuffer::with_capacity(settings.offer_queue_capacity)),
            settings,
            session,
            supervisor,
            state: Mutex::new(State::default()),
            processing: Mutex::new(None),
            generation: AtomicU64::new(0),
            deferred: Mutex::new(Vec::new()),
        })
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn session(&self) -> &Arc<FrameworkSession> {
        &self.session
    }

    pub fn offer_buffer(&self) -> &Arc<OfferBuffer> {
        &self.offers
    }

    // =========================================================================
    // Host API
    // =========================================================================

    /// Queue a worker for launch.
    ///
    /// Starts the framework session if it is not running, otherwise asks the
    /// cluster to resend declined offers. If the label has configured
    /// attribute constraints and the spec has none, the label's apply.
    pub fn request_worker(
        &self,
        mut spec: WorkerSpec,
        callback: Arc<dyn WorkerCallback>,
    ) -> Result<(), SchedulerError> {
        if !(spec.cpus >= 0.0 && spec.cpus.is_finite()) {
            return Err(SchedulerError::InvalidLaunchSpec {
                task_id: spec.name,
                reason: format!("invalid cpus {}", spec.cpus),
            });
        }

        if spec.attributes.is_empty() {
            if let Some(selector) = self.settings.label_constraints.selector_for(&spec.label) {
                spec.attributes = selector.clone();
            }
        }

        let name = spec.name.clone();
        {
            let mut state = self.lock();
            if state.tracker.is_known(&name) || state.requests.contains(&name) {
                warn!(worker = %name, "Worker already pending, running or ended");
                return Err(SchedulerError::DuplicateWorker(name));
            }
            debug!(worker = %name, label = %spec.label, "Enqueuing worker request");
            state.requests.push(WorkerRequest::new(spec, callback));
        }

        if self.session.is_running() {
            self.session.revive();
            return Ok(());
        }

        if let Err(e) = self.session.start() {
            self.lock().requests.remove(&name);
            return Err(e);
        }
        Ok(())
    }

    /// Cancel a worker.
    ///
    /// A launched worker is killed and reports its end through the usual
    /// status path. A worker still waiting for an offer is removed and its
    /// `failed` callback fires immediately.
    pub fn cancel_worker(&self, name: &TaskId) -> Result<(), SchedulerError> {
        info!(worker = %name, "Terminating worker");

        let mut notifications = Vec::new();
        let kill = {
            let mut state = self.lock();
            if state.tracker.contains(name) {
                true
            } else if let Some(request) = state.requests.remove(name) {
                info!(worker = %name, "Removing enqueued worker request");
                notifications.push(Notification::new(
                    NotificationKind::Failed,
                    WorkerInfo {
                        name: name.clone(),
                        agent_id: None,
                    },
                    request.callback,
                ));
                false
            } else {
                warn!(worker = %name, "Asked to terminate unknown worker");
                false
            }
        };

        let result = if kill {
            info!(task_id = %name, "Killing task");
            self.session
                .driver()
                .kill_task(name)
                .map_err(SchedulerError::from)
        } else {
            Ok(())
        };

        notifications.into_iter().for_each(Notification::fire);
        self.supervise_if_on_demand();
        result
    }

    /// Number of requests waiting for an offer.
    pub fn pending_count(&self) -> usize {
        self.lock().requests.len()
    }

    /// Number of launched tasks that have not ended.
    pub fn active_count(&self) -> usize {
        self.lock().tracker.len()
    }

    pub fn is_framework_active(&self) -> bool {
        self.session.is_running()
    }

    pub fn framework_id(&self) -> Option<FrameworkId> {
        self.session.framework_id()
    }

    /// Current or final state of a launched task in this session.
    pub fn task_state(&self, name: &TaskId) -> Option<TaskState> {
        self.lock().tracker.state_of(name)
    }

    /// Labels of requests the last offer batch could not satisfy.
    pub fn unmatched_labels(&self) -> BTreeSet<String> {
        self.lock().unmatched_labels.clone()
    }

    fn readiness(&self, name: &TaskId) -> Readiness {
        let state = self.lock();
        if let Some(task) = state.tracker.get(name) {
            return if task.state == TaskState::Running {
                Readiness::Ready
            } else {
                Readiness::Pending
            };
        }
        if state.requests.contains(name) {
            return Readiness::Pending;
        }
        match state.tracker.terminal_record(name) {
            Some(record) => Readiness::Failed(format!(
                "Agent {name} became {}: {}",
                record.state,
                record.message.as_deref().unwrap_or_default()
            )),
            None => Readiness::Failed(format!("Agent {name} is no longer known")),
        }
    }

    /// Wait until the worker's task reports `RUNNING`.
    pub async fn wait_until_running(
        self: &Arc<Self>,
        name: &TaskId,
        interval: Duration,
        timeout: Duration,
    ) -> Result<(), WaitError> {
        {
            let state = self.lock();
            if !state.requests.contains(name) && state.tracker.state_of(name).is_none() {
                return Err(WaitError::UnknownTask(name.clone()));
            }
        }

        let scheduler = Arc::clone(self);
        let name = name.clone();
        wait_until_online(
            move || {
                let readiness = scheduler.readiness(&name);
                async move { readiness }
            },
            interval,
            timeout,
        )
        .await
    }

    /// Stop the framework session and the offer processing thread.
    ///
    /// Pending requests stay queued and are served once the session is
    /// started again.
    pub fn stop(&self) {
        let mut state = self.lock();
        self.stop_locked(&mut state);
    }

    fn stop_locked(&self, state: &mut State) {
        self.session.stop();
        self.generation.fetch_add(1, Ordering::SeqCst);
        state.tracker.clear_retired();
        state.unmatched_labels.clear();
        self.offers.interrupt();
        if let Some(handle) = self
            .processing
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            debug!(thread = ?handle.thread().name(), "Released offer processing thread");
        }
    }

    fn supervise_if_on_demand(&self) {
        if self.settings.on_demand_registration {
            self.supervisor.supervise(self);
        }
        let deferred =
            std::mem::take(&mut *self.deferred.lock().unwrap_or_else(PoisonError::into_inner));
        deferred.into_iter().for_each(Notification::fire);
    }

    // =========================================================================
    // Cluster callbacks
    // =========================================================================

    pub fn registered(&self, framework_id: FrameworkId) {
        info!(framework_id = %framework_id, "Framework registered");
        self.session.set_framework_id(framework_id);
    }

    pub fn reregistered(&self) {
        info!("Framework re-registered");
    }

    pub fn disconnected(&self) {
        info!("Framework disconnected");
    }

    /// Buffer incoming offers and process them.
    ///
    /// Offers the buffer cannot hold are declined short. In single-threaded
    /// mode the buffer is processed inline; otherwise the processing thread
    /// is started if needed.
    pub fn resource_offers(self: &Arc<Self>, offers: Vec<ResourceOffer>) {
        if self.settings.multi_threaded {
            self.ensure_processing();
        }

        for offer in offers {
            let offer_id = offer.id.clone();
            let agent_id = offer.agent_id.clone();
            if self.offers.enqueue(offer) {
                info!(offer_id = %offer_id, agent_id = %agent_id, "Queued offer");
            } else {
                warn!(offer_id = %offer_id, "Offer queue is full");
                self.decline(&offer_id, SHORT_DECLINE);
            }
        }

        if !self.settings.multi_threaded {
            let batch = self.offers.drain_all(Duration::ZERO);
            self.process_offers(batch);
        }
    }

    pub fn offer_rescinded(&self, offer_id: &OfferId) {
        info!(offer_id = %offer_id, "Rescinded offer");
        self.offers.remove(offer_id);
    }

    /// Apply a task status update.
    ///
    /// An update for a task this scheduler never launched is a protocol
    /// violation and is returned as an error the caller must treat as fatal.
    /// Once the session has stopped its terminal records are gone, so an
    /// unknown task is only logged.
    pub fn status_update(&self, status: TaskStatus) -> Result<StatusOutcome, SchedulerError> {
        debug!(
            task_id = %status.task_id,
            state = %status.state,
            message = status.message.as_deref().unwrap_or(""),
            "Status update"
        );

        let mut notifications = Vec::new();
        let outcome = match self.lock().tracker.on_status(&status, &mut notifications) {
            Ok(outcome) => outcome,
            Err(SchedulerError::UnknownTask(task_id)) if !self.session.is_running() => {
                warn!(task_id = %task_id, "Ignoring status update after the session stopped");
                StatusOutcome::Rejected
            }
            Err(e) => return Err(e),
        };
        notifications.into_iter().for_each(Notification::fire);
        self.supervise_if_on_demand();
        Ok(outcome)
    }

    pub fn agent_lost(&self, agent_id: &AgentId) {
        info!(agent_id = %agent_id, "Agent lost");
    }

    /// The driver hit an unrecoverable error; the session is gone.
    pub fn error(&self, message: &str) {
        error!(message, "Cluster driver error");
        self.stop();
    }

    // =========================================================================
    // Offer processing
    // =========================================================================

    fn is_current(&self, generation: u64) -> bool {
        self.session.is_running() && self.generation.load(Ordering::SeqCst) == generation
    }

    fn decline(&self, offer_id: &OfferId, refuse: Duration) {
        info!(offer_id = %offer_id, refuse_secs = refuse.as_secs_f64(), "Declining offer");
        if let Err(e) = self.session.driver().decline_offer(offer_id, refuse) {
            warn!(offer_id = %offer_id, error = %e, "Failed to decline offer");
        }
    }

    /// Match one batch of offers against pending requests, launching at
    /// most one task per offer. Unused offers are declined.
    pub fn process_offers(&self, mut offers: Vec<ResourceOffer>) {
        if offers.is_empty() {
            return;
        }

        let mut notifications = Vec::new();
        let mut declines = Vec::new();
        {
            let mut state = self.lock();
            let total = offers.len();
            info!(offers = total, "Processing offers");
            state.arrange_by_affinity(&mut offers);

            let now = Utc::now();
            let mut launched = 0usize;

            for offer in offers {
                if state.requests.is_empty() {
                    state.unmatched_labels.clear();
                    info!(offer_id = %offer.id, "No worker requests pending");
                    declines.push((offer.id, self.settings.decline_offer));
                    continue;
                }

                if !offer.is_available(now) {
                    info!(
                        offer_id = %offer.id,
                        agent_id = %offer.agent_id,
                        "Agent is in a maintenance window"
                    );
                    declines.push((offer.id, SHORT_DECLINE));
                    continue;
                }

                let mut allocation = None;
                let matched = state.requests.take_first(|request| {
                    match self.matcher.evaluate(&offer, &request.spec) {
                        Ok(found) => {
                            allocation = Some(found);
                            true
                        }
                        Err(shortfalls) => {
                            log_mismatch(&offer, &request.spec, &shortfalls);
                            false
                        }
                    }
                });

                let (Some(request), Some(allocation)) = (matched, allocation) else {
                    declines.push((offer.id, SHORT_DECLINE));
                    continue;
                };

                info!(offer_id = %offer.id, worker = %request.name(), "Offer matched");
                let label = request.spec.label.clone();
                match self.launcher.launch(
                    self.session.driver().as_ref(),
                    &offer,
                    request,
                    &allocation,
                    &mut state.tracker,
                    &mut notifications,
                ) {
                    Ok(_) => {
                        launched += 1;
                        state.unmatched_labels.remove(&label);
                        state.touch_affinity(&offer.agent_id, self.settings.affinity_cache_size);
                    }
                    Err(e) => {
                        warn!(offer_id = %offer.id, error = %e, "Launch failed");
                        declines.push((offer.id, SHORT_DECLINE));
                    }
                }
            }

            let pending = state.requests.len();
            if launched > 0 {
                info!(launched, offers = total, pending, "Created tasks");
            } else if pending > 0 {
                info!(offers = total, pending, "Did not match any offers");
            }

            let labels: Vec<String> = state.requests.iter().map(|r| r.spec.label.clone()).collect();
            state.unmatched_labels.extend(labels);
        }

        for (offer_id, refuse) in declines {
            self.decline(&offer_id, refuse);
        }
        notifications.into_iter().for_each(Notification::fire);
    }

    /// Start the offer processing thread unless one is alive.
    fn ensure_processing(self: &Arc<Self>) {
        let mut slot = self.processing.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }

        let thread_name = format!(
            "offer-processor-{}",
            self.framework_id()
                .map_or_else(|| "unregistered".to_string(), |id| id.to_string())
        );
        let weak = Arc::downgrade(self);
        let buffer = Arc::clone(&self.offers);
        let wait = self.settings.offer_wait;
        let generation = self.generation.load(Ordering::SeqCst);

        match std::thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || run_processing_loop(weak, buffer, wait, generation))
        {
            Ok(handle) => {
                info!(thread = %thread_name, "Started offer processing thread");
                *slot = Some(handle);
            }
            Err(e) => error!(error = %e, "Failed to start offer processing thread"),
        }
    }
}

fn run_processing_loop(
    scheduler: Weak<Scheduler>,
    buffer: Arc<OfferBuffer>,
    wait: Duration,
    generation: u64,
) {
    loop {
        match scheduler.upgrade() {
            Some(s) if s.is_current(generation) => {}
            _ => break,
        }

        let batch = buffer.drain_all(wait);

        let Some(scheduler) = scheduler.upgrade() else {
            break;
        };
        if !scheduler.session.is_running() {
            break;
        }
        // Offers drained after a restart belong to the new session.
        scheduler.process_offers(batch);
        if !scheduler.is_current(generation) {
            break;
        }
    }
    info!(generation, "Offer processing thread exiting");
}

impl Supervised for Scheduler {
    fn name(&self) -> &str {
        &self.session.info().name
    }

    fn is_session_running(&self) -> bool {
        self.session.is_running()
    }

    fn settle(&self, nodes: &dyn NodeRegistry) -> Settled {
        let mut notifications = Vec::new();
        let settled = {
            let mut state = self.lock();
            let nodes = nodes.worker_node_count();
            let cleared = if nodes == 0 {
                state.tracker.clear(&mut notifications)
            } else {
                0
            };
            let pending = state.requests.len();
            let active = state.tracker.len();
            let stopped = pending == 0 && active == 0 && nodes == 0;
            if stopped {
                self.stop_locked(&mut state);
            }
            Settled {
                pending,
                active,
                nodes,
                cleared,
                stopped,
            }
        };

        self.deferred
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(notifications);
        settled
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use fleet_id::OfferId;

    use super::*;
    use crate::driver::{FrameworkInfo, MockDriver};
    use crate::supervisor::InMemoryNodes;

    fn offer(id: &str, agent: &str) -> ResourceOffer {
        ResourceOffer::new(OfferId::parse(id).unwrap(), AgentId::parse(agent).unwrap())
    }

    #[test]
    fn test_affinity_moves_recent_agents_first() {
        let mut state = State::default();
        state.touch_affinity(&AgentId::parse("a2").unwrap(), 10);
        state.touch_affinity(&AgentId::parse("a3").unwrap(), 10);

        let mut offers = vec![offer("o1", "a1"), offer("o2", "a2"), offer("o3", "a3")];
        state.arrange_by_affinity(&mut offers);

        let agents: Vec<_> = offers.iter().map(|o| o.agent_id.as_str()).collect();
        assert_eq!(agents, vec!["a3", "a2", "a1"]);
    }

    #[test]
    fn test_affinity_is_bounded() {
        let mut state = State::default();
        for i in 0..5 {
            state.touch_affinity(&AgentId::parse(format!("a{i}")).unwrap(), 3);
        }
        state.touch_affinity(&AgentId::parse("a3").unwrap(), 3);

        let agents: Vec<_> = state.affinity.iter().map(|a| a.as_str()).collect();
        assert_eq!(agents, vec!["a3", "a4", "a2"]);
    }

    #[test]
    fn test_affinity_disabled() {
        let mut state = State::default();
        state.touch_affinity(&AgentId::parse("a1").unwrap(), 0);
        assert!(state.affinity.is_empty());
    }

    fn multi_threaded_scheduler() -> Arc<Scheduler> {
        let info = FrameworkInfo {
            name: "fleet-test".to_string(),
            user: String::new(),
            role: "*".to_string(),
            principal: "fleet".to_string(),
            id: None,
        };
        let session = Arc::new(FrameworkSession::new(Arc::new(MockDriver::new()), info));
        let supervisor = Arc::new(Supervisor::new(Arc::new(InMemoryNodes::new())));
        let settings = SchedulerSettings {
            multi_threaded: true,
            offer_wait: Duration::from_secs(30),
            ..SchedulerSettings::default()
        };
        Scheduler::new(settings, session, supervisor)
    }

    #[test]
    fn test_processing_thread_from_old_session_exits_after_restart() {
        let scheduler = multi_threaded_scheduler();
        scheduler.session().start().unwrap();
        scheduler.resource_offers(Vec::new());
        let old = scheduler.processing.lock().unwrap().take().unwrap();
        std::thread::sleep(Duration::from_millis(20));

        scheduler.stop();
        scheduler.session().start().unwrap();
        scheduler.resource_offers(Vec::new());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !old.is_finished() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert!(old.is_finished());
        assert!(scheduler
            .processing
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|h| !h.is_finished()));

        scheduler.stop();
    }
}
