//! Asynchronous, backpressured front end.
//!
//! A `CommandSession` accepts launch and kill commands without blocking. The
//! commands go through a bounded queue to a single consumer task that hands
//! them, one at a time, to a [`SchedulerFlow`]. Lifecycle changes come back
//! as [`StateEvent`]s delivered to one handler.
//!
//! When the queue is full the newest command is rejected on the spot with
//! [`SessionError::Dropped`]; commands are never dropped silently.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use fleet_id::TaskId;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::SessionSettings;
use crate::error::{SessionError, WaitError};
use crate::request::{WorkerCallback, WorkerInfo};
use crate::scheduler::Scheduler;
use crate::spec::WorkerSpec;

// =============================================================================
// Commands and events
// =============================================================================

/// A command submitted to the session.
#[derive(Debug, Clone)]
pub enum Command {
    Launch(WorkerSpec),
    Kill(TaskId),
}

impl Command {
    pub fn operation(&self) -> &'static str {
        match self {
            Self::Launch(_) => "Launch",
            Self::Kill(_) => "Kill",
        }
    }

    pub fn target(&self) -> &TaskId {
        match self {
            Self::Launch(spec) => &spec.name,
            Self::Kill(id) => id,
        }
    }
}

/// Worker lifecycle changes published by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateEvent {
    /// The worker was queued for launch.
    Enqueued(TaskId),
    Running(WorkerInfo),
    Finished(WorkerInfo),
    Failed(WorkerInfo),
    /// A kill was sent for the worker.
    KillRequested(TaskId),
}

/// Receives state events, one at a time, in publication order.
pub trait StateEventHandler: Send + 'static {
    fn on_event(&mut self, event: StateEvent);
}

impl<F> StateEventHandler for F
where
    F: FnMut(StateEvent) + Send + 'static,
{
    fn on_event(&mut self, event: StateEvent) {
        self(event)
    }
}

/// Publishing side of the event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<StateEvent>,
}

impl EventSink {
    pub fn emit(&self, event: StateEvent) {
        if self.tx.send(event).is_err() {
            debug!("State event handler is gone, dropping event");
        }
    }
}

/// Worker callback that republishes lifecycle changes as state events.
struct EventCallback {
    sink: EventSink,
}

impl WorkerCallback for EventCallback {
    fn running(&self, worker: &WorkerInfo) {
        self.sink.emit(StateEvent::Running(worker.clone()));
    }

    fn finished(&self, worker: &WorkerInfo) {
        self.sink.emit(StateEvent::Finished(worker.clone()));
    }

    fn failed(&self, worker: &WorkerInfo) {
        self.sink.emit(StateEvent::Failed(worker.clone()));
    }
}

// =============================================================================
// Flow
// =============================================================================

/// The pipeline stage that executes commands.
///
/// Commands are handled strictly one at a time.
#[async_trait]
pub trait SchedulerFlow: Send + 'static {
    async fn handle(&mut self, command: Command, events: &EventSink) -> Result<()>;
}

/// Runs commands against the synchronous [`Scheduler`], so both front ends
/// share one state machine.
pub struct CoreFlow {
    scheduler: Arc<Scheduler>,
    settings: SessionSettings,
}

impl CoreFlow {
    pub fn new(scheduler: Arc<Scheduler>, settings: SessionSettings) -> Self {
        Self {
            scheduler,
            settings,
        }
    }

    /// Cancel the worker if it is not running within the agent timeout.
    fn watch_online(&self, name: TaskId) {
        let scheduler = Arc::clone(&self.scheduler);
        let interval = self.settings.poll_interval;
        let timeout = self.settings.agent_timeout;

        tokio::spawn(async move {
            match scheduler.wait_until_running(&name, interval, timeout).await {
                Ok(()) => debug!(worker = %name, "Worker is online"),
                Err(WaitError::Timeout(_)) => {
                    warn!(worker = %name, "Worker did not come online in time, cancelling");
                    let scheduler = Arc::clone(&scheduler);
                    let cancelled = tokio::task::spawn_blocking(move || {
                        scheduler.cancel_worker(&name)
                    })
                    .await;
                    match cancelled {
                        Ok(Err(e)) => warn!(error = %e, "Failed to cancel worker"),
                        Err(e) => error!(error = %e, "Cancel task failed"),
                        Ok(Ok(())) => {}
                    }
                }
                Err(e) => info!(worker = %name, error = %e, "Worker will not come online"),
            }
        });
    }
}

#[async_trait]
impl SchedulerFlow for CoreFlow {
    async fn handle(&mut self, command: Command, events: &EventSink) -> Result<()> {
        match command {
            Command::Launch(spec) => {
                let name = spec.name.clone();
                let callback = Arc::new(EventCallback {
                    sink: events.clone(),
                });
                let scheduler = Arc::clone(&self.scheduler);

                // Registering the framework may block on retries
                let result =
                    tokio::task::spawn_blocking(move || scheduler.request_worker(spec, callback))
                        .await?;

                match result {
                    Ok(()) => {
                        events.emit(StateEvent::Enqueued(name.clone()));
                        self.watch_online(name);
                        Ok(())
                    }
                    Err(e) => {
                        events.emit(StateEvent::Failed(WorkerInfo {
                            name,
                            agent_id: None,
                        }));
                        Err(e.into())
                    }
                }
            }
            Command::Kill(name) => {
                let scheduler = Arc::clone(&self.scheduler);
                let target = name.clone();
                tokio::task::spawn_blocking(move || scheduler.cancel_worker(&target)).await??;
                events.emit(StateEvent::KillRequested(name));
                Ok(())
            }
        }
    }
}

// =============================================================================
// Session
// =============================================================================

/// Handle for submitting commands. Cheap to clone; the pipeline stops on
/// [`CommandSession::shutdown`] or when every handle is dropped.
#[derive(Clone)]
pub struct CommandSession {
    tx: mpsc::Sender<Command>,
    shutdown_tx: Arc<watch::Sender<bool>>,
    capacity: usize,
}

impl CommandSession {
    /// Start the pipeline on the current tokio runtime.
    pub fn spawn<F, H>(flow: F, handler: H, settings: &SessionSettings) -> Self
    where
        F: SchedulerFlow,
        H: StateEventHandler,
    {
        let capacity = settings.command_queue_size.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(run_event_loop(handler, event_rx));
        tokio::spawn(run_command_loop(
            flow,
            rx,
            shutdown_rx,
            EventSink { tx: event_tx },
        ));

        info!(capacity, "Command session started");
        Self {
            tx,
            shutdown_tx: Arc::new(shutdown_tx),
            capacity,
        }
    }

    /// Submit a command without blocking.
    pub fn submit(&self, command: Command) -> Result<(), SessionError> {
        let operation = command.operation();
        let target = command.target().to_string();

        self.tx.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                warn!(operation, target = %target, "Command queue is full, dropping command");
                SessionError::Dropped { operation, target }
            }
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed { operation, target },
        })
    }

    pub fn launch(&self, spec: WorkerSpec) -> Result<(), SessionError> {
        self.submit(Command::Launch(spec))
    }

    pub fn kill(&self, name: TaskId) -> Result<(), SessionError> {
        self.submit(Command::Kill(name))
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Stop the pipeline. Commands still queued are discarded.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait until the pipeline has stopped, up to `timeout`.
    pub async fn closed(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.tx.closed()).await.is_ok()
    }
}

/// Resolves once shutdown is signalled or the sender is gone.
async fn shutdown_signalled(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

async fn run_command_loop<F: SchedulerFlow>(
    mut flow: F,
    mut rx: mpsc::Receiver<Command>,
    mut shutdown: watch::Receiver<bool>,
    sink: EventSink,
) {
    loop {
        let command = tokio::select! {
            biased;

            _ = shutdown_signalled(&mut shutdown) => {
                info!("Command session received shutdown signal");
                break;
            }

            command = rx.recv() => match command {
                Some(command) => command,
                None => {
                    info!("All command session handles dropped");
                    break;
                }
            },
        };

        let operation = command.operation();
        let target = command.target().clone();
        debug!(operation, target = %target, "Processing command");

        let result = tokio::select! {
            biased;

            _ = shutdown_signalled(&mut shutdown) => {
                info!(operation, target = %target, "Shutdown while processing command");
                break;
            }

            result = flow.handle(command, &sink) => result,
        };

        if let Err(e) = result {
            error!(operation, target = %target, error = %e, "Command failed");
        }
    }

    rx.close();
    debug!("Command loop stopped");
}

async fn run_event_loop<H: StateEventHandler>(
    mut handler: H,
    mut rx: mpsc::UnboundedReceiver<StateEvent>,
) {
    while let Some(event) = rx.recv().await {
        handler.on_event(event);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use tokio::sync::Notify;

    use super::*;

    /// Flow that signals when it starts a command and then never finishes.
    struct StuckFlow {
        started: Arc<Notify>,
    }

    #[async_trait]
    impl SchedulerFlow for StuckFlow {
        async fn handle(&mut self, _command: Command, _events: &EventSink) -> Result<()> {
            self.started.notify_one();
            std::future::pending::<()>().await;
            Ok(())
        }
    }

    /// Flow that echoes every command as an event.
    struct EchoFlow;

    #[async_trait]
    impl SchedulerFlow for EchoFlow {
        async fn handle(&mut self, command: Command, events: &EventSink) -> Result<()> {
            match command {
                Command::Launch(spec) => events.emit(StateEvent::Enqueued(spec.name)),
                Command::Kill(name) => events.emit(StateEvent::KillRequested(name)),
            }
            Ok(())
        }
    }

    fn id(name: &str) -> TaskId {
        TaskId::parse(name).unwrap()
    }

    fn settings(size: usize) -> SessionSettings {
        SessionSettings::default().with_command_queue_size(size)
    }

    #[tokio::test]
    async fn test_kill_dropped_when_full() {
        let started = Arc::new(Notify::new());
        let session = CommandSession::spawn(
            StuckFlow {
                started: started.clone(),
            },
            |_event: StateEvent| {},
            &settings(1),
        );

        session.kill(id("agent1")).unwrap();
        started.notified().await;
        session.kill(id("agent2")).unwrap();

        let err = session.kill(id("agent3")).unwrap_err();
        assert_eq!(err.to_string(), "Kill command for agent3 was dropped.");
        session.shutdown();
    }

    #[tokio::test]
    async fn test_launch_dropped_when_full() {
        let started = Arc::new(Notify::new());
        let session = CommandSession::spawn(
            StuckFlow {
                started: started.clone(),
            },
            |_event: StateEvent| {},
            &settings(1),
        );

        session
            .launch(WorkerSpec::new(id("agent1"), 0.1, 32))
            .unwrap();
        started.notified().await;
        session
            .launch(WorkerSpec::new(id("agent2"), 0.1, 32))
            .unwrap();

        let err = session
            .launch(WorkerSpec::new(id("agent3"), 0.1, 32))
            .unwrap_err();
        assert_eq!(
            err,
            SessionError::Dropped {
                operation: "Launch",
                target: "agent3".to_string()
            }
        );
        assert_eq!(err.to_string(), "Launch command for agent3 was dropped.");
        session.shutdown();
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let session = CommandSession::spawn(
            EchoFlow,
            move |event: StateEvent| {
                sink.lock().unwrap().push(event);
                let _ = done_tx.send(());
            },
            &settings(4),
        );

        session.launch(WorkerSpec::new(id("w1"), 0.1, 32)).unwrap();
        session.kill(id("w1")).unwrap();
        done_rx.recv().await.unwrap();
        done_rx.recv().await.unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                StateEvent::Enqueued(id("w1")),
                StateEvent::KillRequested(id("w1"))
            ]
        );
    }

    #[tokio::test]
    async fn test_shutdown_closes_session() {
        let session = CommandSession::spawn(EchoFlow, |_event: StateEvent| {}, &settings(2));
        session.shutdown();
        assert!(session.closed(Duration::from_secs(5)).await);

        let err = session.kill(id("late")).unwrap_err();
        assert!(matches!(err, SessionError::Closed { operation: "Kill", .. }));
    }

    #[tokio::test]
    async fn test_zero_capacity_raised_to_one() {
        let session = CommandSession::spawn(EchoFlow, |_event: StateEvent| {}, &settings(0));
        assert_eq!(session.capacity(), 1);
    }
}
