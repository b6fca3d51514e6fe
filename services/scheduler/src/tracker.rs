//! Task lifecycle tracking.
//!
//! Every launched worker has exactly one entry here from launch until its
//! first terminal status. Transitions only move forward:
//!
//! ```text
//! STAGING -> STARTING -> RUNNING -> { FINISHED | FAILED | KILLED | LOST | ERROR }
//! ```
//!
//! Once an entry reaches a terminal state its callback fires, the entry is
//! removed and a small terminal record is kept so duplicates are recognised.

use std::collections::HashMap;
use std::fmt;
use std::time::Instant;

use fleet_id::{AgentId, OfferId, TaskId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::SchedulerError;
use crate::request::{Notification, NotificationKind, WorkerInfo, WorkerRequest};

/// Task states reported by the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Staging,
    Starting,
    Running,
    Finished,
    Failed,
    Killed,
    Lost,
    Error,
}

impl TaskState {
    /// Returns true for states that end the task.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Failed | Self::Killed | Self::Lost | Self::Error
        )
    }

    /// Position in the lifecycle; terminal states share the last rank.
    fn rank(self) -> u8 {
        match self {
            Self::Staging => 0,
            Self::Starting => 1,
            Self::Running => 2,
            _ => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Staging => "TASK_STAGING",
            Self::Starting => "TASK_STARTING",
            Self::Running => "TASK_RUNNING",
            Self::Finished => "TASK_FINISHED",
            Self::Failed => "TASK_FAILED",
            Self::Killed => "TASK_KILLED",
            Self::Lost => "TASK_LOST",
            Self::Error => "TASK_ERROR",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A status update from the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub message: Option<String>,
}

impl TaskStatus {
    pub fn new(task_id: TaskId, state: TaskState) -> Self {
        Self {
            task_id,
            state,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A worker that has been submitted to the cluster.
#[derive(Debug)]
pub struct LaunchedTask {
    pub task_id: TaskId,
    pub agent_id: AgentId,
    pub offer_id: OfferId,
    /// The request this task was launched for.
    pub request: WorkerRequest,
    pub state: TaskState,
    running_notified: bool,
    pub launched_at: Instant,
}

impl LaunchedTask {
    /// A freshly launched task in `STAGING`.
    pub fn new(offer_id: OfferId, agent_id: AgentId, request: WorkerRequest) -> Self {
        Self {
            task_id: request.name().clone(),
            agent_id,
            offer_id,
            request,
            state: TaskState::Staging,
            running_notified: false,
            launched_at: Instant::now(),
        }
    }

    fn worker_info(&self) -> WorkerInfo {
        WorkerInfo {
            name: self.task_id.clone(),
            agent_id: Some(self.agent_id.clone()),
        }
    }

    fn notification(&self, kind: NotificationKind) -> Notification {
        Notification::new(kind, self.worker_info(), self.request.callback.clone())
    }
}

/// How a task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalRecord {
    pub state: TaskState,
    pub message: Option<String>,
}

/// What a status update did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusOutcome {
    /// The task moved to, or stayed in, a non-terminal state.
    Updated(TaskState),
    /// The task ended and was removed.
    Terminal(TaskState),
    /// The update was ignored: the task already ended or the update would
    /// move it backwards.
    Rejected,
}

/// Live tasks keyed by task ID, plus terminal records for this session.
#[derive(Debug, Default)]
pub struct StatusTracker {
    tasks: HashMap<TaskId, LaunchedTask>,
    retired: HashMap<TaskId, TerminalRecord>,
}

impl StatusTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a launched task.
    ///
    /// Task IDs are unique per session: the caller must not insert an ID
    /// that is live or already retired.
    pub fn insert(&mut self, task: LaunchedTask) {
        self.tasks.insert(task.task_id.clone(), task);
    }

    /// Apply a status update, queueing callback notifications.
    ///
    /// Returns an error for a task this tracker has never seen; the caller
    /// must treat that as fatal.
    pub fn on_status(
        &mut self,
        status: &TaskStatus,
        notifications: &mut Vec<Notification>,
    ) -> Result<StatusOutcome, SchedulerError> {
        let Some(task) = self.tasks.get_mut(&status.task_id) else {
            if let Some(record) = self.retired.get(&status.task_id) {
                warn!(
                    task_id = %status.task_id,
                    state = %status.state,
                    terminal_state = %record.state,
                    "Ignoring status update for task that already ended"
                );
                return Ok(StatusOutcome::Rejected);
            }
            error!(
                task_id = %status.task_id,
                state = %status.state,
                "Status update for unknown task"
            );
            return Err(SchedulerError::UnknownTask(status.task_id.clone()));
        };

        if status.state.rank() < task.state.rank() {
            warn!(
                task_id = %status.task_id,
                from = %task.state,
                to = %status.state,
                "Ignoring backwards status transition"
            );
            return Ok(StatusOutcome::Rejected);
        }

        debug!(
            task_id = %status.task_id,
            from = %task.state,
            to = %status.state,
            message = status.message.as_deref().unwrap_or(""),
            "Status update"
        );
        task.state = status.state;

        match status.state {
            TaskState::Staging | TaskState::Starting => Ok(StatusOutcome::Updated(status.state)),
            TaskState::Running => {
                if !task.running_notified {
                    task.running_notified = true;
                    notifications.push(task.notification(NotificationKind::Running));
                }
                Ok(StatusOutcome::Updated(status.state))
            }
            terminal => {
                let kind = if terminal == TaskState::Finished {
                    NotificationKind::Finished
                } else {
                    NotificationKind::Failed
                };
                notifications.push(task.notification(kind));
                self.tasks.remove(&status.task_id);
                self.retired.insert(
                    status.task_id.clone(),
                    TerminalRecord {
                        state: terminal,
                        message: status.message.clone(),
                    },
                );
                info!(task_id = %status.task_id, state = %terminal, "Task ended");
                Ok(StatusOutcome::Terminal(terminal))
            }
        }
    }

    pub fn contains(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id)
    }

    /// Live or ended in this session.
    pub fn is_known(&self, task_id: &TaskId) -> bool {
        self.tasks.contains_key(task_id) || self.retired.contains_key(task_id)
    }

    pub fn get(&self, task_id: &TaskId) -> Option<&LaunchedTask> {
        self.tasks.get(task_id)
    }

    /// Current state of a live task, or the final state of an ended one.
    pub fn state_of(&self, task_id: &TaskId) -> Option<TaskState> {
        self.tasks
            .get(task_id)
            .map(|t| t.state)
            .or_else(|| self.retired.get(task_id).map(|r| r.state))
    }

    pub fn terminal_record(&self, task_id: &TaskId) -> Option<&TerminalRecord> {
        self.retired.get(task_id)
    }

    /// Number of live tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Retire every live task as `LOST`, queueing its `failed`
    /// notification. Returns how many were retired.
    ///
    /// Later statuses for these tasks are rejected like any other duplicate.
    pub fn clear(&mut self, notifications: &mut Vec<Notification>) -> usize {
        let count = self.tasks.len();
        for (task_id, task) in self.tasks.drain() {
            warn!(
                task_id = %task_id,
                state = %task.state,
                "Retiring task without a terminal status"
            );
            notifications.push(task.notification(NotificationKind::Failed));
            self.retired.insert(
                task_id,
                TerminalRecord {
                    state: TaskState::Lost,
                    message: Some(format!("no worker nodes left while {}", task.state)),
                },
            );
        }
        count
    }

    /// Forget terminal records; called when the session ends.
    pub fn clear_retired(&mut self) {
        self.retired.clear();
    }
}
