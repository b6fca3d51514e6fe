//! Scheduler error types.

use fleet_id::TaskId;
use thiserror::Error;

use crate::driver::DriverError;

/// Errors raised by the synchronous scheduler core.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The cluster reported a task this scheduler never launched.
    ///
    /// Bookkeeping is out of sync with the cluster and cannot be repaired
    /// locally.
    #[error("received status update for unknown task {0}")]
    UnknownTask(TaskId),

    /// A worker with this name is queued, running, or already ended in this
    /// session.
    #[error("worker {0} is already pending, running or ended in this session")]
    DuplicateWorker(TaskId),

    /// The worker spec cannot be turned into a launch directive.
    #[error("invalid launch spec for {task_id}: {reason}")]
    InvalidLaunchSpec { task_id: TaskId, reason: String },

    /// The cluster rejected a call.
    #[error("cluster driver error: {0}")]
    Driver(#[from] DriverError),

    /// Framework registration kept failing.
    #[error("framework registration failed after {attempts} attempts: {last_error}")]
    RegistrationFailed { attempts: u32, last_error: String },
}

impl SchedulerError {
    /// True for errors that mean local state no longer reflects the cluster.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::UnknownTask(_))
    }
}

/// Errors returned by the asynchronous command session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The command queue was full and the command was rejected.
    #[error("{operation} command for {target} was dropped.")]
    Dropped {
        operation: &'static str,
        target: String,
    },

    /// The processing pipeline has shut down.
    #[error("{operation} command for {target} failed: session closed")]
    Closed {
        operation: &'static str,
        target: String,
    },
}

/// Errors from waiting on a worker to come online.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for worker to come online")]
    Timeout(std::time::Duration),

    /// The worker reached a terminal state before coming online.
    #[error("{0}")]
    Terminal(String),

    #[error("worker {0} is not known to the scheduler")]
    UnknownTask(TaskId),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dropped_message_names_operation_and_target() {
        let err = SessionError::Dropped {
            operation: "Kill",
            target: "agent3".to_string(),
        };
        assert_eq!(err.to_string(), "Kill command for agent3 was dropped.");
    }

    #[test]
    fn test_only_unknown_task_is_fatal() {
        let task = TaskId::parse("t1").unwrap();
        assert!(SchedulerError::UnknownTask(task.clone()).is_fatal());
        assert!(!SchedulerError::DuplicateWorker(task).is_fatal());
    }
}
