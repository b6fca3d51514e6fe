//! Cluster driver interface and mock implementation.
//!
//! The driver is the scheduler's only way of talking to the cluster resource
//! manager:
//! - Registering and disconnecting the framework
//! - Launching tasks on offers, killing tasks
//! - Declining offers and reviving declined ones
//!
//! Cluster events flow the other way, through the `Scheduler` callbacks.
//! A mock implementation is provided for testing and development.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use fleet_id::{FrameworkId, OfferId, TaskId};
use thiserror::Error;
use tracing::{debug, info};

use crate::launcher::TaskSpec;

/// A failed driver call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct DriverError(pub String);

impl DriverError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Identity the framework registers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameworkInfo {
    pub name: String,
    pub user: String,
    pub role: String,
    pub principal: String,
    /// Set when re-registering after a failover.
    pub id: Option<FrameworkId>,
}

/// Calls from the scheduler to the cluster resource manager.
pub trait ClusterDriver: Send + Sync {
    /// Register the framework. Success is confirmed asynchronously through
    /// the `registered` callback.
    fn register(&self, info: &FrameworkInfo) -> Result<(), DriverError>;

    /// Launch one task on an offer.
    fn launch_task(&self, offer_id: &OfferId, task: &TaskSpec) -> Result<(), DriverError>;

    /// Kill a running task. The terminal status arrives asynchronously.
    fn kill_task(&self, task_id: &TaskId) -> Result<(), DriverError>;

    /// Decline an offer, asking not to see its resources again for `refuse`.
    fn decline_offer(&self, offer_id: &OfferId, refuse: Duration) -> Result<(), DriverError>;

    /// Ask for offers again, including ones declined earlier.
    fn revive_offers(&self) -> Result<(), DriverError>;

    /// Disconnect from the cluster.
    fn stop(&self) -> Result<(), DriverError>;
}

/// A driver call recorded by [`MockDriver`].
#[derive(Debug, Clone, PartialEq)]
pub enum DriverCall {
    Register(String),
    Launch { offer_id: OfferId, task: TaskSpec },
    Kill(TaskId),
    Decline { offer_id: OfferId, refuse: Duration },
    Revive,
    Stop,
}

/// Mock driver for testing and development.
///
/// Records every call and succeeds unless configured otherwise.
#[derive(Debug, Default)]
pub struct MockDriver {
    calls: Mutex<Vec<DriverCall>>,

    /// Whether launches should fail.
    fail_launches: bool,

    /// Registrations left to fail before one succeeds.
    failing_registrations: AtomicU32,
}

impl MockDriver {
    /// Create a new mock driver.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock driver that fails all launches.
    pub fn failing() -> Self {
        Self {
            fail_launches: true,
            ..Self::default()
        }
    }

    /// Create a mock driver whose first `count` registrations fail.
    pub fn with_failing_registrations(count: u32) -> Self {
        Self {
            failing_registrations: AtomicU32::new(count),
            ..Self::default()
        }
    }

    fn record(&self, call: DriverCall) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<DriverCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Tasks launched so far.
    pub fn launched(&self) -> Vec<TaskSpec> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Launch { task, .. } => Some(task),
                _ => None,
            })
            .collect()
    }

    /// Offers declined so far, with their refusal windows.
    pub fn declined(&self) -> Vec<(OfferId, Duration)> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Decline { offer_id, refuse } => Some((offer_id, refuse)),
                _ => None,
            })
            .collect()
    }

    /// Tasks killed so far.
    pub fn killed(&self) -> Vec<TaskId> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                DriverCall::Kill(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matcher: impl Fn(&DriverCall) -> bool) -> usize {
        self.calls().iter().filter(|c| matcher(c)).count()
    }
}

impl ClusterDriver for MockDriver {
    fn register(&self, info: &FrameworkInfo) -> Result<(), DriverError> {
        self.record(DriverCall::Register(info.name.clone()));
        let remaining = self.failing_registrations.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_registrations
                .store(remaining - 1, Ordering::SeqCst);
            return Err(DriverError::new("mock registration failure"));
        }
        info!(framework = %info.name, "Mock registering framework");
        Ok(())
    }

    fn launch_task(&self, offer_id: &OfferId, task: &TaskSpec) -> Result<(), DriverError> {
        self.record(DriverCall::Launch {
            offer_id: offer_id.clone(),
            task: task.clone(),
        });
        if self.fail_launches {
            return Err(DriverError::new("mock launch failure"));
        }
        info!(task_id = %task.task_id, offer_id = %offer_id, "Mock launching task");
        Ok(())
    }

    fn kill_task(&self, task_id: &TaskId) -> Result<(), DriverError> {
        self.record(DriverCall::Kill(task_id.clone()));
        debug!(task_id = %task_id, "Mock killing task");
        Ok(())
    }

    fn decline_offer(&self, offer_id: &OfferId, refuse: Duration) -> Result<(), DriverError> {
        self.record(DriverCall::Decline {
            offer_id: offer_id.clone(),
            refuse,
        });
        Ok(())
    }

    fn revive_offers(&self) -> Result<(), DriverError> {
        self.record(DriverCall::Revive);
        Ok(())
    }

    fn stop(&self) -> Result<(), DriverError> {
        self.record(DriverCall::Stop);
        info!("Mock driver stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info() -> FrameworkInfo {
        FrameworkInfo {
            name: "fleet".to_string(),
            user: String::new(),
            role: "*".to_string(),
            principal: "fleet".to_string(),
            id: None,
        }
    }

    #[test]
    fn test_mock_records_calls() {
        let driver = MockDriver::new();
        driver.register(&info()).unwrap();
        driver
            .decline_offer(&OfferId::parse("o1").unwrap(), Duration::from_secs(1))
            .unwrap();
        driver.revive_offers().unwrap();

        assert_eq!(driver.calls().len(), 3);
        assert_eq!(driver.declined()[0].1, Duration::from_secs(1));
        assert_eq!(driver.count(|c| matches!(c, DriverCall::Revive)), 1);
    }

    #[test]
    fn test_failing_registrations_recover() {
        let driver = MockDriver::with_failing_registrations(2);
        assert!(driver.register(&info()).is_err());
        assert!(driver.register(&info()).is_err());
        assert!(driver.register(&info()).is_ok());
    }
}
