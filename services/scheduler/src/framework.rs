//! The framework session: this process's live registration with the cluster.
//!
//! A session is an owned, reference-counted handle with an explicit
//! `start`/`stop` lifecycle. The scheduler starts it on demand when the first
//! worker is requested and the supervisor stops it once nothing is left to
//! do. A stopped session can be started again.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use fleet_id::FrameworkId;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::driver::{ClusterDriver, FrameworkInfo};
use crate::error::SchedulerError;

/// Default number of registration attempts before giving up.
pub const DEFAULT_REGISTRATION_ATTEMPTS: u32 = 5;

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(3),
            max: Duration::from_secs(30),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Calculate delay for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(30) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

// =============================================================================
// Framework Session
// =============================================================================

#[derive(Debug, Default)]
struct SessionState {
    framework_id: Option<FrameworkId>,
    started_at: Option<Instant>,
}

/// Handle to the framework's connection to the cluster.
pub struct FrameworkSession {
    driver: Arc<dyn ClusterDriver>,
    info: FrameworkInfo,
    backoff: BackoffPolicy,
    max_attempts: u32,
    running: AtomicBool,
    /// Serializes concurrent `start` calls.
    starting: Mutex<()>,
    state: Mutex<SessionState>,
}

impl FrameworkSession {
    /// Create a stopped session.
    pub fn new(driver: Arc<dyn ClusterDriver>, info: FrameworkInfo) -> Self {
        Self {
            driver,
            info,
            backoff: BackoffPolicy::default(),
            max_attempts: DEFAULT_REGISTRATION_ATTEMPTS,
            running: AtomicBool::new(false),
            starting: Mutex::new(()),
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Override the registration retry policy.
    pub fn with_backoff(mut self, backoff: BackoffPolicy, max_attempts: u32) -> Self {
        self.backoff = backoff;
        self.max_attempts = max_attempts.max(1);
        self
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn driver(&self) -> &Arc<dyn ClusterDriver> {
        &self.driver
    }

    pub fn info(&self) -> &FrameworkInfo {
        &self.info
    }

    /// Register with the cluster, retrying with backoff.
    ///
    /// Blocks the calling thread between attempts. Starting a running
    /// session is a no-op.
    pub fn start(&self) -> Result<(), SchedulerError> {
        let _starting = self.starting.lock().unwrap_or_else(PoisonError::into_inner);
        if self.is_running() {
            return Ok(());
        }

        let mut info = self.info.clone();
        info.id = self.framework_id();

        let mut last_error = String::new();
        for attempt in 0..self.max_attempts {
            match self.driver.register(&info) {
                Ok(()) => {
                    self.state().started_at = Some(Instant::now());
                    self.running.store(true, Ordering::SeqCst);
                    info!(framework = %info.name, attempt, "Framework session started");
                    return Ok(());
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt + 1 < self.max_attempts {
                        let delay = self.backoff.delay(attempt);
                        warn!(
                            framework = %info.name,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            error = %e,
                            "Framework registration failed, retrying"
                        );
                        std::thread::sleep(delay);
                    }
                }
            }
        }

        error!(
            framework = %info.name,
            attempts = self.max_attempts,
            error = %last_error,
            "Framework registration failed"
        );
        Err(SchedulerError::RegistrationFailed {
            attempts: self.max_attempts,
            last_error,
        })
    }

    /// Disconnect from the cluster. Stopping a stopped session is a no-op.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.state().started_at = None;
        match self.driver.stop() {
            Ok(()) => info!(framework = %self.info.name, "Framework session stopped"),
            Err(e) => warn!(framework = %self.info.name, error = %e, "Error stopping driver"),
        }
    }

    /// Ask the cluster to resend offers declined earlier.
    pub fn revive(&self) {
        if !self.is_running() {
            return;
        }
        if let Err(e) = self.driver.revive_offers() {
            warn!(error = %e, "Failed to revive offers");
        } else {
            debug!("Revived offers");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// How long the session has been running, if it is.
    pub fn uptime(&self) -> Option<Duration> {
        self.state().started_at.map(|t| t.elapsed())
    }

    /// ID assigned at registration, kept across restarts of the session.
    pub fn framework_id(&self) -> Option<FrameworkId> {
        self.state().framework_id
    }

    pub fn set_framework_id(&self, id: FrameworkId) {
        self.state().framework_id = Some(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{DriverCall, MockDriver};

    fn info() -> FrameworkInfo {
        FrameworkInfo {
            name: "fleet".to_string(),
            user: String::new(),
            role: "*".to_string(),
            principal: "fleet".to_string(),
            id: None,
        }
    }

    fn fast() -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            max: Duration::from_millis(5),
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_grows_to_max() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay(0), Duration::from_secs(3));
        assert_eq!(policy.delay(1), Duration::from_secs(6));
        assert_eq!(policy.delay(10), Duration::from_secs(30));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let policy = BackoffPolicy::default();
        for attempt in 0..5 {
            let delay = policy.delay(attempt);
            assert!(delay <= Duration::from_millis(37_500));
            assert!(delay >= Duration::from_millis(2_250));
        }
    }

    #[test]
    fn test_start_stop() {
        let driver = Arc::new(MockDriver::new());
        let session = FrameworkSession::new(driver.clone(), info());

        session.start().unwrap();
        session.start().unwrap();
        assert!(session.is_running());
        assert!(session.uptime().is_some());

        session.stop();
        session.stop();
        assert!(!session.is_running());
        assert_eq!(driver.count(|c| matches!(c, DriverCall::Register(_))), 1);
        assert_eq!(driver.count(|c| matches!(c, DriverCall::Stop)), 1);
    }

    #[test]
    fn test_registration_retries() {
        let driver = Arc::new(MockDriver::with_failing_registrations(2));
        let session = FrameworkSession::new(driver.clone(), info()).with_backoff(fast(), 5);

        session.start().unwrap();
        assert_eq!(driver.count(|c| matches!(c, DriverCall::Register(_))), 3);
    }

    #[test]
    fn test_registration_gives_up() {
        let driver = Arc::new(MockDriver::with_failing_registrations(10));
        let session = FrameworkSession::new(driver, info()).with_backoff(fast(), 3);

        let err = session.start().unwrap_err();
        assert!(matches!(err, SchedulerError::RegistrationFailed { attempts: 3, .. }));
        assert!(!session.is_running());
    }

    #[test]
    fn test_revive_only_when_running() {
        let driver = Arc::new(MockDriver::new());
        let session = FrameworkSession::new(driver.clone(), info());
        session.revive();
        session.start().unwrap();
        session.revive();
        assert_eq!(driver.count(|c| matches!(c, DriverCall::Revive)), 1);
    }
}
