//! Polling until a launched worker comes online.

use std::future::Future;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::error::WaitError;

/// Default time between probes.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Result of a single probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    Pending,
    /// The worker can never come online; carries the reason.
    Failed(String),
}

/// Probe every `interval`, starting immediately, until the probe reports
/// ready or failed, or `timeout` elapses.
pub async fn wait_until_online<F, Fut>(
    mut probe: F,
    interval: Duration,
    timeout: Duration,
) -> Result<(), WaitError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Readiness>,
{
    let poll = async {
        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut attempts = 0u32;

        loop {
            ticker.tick().await;
            attempts += 1;
            match probe().await {
                Readiness::Ready => return Ok(()),
                Readiness::Failed(reason) => return Err(WaitError::Terminal(reason)),
                Readiness::Pending => debug!(attempts, "Worker not online yet"),
            }
        }
    };

    tokio::time::timeout(timeout, poll)
        .await
        .unwrap_or(Err(WaitError::Timeout(timeout)))
}
