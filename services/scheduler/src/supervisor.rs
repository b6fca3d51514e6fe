//! Framework teardown supervision.
//!
//! After every status update and every cancellation the supervisor checks
//! whether a scheduler still has anything to do:
//!
//! - pending requests waiting for offers
//! - live tasks in the status tracker
//! - worker nodes the host still knows about
//!
//! When all three are empty, the framework session is stopped. A node count
//! of zero while tasks are still tracked is treated as stale bookkeeping:
//! those tasks are retired as lost first. The counts, the clear and the stop
//! happen under the scheduler's own lock in one [`Supervised::settle`] call.
//!
//! Note: this self-healing hides lost status updates. A cleared tracker
//! means some terminal status never arrived.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tracing::{debug, info, warn};

/// Source of the host's worker node count.
pub trait NodeRegistry: Send + Sync {
    /// Number of worker nodes the host currently has for this framework.
    fn worker_node_count(&self) -> usize;
}

/// A node registry backed by a counter, for hosts without their own.
#[derive(Debug, Default)]
pub struct InMemoryNodes {
    count: AtomicUsize,
}

impl InMemoryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, count: usize) {
        self.count.store(count, Ordering::SeqCst);
    }

    pub fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrement, saturating at zero.
    pub fn remove(&self) {
        let _ = self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

impl NodeRegistry for InMemoryNodes {
    fn worker_node_count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Counts observed by one [`Supervised::settle`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Settled {
    pub pending: usize,
    /// Live tasks left after any stale ones were retired.
    pub active: usize,
    pub nodes: usize,
    /// Tasks retired because no worker nodes were left.
    pub cleared: usize,
    pub stopped: bool,
}

/// What the supervisor needs from a scheduler.
pub trait Supervised: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str;

    fn is_session_running(&self) -> bool;

    /// Make one teardown decision under the target's own lock.
    ///
    /// Reads the node count from `nodes`, retires every live task if it is
    /// zero, and stops the session when no pending requests, live tasks or
    /// nodes remain. `nodes` must not call back into the target.
    fn settle(&self, nodes: &dyn NodeRegistry) -> Settled;
}

/// Outcome of one supervision pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The session keeps running.
    Retained {
        pending: usize,
        active: usize,
        nodes: usize,
    },
    TornDown,
    /// There was no session to supervise.
    AlreadyStopped,
}

/// Decides when framework sessions are torn down.
///
/// One supervisor may be shared by several schedulers; passes are
/// serialized by its own lock.
pub struct Supervisor {
    lock: Mutex<()>,
    nodes: Arc<dyn NodeRegistry>,
}

impl Supervisor {
    pub fn new(nodes: Arc<dyn NodeRegistry>) -> Self {
        Self {
            lock: Mutex::new(()),
            nodes,
        }
    }

    /// Run one supervision pass over `target`.
    ///
    /// Must not be called while holding the target's own state lock.
    pub fn supervise(&self, target: &dyn Supervised) -> Decision {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.supervise_locked(target)
    }

    /// Run one supervision pass over every target, in order.
    pub fn supervise_all<'a>(
        &self,
        targets: impl IntoIterator<Item = &'a dyn Supervised>,
    ) -> Vec<Decision> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        targets
            .into_iter()
            .map(|target| self.supervise_locked(target))
            .collect()
    }

    fn supervise_locked(&self, target: &dyn Supervised) -> Decision {
        if !target.is_session_running() {
            debug!(scheduler = target.name(), "Session already stopped");
            return Decision::AlreadyStopped;
        }

        let settled = target.settle(self.nodes.as_ref());
        if settled.cleared > 0 {
            warn!(
                scheduler = target.name(),
                cleared = settled.cleared,
                "No worker nodes left but tasks still tracked, cleared"
            );
        }

        debug!(
            scheduler = target.name(),
            pending = settled.pending,
            active = settled.active,
            nodes = settled.nodes,
            "Supervising"
        );

        if settled.stopped {
            info!(
                scheduler = target.name(),
                "No active tasks, worker nodes or pending requests, stopping session"
            );
            return Decision::TornDown;
        }

        Decision::Retained {
            pending: settled.pending,
            active: settled.active,
            nodes: settled.nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;

    use rstest::rstest;

    use super::*;

    struct Fake {
        running: AtomicBool,
        pending: AtomicUsize,
        active: AtomicUsize,
    }

    impl Fake {
        fn new(pending: usize, active: usize) -> Self {
            Self {
                running: AtomicBool::new(true),
                pending: AtomicUsize::new(pending),
                active: AtomicUsize::new(active),
            }
        }
    }

    impl Supervised for Fake {
        fn name(&self) -> &str {
            "fake"
        }
        fn is_session_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }
        fn settle(&self, nodes: &dyn NodeRegistry) -> Settled {
            let nodes = nodes.worker_node_count();
            let pending = self.pending.load(Ordering::SeqCst);
            let cleared = if nodes == 0 {
                self.active.swap(0, Ordering::SeqCst)
            } else {
                0
            };
            let active = self.active.load(Ordering::SeqCst);
            let stopped = pending == 0 && active == 0 && nodes == 0;
            if stopped {
                self.running.store(false, Ordering::SeqCst);
            }
            Settled {
                pending,
                active,
                nodes,
                cleared,
                stopped,
            }
        }
    }

    fn supervisor(nodes: usize) -> Supervisor {
        let registry = Arc::new(InMemoryNodes::new());
        registry.set(nodes);
        Supervisor::new(registry)
    }

    #[test]
    fn test_idle_session_torn_down() {
        let fake = Fake::new(0, 0);
        assert_eq!(supervisor(0).supervise(&fake), Decision::TornDown);
        assert!(!fake.is_session_running());
        assert_eq!(supervisor(0).supervise(&fake), Decision::AlreadyStopped);
    }

    #[rstest]
    #[case(1, 0, 0)]
    #[case(0, 1, 1)]
    #[case(0, 0, 1)]
    fn test_any_work_retains_session(
        #[case] pending: usize,
        #[case] active: usize,
        #[case] nodes: usize,
    ) {
        let fake = Fake::new(pending, active);
        assert!(matches!(
            supervisor(nodes).supervise(&fake),
            Decision::Retained { .. }
        ));
        assert!(fake.is_session_running());
    }

    #[test]
    fn test_stale_tasks_cleared_without_nodes() {
        let fake = Fake::new(0, 3);
        assert_eq!(supervisor(0).supervise(&fake), Decision::TornDown);
        assert_eq!(fake.active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_stale_tasks_cleared_but_pending_retains() {
        let fake = Fake::new(2, 3);
        assert_eq!(
            supervisor(0).supervise(&fake),
            Decision::Retained {
                pending: 2,
                active: 0,
                nodes: 0
            }
        );
        assert_eq!(fake.active.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_supervise_all() {
        let idle = Fake::new(0, 0);
        let busy = Fake::new(1, 0);
        let decisions = supervisor(0).supervise_all([&idle as &dyn Supervised, &busy]);
        assert_eq!(decisions[0], Decision::TornDown);
        assert!(matches!(decisions[1], Decision::Retained { .. }));
    }

    #[test]
    fn test_in_memory_nodes_saturate() {
        let nodes = InMemoryNodes::new();
        nodes.remove();
        assert_eq!(nodes.worker_node_count(), 0);
        nodes.add();
        nodes.add();
        nodes.remove();
        assert_eq!(nodes.worker_node_count(), 1);
    }
}
