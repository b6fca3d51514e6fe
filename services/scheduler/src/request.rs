//! Pending worker requests and their completion callbacks.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use fleet_id::{AgentId, TaskId};

use crate::spec::WorkerSpec;

/// Where a worker ended up, passed to callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub name: TaskId,
    /// `None` if the worker never reached an agent.
    pub agent_id: Option<AgentId>,
}

/// Lifecycle notifications for one worker.
///
/// `running` fires at most once. Exactly one of `finished` or `failed`
/// fires, after which the worker is forgotten.
pub trait WorkerCallback: Send + Sync {
    fn running(&self, worker: &WorkerInfo);
    fn finished(&self, worker: &WorkerInfo);
    fn failed(&self, worker: &WorkerInfo);
}

/// A request waiting for a compatible offer.
pub struct WorkerRequest {
    pub spec: WorkerSpec,
    pub callback: Arc<dyn WorkerCallback>,
    pub enqueued_at: Instant,
}

impl WorkerRequest {
    pub fn new(spec: WorkerSpec, callback: Arc<dyn WorkerCallback>) -> Self {
        Self {
            spec,
            callback,
            enqueued_at: Instant::now(),
        }
    }

    pub fn name(&self) -> &TaskId {
        &self.spec.name
    }
}

impl fmt::Debug for WorkerRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerRequest")
            .field("name", &self.spec.name)
            .field("label", &self.spec.label)
            .field("cpus", &self.spec.cpus)
            .field("memory_mb", &self.spec.memory_mb)
            .finish_non_exhaustive()
    }
}

/// FIFO of pending requests. The earliest compatible request wins.
#[derive(Debug, Default)]
pub struct RequestQueue {
    requests: VecDeque<WorkerRequest>,
}

impl RequestQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, request: WorkerRequest) {
        self.requests.push_back(request);
    }

    /// Removes and returns the earliest request satisfying `predicate`.
    pub fn take_first(
        &mut self,
        mut predicate: impl FnMut(&WorkerRequest) -> bool,
    ) -> Option<WorkerRequest> {
        let index = self.requests.iter().position(|r| predicate(r))?;
        self.requests.remove(index)
    }

    /// Removes the request named `name`, if queued.
    pub fn remove(&mut self, name: &TaskId) -> Option<WorkerRequest> {
        self.take_first(|r| r.name() == name)
    }

    pub fn contains(&self, name: &TaskId) -> bool {
        self.requests.iter().any(|r| r.name() == name)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRequest> {
        self.requests.iter()
    }
}

/// Which callback a notification invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Running,
    Finished,
    Failed,
}

/// A callback invocation collected under the scheduler lock and fired after
/// it is released, so callbacks may safely re-enter the scheduler.
pub struct Notification {
    pub kind: NotificationKind,
    pub worker: WorkerInfo,
    callback: Arc<dyn WorkerCallback>,
}

impl Notification {
    pub fn new(kind: NotificationKind, worker: WorkerInfo, callback: Arc<dyn WorkerCallback>) -> Self {
        Self {
            kind,
            worker,
            callback,
        }
    }

    pub fn fire(self) {
        match self.kind {
            NotificationKind::Running => self.callback.running(&self.worker),
            NotificationKind::Finished => self.callback.finished(&self.worker),
            NotificationKind::Failed => self.callback.failed(&self.worker),
        }
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("kind", &self.kind)
            .field("worker", &self.worker)
            .finish_non_exhaustive()
    }
}
