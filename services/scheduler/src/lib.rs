//! fleet Scheduler Library
//!
//! Launches short-lived build workers on a cluster resource manager that
//! hands out resources as offers. The host asks for workers; the scheduler
//! matches the requests against incoming offers, launches tasks, follows
//! their status, and disconnects from the cluster once nothing is left.
//!
//! ## Architecture
//!
//! ```text
//! CommandSession ──► CoreFlow ──┐
//!                               ▼
//! host ──────────────────► Scheduler ◄──── ClusterDriver events
//!                          ├── OfferBuffer
//!                          ├── Matcher / TaskLauncher
//!                          ├── StatusTracker
//!                          └── FrameworkSession ──► Supervisor
//! ```
//!
//! ## Modules
//!
//! - `scheduler`: The synchronous core and cluster callbacks
//! - `session`: Backpressured asynchronous front end
//! - `matcher`: Offer/spec compatibility and port selection
//! - `launcher`: Task description building
//! - `tracker`: Task status state machine
//! - `supervisor`: Framework teardown decisions

pub mod config;
pub mod constraints;
pub mod driver;
pub mod error;
pub mod framework;
pub mod launcher;
pub mod matcher;
pub mod offer;
pub mod offer_buffer;
pub mod online;
pub mod request;
pub mod scheduler;
pub mod session;
pub mod spec;
pub mod supervisor;
pub mod tracker;

// Re-export commonly used types
pub use config::{Config, SchedulerSettings, SessionSettings};
pub use driver::{ClusterDriver, DriverError, FrameworkInfo, MockDriver};
pub use error::{SchedulerError, SessionError, WaitError};
pub use framework::FrameworkSession;
pub use offer::ResourceOffer;
pub use request::{WorkerCallback, WorkerInfo};
pub use scheduler::Scheduler;
pub use session::{CommandSession, CoreFlow, StateEvent};
pub use spec::WorkerSpec;
pub use supervisor::{InMemoryNodes, Supervisor};
pub use tracker::{TaskState, TaskStatus};
