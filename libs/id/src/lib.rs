//! # fleet-id
//!
//! Typed identifiers for the fleet scheduler.
//!
//! Two families of IDs exist:
//!
//! - **Generated IDs** are minted by this process and use a prefixed ULID
//!   format, `{prefix}_{ulid}` (e.g. `fw_01HV4Z2WQXKJNM8GPQY6VBKC3D`).
//! - **Assigned IDs** are opaque strings handed to us by the cluster resource
//!   manager (offers, agents) or chosen by the host (task names). They are
//!   validated for emptiness and whitespace only.
//!
//! Keeping them as distinct types prevents passing an offer ID where a task
//! ID is expected.

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;

/// Re-export ulid for consumers that need raw ULID operations
pub use ulid::Ulid;
