//! Concrete ID types.

use crate::{define_id, define_name};

// =============================================================================
// Generated IDs
// =============================================================================

define_id!(FrameworkId, "fw");

// =============================================================================
// Assigned IDs
// =============================================================================

define_name!(OfferId);
define_name!(AgentId);
define_name!(TaskId);

impl TaskId {
    /// Generates a unique task name of the form `{prefix}-{ulid}`.
    ///
    /// Used by hosts that do not pick worker names themselves.
    #[must_use]
    pub fn generate(prefix: &str) -> Self {
        Self(format!(
            "{}-{}",
            prefix,
            crate::Ulid::new().to_string().to_lowercase()
        ))
    }
}

// =============================================================================
// Tests
// =============================================================================
