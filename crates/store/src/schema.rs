//! Schema version compatibility probe

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};

/// The schema version reported for databases created before versioning
/// was recorded.
pub const FIRST_SCHEMA_VERSION: u32 = 1;

/// The schema version this crate is compatible with.
pub const CURRENT_SCHEMA_VERSION: u32 = 2;

/// Result of a schema check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSchemaResult {
    /// The version recorded in the database
    pub observed: u32,
    /// The version this crate expects
    pub expected: u32,
}

impl CheckSchemaResult {
    pub(crate) fn new(observed: u32, expected: u32) -> Self {
        Self { observed, expected }
    }

    /// Whether the observed version matches the expected one.
    #[must_use]
    pub fn is_match(&self) -> bool {
        self.observed == self.expected
    }

    /// Error with the mismatch details unless the versions match.
    pub fn ensure_match(&self) -> StoreResult<()> {
        if self.is_match() {
            Ok(())
        } else {
            Err(StoreError::SchemaVersionMismatch {
                observed: self.observed,
                expected: self.expected,
            })
        }
    }
}
