pub mod store;
pub mod sweeper;

pub use store::{SessionStore, StoreOptions};
pub use sweeper::{BackgroundSweeper, RetentionError, RetentionPolicy, SweepReport};

use crate::codec::{GuardError, Value};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

/// Named values visible to a snippet.
pub type Namespace = BTreeMap<String, Value>;

/// What one execution changed at top level.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NamespaceDelta {
    pub changed: BTreeMap<String, Value>,
    pub removed: Vec<String>,
    /// Drop every stored variable first, in the same transaction.
    pub replace: bool,
}

impl NamespaceDelta {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.removed.is_empty() && !self.replace
    }
}

/// Read-only projection of a stored variable. Raw bytes never leave the
/// store through this type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableDescriptor {
    pub name: String,
    pub type_tag: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    pub variable_count: usize,
    pub execution_count: u64,
    pub total_bytes: u64,
    pub active: bool,
}

/// A variable left out of a commit.
#[derive(Debug, Clone, PartialEq)]
pub struct DroppedVariable {
    pub name: String,
    pub error: GuardError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitReport {
    pub persisted: Vec<String>,
    pub removed: Vec<String>,
    pub dropped: Vec<DroppedVariable>,
    pub total_bytes: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session '{0}' not found")]
    SessionNotFound(String),
    #[error("session '{session_id}' would hold {attempted} bytes, over the {cap} byte session cap")]
    SessionOverflow {
        session_id: String,
        attempted: u64,
        cap: u64,
    },
    #[error("invalid session id: {0}")]
    InvalidId(String),
    #[error("session storage failed: {0}")]
    Storage(#[from] rusqlite::Error),
}

pub(crate) const MAX_SESSION_ID_LEN: usize = 256;

pub(crate) fn validate_session_id(id: &str) -> Result<(), StoreError> {
    if id.trim().is_empty() {
        return Err(StoreError::InvalidId("session id is empty".to_string()));
    }
    if id.len() > MAX_SESSION_ID_LEN {
        return Err(StoreError::InvalidId(format!(
            "session id is longer than {} bytes",
            MAX_SESSION_ID_LEN
        )));
    }
    if id.chars().any(char::is_control) {
        return Err(StoreError::InvalidId(
            "session id contains control characters".to_string(),
        ));
    }
    Ok(())
}
