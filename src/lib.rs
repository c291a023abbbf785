//! Sandboxed Python snippet execution with session-scoped state.
//!
//! Each execution runs in a fresh, resource-limited worker process behind a
//! module allow-list. Top-level variables a snippet leaves behind can be
//! persisted under a session id and are injected into later executions of
//! the same session.

pub mod analysis;
pub mod codec;
pub mod config;
pub mod sandbox;
pub mod security;
pub mod session;
pub mod supervisor;

pub use analysis::{AnalysisKind, AnalysisRequest, PlotKind};
pub use codec::{SerializationGuard, Value};
pub use config::{Config, ConfigError};
pub use security::CapabilityPolicy;
pub use session::{SessionStore, SessionSummary, StoreError, VariableDescriptor};
pub use supervisor::{
    ErrorKind, ExecutionRequest, ExecutionResult, Supervisor, SupervisorError,
};

use std::sync::Arc;

/// Open the configured store and wire a supervisor over it. Validation
/// errors surface here, before any snippet runs.
pub fn build_supervisor(config: &Config) -> Result<Supervisor, BuildError> {
    config.validate()?;
    let store = SessionStore::new(&config.sessions.database_path, config.store_options()?)?;
    Ok(Supervisor::new(
        Arc::new(store),
        &config.policy()?,
        config.launcher(),
        config.supervisor_options()?,
    ))
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Store(#[from] StoreError),
}
