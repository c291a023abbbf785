use super::SessionStore;
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error, PartialEq)]
pub enum RetentionError {
    #[error("inactive_after must be positive")]
    ZeroInactive,
    #[error("delete_after ({delete_after}s) must be longer than inactive_after ({inactive_after}s)")]
    DeleteBeforeInactive {
        inactive_after: u64,
        delete_after: u64,
    },
    #[error("{0} hours is out of range")]
    OutOfRange(u64),
}

/// When idle sessions stop being listed and when they disappear.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    inactive_after: Duration,
    delete_after: Duration,
}

impl RetentionPolicy {
    pub fn new(inactive_after: Duration, delete_after: Duration) -> Result<Self, RetentionError> {
        if inactive_after.is_zero() {
            return Err(RetentionError::ZeroInactive);
        }
        if delete_after <= inactive_after {
            return Err(RetentionError::DeleteBeforeInactive {
                inactive_after: inactive_after.as_secs(),
                delete_after: delete_after.as_secs(),
            });
        }
        Ok(Self {
            inactive_after,
            delete_after,
        })
    }

    pub fn from_hours(inactive_after: u64, delete_after: u64) -> Result<Self, RetentionError> {
        Self::new(hours(inactive_after)?, hours(delete_after)?)
    }

    pub fn inactive_after(&self) -> Duration {
        self.inactive_after
    }

    pub fn delete_after(&self) -> Duration {
        self.delete_after
    }
}

fn hours(n: u64) -> Result<Duration, RetentionError> {
    n.checked_mul(3600)
        .map(Duration::from_secs)
        .ok_or(RetentionError::OutOfRange(n))
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            inactive_after: Duration::from_secs(24 * 3600),
            delete_after: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    pub marked_inactive: usize,
    pub deleted: Vec<String>,
    /// Expired sessions left alone because an execution held them.
    pub skipped_busy: usize,
}

/// Periodic sweep on its own thread, for long-lived processes. Stops when
/// dropped.
pub struct BackgroundSweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundSweeper {
    pub fn start(store: Arc<SessionStore>, interval: Duration) -> Self {
        let (stop, stopped) = mpsc::channel::<()>();
        let handle = std::thread::spawn(move || loop {
            match stopped.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => match store.sweep() {
                    Ok(report) if report.marked_inactive > 0 || !report.deleted.is_empty() => {
                        info!(
                            marked_inactive = report.marked_inactive,
                            deleted = report.deleted.len(),
                            "background sweep"
                        );
                    }
                    Ok(_) => {}
                    Err(e) => warn!("background sweep failed: {}", e),
                },
                _ => break,
            }
        });
        Self {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

impl Drop for BackgroundSweeper {
    fn drop(&mut self) {
        // Dropping the sender wakes the thread with a disconnect.
        self.stop.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
