//! Collaborator-facing context types: node identity and the progress /
//! cancellation token handed into long-running table operations.
//!
//! Ownership of a table is compared by [`NodeId`] equality, and cancellation
//! is cooperative: anything that may block for the duration of a backend
//! serialization polls [`ProgressMonitor::check_canceled`] and aborts with
//! [`CanceledError`], which callers can tell apart from genuine I/O failure.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// Identity of the workflow node that owns a table. Opaque; two tables belong
/// to the same node iff their `NodeId`s compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(String);

impl NodeId {
    /// Mints a fresh, process-unique node identity.
    pub fn fresh() -> Self {
        NodeId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        NodeId(s.to_string())
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The expected, user-initiated abort condition. Distinct from I/O failure so
/// callers can report it differently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("execution canceled")]
pub struct CanceledError;

/// Progress and cancellation token for save/load and materialization.
///
/// Cancellation is a one-way latch: once [`cancel`](Self::cancel) has been
/// called every subsequent [`check_canceled`](Self::check_canceled) fails.
/// Progress is a best-effort fraction in `[0, 1]` for display purposes only.
#[derive(Debug, Default)]
pub struct ProgressMonitor {
    canceled: AtomicBool,
    progress: Mutex<f64>,
}

impl ProgressMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cooperative cancellation of the running operation.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::SeqCst)
    }

    /// Fails with [`CanceledError`] once cancellation has been requested.
    pub fn check_canceled(&self) -> Result<(), CanceledError> {
        if self.is_canceled() {
            Err(CanceledError)
        } else {
            Ok(())
        }
    }

    /// Reports progress as a fraction in `[0, 1]`; values are clamped.
    pub fn set_progress(&self, fraction: f64) {
        let mut p = self
            .progress
            .lock()
            .unwrap_or_else(|_| panic!("progress lock poisoned"));
        *p = fraction.clamp(0.0, 1.0);
    }

    pub fn progress(&self) -> f64 {
        *self
            .progress
            .lock()
            .unwrap_or_else(|_| panic!("progress lock poisoned"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_node_ids_are_distinct() {
        let a = NodeId::fresh();
        let b = NodeId::fresh();
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn test_monitor_starts_uncanceled() {
        let monitor = ProgressMonitor::new();
        assert!(!monitor.is_canceled());
        assert!(monitor.check_canceled().is_ok());
    }

    #[test]
    fn test_cancel_is_latched() {
        let monitor = ProgressMonitor::new();
        monitor.cancel();
        assert!(monitor.is_canceled());
        assert_eq!(monitor.check_canceled(), Err(CanceledError));
        // stays canceled
        assert_eq!(monitor.check_canceled(), Err(CanceledError));
    }

    #[test]
    fn test_progress_is_clamped() {
        let monitor = ProgressMonitor::new();
        monitor.set_progress(0.5);
        assert_eq!(monitor.progress(), 0.5);
        monitor.set_progress(1.5);
        assert_eq!(monitor.progress(), 1.0);
        monitor.set_progress(-0.1);
        assert_eq!(monitor.progress(), 0.0);
    }
}
