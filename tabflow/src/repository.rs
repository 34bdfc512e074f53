//! Process-wide table identity and the load-session repository.
//!
//! Responsibilities:
//! - Hand out process-unique, monotonically increasing table ids; ids are
//!   never reused, even after a table is dropped.
//! - During deserialization of a workflow graph, map (session id, table id)
//!   back to the one restored handle so shared references resolve to the
//!   same object instead of being duplicated.
//!
//! The repository is an explicitly constructed service: the workflow manager
//! creates one per process and passes it wherever tables are created or
//! loaded. A session must be initialized before tables can be registered or
//! fetched under it, and is cleared once loading completes; lookups against
//! an unknown session fail with an error naming the currently valid ids.

use crate::table::{TableHandle, TableId};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// Identifies one workflow-load operation.
pub type SessionId = u64;

/// Error type for session and table lookups.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("no table repository session with id {session} (valid sessions: {valid:?})")]
    NoSuchSession {
        session: SessionId,
        valid: Vec<SessionId>,
    },
    #[error("no table with id {table} under session {session}")]
    NoSuchTable { session: SessionId, table: TableId },
}

/// Owns the table id counter and the per-session registries of restored
/// table handles.
#[derive(Debug, Default)]
pub struct TableRepository {
    next_id: AtomicU64,
    sessions: Mutex<HashMap<SessionId, HashMap<TableId, Arc<TableHandle>>>>,
}

impl TableRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates the next unused table id.
    pub(crate) fn next_table_id(&self) -> TableId {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Raises the id counter past `loaded` so ids restored from disk can
    /// never collide with freshly created ones.
    pub(crate) fn advance_table_id(&self, loaded: TableId) {
        self.next_id.fetch_max(loaded + 1, Ordering::SeqCst);
    }

    /// Opens an empty registry for a load session. Called once right before
    /// a workflow is loaded; initializing an id that is already live is
    /// caller misuse and replaces the previous registry.
    pub fn init_session(&self, session: SessionId) {
        let mut sessions = self.lock_sessions();
        if sessions.insert(session, HashMap::new()).is_some() {
            log::warn!(
                "table session {} initialized twice, dropping previous registry",
                session
            );
        }
        log::debug!(
            "added table session {} ({} in total)",
            session,
            sessions.len()
        );
    }

    /// Drops the registry of a completed load session. Clearing an unknown
    /// id is non-fatal and only logged.
    pub fn clear_session(&self, session: SessionId) {
        let mut sessions = self.lock_sessions();
        if sessions.remove(&session).is_none() {
            log::warn!("no table session with id {}", session);
        } else {
            log::debug!(
                "removed table session {} ({} left)",
                session,
                sessions.len()
            );
        }
    }

    /// Fails unless `session` has been initialized and not yet cleared.
    pub fn ensure_session(&self, session: SessionId) -> Result<(), RepositoryError> {
        let sessions = self.lock_sessions();
        if sessions.contains_key(&session) {
            Ok(())
        } else {
            Err(RepositoryError::NoSuchSession {
                session,
                valid: sessions.keys().copied().collect(),
            })
        }
    }

    /// Fetches a restored handle by id. A successful lookup also raises the
    /// id counter, since the fetched id is known to be in use.
    pub fn get(
        &self,
        session: SessionId,
        table: TableId,
    ) -> Result<Arc<TableHandle>, RepositoryError> {
        let handle = {
            let sessions = self.lock_sessions();
            let registry =
                sessions
                    .get(&session)
                    .ok_or_else(|| RepositoryError::NoSuchSession {
                        session,
                        valid: sessions.keys().copied().collect(),
                    })?;
            registry
                .get(&table)
                .cloned()
                .ok_or(RepositoryError::NoSuchTable { session, table })?
        };
        debug_assert_eq!(handle.id(), table);
        self.advance_table_id(table);
        Ok(handle)
    }

    /// Registers a restored handle under its load session.
    pub fn put(
        &self,
        session: SessionId,
        handle: Arc<TableHandle>,
    ) -> Result<(), RepositoryError> {
        let mut sessions = self.lock_sessions();
        let valid: Vec<SessionId> = sessions.keys().copied().collect();
        match sessions.get_mut(&session) {
            Some(registry) => {
                registry.insert(handle.id(), handle);
                Ok(())
            }
            None => Err(RepositoryError::NoSuchSession { session, valid }),
        }
    }

    fn lock_sessions(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<SessionId, HashMap<TableId, Arc<TableHandle>>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|_| panic!("table session lock poisoned"))
    }
}
