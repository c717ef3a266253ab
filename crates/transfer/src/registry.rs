//! Per-session registry of active transfers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::error::AdmitError;
use crate::types::{TransferRequest, TransferSnapshot, TransferState};

type Entries = HashMap<String, Arc<TransferState>>;

/// Shared map of session id to the transfer it is running.
///
/// At most one transfer is active per session. The map lock is held only for
/// the map operation itself, never across an await.
#[derive(Clone, Default)]
pub struct TransferRegistry {
    inner: Arc<Mutex<Entries>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Entries> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Registers a new transfer for `request.session`.
    ///
    /// The returned guard removes the entry when dropped.
    pub fn admit(&self, request: &TransferRequest) -> Result<Admission, AdmitError> {
        let mut entries = self.entries();
        if let Some(active) = entries.get(&request.session) {
            return Err(AdmitError::AlreadyActive {
                session: request.session.clone(),
                transfer_id: active.id().to_string(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let state = Arc::new(TransferState::new(
            id.clone(),
            request.session.clone(),
            request.total_size_hint,
        ));
        entries.insert(request.session.clone(), Arc::clone(&state));
        drop(entries);

        info!(transfer = %id, session = %request.session, source = %request.source, "transfer admitted");
        Ok(Admission {
            registry: self.clone(),
            state,
        })
    }

    /// Requests cancellation of the session's active transfer.
    ///
    /// Returns `false` if the session has none.
    pub fn cancel(&self, session: &str) -> bool {
        let state = self.entries().get(session).cloned();
        match state {
            Some(state) => {
                state.cancel();
                info!(transfer = %state.id(), session, "cancellation requested");
                true
            }
            None => false,
        }
    }

    /// Removes the entry for `session` if it still belongs to `transfer_id`.
    pub fn release(&self, session: &str, transfer_id: &str) -> bool {
        let mut entries = self.entries();
        let owned = entries
            .get(session)
            .is_some_and(|state| state.id() == transfer_id);
        if owned {
            entries.remove(session);
            debug!(transfer = %transfer_id, session, "transfer released");
        }
        owned
    }

    /// Returns the live state of the session's active transfer.
    pub fn get(&self, session: &str) -> Option<Arc<TransferState>> {
        self.entries().get(session).cloned()
    }

    /// Snapshots of every active transfer, oldest first.
    pub fn active(&self) -> Vec<TransferSnapshot> {
        let states: Vec<_> = self.entries().values().cloned().collect();
        let mut snapshots: Vec<_> = states.iter().map(|s| s.snapshot()).collect();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        snapshots
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }
}

/// Registry slot held by a running transfer.
///
/// Dropping it releases the slot, on success, failure, cancellation or panic.
pub struct Admission {
    registry: TransferRegistry,
    state: Arc<TransferState>,
}

impl Admission {
    pub fn state(&self) -> &Arc<TransferState> {
        &self.state
    }
}

impl std::fmt::Debug for Admission {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Admission")
            .field("transfer", &self.state.id())
            .field("session", &self.state.session())
            .finish()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        self.registry
            .release(self.state.session(), self.state.id());
    }
}
