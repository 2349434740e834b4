//! Pending-request table for one session

use crate::error::Result;
use crate::scheduler::Deferred;
use latchkey_protocol::{CommandResult, Ident};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::oneshot;

/// Whoever is waiting on a request: an awaiting task or a scheduled callback.
pub(crate) enum Pending {
    Waiter(oneshot::Sender<Result<CommandResult>>),
    Deferred(Arc<Deferred>),
}

impl Pending {
    /// Delivers the outcome. Consumes the entry so it cannot fire twice.
    pub(crate) fn resolve(self, outcome: Result<CommandResult>) {
        match self {
            Self::Waiter(tx) => {
                // The receiver is gone when the awaiting side already timed out
                let _ = tx.send(outcome);
            }
            Self::Deferred(deferred) => deferred.complete(outcome),
        }
    }
}

#[derive(Default)]
struct TableState {
    entries: HashMap<Ident, Pending>,
    closed: bool,
}

/// Maps request ids to their waiters.
///
/// Each entry leaves the table exactly once, through [`take`](Self::take)
/// or [`drain`](Self::drain). A drained table stays closed.
#[derive(Default)]
pub(crate) struct PendingTable {
    state: Mutex<TableState>,
}

impl PendingTable {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Registers a waiter; hands it back if the table was already drained.
    pub(crate) fn register(
        &self,
        request_id: Ident,
        pending: Pending,
    ) -> std::result::Result<(), Pending> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(pending);
        }
        state.entries.insert(request_id, pending);
        Ok(())
    }

    pub(crate) fn take(&self, request_id: &Ident) -> Option<Pending> {
        self.state.lock().entries.remove(request_id)
    }

    /// Closes the table and returns every outstanding entry.
    pub(crate) fn drain(&self) -> Vec<Pending> {
        let mut state = self.state.lock();
        state.closed = true;
        state.entries.drain().map(|(_, pending)| pending).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().entries.len()
    }
}
