//! Operation registry: every in-flight operation of one connection.
//!
//! Each entry carries a generation number so a producer left over from a
//! terminated operation can never affect a newer operation that reuses the
//! same id. Terminal transitions remove the entry; the first one committed
//! wins and every later attempt is a no-op.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use subwire_core::OperationId;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::errors::RegistryError;

/// Lifecycle state of an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationState {
    /// Accepted, not yet draining results.
    Created,
    /// Results are being drained.
    Streaming,
    /// Sequence ended without error.
    Completed,
    /// Sequence raised a terminal error.
    Errored,
    /// Unsubscribed or torn down with the connection.
    Cancelled,
}

impl OperationState {
    /// Whether the state is terminal.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored | Self::Cancelled)
    }
}

impl fmt::Display for OperationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Created => "created",
            Self::Streaming => "streaming",
            Self::Completed => "completed",
            Self::Errored => "errored",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Handle returned by [`OperationRegistry::register`].
#[derive(Clone, Debug)]
pub struct OperationTicket {
    /// Operation id.
    pub id: OperationId,
    /// Generation of this registration.
    pub generation: u64,
    /// Fires when the operation is cancelled.
    pub cancel: CancellationToken,
}

struct Entry {
    generation: u64,
    state: OperationState,
    cancel: CancellationToken,
}

#[derive(Default)]
struct Inner {
    entries: HashMap<OperationId, Entry>,
    next_generation: u64,
}

/// Live operations of one connection, keyed by id.
#[derive(Default)]
pub struct OperationRegistry {
    inner: Mutex<Inner>,
    limit: Option<usize>,
}

impl OperationRegistry {
    /// Empty registry without an operation limit.
    pub fn new() -> Self {
        Self::default()
    }

    /// Empty registry admitting at most `limit` concurrent operations.
    pub fn with_limit(limit: Option<usize>) -> Self {
        Self {
            inner: Mutex::default(),
            limit,
        }
    }

    /// Admit a new operation in `Created` state.
    ///
    /// The operation's cancellation token is a child of `parent`, so
    /// cancelling the connection cancels every operation.
    pub fn register(
        &self,
        id: OperationId,
        parent: &CancellationToken,
    ) -> Result<OperationTicket, RegistryError> {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&id) {
            return Err(RegistryError::Duplicate(id));
        }
        if let Some(limit) = self.limit {
            if inner.entries.len() >= limit {
                return Err(RegistryError::LimitReached(limit));
            }
        }
        inner.next_generation += 1;
        let generation = inner.next_generation;
        let cancel = parent.child_token();
        let _ = inner.entries.insert(
            id.clone(),
            Entry {
                generation,
                state: OperationState::Created,
                cancel: cancel.clone(),
            },
        );
        debug!(operation_id = %id, generation, "operation registered");
        Ok(OperationTicket {
            id,
            generation,
            cancel,
        })
    }

    /// `Created → Streaming`. Returns `false` if the entry is gone or newer.
    pub fn mark_streaming(&self, id: &OperationId, generation: u64) -> bool {
        let mut inner = self.inner.lock();
        match inner.entries.get_mut(id) {
            Some(entry) if entry.generation == generation => {
                entry.state = OperationState::Streaming;
                true
            }
            _ => false,
        }
    }

    /// Commit a terminal transition for one generation.
    ///
    /// Returns `true` if this call won; the entry is removed and its token
    /// cancelled. Returns `false` if another terminal transition already
    /// happened.
    pub fn finish(&self, id: &OperationId, generation: u64, outcome: OperationState) -> bool {
        debug_assert!(outcome.is_terminal());
        let mut inner = self.inner.lock();
        let matches = inner
            .entries
            .get(id)
            .is_some_and(|entry| entry.generation == generation);
        if !matches {
            return false;
        }
        if let Some(entry) = inner.entries.remove(id) {
            entry.cancel.cancel();
        }
        debug!(operation_id = %id, generation, %outcome, "operation finished");
        true
    }

    /// Cancel whichever generation currently owns `id`.
    ///
    /// Returns `true` if a live operation was cancelled.
    pub fn cancel(&self, id: &OperationId) -> bool {
        let removed = self.inner.lock().entries.remove(id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(operation_id = %id, generation = entry.generation, "operation cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every live operation. Returns how many were cancelled.
    pub fn cancel_all(&self) -> usize {
        let drained: Vec<(OperationId, Entry)> = self.inner.lock().entries.drain().collect();
        for (_, entry) in &drained {
            entry.cancel.cancel();
        }
        if !drained.is_empty() {
            debug!(count = drained.len(), "cancelled all operations");
        }
        drained.len()
    }

    /// Whether `generation` still owns `id` and is not terminal.
    pub fn is_live(&self, id: &OperationId, generation: u64) -> bool {
        self.inner
            .lock()
            .entries
            .get(id)
            .is_some_and(|entry| entry.generation == generation)
    }

    /// Current state of the operation owning `id`, if any.
    pub fn state(&self, id: &OperationId) -> Option<OperationState> {
        self.inner.lock().entries.get(id).map(|entry| entry.state)
    }

    /// Generation currently owning `id`, if any.
    pub fn generation(&self, id: &OperationId) -> Option<u64> {
        self.inner.lock().entries.get(id).map(|entry| entry.generation)
    }

    /// Whether `id` has a live operation.
    pub fn contains(&self, id: &OperationId) -> bool {
        self.inner.lock().entries.contains_key(id)
    }

    /// Number of live operations.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether there are no live operations.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for OperationRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OperationRegistry")
            .field("active", &self.len())
            .field("limit", &self.limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> OperationId {
        OperationId::from(s)
    }

    #[test]
    fn register_and_lookup() {
        let registry = OperationRegistry::new();
        let root = CancellationToken::new();
        let ticket = registry.register(id("1"), &root).unwrap();
        assert_eq!(registry.state(&id("1")), Some(OperationState::Created));
        assert!(registry.is_live(&id("1"), ticket.generation));
        assert_eq!(registry.len(), 1);
        assert!(registry.mark_streaming(&id("1"), ticket.generation));
        assert_eq!(registry.state(&id("1")), Some(OperationState::Streaming));
    }

    #[test]
    fn duplicate_rejected_without_disturbing_existing() {
        let registry = OperationRegistry::new();
        let root = CancellationToken::new();
        let first = registry.register(id("3"), &root).unwrap();
        assert!(registry.mark_streaming(&id("3"), first.generation));

        let err = registry.register(id("3"), &root).unwrap_err();
        assert_eq!(err, RegistryError::Duplicate(id("3")));
        assert_eq!(registry.state(&id("3")), Some(OperationState::Streaming));
        assert!(!first.cancel.is_cancelled());
    }

    #[test]
    fn limit_enforced() {
        let registry = OperationRegistry::with_limit(Some(1));
        let root = CancellationToken::new();
        let _ = registry.register(id("a"), &root).unwrap();
        assert_eq!(
            registry.register(id("b"), &root).unwrap_err(),
            RegistryError::LimitReached(1)
        );
    }

    #[test]
    fn first_terminal_transition_wins() {
        let registry = OperationRegistry::new();
        let root = CancellationToken::new();
        let ticket = registry.register(id("1"), &root).unwrap();

        assert!(registry.finish(&id("1"), ticket.generation, OperationState::Completed));
        assert!(!registry.finish(&id("1"), ticket.generation, OperationState::Errored));
        assert!(!registry.cancel(&id("1")));
        assert!(!registry.contains(&id("1")));
        assert!(ticket.cancel.is_cancelled());
    }

    #[test]
    fn cancel_signals_token() {
        let registry = OperationRegistry::new();
        let root = CancellationToken::new();
        let ticket = registry.register(id("2"), &root).unwrap();
        assert!(registry.cancel(&id("2")));
        assert!(ticket.cancel.is_cancelled());
        assert!(!registry.finish(&id("2"), ticket.generation, OperationState::Completed));
    }

    #[test]
    fn reused_id_ignores_stale_generation() {
        let registry = OperationRegistry::new();
        let root = CancellationToken::new();
        let old = registry.register(id("1"), &root).unwrap();
        assert!(registry.cancel(&id("1")));

        let new = registry.register(id("1"), &root).unwrap();
        assert_ne!(old.generation, new.generation);
        assert!(!registry.is_live(&id("1"), old.generation));
        assert!(!registry.mark_streaming(&id("1"), old.generation));
        assert!(!registry.finish(&id("1"), old.generation, OperationState::Completed));
        assert!(registry.is_live(&id("1"), new.generation));
        assert!(!new.cancel.is_cancelled());
    }

    #[test]
    fn cancel_all_drains() {
        let registry = OperationRegistry::new();
        let root = CancellationToken::new();
        let a = registry.register(id("a"), &root).unwrap();
        let b = registry.register(id("b"), &root).unwrap();
        assert_eq!(registry.cancel_all(), 2);
        assert!(registry.is_empty());
        assert!(a.cancel.is_cancelled() && b.cancel.is_cancelled());
        assert_eq!(registry.cancel_all(), 0);
    }

    #[test]
    fn parent_cancellation_propagates() {
        let registry = OperationRegistry::new();
        let root = CancellationToken::new();
        let ticket = registry.register(id("1"), &root).unwrap();
        root.cancel();
        assert!(ticket.cancel.is_cancelled());
    }

    #[test]
    fn terminal_states() {
        assert!(!OperationState::Created.is_terminal());
        assert!(!OperationState::Streaming.is_terminal());
        assert!(OperationState::Completed.is_terminal());
        assert!(OperationState::Errored.is_terminal());
        assert!(OperationState::Cancelled.is_terminal());
    }
}
