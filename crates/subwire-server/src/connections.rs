//! Open-connection accounting: the connection cap, per-connection operation
//! registries for `/health`, and an idle signal for shutdown.

use std::collections::HashMap;
use std::sync::Arc;

use metrics::gauge;
use parking_lot::Mutex;
use subwire_core::ConnectionId;
use subwire_session::OperationRegistry;
use tokio::sync::watch;

/// Currently admitted connections, as seen by the HTTP layer (gauge).
pub const WS_CONNECTIONS_ADMITTED: &str = "ws_connections_admitted";

/// Tracks admitted connections against `max_connections`.
pub struct ConnectionTracker {
    limit: usize,
    active: watch::Sender<usize>,
    registries: Mutex<HashMap<ConnectionId, Arc<OperationRegistry>>>,
}

impl ConnectionTracker {
    /// Tracker admitting at most `limit` connections.
    pub fn new(limit: usize) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            limit,
            active,
            registries: Mutex::default(),
        }
    }

    /// Reserve a connection slot, or `None` when the cap is reached.
    ///
    /// The slot is released when the returned guard drops.
    pub fn try_acquire(self: &Arc<Self>) -> Option<ConnectionSlot> {
        let mut admitted = 0;
        let acquired = self.active.send_if_modified(|n| {
            if *n < self.limit {
                *n += 1;
                admitted = *n;
                true
            } else {
                false
            }
        });
        if !acquired {
            return None;
        }
        gauge!(WS_CONNECTIONS_ADMITTED).set(count_as_f64(admitted));
        Some(ConnectionSlot {
            tracker: self.clone(),
            connection: None,
        })
    }

    /// Number of admitted connections.
    pub fn count(&self) -> usize {
        *self.active.borrow()
    }

    /// Operations registered across all attached connections.
    pub fn active_operations(&self) -> usize {
        self.registries.lock().values().map(|r| r.len()).sum()
    }

    /// Resolve once no connection is admitted.
    pub async fn wait_until_idle(&self) {
        let mut rx = self.active.subscribe();
        // The sender lives in `self`, so the channel cannot close here.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    fn release(&self, connection: Option<&ConnectionId>) {
        if let Some(id) = connection {
            let _ = self.registries.lock().remove(id);
        }
        let mut remaining = 0;
        self.active.send_modify(|n| {
            *n = n.saturating_sub(1);
            remaining = *n;
        });
        gauge!(WS_CONNECTIONS_ADMITTED).set(count_as_f64(remaining));
    }
}

#[allow(clippy::cast_precision_loss)]
fn count_as_f64(n: usize) -> f64 {
    n as f64
}

/// A reserved connection slot.
pub struct ConnectionSlot {
    tracker: Arc<ConnectionTracker>,
    connection: Option<ConnectionId>,
}

impl ConnectionSlot {
    /// Expose `registry` through [`ConnectionTracker::active_operations`]
    /// until the slot drops.
    pub fn attach(&mut self, id: ConnectionId, registry: Arc<OperationRegistry>) {
        let _ = self.tracker.registries.lock().insert(id.clone(), registry);
        self.connection = Some(id);
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.tracker.release(self.connection.as_ref());
    }
}
