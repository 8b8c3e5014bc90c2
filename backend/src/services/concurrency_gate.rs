//! Admission control for workflows sharing a server.
//!
//! Sync workflows are bounded per `(server, repo group)` and snapshot
//! workflows per server. Each key has its own semaphore, so gates never
//! share capacity.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::services::metrics_service;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum GateKey {
    Sync { server: String, group: String },
    Snapshot { server: String },
}

impl GateKey {
    pub fn sync(server: impl Into<String>, group: impl Into<String>) -> Self {
        GateKey::Sync {
            server: server.into(),
            group: group.into(),
        }
    }

    pub fn snapshot(server: impl Into<String>) -> Self {
        GateKey::Snapshot {
            server: server.into(),
        }
    }

    fn server(&self) -> &str {
        match self {
            GateKey::Sync { server, .. } | GateKey::Snapshot { server } => server,
        }
    }

    fn label(&self) -> String {
        match self {
            GateKey::Sync { group, .. } => format!("sync:{}", group),
            GateKey::Snapshot { .. } => "snapshot".to_string(),
        }
    }
}

impl fmt::Display for GateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.label(), self.server())
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GateError {
    #[error("cancelled while waiting for a gate slot")]
    Cancelled,
}

/// Capacity of one key. A limit change resizes the semaphore in place; a
/// shrink below the current holders leaves a debt that returning permits
/// pay off instead of being released.
struct Slot {
    semaphore: Arc<Semaphore>,
    capacity: Mutex<Capacity>,
    held: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
struct Capacity {
    limit: usize,
    debt: usize,
}

impl Slot {
    fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            capacity: Mutex::new(Capacity { limit, debt: 0 }),
            held: AtomicUsize::new(0),
        }
    }

    fn resize(&self, key: &GateKey, limit: usize) {
        let mut capacity = self.capacity.lock().unwrap_or_else(|e| e.into_inner());
        if capacity.limit == limit {
            return;
        }
        if limit > capacity.limit {
            let grow = limit - capacity.limit;
            let repaid = grow.min(capacity.debt);
            capacity.debt -= repaid;
            self.semaphore.add_permits(grow - repaid);
        } else {
            let shrink = capacity.limit - limit;
            let forgotten = self.semaphore.forget_permits(shrink);
            capacity.debt += shrink - forgotten;
        }
        tracing::debug!(
            "Gate {} resized {} -> {} (debt {})",
            key,
            capacity.limit,
            limit,
            capacity.debt
        );
        capacity.limit = limit;
    }

    fn release(&self, permit: OwnedSemaphorePermit) {
        let mut capacity = self.capacity.lock().unwrap_or_else(|e| e.into_inner());
        if capacity.debt > 0 {
            capacity.debt -= 1;
            permit.forget();
        } else {
            drop(permit);
        }
        let _ = self
            .held
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }
}

/// Process-wide set of gates keyed by [`GateKey`].
#[derive(Default)]
pub struct ConcurrencyGate {
    slots: Mutex<HashMap<GateKey, Arc<Slot>>>,
}

impl ConcurrencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, key: &GateKey, limit: usize) -> Arc<Slot> {
        let limit = limit.max(1);
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Slot::new(limit)))
                .clone()
        };
        slot.resize(key, limit);
        slot
    }

    /// Wait for a slot under `key`, admitting at most `limit` holders.
    /// A different `limit` than last time resizes the gate for everyone
    /// waiting on it.
    ///
    /// Returns [`GateError::Cancelled`] without a slot if `cancel` fires
    /// first.
    pub async fn acquire(
        &self,
        key: GateKey,
        limit: usize,
        cancel: &CancellationToken,
    ) -> Result<GatePermit, GateError> {
        let slot = self.slot(&key, limit);
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(GateError::Cancelled),
            permit = slot.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| GateError::Cancelled)?
            }
        };

        let in_flight = slot.held.fetch_add(1, Ordering::SeqCst) + 1;
        metrics_service::set_gate_in_flight(&key.label(), key.server(), in_flight);
        Ok(GatePermit {
            key,
            slot,
            permit: Some(permit),
        })
    }

    /// Holders currently admitted under `key`.
    pub fn in_flight(&self, key: &GateKey) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(key)
            .map(|slot| slot.held.load(Ordering::SeqCst))
            .unwrap_or(0)
    }
}

/// A held gate slot; released on drop.
pub struct GatePermit {
    key: GateKey,
    slot: Arc<Slot>,
    permit: Option<OwnedSemaphorePermit>,
}

impl GatePermit {
    pub fn key(&self) -> &GateKey {
        &self.key
    }
}

impl Drop for GatePermit {
    fn drop(&mut self) {
        if let Some(permit) = self.permit.take() {
            self.slot.release(permit);
        }
        let in_flight = self.slot.held.load(Ordering::SeqCst);
        metrics_service::set_gate_in_flight(&self.key.label(), self.key.server(), in_flight);
    }
}
