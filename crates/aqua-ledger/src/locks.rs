// crates/aqua-ledger/src/locks.rs
//
// Per-unit mutual exclusion.
//
// `UnitLocks` is shared by the usage ledger and reconciliation. A writer
// holds a unit's lock for the whole read-balance -> validate -> append step;
// reconciliation holds it while closing a period, which doubles as the fence
// that drains in-flight debits. Different units never contend.
//
// `InFlight` tracks which units have a reconciliation running so a second
// concurrent one fails fast instead of queueing.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use aqua_core::error::AquaError;
use aqua_core::unit::UnitId;

#[derive(Debug)]
pub struct UnitLocks {
    locks: Mutex<HashMap<UnitId, Arc<AsyncMutex<()>>>>,
    timeout: Duration,
}

impl UnitLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
            timeout,
        }
    }

    /// Acquire the unit's lock, waiting at most the configured timeout.
    ///
    /// # Errors
    /// Returns `AquaError::StoreUnavailable` (transient) on timeout.
    pub async fn acquire(&self, unit_id: &UnitId) -> Result<OwnedMutexGuard<()>, AquaError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|p| p.into_inner());
            locks
                .entry(unit_id.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        tokio::time::timeout(self.timeout, lock.lock_owned())
            .await
            .map_err(|_| {
                AquaError::StoreUnavailable(format!(
                    "timed out after {:?} waiting for ledger lock on unit {}",
                    self.timeout, unit_id
                ))
            })
    }
}

#[derive(Debug, Default)]
pub struct InFlight {
    units: Arc<Mutex<HashSet<UnitId>>>,
}

/// Marks a unit's reconciliation as running until dropped.
#[derive(Debug)]
pub struct InFlightGuard {
    units: Arc<Mutex<HashSet<UnitId>>>,
    unit_id: UnitId,
}

impl InFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `AquaError::ReconciliationConflict` if the unit is already marked.
    pub fn try_begin(&self, unit_id: &UnitId) -> Result<InFlightGuard, AquaError> {
        let mut units = self.units.lock().unwrap_or_else(|p| p.into_inner());
        if !units.insert(unit_id.clone()) {
            return Err(AquaError::ReconciliationConflict(format!(
                "reconciliation for unit {} is already in progress",
                unit_id
            )));
        }
        Ok(InFlightGuard {
            units: self.units.clone(),
            unit_id: unit_id.clone(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut units = self.units.lock().unwrap_or_else(|p| p.into_inner());
        units.remove(&self.unit_id);
    }
}
