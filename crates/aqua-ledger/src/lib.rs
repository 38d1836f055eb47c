// crates/aqua-ledger/src/lib.rs
//
// aqua-ledger: Registry, allocation, usage, and reconciliation services.
//
// Four components share one store, one clock, and one set of per-unit locks:
//   - AccountRegistry: units and their owners
//   - AllocationEngine: grants and the period lifecycle
//   - UsageLedger: exactly-once debits and derived balances
//   - ReconciliationService: period close, carry-over, and rollover
//
// LedgerServices wires them together from a LedgerConfig.

pub mod allocation;
pub mod locks;
pub mod policy;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod usage;

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use aqua_core::error::AquaError;
use aqua_core::traits::{Clock, LedgerStore, UsageHistorySource};

pub use allocation::AllocationEngine;
pub use locks::UnitLocks;
pub use policy::{AllocationPolicy, LedgerPolicy, RolloverPolicy};
pub use reconcile::{ReconcileReport, ReconciliationService, RollOutcome};
pub use registry::AccountRegistry;
pub use retry::RetryPolicy;
pub use usage::{UsageHistory, UsageLedger};

/// All deployment policy in one place.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub allocation: AllocationPolicy,
    #[serde(default)]
    pub ledger: LedgerPolicy,
    #[serde(default)]
    pub rollover: RolloverPolicy,
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), AquaError> {
        self.allocation.validate()?;
        self.ledger.validate()?;
        self.rollover.validate()
    }
}

/// The ledger's components, built over a shared store and lock table.
#[derive(Clone)]
pub struct LedgerServices {
    pub registry: Arc<AccountRegistry>,
    pub engine: Arc<AllocationEngine>,
    pub usage: Arc<UsageLedger>,
    pub reconciler: Arc<ReconciliationService>,
}

impl LedgerServices {
    /// # Errors
    /// `InvalidRequest` if `config` fails validation.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        history: Arc<dyn UsageHistorySource>,
        clock: Arc<dyn Clock>,
        config: LedgerConfig,
    ) -> Result<Self, AquaError> {
        config.validate()?;
        let locks = Arc::new(UnitLocks::new(Duration::from_millis(
            config.ledger.lock_timeout_ms.max(1),
        )));

        let registry = Arc::new(AccountRegistry::new(store.clone(), clock.clone()));
        let engine = Arc::new(AllocationEngine::new(
            store.clone(),
            clock.clone(),
            config.allocation,
            config.ledger.clone(),
            config.rollover,
        ));
        let usage = Arc::new(UsageLedger::new(
            store.clone(),
            clock.clone(),
            locks.clone(),
            config.ledger,
        ));
        let reconciler = Arc::new(ReconciliationService::new(
            store,
            engine.clone(),
            history,
            clock,
            locks,
            config.retry,
        ));

        Ok(Self {
            registry,
            engine,
            usage,
            reconciler,
        })
    }
}
