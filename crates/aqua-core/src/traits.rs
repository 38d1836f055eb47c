// crates/aqua-core/src/traits.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::AquaError;
use crate::period::{AllocationPeriod, PeriodId, PeriodWindow};
use crate::token::Tokens;
use crate::unit::{Unit, UnitId};
use crate::usage::{AppendOutcome, IdempotencyKey, UsageEvent, UsageSample};

/// Persistent ledger state: units, allocation periods, and usage events.
///
/// Implemented by aqua-store (in-memory and RocksDB backends). The store
/// enforces the uniqueness constraints itself so that callers racing through
/// different processes still cannot break them:
///   - one Open period per unit,
///   - one event per `(unit, idempotency key)`,
///   - one event per `(unit, sequence)`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Insert a new unit. Fails with `DuplicateUnit` if the id is taken.
    async fn insert_unit(&self, unit: &Unit) -> Result<(), AquaError>;

    async fn get_unit(&self, unit_id: &UnitId) -> Result<Option<Unit>, AquaError>;

    /// Replace an existing unit row. Fails with `NotFound` if absent.
    async fn update_unit(&self, unit: &Unit) -> Result<(), AquaError>;

    /// All units ordered by id.
    async fn list_units(&self) -> Result<Vec<Unit>, AquaError>;

    /// Insert a period in Open status.
    ///
    /// Fails with `PeriodOverlap` if the unit already has an Open period or a
    /// period with the same id.
    async fn insert_open_period(&self, period: &AllocationPeriod) -> Result<(), AquaError>;

    async fn get_period(
        &self,
        unit_id: &UnitId,
        period_id: PeriodId,
    ) -> Result<Option<AllocationPeriod>, AquaError>;

    async fn open_period(&self, unit_id: &UnitId) -> Result<Option<AllocationPeriod>, AquaError>;

    /// Period with the highest id, whatever its status.
    async fn latest_period(&self, unit_id: &UnitId) -> Result<Option<AllocationPeriod>, AquaError>;

    /// All periods of a unit ordered by id.
    async fn list_periods(&self, unit_id: &UnitId) -> Result<Vec<AllocationPeriod>, AquaError>;

    /// Transition a period Open -> Closed.
    ///
    /// Fails with `NotFound` or `AlreadyClosed`.
    async fn close_period(
        &self,
        unit_id: &UnitId,
        period_id: PeriodId,
        closed_at: DateTime<Utc>,
    ) -> Result<AllocationPeriod, AquaError>;

    async fn find_usage_by_key(
        &self,
        unit_id: &UnitId,
        key: &IdempotencyKey,
    ) -> Result<Option<UsageEvent>, AquaError>;

    /// Highest sequence number appended for the unit (0 if none).
    async fn last_sequence(&self, unit_id: &UnitId) -> Result<u64, AquaError>;

    /// Compare-and-append a usage event.
    ///
    /// In one atomic step: if the idempotency key is known, return
    /// `Duplicate(existing)`; otherwise require `event.sequence == last + 1`
    /// (else `StoreUnavailable`, a retryable conflict) and that
    /// `event.period_id` is the unit's Open period (else `PeriodClosed`),
    /// then write the event and register the key.
    async fn append_usage(&self, event: &UsageEvent) -> Result<AppendOutcome, AquaError>;

    /// Sum of usage debited in a period.
    async fn usage_total(&self, unit_id: &UnitId, period_id: PeriodId) -> Result<Tokens, AquaError>;

    /// Up to `limit` events of a period with `sequence > after_sequence`,
    /// in sequence order.
    async fn usage_page(
        &self,
        unit_id: &UnitId,
        period_id: PeriodId,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<UsageEvent>, AquaError>;

    /// The unit's open period together with its usage total, read at one
    /// point in time.
    async fn open_period_with_usage(
        &self,
        unit_id: &UnitId,
    ) -> Result<Option<(AllocationPeriod, Tokens)>, AquaError>;
}

/// External oracle supplying prior usage for a unit.
///
/// Untrusted: may return an empty series, garbage values, or time out.
#[async_trait]
pub trait UsageHistorySource: Send + Sync {
    /// Ordered (oldest first) usage samples relevant to `window`.
    async fn fetch_series(
        &self,
        unit: &Unit,
        window: &PeriodWindow,
    ) -> Result<Vec<UsageSample>, AquaError>;
}

/// Time source. Reconciliation never reads the wall clock directly.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}
