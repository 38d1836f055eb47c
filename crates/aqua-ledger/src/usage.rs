// crates/aqua-ledger/src/usage.rs
//
// UsageLedger: the append-only record of debits against a unit's open period.
//
// The target period is read before the lock. Every write then runs under
// the unit's ledger lock:
//   1. replay check on the idempotency key
//   2. confirm the target period is still the open one
//   3. derive the balance and check it against the floor
//   4. compare-and-append at `last_sequence + 1`
//
// The store repeats the key, sequence, and open-period checks atomically, so
// a second process racing the same unit fails with a retryable error instead
// of double-spending. Reads take no lock.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use aqua_core::context::CallerContext;
use aqua_core::error::AquaError;
use aqua_core::period::PeriodId;
use aqua_core::request::{RecordUsageRequest, ValidUsage};
use aqua_core::traits::{Clock, LedgerStore};
use aqua_core::unit::{Unit, UnitId};
use aqua_core::usage::{AppendOutcome, Balance, UsageEvent};

use crate::locks::UnitLocks;
use crate::policy::LedgerPolicy;
use crate::retry::bounded;

pub struct UsageLedger {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    locks: Arc<UnitLocks>,
    policy: LedgerPolicy,
}

impl UsageLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        locks: Arc<UnitLocks>,
        policy: LedgerPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            locks,
            policy,
        }
    }

    fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.policy.store_timeout_ms.max(1))
    }

    async fn unit(&self, unit_id: &UnitId) -> Result<Unit, AquaError> {
        bounded(self.store_timeout(), "unit lookup", self.store.get_unit(unit_id))
            .await?
            .ok_or_else(|| AquaError::NotFound(format!("unit {} is not registered", unit_id)))
    }

    /// Validate and record a usage submission.
    pub async fn record_usage(
        &self,
        ctx: &CallerContext,
        request: &RecordUsageRequest,
    ) -> Result<UsageEvent, AquaError> {
        let usage = request.validate()?;
        self.record(ctx, &usage).await
    }

    /// Debit `usage.amount` from the unit's open period, exactly once per
    /// idempotency key.
    ///
    /// The target period is fixed when the call arrives: `expected_period` if
    /// given, else the period open at that moment. A debit that waited out a
    /// roll is refused rather than posted into the successor.
    ///
    /// A retry with a key that was already recorded returns the original
    /// event unchanged, even if its period has since closed.
    ///
    /// # Errors
    /// - `NotFound` / `Unauthorized` / `UnitArchived` for the unit and caller
    /// - `NotOpen` if the unit has never had a period
    /// - `PeriodClosed` if no period is open or the target period is no
    ///   longer the open one
    /// - `InsufficientAllocation` if the debit would cross the floor
    /// - `StoreUnavailable` (transient) on lock or store timeouts and
    ///   cross-process sequence conflicts
    pub async fn record(
        &self,
        ctx: &CallerContext,
        usage: &ValidUsage,
    ) -> Result<UsageEvent, AquaError> {
        let unit_id = &usage.unit_id;
        let unit = self.unit(unit_id).await?;
        self.authorize(ctx, &unit)?;

        let timeout = self.store_timeout();
        let target = match usage.expected_period {
            Some(pinned) => Some(pinned),
            None => bounded(timeout, "period lookup", self.store.open_period(unit_id))
                .await?
                .map(|p| p.period_id),
        };

        let _guard = self.locks.acquire(unit_id).await?;

        if let Some(existing) = bounded(
            timeout,
            "idempotency lookup",
            self.store.find_usage_by_key(unit_id, &usage.idempotency_key),
        )
        .await?
        {
            if existing.amount != usage.amount {
                tracing::warn!(
                    "Replay of key {} on unit {} carried {} but {} was recorded",
                    usage.idempotency_key,
                    unit_id,
                    usage.amount,
                    existing.amount
                );
            }
            tracing::debug!(
                "Replayed usage {} for unit {} (seq {})",
                usage.idempotency_key,
                unit_id,
                existing.sequence
            );
            return Ok(existing);
        }

        // The unit may have been archived or transferred while we waited.
        let unit = self.unit(unit_id).await?;
        self.authorize(ctx, &unit)?;
        if unit.is_archived() {
            return Err(AquaError::UnitArchived(format!("unit {} is archived", unit_id)));
        }

        let Some(target) = target else {
            return Err(self.no_open_period(unit_id).await?);
        };
        let (period, used) = match bounded(
            timeout,
            "balance read",
            self.store.open_period_with_usage(unit_id),
        )
        .await?
        {
            Some(open) => open,
            None => return Err(self.no_open_period(unit_id).await?),
        };

        if target != period.period_id {
            return Err(AquaError::PeriodClosed(format!(
                "usage targeted {} but unit {} has {} open",
                target, unit_id, period.period_id
            )));
        }

        let balance = Balance::compute(
            unit_id.clone(),
            period.period_id,
            period.granted,
            period.carry_over,
            used,
        );
        let floor = self.policy.effective_floor();
        if balance.available - usage.amount < floor {
            return Err(AquaError::InsufficientAllocation {
                balance: balance.available.litres,
                requested: usage.amount.litres,
                floor: floor.litres,
            });
        }

        let last = bounded(timeout, "sequence read", self.store.last_sequence(unit_id)).await?;
        let event = UsageEvent {
            event_id: Uuid::now_v7(),
            unit_id: unit_id.clone(),
            sequence: last + 1,
            period_id: period.period_id,
            amount: usage.amount,
            idempotency_key: usage.idempotency_key.clone(),
            submitted_at: self.clock.now(),
        };

        match bounded(timeout, "usage append", self.store.append_usage(&event)).await? {
            AppendOutcome::Appended(event) => {
                tracing::info!(
                    "Recorded {} for unit {} in {} (seq {}, remaining {})",
                    event.amount,
                    unit_id,
                    event.period_id,
                    event.sequence,
                    balance.available - event.amount
                );
                Ok(event)
            }
            AppendOutcome::Duplicate(existing) => Ok(existing),
        }
    }

    fn authorize(&self, ctx: &CallerContext, unit: &Unit) -> Result<(), AquaError> {
        if ctx.may_act_for(unit) {
            Ok(())
        } else {
            Err(AquaError::Unauthorized(format!(
                "{} may not record usage for unit {}",
                ctx.principal, unit.unit_id
            )))
        }
    }

    async fn no_open_period(&self, unit_id: &UnitId) -> Result<AquaError, AquaError> {
        let latest = bounded(
            self.store_timeout(),
            "period lookup",
            self.store.latest_period(unit_id),
        )
        .await?;
        Ok(match latest {
            Some(p) => AquaError::PeriodClosed(format!(
                "no period of unit {} was open to take the usage (latest is {}, {})",
                unit_id, p.period_id, p.status
            )),
            None => AquaError::NotOpen(format!("unit {} has no open period", unit_id)),
        })
    }

    /// Balance of the unit's open period: `granted + carry_over - used`.
    ///
    /// # Errors
    /// `NotFound` for unknown units, `NotOpen` when no period is open.
    pub async fn current_balance(&self, unit_id: &UnitId) -> Result<Balance, AquaError> {
        self.unit(unit_id).await?;
        let (period, used) = bounded(
            self.store_timeout(),
            "balance read",
            self.store.open_period_with_usage(unit_id),
        )
        .await?
        .ok_or_else(|| AquaError::NotOpen(format!("unit {} has no open period", unit_id)))?;
        Ok(Balance::compute(
            unit_id.clone(),
            period.period_id,
            period.granted,
            period.carry_over,
            used,
        ))
    }

    /// Cursor over a period's usage events in sequence order.
    ///
    /// # Errors
    /// `NotFound` for unknown units or periods.
    pub async fn history(
        &self,
        unit_id: &UnitId,
        period_id: PeriodId,
    ) -> Result<UsageHistory, AquaError> {
        self.unit(unit_id).await?;
        bounded(
            self.store_timeout(),
            "period lookup",
            self.store.get_period(unit_id, period_id),
        )
        .await?
        .ok_or_else(|| {
            AquaError::NotFound(format!("unit {} has no period {}", unit_id, period_id))
        })?;
        Ok(UsageHistory::new(
            self.store.clone(),
            unit_id.clone(),
            period_id,
            self.policy.history_page_size,
        ))
    }
}

/// Paged, restartable iterator over one period's usage events.
///
/// Events arrive in sequence order. Each clone keeps its own position.
#[derive(Clone)]
pub struct UsageHistory {
    store: Arc<dyn LedgerStore>,
    unit_id: UnitId,
    period_id: PeriodId,
    page_size: usize,
    buffer: VecDeque<UsageEvent>,
    after_sequence: u64,
    exhausted: bool,
}

impl UsageHistory {
    fn new(
        store: Arc<dyn LedgerStore>,
        unit_id: UnitId,
        period_id: PeriodId,
        page_size: usize,
    ) -> Self {
        Self {
            store,
            unit_id,
            period_id,
            page_size: page_size.max(1),
            buffer: VecDeque::new(),
            after_sequence: 0,
            exhausted: false,
        }
    }

    pub fn period_id(&self) -> PeriodId {
        self.period_id
    }

    pub async fn next(&mut self) -> Result<Option<UsageEvent>, AquaError> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self
                .store
                .usage_page(&self.unit_id, self.period_id, self.after_sequence, self.page_size)
                .await?;
            if page.len() < self.page_size {
                self.exhausted = true;
            }
            self.buffer.extend(page);
        }
        let event = self.buffer.pop_front();
        if let Some(e) = &event {
            self.after_sequence = e.sequence;
        }
        Ok(event)
    }

    /// Start over from the first event.
    pub fn rewind(&mut self) {
        self.buffer.clear();
        self.after_sequence = 0;
        self.exhausted = false;
    }

    /// Every event from the start, leaving the cursor exhausted.
    pub async fn collect_all(&mut self) -> Result<Vec<UsageEvent>, AquaError> {
        self.rewind();
        let mut events = Vec::new();
        while let Some(event) = self.next().await? {
            events.push(event);
        }
        Ok(events)
    }
}

impl std::fmt::Debug for UsageHistory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageHistory")
            .field("unit_id", &self.unit_id)
            .field("period_id", &self.period_id)
            .field("after_sequence", &self.after_sequence)
            .field("exhausted", &self.exhausted)
            .finish()
    }
}
