// crates/aqua-store/src/memory.rs
//
// In-memory `LedgerStore`.
//
// Three tables behind tokio RwLocks. Lock order is always
// units -> periods -> usage, and `append_usage` holds the periods read lock
// while it writes, so a concurrent `close_period` cannot slip between the
// open-period check and the write.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use aqua_core::error::AquaError;
use aqua_core::period::{AllocationPeriod, PeriodId, PeriodStatus};
use aqua_core::token::Tokens;
use aqua_core::traits::LedgerStore;
use aqua_core::unit::{Unit, UnitId};
use aqua_core::usage::{AppendOutcome, IdempotencyKey, UsageEvent};

#[derive(Debug, Default)]
struct UnitUsage {
    events: BTreeMap<u64, UsageEvent>,
    by_key: HashMap<IdempotencyKey, u64>,
}

impl UnitUsage {
    fn last_sequence(&self) -> u64 {
        self.events.keys().next_back().copied().unwrap_or(0)
    }

    fn total_for(&self, period_id: PeriodId) -> Tokens {
        self.events
            .values()
            .filter(|e| e.period_id == period_id)
            .map(|e| e.amount)
            .sum()
    }
}

/// Ledger store held entirely in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    units: RwLock<BTreeMap<UnitId, Unit>>,
    periods: RwLock<HashMap<UnitId, BTreeMap<PeriodId, AllocationPeriod>>>,
    usage: RwLock<HashMap<UnitId, UnitUsage>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn open_of(periods: &BTreeMap<PeriodId, AllocationPeriod>) -> Option<&AllocationPeriod> {
    periods.values().rev().find(|p| p.status == PeriodStatus::Open)
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn insert_unit(&self, unit: &Unit) -> Result<(), AquaError> {
        let mut units = self.units.write().await;
        if units.contains_key(&unit.unit_id) {
            return Err(AquaError::DuplicateUnit(unit.unit_id.to_string()));
        }
        units.insert(unit.unit_id.clone(), unit.clone());
        Ok(())
    }

    async fn get_unit(&self, unit_id: &UnitId) -> Result<Option<Unit>, AquaError> {
        Ok(self.units.read().await.get(unit_id).cloned())
    }

    async fn update_unit(&self, unit: &Unit) -> Result<(), AquaError> {
        let mut units = self.units.write().await;
        match units.get_mut(&unit.unit_id) {
            Some(existing) => {
                *existing = unit.clone();
                Ok(())
            }
            None => Err(AquaError::NotFound(format!("unit {}", unit.unit_id))),
        }
    }

    async fn list_units(&self) -> Result<Vec<Unit>, AquaError> {
        Ok(self.units.read().await.values().cloned().collect())
    }

    async fn insert_open_period(&self, period: &AllocationPeriod) -> Result<(), AquaError> {
        let mut periods = self.periods.write().await;
        let unit_periods = periods.entry(period.unit_id.clone()).or_default();
        if let Some(open) = open_of(unit_periods) {
            return Err(AquaError::PeriodOverlap(format!(
                "unit {} already has open period {}",
                period.unit_id, open.period_id
            )));
        }
        if unit_periods.contains_key(&period.period_id) {
            return Err(AquaError::PeriodOverlap(format!(
                "unit {} already has period {}",
                period.unit_id, period.period_id
            )));
        }
        let mut row = period.clone();
        row.status = PeriodStatus::Open;
        row.closed_at = None;
        unit_periods.insert(row.period_id, row);
        Ok(())
    }

    async fn get_period(
        &self,
        unit_id: &UnitId,
        period_id: PeriodId,
    ) -> Result<Option<AllocationPeriod>, AquaError> {
        let periods = self.periods.read().await;
        Ok(periods
            .get(unit_id)
            .and_then(|p| p.get(&period_id))
            .cloned())
    }

    async fn open_period(&self, unit_id: &UnitId) -> Result<Option<AllocationPeriod>, AquaError> {
        let periods = self.periods.read().await;
        Ok(periods.get(unit_id).and_then(open_of).cloned())
    }

    async fn latest_period(&self, unit_id: &UnitId) -> Result<Option<AllocationPeriod>, AquaError> {
        let periods = self.periods.read().await;
        Ok(periods
            .get(unit_id)
            .and_then(|p| p.values().next_back())
            .cloned())
    }

    async fn list_periods(&self, unit_id: &UnitId) -> Result<Vec<AllocationPeriod>, AquaError> {
        let periods = self.periods.read().await;
        Ok(periods
            .get(unit_id)
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn close_period(
        &self,
        unit_id: &UnitId,
        period_id: PeriodId,
        closed_at: DateTime<Utc>,
    ) -> Result<AllocationPeriod, AquaError> {
        let mut periods = self.periods.write().await;
        let period = periods
            .get_mut(unit_id)
            .and_then(|p| p.get_mut(&period_id))
            .ok_or_else(|| AquaError::NotFound(format!("period {} of unit {}", period_id, unit_id)))?;
        if period.status == PeriodStatus::Closed {
            return Err(AquaError::AlreadyClosed(format!(
                "period {} of unit {}",
                period_id, unit_id
            )));
        }
        period.status = PeriodStatus::Closed;
        period.closed_at = Some(closed_at);
        Ok(period.clone())
    }

    async fn find_usage_by_key(
        &self,
        unit_id: &UnitId,
        key: &IdempotencyKey,
    ) -> Result<Option<UsageEvent>, AquaError> {
        let usage = self.usage.read().await;
        Ok(usage.get(unit_id).and_then(|u| {
            u.by_key
                .get(key)
                .and_then(|seq| u.events.get(seq))
                .cloned()
        }))
    }

    async fn last_sequence(&self, unit_id: &UnitId) -> Result<u64, AquaError> {
        let usage = self.usage.read().await;
        Ok(usage.get(unit_id).map(UnitUsage::last_sequence).unwrap_or(0))
    }

    async fn append_usage(&self, event: &UsageEvent) -> Result<AppendOutcome, AquaError> {
        let periods = self.periods.read().await;
        let mut usage = self.usage.write().await;
        let unit_usage = usage.entry(event.unit_id.clone()).or_default();

        if let Some(seq) = unit_usage.by_key.get(&event.idempotency_key) {
            if let Some(existing) = unit_usage.events.get(seq) {
                return Ok(AppendOutcome::Duplicate(existing.clone()));
            }
        }

        let last = unit_usage.last_sequence();
        if event.sequence != last + 1 {
            return Err(AquaError::StoreUnavailable(format!(
                "sequence conflict for unit {}: expected {}, got {}",
                event.unit_id,
                last + 1,
                event.sequence
            )));
        }

        let open = periods.get(&event.unit_id).and_then(open_of);
        if open.map(|p| p.period_id) != Some(event.period_id) {
            return Err(AquaError::PeriodClosed(format!(
                "period {} of unit {} is not accepting usage",
                event.period_id, event.unit_id
            )));
        }

        unit_usage
            .by_key
            .insert(event.idempotency_key.clone(), event.sequence);
        unit_usage.events.insert(event.sequence, event.clone());
        Ok(AppendOutcome::Appended(event.clone()))
    }

    async fn usage_total(&self, unit_id: &UnitId, period_id: PeriodId) -> Result<Tokens, AquaError> {
        let usage = self.usage.read().await;
        Ok(usage
            .get(unit_id)
            .map(|u| u.total_for(period_id))
            .unwrap_or_default())
    }

    async fn usage_page(
        &self,
        unit_id: &UnitId,
        period_id: PeriodId,
        after_sequence: u64,
        limit: usize,
    ) -> Result<Vec<UsageEvent>, AquaError> {
        let usage = self.usage.read().await;
        Ok(usage
            .get(unit_id)
            .map(|u| {
                u.events
                    .range(after_sequence.saturating_add(1)..)
                    .map(|(_, e)| e)
                    .filter(|e| e.period_id == period_id)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn open_period_with_usage(
        &self,
        unit_id: &UnitId,
    ) -> Result<Option<(AllocationPeriod, Tokens)>, AquaError> {
        let periods = self.periods.read().await;
        let usage = self.usage.read().await;
        Ok(periods.get(unit_id).and_then(open_of).map(|open| {
            let used = usage
                .get(unit_id)
                .map(|u| u.total_for(open.period_id))
                .unwrap_or_default();
            (open.clone(), used)
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    #[tokio::test]
    async fn test_duplicate_unit_rejected() {
        let store = MemoryStore::new();
        store.insert_unit(&unit("A101")).await.unwrap();
        let err = store.insert_unit(&unit("A101")).await.unwrap_err();
        assert!(matches!(err, AquaError::DuplicateUnit(_)));
    }

    #[tokio::test]
    async fn test_single_open_period() {
        let store = MemoryStore::new();
        store.insert_open_period(&period("A101", 1)).await.unwrap();
        let err = store.insert_open_period(&period("A101", 2)).await.unwrap_err();
        assert!(matches!(err, AquaError::PeriodOverlap(_)));

        // Other units are unaffected.
        store.insert_open_period(&period("A102", 1)).await.unwrap();
    }

    #[tokio::test]
    async fn test_close_then_reopen() {
        let store = MemoryStore::new();
        let uid = unit_id("A101");
        store.insert_open_period(&period("A101", 1)).await.unwrap();
        let closed = store.close_period(&uid, PeriodId(1), Utc::now()).await.unwrap();
        assert_eq!(closed.status, PeriodStatus::Closed);

        let err = store.close_period(&uid, PeriodId(1), Utc::now()).await.unwrap_err();
        assert!(matches!(err, AquaError::AlreadyClosed(_)));
        let err = store.close_period(&uid, PeriodId(9), Utc::now()).await.unwrap_err();
        assert!(matches!(err, AquaError::NotFound(_)));

        store.insert_open_period(&period("A101", 2)).await.unwrap();
        assert_eq!(store.open_period(&uid).await.unwrap().unwrap().period_id, PeriodId(2));
        assert_eq!(store.latest_period(&uid).await.unwrap().unwrap().period_id, PeriodId(2));
        assert_eq!(store.list_periods(&uid).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_append_is_compare_and_append() {
        let store = MemoryStore::new();
        let uid = unit_id("A101");
        store.insert_open_period(&period("A101", 1)).await.unwrap();

        let first = event("A101", 1, 1, 100, "k1");
        assert!(matches!(
            store.append_usage(&first).await.unwrap(),
            AppendOutcome::Appended(_)
        ));

        // Same key, different payload: the stored event wins.
        let retry = event("A101", 2, 1, 999, "k1");
        match store.append_usage(&retry).await.unwrap() {
            AppendOutcome::Duplicate(existing) => assert_eq!(existing, first),
            other => panic!("expected duplicate, got {:?}", other),
        }

        // Stale sequence number.
        let stale = event("A101", 1, 1, 10, "k2");
        assert!(matches!(
            store.append_usage(&stale).await.unwrap_err(),
            AquaError::StoreUnavailable(_)
        ));

        assert_eq!(store.last_sequence(&uid).await.unwrap(), 1);
        assert_eq!(store.usage_total(&uid, PeriodId(1)).await.unwrap(), Tokens::new(100));
    }

    #[tokio::test]
    async fn test_append_into_closed_period_fails() {
        let store = MemoryStore::new();
        let uid = unit_id("A101");
        store.insert_open_period(&period("A101", 1)).await.unwrap();
        store.close_period(&uid, PeriodId(1), Utc::now()).await.unwrap();

        let late = event("A101", 1, 1, 10, "late");
        assert!(matches!(
            store.append_usage(&late).await.unwrap_err(),
            AquaError::PeriodClosed(_)
        ));
        assert!(store
            .find_usage_by_key(&uid, &late.idempotency_key)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_usage_page_filters_by_period() {
        let store = MemoryStore::new();
        let uid = unit_id("A101");
        store.insert_open_period(&period("A101", 1)).await.unwrap();
        for seq in 1..=3 {
            store
                .append_usage(&event("A101", seq, 1, 10, &format!("p1-{}", seq)))
                .await
                .unwrap();
        }
        store.close_period(&uid, PeriodId(1), Utc::now()).await.unwrap();
        store.insert_open_period(&period("A101", 2)).await.unwrap();
        store
            .append_usage(&event("A101", 4, 2, 7, "p2-4"))
            .await
            .unwrap();

        let page = store.usage_page(&uid, PeriodId(1), 0, 2).await.unwrap();
        assert_eq!(page.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![1, 2]);
        let page = store.usage_page(&uid, PeriodId(1), 2, 2).await.unwrap();
        assert_eq!(page.iter().map(|e| e.sequence).collect::<Vec<_>>(), vec![3]);
        let page = store.usage_page(&uid, PeriodId(2), 0, 10).await.unwrap();
        assert_eq!(page.len(), 1);

        let (open, used) = store.open_period_with_usage(&uid).await.unwrap().unwrap();
        assert_eq!(open.period_id, PeriodId(2));
        assert_eq!(used, Tokens::new(7));
    }
}
