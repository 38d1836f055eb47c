// crates/aqua-ledger/src/allocation.rs
//
// AllocationEngine: turns a unit's historical usage into a per-period grant
// and manages the period lifecycle (open, close, carry-over).
//
// Grant rule:
//   mean of the last `sample_window` usable samples
//   x headroom
//   clamped to [max(min_allocation, residents x per_resident_allowance), max_allocation]
//
// A series with no usable samples (empty, negative, NaN) falls back to the
// deployment's default allocation. The basis is recorded on the period.

use std::sync::Arc;

use aqua_core::error::AquaError;
use aqua_core::period::{
    AllocationPeriod, ClosedPeriod, GrantBasis, PeriodId, PeriodStatus, PeriodWindow,
};
use aqua_core::token::Tokens;
use aqua_core::traits::{Clock, LedgerStore};
use aqua_core::unit::{UnitId, UnitProfile};
use aqua_core::usage::UsageSample;

use crate::policy::{AllocationPolicy, LedgerPolicy, RolloverPolicy};

pub struct AllocationEngine {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    policy: AllocationPolicy,
    ledger_policy: LedgerPolicy,
    rollover: RolloverPolicy,
}

impl AllocationEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        policy: AllocationPolicy,
        ledger_policy: LedgerPolicy,
        rollover: RolloverPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            policy,
            ledger_policy,
            rollover,
        }
    }

    pub fn policy(&self) -> &AllocationPolicy {
        &self.policy
    }

    /// Grant derived from history alone.
    ///
    /// # Errors
    /// `NoHistory` if the series has no usable samples.
    pub fn compute_grant(
        &self,
        profile: &UnitProfile,
        series: &[UsageSample],
    ) -> Result<(Tokens, GrantBasis), AquaError> {
        let usable: Vec<f64> = series
            .iter()
            .map(|s| s.litres)
            .filter(|v| v.is_finite() && *v >= 0.0)
            .collect();
        if usable.is_empty() {
            return Err(AquaError::NoHistory(format!(
                "{} samples supplied, none usable",
                series.len()
            )));
        }

        let window = self.policy.sample_window.max(1);
        let recent = &usable[usable.len().saturating_sub(window)..];
        let mean = recent.iter().sum::<f64>() / recent.len() as f64;
        let raw = Tokens::from_litres_f64(mean * self.policy.headroom);

        let resident_floor = Tokens::new(
            self.policy
                .per_resident_allowance
                .litres
                .saturating_mul(i64::from(profile.residents)),
        );
        let hi = self.policy.max_allocation;
        let lo = self.policy.min_allocation.max(resident_floor).min(hi);

        Ok((
            raw.clamp_to(lo, hi),
            GrantBasis::Historical {
                samples: recent.len(),
                mean,
            },
        ))
    }

    /// Grant for a period, falling back to the default allocation when the
    /// series carries no usable history.
    pub fn grant_for(&self, profile: &UnitProfile, series: &[UsageSample]) -> (Tokens, GrantBasis) {
        match self.compute_grant(profile, series) {
            Ok(grant) => grant,
            Err(e) => {
                tracing::warn!("Using default allocation: {}", e);
                (self.policy.default_allocation, GrantBasis::Default)
            }
        }
    }

    /// Balance carried into the successor of a closed period.
    ///
    /// Capped at `max_carry_over`. Without debt mode a negative balance is
    /// forgiven; in debt mode it carries down to the debt floor.
    pub fn carry_over_from(&self, closed: &ClosedPeriod) -> Tokens {
        let lo = self.ledger_policy.effective_floor();
        let hi = self.rollover.max_carry_over.max(lo);
        closed.closing_balance.clamp_to(lo, hi)
    }

    /// Open a new period for `window`, contiguous with the unit's latest one.
    ///
    /// # Errors
    /// `NotFound` for unknown units, `UnitArchived` for archived ones,
    /// `PeriodOverlap` if a period is still open or `window` does not start
    /// where the latest period ended.
    pub async fn open_period(
        &self,
        unit_id: &UnitId,
        window: PeriodWindow,
        series: &[UsageSample],
        carry_over: Tokens,
    ) -> Result<AllocationPeriod, AquaError> {
        let unit = self
            .store
            .get_unit(unit_id)
            .await?
            .ok_or_else(|| AquaError::NotFound(format!("unit {} is not registered", unit_id)))?;
        if unit.is_archived() {
            return Err(AquaError::UnitArchived(format!("unit {} is archived", unit_id)));
        }

        let period_id = match self.store.latest_period(unit_id).await? {
            None => PeriodId::FIRST,
            Some(latest) if latest.is_open() => {
                return Err(AquaError::PeriodOverlap(format!(
                    "unit {} still has {} open",
                    unit_id, latest.period_id
                )));
            }
            Some(latest) => {
                if window.start != latest.window.end {
                    return Err(AquaError::PeriodOverlap(format!(
                        "window starting {} is not contiguous with {} ending {}",
                        window.start, latest.period_id, latest.window.end
                    )));
                }
                latest.period_id.next()
            }
        };

        let (granted, basis) = self.grant_for(&unit.profile, series);
        let period = AllocationPeriod {
            unit_id: unit_id.clone(),
            period_id,
            window,
            granted,
            carry_over,
            basis,
            status: PeriodStatus::Open,
            opened_at: self.clock.now(),
            closed_at: None,
        };
        self.store.insert_open_period(&period).await?;

        tracing::info!(
            "Opened {} for unit {}: granted {} + carry {} ({} -> {})",
            period_id,
            unit_id,
            granted,
            carry_over,
            window.start,
            window.end
        );
        Ok(period)
    }

    /// Freeze an open period and compute its closing figures. Only
    /// reconciliation should call this, under the unit's ledger lock.
    ///
    /// # Errors
    /// `NotOpen` if the unit never had a period, `NotFound` for an unknown
    /// period, `AlreadyClosed` if it was closed before.
    pub async fn close_period(
        &self,
        unit_id: &UnitId,
        period_id: PeriodId,
    ) -> Result<ClosedPeriod, AquaError> {
        if self.store.latest_period(unit_id).await?.is_none() {
            return Err(AquaError::NotOpen(format!(
                "unit {} has no allocation periods",
                unit_id
            )));
        }
        let period = self
            .store
            .close_period(unit_id, period_id, self.clock.now())
            .await?;
        let closed = self.summarize(period).await?;
        tracing::info!(
            "Closed {} for unit {}: used {}, closing balance {}",
            period_id,
            unit_id,
            closed.usage_total,
            closed.closing_balance
        );
        Ok(closed)
    }

    /// Closing figures of a period that is already closed.
    ///
    /// # Errors
    /// `NotFound` for unknown periods, `NotOpen` if the period is still open.
    pub async fn closed_summary(
        &self,
        unit_id: &UnitId,
        period_id: PeriodId,
    ) -> Result<ClosedPeriod, AquaError> {
        let period = self
            .store
            .get_period(unit_id, period_id)
            .await?
            .ok_or_else(|| {
                AquaError::NotFound(format!("unit {} has no period {}", unit_id, period_id))
            })?;
        if period.is_open() {
            return Err(AquaError::NotOpen(format!(
                "{} of unit {} has not been closed",
                period_id, unit_id
            )));
        }
        self.summarize(period).await
    }

    async fn summarize(&self, period: AllocationPeriod) -> Result<ClosedPeriod, AquaError> {
        let usage_total = self
            .store
            .usage_total(&period.unit_id, period.period_id)
            .await?;
        let closing_balance = period.entitlement() - usage_total;
        Ok(ClosedPeriod {
            period,
            usage_total,
            closing_balance,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqua_core::clock::ManualClock;
    use aqua_core::period::PeriodCadence;
    use aqua_core::unit::{Principal, Unit};
    use aqua_store::MemoryStore;
    use chrono::{NaiveDate, TimeZone, Utc};

    fn profile(residents: u16) -> UnitProfile {
        UnitProfile {
            floor: 1,
            unit_number: 1,
            residents,
            unit_size_sqft: 700,
        }
    }

    fn samples(values: &[f64]) -> Vec<UsageSample> {
        values
            .iter()
            .enumerate()
            .map(|(i, v)| UsageSample {
                date: NaiveDate::from_ymd_opt(2026, 9, 1 + i as u32).unwrap(),
                litres: *v,
            })
            .collect()
    }

    fn engine_with(
        policy: AllocationPolicy,
        ledger: LedgerPolicy,
        rollover: RolloverPolicy,
    ) -> (AllocationEngine, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single().unwrap(),
        ));
        let engine = AllocationEngine::new(store.clone(), clock, policy, ledger, rollover);
        (engine, store)
    }

    fn engine() -> (AllocationEngine, Arc<MemoryStore>) {
        engine_with(
            AllocationPolicy::default(),
            LedgerPolicy::default(),
            RolloverPolicy::default(),
        )
    }

    async fn seed_unit(store: &MemoryStore) -> UnitId {
        let unit = Unit {
            unit_id: UnitId::parse("A101").unwrap(),
            principal: Principal::parse("resident-1").unwrap(),
            profile: profile(3),
            registered_at: Utc.with_ymd_and_hms(2026, 9, 1, 0, 0, 0).single().unwrap(),
            archived_at: None,
        };
        store.insert_unit(&unit).await.unwrap();
        unit.unit_id
    }

    fn october() -> PeriodWindow {
        PeriodWindow::containing(
            Utc.with_ymd_and_hms(2026, 10, 1, 0, 0, 0).single().unwrap(),
            PeriodCadence::Monthly,
        )
    }

    #[test]
    fn test_grant_uses_last_n_samples_with_headroom() {
        let (engine, _) = engine();
        // Only the last 7 count: mean 200, x1.1 = 220.
        let series = samples(&[9_000.0, 200.0, 200.0, 200.0, 200.0, 200.0, 200.0, 200.0]);
        let (grant, basis) = engine.compute_grant(&profile(2), &series).unwrap();
        assert_eq!(grant, Tokens::new(220));
        assert_eq!(
            basis,
            GrantBasis::Historical {
                samples: 7,
                mean: 200.0
            }
        );
    }

    #[test]
    fn test_grant_clamped_to_bounds() {
        let (engine, _) = engine();
        let (low, _) = engine.compute_grant(&profile(1), &samples(&[1.0])).unwrap();
        assert_eq!(low, Tokens::new(50));
        let (high, _) = engine
            .compute_grant(&profile(1), &samples(&[1_000_000.0]))
            .unwrap();
        assert_eq!(high, Tokens::new(10_000));
    }

    #[test]
    fn test_per_resident_floor() {
        let policy = AllocationPolicy {
            per_resident_allowance: Tokens::new(100),
            ..AllocationPolicy::default()
        };
        let (engine, _) = engine_with(policy, LedgerPolicy::default(), RolloverPolicy::default());
        let (grant, _) = engine.compute_grant(&profile(4), &samples(&[10.0])).unwrap();
        assert_eq!(grant, Tokens::new(400));
    }

    #[test]
    fn test_unusable_history_falls_back_to_default() {
        let (engine, _) = engine();
        let garbage = samples(&[-5.0, f64::NAN, f64::INFINITY]);
        assert!(matches!(
            engine.compute_grant(&profile(2), &garbage),
            Err(AquaError::NoHistory(_))
        ));
        assert_eq!(
            engine.grant_for(&profile(2), &[]),
            (Tokens::new(300), GrantBasis::Default)
        );
        // Garbage samples are dropped, not averaged in.
        let mixed = samples(&[f64::NAN, 100.0, -1.0]);
        assert_eq!(engine.grant_for(&profile(2), &mixed).0, Tokens::new(110));
    }

    #[tokio::test]
    async fn test_open_rejects_second_open_period() {
        let (engine, store) = engine();
        let uid = seed_unit(&store).await;
        engine
            .open_period(&uid, october(), &[], Tokens::zero())
            .await
            .unwrap();
        let again = engine
            .open_period(&uid, october().following(PeriodCadence::Monthly), &[], Tokens::zero())
            .await;
        assert!(matches!(again, Err(AquaError::PeriodOverlap(_))));
    }

    #[tokio::test]
    async fn test_open_requires_contiguous_window() {
        let (engine, store) = engine();
        let uid = seed_unit(&store).await;
        let p1 = engine
            .open_period(&uid, october(), &[], Tokens::zero())
            .await
            .unwrap();
        engine.close_period(&uid, p1.period_id).await.unwrap();

        let gap = october()
            .following(PeriodCadence::Monthly)
            .following(PeriodCadence::Monthly);
        let result = engine.open_period(&uid, gap, &[], Tokens::zero()).await;
        assert!(matches!(result, Err(AquaError::PeriodOverlap(_))));

        let p2 = engine
            .open_period(&uid, october().following(PeriodCadence::Monthly), &[], Tokens::zero())
            .await
            .unwrap();
        assert_eq!(p2.period_id, PeriodId(2));
        assert_eq!(p2.window.start, p1.window.end);
    }

    #[tokio::test]
    async fn test_close_errors() {
        let (engine, store) = engine();
        let uid = seed_unit(&store).await;
        assert!(matches!(
            engine.close_period(&uid, PeriodId::FIRST).await,
            Err(AquaError::NotOpen(_))
        ));
        let p1 = engine
            .open_period(&uid, october(), &[], Tokens::zero())
            .await
            .unwrap();
        let closed = engine.close_period(&uid, p1.period_id).await.unwrap();
        assert_eq!(closed.closing_balance, Tokens::new(300));
        assert!(matches!(
            engine.close_period(&uid, p1.period_id).await,
            Err(AquaError::AlreadyClosed(_))
        ));
        assert_eq!(
            engine.closed_summary(&uid, p1.period_id).await.unwrap(),
            closed
        );
    }

    #[tokio::test]
    async fn test_carry_over_clamping() {
        let (engine, store) = engine();
        let uid = seed_unit(&store).await;
        let p1 = engine
            .open_period(&uid, october(), &[], Tokens::zero())
            .await
            .unwrap();
        let mut closed = engine.close_period(&uid, p1.period_id).await.unwrap();

        // Defaults: nothing rolls over, debt is forgiven.
        assert_eq!(engine.carry_over_from(&closed), Tokens::zero());
        closed.closing_balance = Tokens::new(-40);
        assert_eq!(engine.carry_over_from(&closed), Tokens::zero());

        let (debt_engine, _) = engine_with(
            AllocationPolicy::default(),
            LedgerPolicy {
                debt_mode: true,
                debt_floor: Tokens::new(-25),
                ..LedgerPolicy::default()
            },
            RolloverPolicy {
                max_carry_over: Tokens::new(100),
            },
        );
        assert_eq!(debt_engine.carry_over_from(&closed), Tokens::new(-25));
        closed.closing_balance = Tokens::new(250);
        assert_eq!(debt_engine.carry_over_from(&closed), Tokens::new(100));
        closed.closing_balance = Tokens::new(60);
        assert_eq!(debt_engine.carry_over_from(&closed), Tokens::new(60));
    }
}
