// crates/aqua-ledger/src/reconcile.rs
//
// ReconciliationService: closes due periods, computes carry-over, and opens
// their successors.
//
// A roll runs in two phases:
//   1. Fetch the successor's historical series (retried, bounded). Nothing
//      is written yet; on failure the period stays Open and the call can be
//      repeated.
//   2. Under the unit's ledger lock: close, carry, open. The lock waits out
//      any in-flight debit and blocks new ones until the successor is open.
//
// Rolls are idempotent per (unit, period). A closed period without a
// successor (a crash between close and open) is resumed; one with a
// successor reports `AlreadyRolled`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use aqua_core::error::AquaError;
use aqua_core::period::{AllocationPeriod, ClosedPeriod, PeriodId, PeriodWindow};
use aqua_core::token::Tokens;
use aqua_core::traits::{Clock, LedgerStore, UsageHistorySource};
use aqua_core::unit::{Unit, UnitId};
use aqua_core::usage::UsageSample;

use crate::allocation::AllocationEngine;
use crate::locks::{InFlight, UnitLocks};
use crate::retry::RetryPolicy;

/// Upper bound on periods rolled for one unit in a single sweep.
const MAX_CATCH_UP: usize = 24;

/// Result of a roll request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RollOutcome {
    /// The open period was closed and its successor opened.
    Rolled {
        closed: ClosedPeriod,
        opened: AllocationPeriod,
    },
    /// A previously closed period got its missing successor.
    Resumed {
        closed: ClosedPeriod,
        opened: AllocationPeriod,
    },
    /// The period was closed and succeeded earlier. Nothing changed.
    AlreadyRolled {
        period_id: PeriodId,
        successor: PeriodId,
    },
    /// The open period's window has not ended yet.
    NotDue {
        period_id: PeriodId,
        due_at: DateTime<Utc>,
    },
}

impl RollOutcome {
    /// True if this call opened a new period.
    pub fn advanced(&self) -> bool {
        matches!(self, RollOutcome::Rolled { .. } | RollOutcome::Resumed { .. })
    }
}

/// Per-sweep tally produced by [`ReconciliationService::reconcile_all`].
#[derive(Debug, Default)]
pub struct ReconcileReport {
    pub bootstrapped: Vec<UnitId>,
    pub rolled: Vec<(UnitId, PeriodId)>,
    pub up_to_date: usize,
    pub failed: Vec<(UnitId, AquaError)>,
}

pub struct ReconciliationService {
    store: Arc<dyn LedgerStore>,
    engine: Arc<AllocationEngine>,
    history: Arc<dyn UsageHistorySource>,
    clock: Arc<dyn Clock>,
    locks: Arc<UnitLocks>,
    in_flight: InFlight,
    retry: RetryPolicy,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        engine: Arc<AllocationEngine>,
        history: Arc<dyn UsageHistorySource>,
        clock: Arc<dyn Clock>,
        locks: Arc<UnitLocks>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            engine,
            history,
            clock,
            locks,
            in_flight: InFlight::new(),
            retry,
        }
    }

    async fn active_unit(&self, unit_id: &UnitId) -> Result<Unit, AquaError> {
        let unit = self
            .store
            .get_unit(unit_id)
            .await?
            .ok_or_else(|| AquaError::NotFound(format!("unit {} is not registered", unit_id)))?;
        if unit.is_archived() {
            return Err(AquaError::UnitArchived(format!("unit {} is archived", unit_id)));
        }
        Ok(unit)
    }

    /// Open a unit's first period: the window containing the current time.
    ///
    /// # Errors
    /// `PeriodOverlap` if the unit already has periods,
    /// `AllocationUnavailable` if history could not be fetched.
    pub async fn bootstrap(&self, unit_id: &UnitId) -> Result<AllocationPeriod, AquaError> {
        let _running = self.in_flight.try_begin(unit_id)?;
        let unit = self.active_unit(unit_id).await?;
        if let Some(latest) = self.store.latest_period(unit_id).await? {
            return Err(AquaError::PeriodOverlap(format!(
                "unit {} already has {}",
                unit_id, latest.period_id
            )));
        }

        let window = PeriodWindow::containing(self.clock.now(), self.engine.policy().cadence);
        let series = self.fetch_series(&unit, &window).await?;

        let _fence = self.locks.acquire(unit_id).await?;
        self.engine
            .open_period(unit_id, window, &series, Tokens::zero())
            .await
    }

    /// Roll the unit's latest period if it is due, or resume an interrupted
    /// roll. Advances at most one period per call.
    ///
    /// A period that was opened after its own window had already ended came
    /// from a late roll. Rolling it again here would turn a retried tick into
    /// a second roll, so it reports `AlreadyRolled` for its predecessor;
    /// [`Self::reconcile_all`] and [`Self::close_and_roll_period`] catch such
    /// periods up explicitly.
    ///
    /// # Errors
    /// `NotOpen` if the unit has never been bootstrapped,
    /// `ReconciliationConflict` if a roll for the unit is already running,
    /// `AllocationUnavailable` if history could not be fetched.
    pub async fn close_and_roll(&self, unit_id: &UnitId) -> Result<RollOutcome, AquaError> {
        let _running = self.in_flight.try_begin(unit_id)?;
        let unit = self.active_unit(unit_id).await?;
        let latest = self.latest(unit_id).await?;
        if latest.is_open() && latest.opened_at >= latest.window.end {
            if let Some(previous) = latest.period_id.previous() {
                tracing::debug!(
                    "{} of unit {} was opened late; leaving it for catch-up",
                    latest.period_id,
                    unit_id
                );
                return Ok(RollOutcome::AlreadyRolled {
                    period_id: previous,
                    successor: latest.period_id,
                });
            }
        }
        self.roll_from(&unit, latest).await
    }

    async fn latest(&self, unit_id: &UnitId) -> Result<AllocationPeriod, AquaError> {
        self.store.latest_period(unit_id).await?.ok_or_else(|| {
            AquaError::NotOpen(format!("unit {} has no periods; bootstrap it first", unit_id))
        })
    }

    /// Roll a specific period. Repeating the call after success is a no-op
    /// that reports `AlreadyRolled`.
    ///
    /// # Errors
    /// `NotFound` for unknown periods, otherwise as [`Self::close_and_roll`].
    pub async fn close_and_roll_period(
        &self,
        unit_id: &UnitId,
        period_id: PeriodId,
    ) -> Result<RollOutcome, AquaError> {
        let _running = self.in_flight.try_begin(unit_id)?;
        let unit = self.active_unit(unit_id).await?;
        let period = self
            .store
            .get_period(unit_id, period_id)
            .await?
            .ok_or_else(|| {
                AquaError::NotFound(format!("unit {} has no period {}", unit_id, period_id))
            })?;
        self.roll_from(&unit, period).await
    }

    async fn roll_from(
        &self,
        unit: &Unit,
        period: AllocationPeriod,
    ) -> Result<RollOutcome, AquaError> {
        let unit_id = &unit.unit_id;
        let cadence = self.engine.policy().cadence;

        if !period.is_open() {
            if let Some(successor) = self.store.get_period(unit_id, period.period_id.next()).await? {
                return Ok(RollOutcome::AlreadyRolled {
                    period_id: period.period_id,
                    successor: successor.period_id,
                });
            }
            tracing::warn!(
                "Resuming interrupted roll of {} for unit {}",
                period.period_id,
                unit_id
            );
            let closed = self.engine.closed_summary(unit_id, period.period_id).await?;
            let next_window = closed.period.window.following(cadence);
            let series = self.fetch_series(unit, &next_window).await?;

            let _fence = self.locks.acquire(unit_id).await?;
            let opened = self
                .engine
                .open_period(unit_id, next_window, &series, self.engine.carry_over_from(&closed))
                .await?;
            return Ok(RollOutcome::Resumed { closed, opened });
        }

        let now = self.clock.now();
        if period.window.end > now {
            return Ok(RollOutcome::NotDue {
                period_id: period.period_id,
                due_at: period.window.end,
            });
        }

        let next_window = period.window.following(cadence);
        let series = self.fetch_series(unit, &next_window).await?;

        let _fence = self.locks.acquire(unit_id).await?;
        let closed = self.engine.close_period(unit_id, period.period_id).await?;
        let carry_over = self.engine.carry_over_from(&closed);
        let opened = self
            .engine
            .open_period(unit_id, next_window, &series, carry_over)
            .await?;
        Ok(RollOutcome::Rolled { closed, opened })
    }

    /// Fetch history for `window` with retries.
    ///
    /// A source that has nothing for the unit (`NotFound` / `NoHistory`)
    /// yields an empty series so the default allocation applies. Anything
    /// else that survives the retries is `AllocationUnavailable`.
    async fn fetch_series(
        &self,
        unit: &Unit,
        window: &PeriodWindow,
    ) -> Result<Vec<UsageSample>, AquaError> {
        let what = format!("history fetch for unit {}", unit.unit_id);
        let result = self
            .retry
            .retry_transient(&what, |_| self.history.fetch_series(unit, window))
            .await;
        match result {
            Ok(series) => Ok(series),
            Err(AquaError::NotFound(msg)) | Err(AquaError::NoHistory(msg)) => {
                tracing::info!("No history for unit {}: {}", unit.unit_id, msg);
                Ok(Vec::new())
            }
            Err(AquaError::AllocationUnavailable(msg)) => {
                Err(AquaError::AllocationUnavailable(msg))
            }
            Err(other) => Err(AquaError::AllocationUnavailable(format!(
                "{} failed: {}",
                what, other
            ))),
        }
    }

    /// One scheduler sweep over every active unit: bootstrap units without
    /// periods and roll due periods, catching up on missed ones. Failures are
    /// collected per unit and never stop the sweep.
    pub async fn reconcile_all(&self) -> Result<ReconcileReport, AquaError> {
        let mut report = ReconcileReport::default();
        for unit in self.store.list_units().await? {
            if unit.is_archived() {
                continue;
            }
            let unit_id = unit.unit_id;

            if self.store.latest_period(&unit_id).await?.is_none() {
                match self.bootstrap(&unit_id).await {
                    Ok(_) => report.bootstrapped.push(unit_id),
                    Err(e) => {
                        tracing::warn!("Bootstrap of unit {} failed: {}", unit_id, e);
                        report.failed.push((unit_id, e));
                    }
                }
                continue;
            }

            // Catch-up targets the period observed at each step, so a period
            // opened late by the previous step is rolled too.
            let mut advanced = false;
            for _ in 0..MAX_CATCH_UP {
                let step = match self.latest(&unit_id).await {
                    Ok(latest) => self.close_and_roll_period(&unit_id, latest.period_id).await,
                    Err(e) => Err(e),
                };
                match step {
                    Ok(RollOutcome::Rolled { opened, .. })
                    | Ok(RollOutcome::Resumed { opened, .. }) => {
                        report.rolled.push((unit_id.clone(), opened.period_id));
                        advanced = true;
                    }
                    Ok(_) => {
                        if !advanced {
                            report.up_to_date += 1;
                        }
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Roll of unit {} failed: {}", unit_id, e);
                        report.failed.push((unit_id.clone(), e));
                        break;
                    }
                }
            }
        }

        tracing::info!(
            "Reconciliation sweep: {} bootstrapped, {} rolled, {} up to date, {} failed",
            report.bootstrapped.len(),
            report.rolled.len(),
            report.up_to_date,
            report.failed.len()
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{AllocationPolicy, LedgerPolicy, RolloverPolicy};
    use aqua_core::clock::ManualClock;
    use aqua_core::period::{GrantBasis, PeriodStatus};
    use aqua_core::unit::{Principal, UnitProfile};
    use aqua_store::MemoryStore;
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, NaiveDate, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Fails the first `failures` calls, then returns `series`.
    struct FlakySource {
        failures: usize,
        calls: AtomicUsize,
        series: Vec<UsageSample>,
    }

    #[async_trait]
    impl UsageHistorySource for FlakySource {
        async fn fetch_series(
            &self,
            _unit: &Unit,
            _window: &PeriodWindow,
        ) -> Result<Vec<UsageSample>, AquaError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(AquaError::AllocationUnavailable("oracle down".into()))
            } else {
                Ok(self.series.clone())
            }
        }
    }

    struct Fixture {
        service: ReconciliationService,
        store: Arc<MemoryStore>,
        clock: Arc<ManualClock>,
        unit_id: UnitId,
    }

    async fn fixture(failures: usize) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 10, 5, 12, 0, 0).single().unwrap(),
        ));
        let unit = Unit {
            unit_id: UnitId::parse("A101").unwrap(),
            principal: Principal::parse("resident-1").unwrap(),
            profile: UnitProfile {
                floor: 1,
                unit_number: 1,
                residents: 2,
                unit_size_sqft: 700,
            },
            registered_at: clock.now(),
            archived_at: None,
        };
        store.insert_unit(&unit).await.unwrap();

        let engine = Arc::new(AllocationEngine::new(
            store.clone(),
            clock.clone(),
            AllocationPolicy::default(),
            LedgerPolicy::default(),
            RolloverPolicy::default(),
        ));
        let source = Arc::new(FlakySource {
            failures,
            calls: AtomicUsize::new(0),
            series: vec![UsageSample {
                date: NaiveDate::from_ymd_opt(2026, 10, 1).unwrap(),
                litres: 200.0,
            }],
        });
        let service = ReconciliationService::new(
            store.clone(),
            engine,
            source,
            clock.clone(),
            Arc::new(UnitLocks::new(Duration::from_millis(500))),
            RetryPolicy::new(2, 1, 2, 0.0, 100),
        );
        Fixture {
            service,
            store,
            clock,
            unit_id: unit.unit_id,
        }
    }

    #[tokio::test]
    async fn test_bootstrap_opens_current_window() {
        let fx = fixture(0).await;
        let p1 = fx.service.bootstrap(&fx.unit_id).await.unwrap();
        assert_eq!(p1.period_id, PeriodId::FIRST);
        assert!(p1.window.contains(fx.clock.now()));
        assert_eq!(p1.granted, Tokens::new(220));
        assert!(matches!(
            fx.service.bootstrap(&fx.unit_id).await,
            Err(AquaError::PeriodOverlap(_))
        ));
    }

    #[tokio::test]
    async fn test_roll_not_due_then_rolled_then_already_rolled() {
        let fx = fixture(0).await;
        fx.service.bootstrap(&fx.unit_id).await.unwrap();

        let outcome = fx.service.close_and_roll(&fx.unit_id).await.unwrap();
        assert!(matches!(outcome, RollOutcome::NotDue { .. }));

        fx.clock.advance(ChronoDuration::days(30));
        let outcome = fx.service.close_and_roll(&fx.unit_id).await.unwrap();
        let RollOutcome::Rolled { closed, opened } = outcome else {
            panic!("expected Rolled, got {:?}", outcome);
        };
        assert_eq!(closed.period.status, PeriodStatus::Closed);
        assert_eq!(opened.period_id, PeriodId(2));
        assert_eq!(opened.window.start, closed.period.window.end);

        let again = fx
            .service
            .close_and_roll_period(&fx.unit_id, PeriodId::FIRST)
            .await
            .unwrap();
        assert_eq!(
            again,
            RollOutcome::AlreadyRolled {
                period_id: PeriodId::FIRST,
                successor: PeriodId(2)
            }
        );
    }

    #[tokio::test]
    async fn test_unavailable_history_leaves_period_open() {
        let fx = fixture(10).await;
        fx.store
            .insert_open_period(&AllocationPeriod {
                unit_id: fx.unit_id.clone(),
                period_id: PeriodId::FIRST,
                window: PeriodWindow::containing(fx.clock.now(), Default::default()),
                granted: Tokens::new(300),
                carry_over: Tokens::zero(),
                basis: GrantBasis::Default,
                status: PeriodStatus::Open,
                opened_at: fx.clock.now(),
                closed_at: None,
            })
            .await
            .unwrap();
        fx.clock.advance(ChronoDuration::days(40));

        let err = fx.service.close_and_roll(&fx.unit_id).await.unwrap_err();
        assert!(matches!(err, AquaError::AllocationUnavailable(_)));
        let open = fx.store.open_period(&fx.unit_id).await.unwrap().unwrap();
        assert_eq!(open.period_id, PeriodId::FIRST);
    }

    #[tokio::test]
    async fn test_resume_after_partial_roll() {
        let fx = fixture(0).await;
        let p1 = fx.service.bootstrap(&fx.unit_id).await.unwrap();
        fx.clock.advance(ChronoDuration::days(30));
        // Simulate a crash between close and open.
        fx.store
            .close_period(&fx.unit_id, p1.period_id, fx.clock.now())
            .await
            .unwrap();

        let outcome = fx.service.close_and_roll(&fx.unit_id).await.unwrap();
        let RollOutcome::Resumed { opened, .. } = outcome else {
            panic!("expected Resumed, got {:?}", outcome);
        };
        assert_eq!(opened.period_id, PeriodId(2));
        assert_eq!(opened.window.start, p1.window.end);
    }

    #[tokio::test]
    async fn test_retried_roll_after_downtime_advances_once() {
        let fx = fixture(0).await;
        fx.service.bootstrap(&fx.unit_id).await.unwrap();

        // 2026-10-05 + 70 days is mid-December: October and November ended.
        fx.clock.advance(ChronoDuration::days(70));
        let first = fx.service.close_and_roll(&fx.unit_id).await.unwrap();
        let RollOutcome::Rolled { opened, .. } = &first else {
            panic!("expected Rolled, got {:?}", first);
        };
        assert_eq!(opened.period_id, PeriodId(2));
        assert!(opened.window.end <= fx.clock.now());

        let second = fx.service.close_and_roll(&fx.unit_id).await.unwrap();
        assert_eq!(
            second,
            RollOutcome::AlreadyRolled {
                period_id: PeriodId::FIRST,
                successor: PeriodId(2)
            }
        );
        assert_eq!(fx.store.list_periods(&fx.unit_id).await.unwrap().len(), 2);

        // The sweep catches the late period up.
        let report = fx.service.reconcile_all().await.unwrap();
        assert_eq!(report.rolled, vec![(fx.unit_id.clone(), PeriodId(3))]);
        let periods = fx.store.list_periods(&fx.unit_id).await.unwrap();
        assert_eq!(periods.len(), 3);
        assert!(periods.last().unwrap().window.contains(fx.clock.now()));
    }

    #[tokio::test]
    async fn test_reconcile_all_catches_up() {
        let fx = fixture(0).await;
        let report = fx.service.reconcile_all().await.unwrap();
        assert_eq!(report.bootstrapped, vec![fx.unit_id.clone()]);

        // 2026-10-05 + 100 days lands in January: Nov, Dec, and Jan open.
        fx.clock.advance(ChronoDuration::days(100));
        let report = fx.service.reconcile_all().await.unwrap();
        assert_eq!(report.rolled.len(), 3);
        assert!(report.failed.is_empty());

        let periods = fx.store.list_periods(&fx.unit_id).await.unwrap();
        assert_eq!(periods.len(), 4);
        assert!(periods.windows(2).all(|w| w[0].window.end == w[1].window.start));
        assert_eq!(periods.iter().filter(|p| p.is_open()).count(), 1);
        assert!(periods.last().unwrap().window.contains(fx.clock.now()));

        let report = fx.service.reconcile_all().await.unwrap();
        assert_eq!(report.up_to_date, 1);
    }
}
