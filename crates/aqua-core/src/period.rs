// crates/aqua-core/src/period.rs
//
// Allocation periods and their windows.
//
// Per unit, periods form a contiguous chain: each window starts exactly where
// the previous one ended, ids increase by one, and at most one period is Open.
//
//   NoPeriod --> Open --> Closed --> (next) Open --> Closed --> ...

use chrono::{DateTime, Datelike, Duration, Months, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AquaError;
use crate::token::Tokens;
use crate::unit::UnitId;

/// Per-unit period number. The first period of a unit is 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeriodId(pub u64);

impl PeriodId {
    pub const FIRST: PeriodId = PeriodId(1);

    pub fn next(self) -> PeriodId {
        PeriodId(self.0 + 1)
    }

    /// The predecessor, or `None` for the first period.
    pub fn previous(self) -> Option<PeriodId> {
        (self.0 > 1).then(|| PeriodId(self.0 - 1))
    }
}

impl fmt::Display for PeriodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Length of an accounting window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeriodCadence {
    Daily,
    Weekly,
    Monthly,
}

impl Default for PeriodCadence {
    fn default() -> Self {
        PeriodCadence::Monthly
    }
}

/// Half-open time interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl PeriodWindow {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AquaError> {
        if end <= start {
            return Err(AquaError::InvalidRequest(format!(
                "period window end {} must be after start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// The window of the given cadence that contains `instant`.
    ///
    /// Daily windows start at midnight UTC, weekly windows on Monday, monthly
    /// windows on the first of the month.
    pub fn containing(instant: DateTime<Utc>, cadence: PeriodCadence) -> Self {
        let midnight = Utc
            .with_ymd_and_hms(instant.year(), instant.month(), instant.day(), 0, 0, 0)
            .single()
            .unwrap_or(instant);
        let start = match cadence {
            PeriodCadence::Daily => midnight,
            PeriodCadence::Weekly => {
                midnight - Duration::days(instant.weekday().num_days_from_monday() as i64)
            }
            PeriodCadence::Monthly => Utc
                .with_ymd_and_hms(instant.year(), instant.month(), 1, 0, 0, 0)
                .single()
                .unwrap_or(midnight),
        };
        Self {
            start,
            end: advance(start, cadence),
        }
    }

    /// The window immediately following this one.
    pub fn following(&self, cadence: PeriodCadence) -> Self {
        Self {
            start: self.end,
            end: advance(self.end, cadence),
        }
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Length of the window in whole days (at least 1).
    pub fn days(&self) -> u32 {
        (self.end - self.start).num_days().max(1) as u32
    }
}

fn advance(from: DateTime<Utc>, cadence: PeriodCadence) -> DateTime<Utc> {
    match cadence {
        PeriodCadence::Daily => from + Duration::days(1),
        PeriodCadence::Weekly => from + Duration::weeks(1),
        PeriodCadence::Monthly => from
            .checked_add_months(Months::new(1))
            .unwrap_or(from + Duration::days(30)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodStatus {
    Open,
    Closed,
}

impl fmt::Display for PeriodStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeriodStatus::Open => write!(f, "Open"),
            PeriodStatus::Closed => write!(f, "Closed"),
        }
    }
}

/// How a period's grant was derived, kept for audit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "basis", rename_all = "snake_case")]
pub enum GrantBasis {
    /// Mean of `samples` usable historical values, before headroom and clamping.
    Historical { samples: usize, mean: f64 },
    /// No usable history; the deployment's default allocation was granted.
    Default,
}

/// One unit's token grant for one accounting window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationPeriod {
    pub unit_id: UnitId,
    pub period_id: PeriodId,
    pub window: PeriodWindow,
    /// Tokens granted for this window. Never negative.
    pub granted: Tokens,
    /// Balance rolled in from the previous period. Negative only in debt mode.
    pub carry_over: Tokens,
    pub basis: GrantBasis,
    pub status: PeriodStatus,
    pub opened_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
}

impl AllocationPeriod {
    /// `granted + carry_over`: the most this period can absorb before the floor.
    pub fn entitlement(&self) -> Tokens {
        self.granted + self.carry_over
    }

    pub fn is_open(&self) -> bool {
        self.status == PeriodStatus::Open
    }
}

/// A period frozen by `close_period`, with its final figures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedPeriod {
    pub period: AllocationPeriod,
    /// Sum of all usage debited in the period.
    pub usage_total: Tokens,
    /// `entitlement - usage_total` at close.
    pub closing_balance: Tokens,
}
