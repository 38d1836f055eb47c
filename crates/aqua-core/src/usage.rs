// crates/aqua-core/src/usage.rs
//
// Usage events and derived balances.
//
// Usage events are append-only. The balance of a unit is never stored; it is
// recomputed from the open period and the events debited against it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::AquaError;
use crate::period::PeriodId;
use crate::token::Tokens;
use crate::unit::UnitId;

const MAX_IDEMPOTENCY_KEY_LEN: usize = 128;

/// Client-supplied token that makes a retried usage submission land once.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn parse(raw: &str) -> Result<Self, AquaError> {
        if raw.is_empty() || raw.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(AquaError::InvalidRequest(format!(
                "idempotency key must be 1..={} characters",
                MAX_IDEMPOTENCY_KEY_LEN
            )));
        }
        if !raw.chars().all(|c| c.is_ascii_graphic()) {
            return Err(AquaError::InvalidRequest(
                "idempotency key must be printable ASCII without whitespace".to_string(),
            ));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One debit against a unit's open allocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageEvent {
    /// Globally unique event id (UUID v7, time-ordered).
    pub event_id: Uuid,
    pub unit_id: UnitId,
    /// Per-unit sequence number, starting at 1 and gap-free.
    pub sequence: u64,
    /// The period that was Open when the event was accepted.
    pub period_id: PeriodId,
    /// Debited amount. Always positive.
    pub amount: Tokens,
    pub idempotency_key: IdempotencyKey,
    pub submitted_at: DateTime<Utc>,
}

/// Result of a compare-and-append against the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    /// The event was written.
    Appended(UsageEvent),
    /// The idempotency key was already registered; the stored event is returned.
    Duplicate(UsageEvent),
}

impl AppendOutcome {
    pub fn into_event(self) -> UsageEvent {
        match self {
            AppendOutcome::Appended(e) | AppendOutcome::Duplicate(e) => e,
        }
    }
}

/// One observed (or forecast) daily consumption figure from the
/// historical-usage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageSample {
    pub date: NaiveDate,
    pub litres: f64,
}

/// Derived balance of a unit's open period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub unit_id: UnitId,
    pub period_id: PeriodId,
    pub granted: Tokens,
    pub carry_over: Tokens,
    pub used: Tokens,
    /// `granted + carry_over - used`.
    pub available: Tokens,
}

impl Balance {
    pub fn compute(
        unit_id: UnitId,
        period_id: PeriodId,
        granted: Tokens,
        carry_over: Tokens,
        used: Tokens,
    ) -> Self {
        Self {
            unit_id,
            period_id,
            granted,
            carry_over,
            used,
            available: granted + carry_over - used,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idempotency_key_validation() {
        assert!(IdempotencyKey::parse("tx-0xabc-1").is_ok());
        assert!(IdempotencyKey::parse("").is_err());
        assert!(IdempotencyKey::parse("has space").is_err());
        assert!(IdempotencyKey::parse(&"k".repeat(129)).is_err());
    }

    #[test]
    fn test_balance_compute() {
        let b = Balance::compute(
            UnitId::parse("A101").unwrap(),
            PeriodId::FIRST,
            Tokens::new(300),
            Tokens::zero(),
            Tokens::new(250),
        );
        assert_eq!(b.available, Tokens::new(50));
    }
}
