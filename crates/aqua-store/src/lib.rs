// crates/aqua-store/src/lib.rs
//
// aqua-store: Storage layer for the Aqua water-token ledger.
//
// Provides two `LedgerStore` backends with identical constraint semantics:
// an in-memory store for tests and embedded use, and a RocksDB store whose
// usage appends commit as a single atomic write batch.

pub mod memory;
pub mod rocks;

// Re-export key types for ergonomic access from downstream crates.
pub use memory::MemoryStore;
pub use rocks::RocksStore;

#[cfg(test)]
mod test_support {
    use chrono::{Duration, Utc};

    use aqua_core::period::{AllocationPeriod, GrantBasis, PeriodId, PeriodStatus, PeriodWindow};
    use aqua_core::token::Tokens;
    use aqua_core::unit::{Principal, Unit, UnitId, UnitProfile};
    use aqua_core::usage::{IdempotencyKey, UsageEvent};

    pub fn unit_id(id: &str) -> UnitId {
        UnitId::parse(id).unwrap()
    }

    pub fn unit(id: &str) -> Unit {
        Unit {
            unit_id: unit_id(id),
            principal: Principal::parse("resident-1").unwrap(),
            profile: UnitProfile {
                floor: 2,
                unit_number: 1,
                residents: 3,
                unit_size_sqft: 850,
            },
            registered_at: Utc::now(),
            archived_at: None,
        }
    }

    pub fn period(id: &str, period_id: u64) -> AllocationPeriod {
        let start = Utc::now() + Duration::days(30 * period_id as i64);
        AllocationPeriod {
            unit_id: unit_id(id),
            period_id: PeriodId(period_id),
            window: PeriodWindow {
                start,
                end: start + Duration::days(30),
            },
            granted: Tokens::new(300),
            carry_over: Tokens::zero(),
            basis: GrantBasis::Default,
            status: PeriodStatus::Open,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn event(id: &str, sequence: u64, period_id: u64, amount: i64, key: &str) -> UsageEvent {
        UsageEvent {
            event_id: uuid::Uuid::now_v7(),
            unit_id: unit_id(id),
            sequence,
            period_id: PeriodId(period_id),
            amount: Tokens::new(amount),
            idempotency_key: IdempotencyKey::parse(key).unwrap(),
            submitted_at: Utc::now(),
        }
    }
}
