// crates/aqua-core/src/lib.rs
//
// aqua-core: Core types, error taxonomy, and traits for the Aqua water-token ledger.
//
// This is the leaf crate every other crate in the workspace depends on. It
// defines units, allocation periods, usage events, the token amount type,
// validated request payloads, and the storage/collaborator interfaces.

pub mod clock;
pub mod context;
pub mod error;
pub mod period;
pub mod request;
pub mod token;
pub mod traits;
pub mod unit;
pub mod usage;

// Re-export key types for ergonomic access from downstream crates.
// Usage: `use aqua_core::UnitId;`

pub use clock::{ManualClock, SystemClock};
pub use context::{CallerContext, Role};
pub use error::AquaError;
pub use period::{
    AllocationPeriod, ClosedPeriod, GrantBasis, PeriodCadence, PeriodId, PeriodStatus,
    PeriodWindow,
};
pub use request::{RecordUsageRequest, RegisterUnitRequest, ValidRegistration, ValidUsage};
pub use token::Tokens;
pub use traits::{Clock, LedgerStore, UsageHistorySource};
pub use unit::{Principal, Unit, UnitId, UnitProfile};
pub use usage::{AppendOutcome, Balance, IdempotencyKey, UsageEvent, UsageSample};
