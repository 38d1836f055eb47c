use thiserror::Error;

/// Ledger-wide error taxonomy.
///
/// Transient kinds (`AllocationUnavailable`, `StoreUnavailable`) may be
/// retried by the caller with backoff. Every other kind is terminal for the
/// call that produced it and is surfaced to the collaborator verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AquaError {
    /// Unit, period, or event does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// A unit with this id is already registered.
    #[error("Duplicate unit: {0}")]
    DuplicateUnit(String),

    /// Principal failed wallet-address / user-id format validation.
    #[error("Invalid principal: {0}")]
    InvalidPrincipal(String),

    /// Request payload failed boundary validation.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Caller is neither the unit's principal nor an admin.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Unit has been soft-archived and accepts no new usage.
    #[error("Unit archived: {0}")]
    UnitArchived(String),

    /// An Open period already exists, or the new window is not contiguous.
    #[error("Period overlap: {0}")]
    PeriodOverlap(String),

    /// The targeted period no longer accepts debits.
    #[error("Period closed: {0}")]
    PeriodClosed(String),

    /// `close_period` on a period that is already Closed.
    #[error("Period already closed: {0}")]
    AlreadyClosed(String),

    /// No period is open where one is required.
    #[error("No open period: {0}")]
    NotOpen(String),

    /// Historical series was empty or contained no usable samples.
    #[error("No usage history: {0}")]
    NoHistory(String),

    /// Debit would take the balance below the effective debt floor.
    #[error("Insufficient allocation: balance {balance} WTK, requested {requested} WTK, floor {floor} WTK")]
    InsufficientAllocation {
        balance: i64,
        requested: i64,
        floor: i64,
    },

    /// Another reconciliation for the same unit is in flight.
    #[error("Reconciliation conflict: {0}")]
    ReconciliationConflict(String),

    /// Historical-usage collaborator timed out or failed (transient).
    #[error("Allocation unavailable: {0}")]
    AllocationUnavailable(String),

    /// Backing store could not serve the request in time (transient).
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AquaError {
    /// Whether the caller may retry the same call with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AquaError::AllocationUnavailable(_) | AquaError::StoreUnavailable(_)
        )
    }
}

impl From<serde_json::Error> for AquaError {
    fn from(e: serde_json::Error) -> Self {
        AquaError::Serialization(e.to_string())
    }
}
