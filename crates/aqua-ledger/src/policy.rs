// crates/aqua-ledger/src/policy.rs
//
// Deployment policy for allocation, debiting, and rollover.
//
// None of these are business constants: each deployment sets them in its
// configuration file. Defaults keep debt disabled and carry nothing over.

use serde::{Deserialize, Serialize};

use aqua_core::error::AquaError;
use aqua_core::period::PeriodCadence;
use aqua_core::token::Tokens;

/// How a period's grant is derived from historical usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationPolicy {
    /// Number of most recent samples averaged (N).
    #[serde(default = "default_sample_window")]
    pub sample_window: usize,

    /// Multiplier applied to the mean.
    #[serde(default = "default_headroom")]
    pub headroom: f64,

    #[serde(default = "default_min_allocation")]
    pub min_allocation: Tokens,

    #[serde(default = "default_max_allocation")]
    pub max_allocation: Tokens,

    /// Granted when the historical series has no usable samples.
    #[serde(default = "default_default_allocation")]
    pub default_allocation: Tokens,

    /// Per-resident lower bound on the grant. Zero disables it.
    #[serde(default)]
    pub per_resident_allowance: Tokens,

    /// Length of each accounting window.
    #[serde(default)]
    pub cadence: PeriodCadence,
}

fn default_sample_window() -> usize {
    7
}

fn default_headroom() -> f64 {
    1.1
}

fn default_min_allocation() -> Tokens {
    Tokens::new(50)
}

fn default_max_allocation() -> Tokens {
    Tokens::new(10_000)
}

fn default_default_allocation() -> Tokens {
    Tokens::new(300)
}

impl Default for AllocationPolicy {
    fn default() -> Self {
        Self {
            sample_window: default_sample_window(),
            headroom: default_headroom(),
            min_allocation: default_min_allocation(),
            max_allocation: default_max_allocation(),
            default_allocation: default_default_allocation(),
            per_resident_allowance: Tokens::zero(),
            cadence: PeriodCadence::default(),
        }
    }
}

impl AllocationPolicy {
    pub fn validate(&self) -> Result<(), AquaError> {
        if self.sample_window == 0 {
            return Err(AquaError::InvalidRequest("sample_window must be >= 1".to_string()));
        }
        if !self.headroom.is_finite() || self.headroom <= 0.0 {
            return Err(AquaError::InvalidRequest(format!(
                "headroom must be a positive number, got {}",
                self.headroom
            )));
        }
        if self.min_allocation.is_negative() || self.min_allocation > self.max_allocation {
            return Err(AquaError::InvalidRequest(format!(
                "allocation bounds [{}, {}] are invalid",
                self.min_allocation, self.max_allocation
            )));
        }
        if self.default_allocation.is_negative() || self.per_resident_allowance.is_negative() {
            return Err(AquaError::InvalidRequest(
                "default_allocation and per_resident_allowance must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}

/// Debit rules and latency bounds for the usage ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerPolicy {
    /// Allow balances to go negative down to `debt_floor`.
    #[serde(default)]
    pub debt_mode: bool,

    /// Lowest balance permitted in debt mode. Must be <= 0.
    #[serde(default)]
    pub debt_floor: Tokens,

    /// Longest a writer waits for a unit's ledger lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Longest a single store call may take.
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Events fetched per page by history cursors.
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,
}

fn default_lock_timeout_ms() -> u64 {
    2_000
}

fn default_store_timeout_ms() -> u64 {
    5_000
}

fn default_history_page_size() -> usize {
    256
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            debt_mode: false,
            debt_floor: Tokens::zero(),
            lock_timeout_ms: default_lock_timeout_ms(),
            store_timeout_ms: default_store_timeout_ms(),
            history_page_size: default_history_page_size(),
        }
    }
}

impl LedgerPolicy {
    /// The lowest balance a debit may leave behind: `debt_floor` in debt
    /// mode, zero otherwise.
    pub fn effective_floor(&self) -> Tokens {
        if self.debt_mode {
            self.debt_floor.min(Tokens::zero())
        } else {
            Tokens::zero()
        }
    }

    pub fn validate(&self) -> Result<(), AquaError> {
        if self.debt_floor.is_positive() {
            return Err(AquaError::InvalidRequest(format!(
                "debt_floor must be <= 0, got {}",
                self.debt_floor
            )));
        }
        if self.history_page_size == 0 {
            return Err(AquaError::InvalidRequest("history_page_size must be >= 1".to_string()));
        }
        Ok(())
    }
}

/// What happens to a closed period's balance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RolloverPolicy {
    /// Largest unused balance carried into the next period.
    #[serde(default)]
    pub max_carry_over: Tokens,
}

impl RolloverPolicy {
    pub fn validate(&self) -> Result<(), AquaError> {
        if self.max_carry_over.is_negative() {
            return Err(AquaError::InvalidRequest(
                "max_carry_over must not be negative".to_string(),
            ));
        }
        Ok(())
    }
}
