// crates/aqua-core/src/unit.rs
//
// Dwelling units and the principals that own them.
//
// A Unit is created at registration and never deleted. The only mutations
// are principal transfer and soft-archival.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AquaError;

const MAX_UNIT_ID_LEN: usize = 32;
const MAX_USER_ID_LEN: usize = 64;

/// Stable identifier of a dwelling unit (flat/apartment), e.g. `A101`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitId(String);

impl UnitId {
    /// Parse and normalize a unit id.
    ///
    /// Accepts 1..=32 ASCII alphanumerics, `-` and `_`. Letters are upper-cased
    /// so `a101` and `A101` name the same unit.
    pub fn parse(raw: &str) -> Result<Self, AquaError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(AquaError::InvalidRequest("unit id must not be empty".to_string()));
        }
        if trimmed.len() > MAX_UNIT_ID_LEN {
            return Err(AquaError::InvalidRequest(format!(
                "unit id '{}' exceeds {} characters",
                trimmed, MAX_UNIT_ID_LEN
            )));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(AquaError::InvalidRequest(format!(
                "unit id '{}' contains invalid characters",
                trimmed
            )));
        }
        Ok(Self(trimmed.to_ascii_uppercase()))
    }

    /// The building's native key for a floor/unit pair.
    ///
    /// Floors are numbered from 1 but the key stores `floor - 1`, so
    /// floor 2 unit 1 is `A101`.
    pub fn from_floor_unit(floor: u16, unit_number: u16) -> Result<Self, AquaError> {
        if floor == 0 || unit_number == 0 {
            return Err(AquaError::InvalidRequest(
                "floor and unit number start at 1".to_string(),
            ));
        }
        Self::parse(&format!("A{}{:02}", floor - 1, unit_number))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The owner of a unit: a wallet address or a plain user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum Principal {
    /// `0x`-prefixed 20-byte hex address, stored lower-case.
    Wallet(String),
    /// Application user id.
    User(String),
}

impl Principal {
    /// Parse a principal, validating its format.
    ///
    /// # Errors
    /// Returns `AquaError::InvalidPrincipal` for malformed addresses or ids.
    pub fn parse(raw: &str) -> Result<Self, AquaError> {
        let trimmed = raw.trim();
        if let Some(hex) = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
        {
            if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(AquaError::InvalidPrincipal(format!(
                    "'{}' is not a 20-byte hex wallet address",
                    trimmed
                )));
            }
            return Ok(Principal::Wallet(format!("0x{}", hex.to_ascii_lowercase())));
        }

        if trimmed.is_empty() || trimmed.len() > MAX_USER_ID_LEN {
            return Err(AquaError::InvalidPrincipal(format!(
                "user id must be 1..={} characters",
                MAX_USER_ID_LEN
            )));
        }
        if !trimmed
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '-'))
        {
            return Err(AquaError::InvalidPrincipal(format!(
                "user id '{}' contains invalid characters",
                trimmed
            )));
        }
        Ok(Principal::User(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        match self {
            Principal::Wallet(addr) => addr,
            Principal::User(id) => id,
        }
    }
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Household profile captured at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitProfile {
    /// Floor number, starting at 1.
    pub floor: u16,
    /// Unit number on the floor, starting at 1.
    pub unit_number: u16,
    /// Number of residents.
    pub residents: u16,
    /// Floor area in square feet.
    pub unit_size_sqft: u32,
}

impl UnitProfile {
    pub fn validate(&self) -> Result<(), AquaError> {
        if self.floor == 0 {
            return Err(AquaError::InvalidRequest("floor must be >= 1".to_string()));
        }
        if self.unit_number == 0 {
            return Err(AquaError::InvalidRequest("unit number must be >= 1".to_string()));
        }
        if self.residents == 0 {
            return Err(AquaError::InvalidRequest("residents must be >= 1".to_string()));
        }
        if self.unit_size_sqft == 0 {
            return Err(AquaError::InvalidRequest("unit size must be > 0".to_string()));
        }
        Ok(())
    }
}

/// A registered dwelling unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub unit_id: UnitId,
    /// Current owner. Changes only through ownership transfer.
    pub principal: Principal,
    pub profile: UnitProfile,
    pub registered_at: DateTime<Utc>,
    /// Set when the unit is soft-archived.
    #[serde(default)]
    pub archived_at: Option<DateTime<Utc>>,
}

impl Unit {
    pub fn is_archived(&self) -> bool {
        self.archived_at.is_some()
    }
}
