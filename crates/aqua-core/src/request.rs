// crates/aqua-core/src/request.rs
//
// Loosely-typed payloads from the registration and wallet collaborators,
// validated into typed values before they reach the ledger.

use serde::{Deserialize, Serialize};

use crate::error::AquaError;
use crate::period::PeriodId;
use crate::token::Tokens;
use crate::unit::{Principal, UnitId, UnitProfile};
use crate::usage::IdempotencyKey;

/// Registration payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterUnitRequest {
    pub unit_id: String,
    pub principal: String,
    pub profile: UnitProfile,
}

/// Registration payload after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidRegistration {
    pub unit_id: UnitId,
    pub principal: Principal,
    pub profile: UnitProfile,
}

impl RegisterUnitRequest {
    pub fn validate(&self) -> Result<ValidRegistration, AquaError> {
        let unit_id = UnitId::parse(&self.unit_id)?;
        let principal = Principal::parse(&self.principal)?;
        self.profile.validate()?;
        Ok(ValidRegistration {
            unit_id,
            principal,
            profile: self.profile.clone(),
        })
    }
}

/// Usage submission payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordUsageRequest {
    pub unit_id: String,
    pub amount: i64,
    pub idempotency_key: String,
    /// When set, the debit must land in exactly this period or fail.
    #[serde(default)]
    pub expected_period: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidUsage {
    pub unit_id: UnitId,
    pub amount: Tokens,
    pub idempotency_key: IdempotencyKey,
    pub expected_period: Option<PeriodId>,
}

impl RecordUsageRequest {
    pub fn validate(&self) -> Result<ValidUsage, AquaError> {
        let unit_id = UnitId::parse(&self.unit_id)?;
        if self.amount <= 0 {
            return Err(AquaError::InvalidRequest(format!(
                "usage amount must be positive, got {}",
                self.amount
            )));
        }
        let idempotency_key = IdempotencyKey::parse(&self.idempotency_key)?;
        Ok(ValidUsage {
            unit_id,
            amount: Tokens::new(self.amount),
            idempotency_key,
            expected_period: self.expected_period.map(PeriodId),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> UnitProfile {
        UnitProfile {
            floor: 2,
            unit_number: 1,
            residents: 4,
            unit_size_sqft: 900,
        }
    }

    #[test]
    fn test_registration_validates_every_field() {
        let req = RegisterUnitRequest {
            unit_id: "a101".to_string(),
            principal: "0x14f713b4cb00eFD22746b7964b41606f638E5919".to_string(),
            profile: profile(),
        };
        let valid = req.validate().unwrap();
        assert_eq!(valid.unit_id.as_str(), "A101");

        let bad = RegisterUnitRequest {
            principal: "0xUser1".to_string(),
            ..req
        };
        assert!(matches!(bad.validate(), Err(AquaError::InvalidPrincipal(_))));
    }

    #[test]
    fn test_usage_rejects_non_positive_amount() {
        let req = RecordUsageRequest {
            unit_id: "A101".to_string(),
            amount: 0,
            idempotency_key: "k1".to_string(),
            expected_period: None,
        };
        assert!(matches!(req.validate(), Err(AquaError::InvalidRequest(_))));
    }

    #[test]
    fn test_usage_from_json_payload() {
        let json = r#"{"unit_id":"A101","amount":5,"idempotency_key":"k1"}"#;
        let req: RecordUsageRequest = serde_json::from_str(json).unwrap();
        let valid = req.validate().unwrap();
        assert_eq!(valid.amount, Tokens::new(5));
        assert_eq!(valid.expected_period, None);
    }
}
