// crates/aqua-core/src/context.rs
//
// Explicit caller context passed into registry and ledger calls in place of
// an ambient wallet session.

use serde::{Deserialize, Serialize};

use crate::unit::{Principal, Unit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Resident,
    Admin,
}

/// Who is making a call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub principal: Principal,
    pub role: Role,
}

impl CallerContext {
    pub fn resident(principal: Principal) -> Self {
        Self {
            principal,
            role: Role::Resident,
        }
    }

    pub fn admin(principal: Principal) -> Self {
        Self {
            principal,
            role: Role::Admin,
        }
    }

    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }

    /// Owner of the unit, or an admin.
    pub fn may_act_for(&self, unit: &Unit) -> bool {
        self.is_admin() || self.principal == unit.principal
    }
}
