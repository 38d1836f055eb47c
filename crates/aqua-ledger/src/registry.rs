// crates/aqua-ledger/src/registry.rs
//
// AccountRegistry: binds a unit to its owning principal and profile.

use std::sync::Arc;

use aqua_core::context::CallerContext;
use aqua_core::error::AquaError;
use aqua_core::request::RegisterUnitRequest;
use aqua_core::traits::{Clock, LedgerStore};
use aqua_core::unit::{Principal, Unit, UnitId};

pub struct AccountRegistry {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl AccountRegistry {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Register a new unit.
    ///
    /// Residents may only register units they will own themselves; admins may
    /// register on behalf of any principal.
    ///
    /// # Errors
    /// `InvalidPrincipal` / `InvalidRequest` for malformed input,
    /// `Unauthorized` when a resident registers for someone else,
    /// `DuplicateUnit` when the id is taken.
    pub async fn register(
        &self,
        ctx: &CallerContext,
        request: &RegisterUnitRequest,
    ) -> Result<UnitId, AquaError> {
        let valid = request.validate()?;
        if !ctx.is_admin() && ctx.principal != valid.principal {
            return Err(AquaError::Unauthorized(format!(
                "{} may not register unit {} for {}",
                ctx.principal, valid.unit_id, valid.principal
            )));
        }

        let unit = Unit {
            unit_id: valid.unit_id.clone(),
            principal: valid.principal,
            profile: valid.profile,
            registered_at: self.clock.now(),
            archived_at: None,
        };
        self.store.insert_unit(&unit).await?;

        tracing::info!(
            "Registered unit {} (floor {}, {} residents) for {}",
            unit.unit_id,
            unit.profile.floor,
            unit.profile.residents,
            unit.principal
        );
        Ok(valid.unit_id)
    }

    /// # Errors
    /// `NotFound` if the unit was never registered.
    pub async fn resolve(&self, unit_id: &UnitId) -> Result<Unit, AquaError> {
        self.store
            .get_unit(unit_id)
            .await?
            .ok_or_else(|| AquaError::NotFound(format!("unit {} is not registered", unit_id)))
    }

    /// Hand a unit to a new principal. The unit's periods and usage history
    /// stay with the unit.
    ///
    /// # Errors
    /// `Unauthorized` unless the caller owns the unit or is an admin,
    /// `UnitArchived` for archived units, `InvalidPrincipal` for a malformed
    /// new owner.
    pub async fn transfer_ownership(
        &self,
        ctx: &CallerContext,
        unit_id: &UnitId,
        new_principal: &str,
    ) -> Result<Unit, AquaError> {
        let new_principal = Principal::parse(new_principal)?;
        let mut unit = self.resolve(unit_id).await?;
        if !ctx.may_act_for(&unit) {
            return Err(AquaError::Unauthorized(format!(
                "{} does not own unit {}",
                ctx.principal, unit_id
            )));
        }
        if unit.is_archived() {
            return Err(AquaError::UnitArchived(format!(
                "unit {} is archived",
                unit_id
            )));
        }
        if unit.principal == new_principal {
            return Ok(unit);
        }

        let previous = std::mem::replace(&mut unit.principal, new_principal);
        self.store.update_unit(&unit).await?;
        tracing::info!(
            "Transferred unit {} from {} to {}",
            unit_id,
            previous,
            unit.principal
        );
        Ok(unit)
    }

    /// Retire a unit. Archived units accept no further usage and are skipped
    /// by reconciliation; their history stays readable. Archiving twice is a
    /// no-op.
    ///
    /// # Errors
    /// `Unauthorized` unless the caller is an admin.
    pub async fn archive(&self, ctx: &CallerContext, unit_id: &UnitId) -> Result<Unit, AquaError> {
        if !ctx.is_admin() {
            return Err(AquaError::Unauthorized(format!(
                "archiving unit {} requires an admin",
                unit_id
            )));
        }
        let mut unit = self.resolve(unit_id).await?;
        if unit.is_archived() {
            return Ok(unit);
        }
        unit.archived_at = Some(self.clock.now());
        self.store.update_unit(&unit).await?;
        tracing::info!("Archived unit {}", unit_id);
        Ok(unit)
    }

    pub async fn list_units(&self, include_archived: bool) -> Result<Vec<Unit>, AquaError> {
        let units = self.store.list_units().await?;
        Ok(units
            .into_iter()
            .filter(|u| include_archived || !u.is_archived())
            .collect())
    }
}
