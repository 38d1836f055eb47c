// crates/aqua-daemon/src/output.rs
//
// Output formatting for operator commands: tables by default, JSON with
// --json.

use serde::Serialize;
use tabled::{Table, Tabled};

use aqua_core::period::{AllocationPeriod, ClosedPeriod};
use aqua_core::unit::Unit;
use aqua_core::usage::{Balance, UsageEvent};

/// Output format for operator commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Pretty-printed table output (default).
    Table,
    /// JSON output for machine consumption.
    Json,
}

/// Format a slice of Tabled items as a table string.
pub fn format_table<T: Tabled>(data: &[T]) -> String {
    Table::new(data).to_string()
}

/// Format a serializable value as a pretty-printed JSON string.
pub fn format_json<T: Serialize>(data: &T) -> String {
    serde_json::to_string_pretty(data).unwrap_or_else(|e| format!("JSON serialization error: {}", e))
}

#[derive(Tabled)]
pub struct UnitRow {
    #[tabled(rename = "Unit")]
    pub unit_id: String,
    #[tabled(rename = "Owner")]
    pub principal: String,
    #[tabled(rename = "Floor")]
    pub floor: u16,
    #[tabled(rename = "Residents")]
    pub residents: u16,
    #[tabled(rename = "Sq ft")]
    pub size: u32,
    #[tabled(rename = "Status")]
    pub status: String,
}

impl From<&Unit> for UnitRow {
    fn from(unit: &Unit) -> Self {
        Self {
            unit_id: unit.unit_id.to_string(),
            principal: unit.principal.to_string(),
            floor: unit.profile.floor,
            residents: unit.profile.residents,
            size: unit.profile.unit_size_sqft,
            status: match unit.archived_at {
                Some(at) => format!("archived {}", at.format("%Y-%m-%d")),
                None => "active".to_string(),
            },
        }
    }
}

#[derive(Tabled)]
pub struct BalanceRow {
    #[tabled(rename = "Unit")]
    pub unit_id: String,
    #[tabled(rename = "Period")]
    pub period: String,
    #[tabled(rename = "Granted")]
    pub granted: String,
    #[tabled(rename = "Carry-over")]
    pub carry_over: String,
    #[tabled(rename = "Used")]
    pub used: String,
    #[tabled(rename = "Available")]
    pub available: String,
}

impl From<&Balance> for BalanceRow {
    fn from(b: &Balance) -> Self {
        Self {
            unit_id: b.unit_id.to_string(),
            period: b.period_id.to_string(),
            granted: b.granted.to_string(),
            carry_over: b.carry_over.to_string(),
            used: b.used.to_string(),
            available: b.available.to_string(),
        }
    }
}

#[derive(Tabled)]
pub struct EventRow {
    #[tabled(rename = "Seq")]
    pub sequence: u64,
    #[tabled(rename = "Amount")]
    pub amount: String,
    #[tabled(rename = "Key")]
    pub key: String,
    #[tabled(rename = "Submitted")]
    pub submitted_at: String,
}

impl From<&UsageEvent> for EventRow {
    fn from(e: &UsageEvent) -> Self {
        Self {
            sequence: e.sequence,
            amount: e.amount.to_string(),
            key: e.idempotency_key.to_string(),
            submitted_at: e.submitted_at.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }
}

#[derive(Tabled)]
pub struct PeriodRow {
    #[tabled(rename = "Period")]
    pub period: String,
    #[tabled(rename = "Window")]
    pub window: String,
    #[tabled(rename = "Granted")]
    pub granted: String,
    #[tabled(rename = "Carry-over")]
    pub carry_over: String,
    #[tabled(rename = "Status")]
    pub status: String,
}

impl From<&AllocationPeriod> for PeriodRow {
    fn from(p: &AllocationPeriod) -> Self {
        Self {
            period: p.period_id.to_string(),
            window: format!(
                "{} .. {}",
                p.window.start.format("%Y-%m-%d"),
                p.window.end.format("%Y-%m-%d")
            ),
            granted: p.granted.to_string(),
            carry_over: p.carry_over.to_string(),
            status: p.status.to_string(),
        }
    }
}

/// One-line summary of a closed period.
pub fn describe_closed(closed: &ClosedPeriod) -> String {
    format!(
        "{} closed: used {}, closing balance {}",
        closed.period.period_id, closed.usage_total, closed.closing_balance
    )
}
