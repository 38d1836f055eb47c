// crates/aqua-daemon/src/commands.rs
//
// Operator subcommands: registry administration, usage, balances, history,
// and manual period rolls.

use std::sync::Arc;

use clap::Subcommand;

use aqua_core::context::CallerContext;
use aqua_core::error::AquaError;
use aqua_core::period::PeriodId;
use aqua_core::request::{RecordUsageRequest, RegisterUnitRequest};
use aqua_core::traits::LedgerStore;
use aqua_core::unit::{Principal, UnitId, UnitProfile};
use aqua_ledger::{LedgerServices, RollOutcome};

use crate::output::{
    describe_closed, format_json, format_table, BalanceRow, EventRow, OutputFormat, PeriodRow,
    UnitRow,
};

/// Operator subcommands.
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the reconciliation scheduler until Ctrl-C.
    Run,

    /// Register a unit.
    Register {
        /// Unit id; derived from floor and unit number when omitted.
        #[arg(long)]
        unit_id: Option<String>,
        /// Owner: a 0x wallet address or a user id.
        #[arg(long)]
        principal: String,
        #[arg(long)]
        floor: u16,
        #[arg(long)]
        unit_number: u16,
        #[arg(long)]
        residents: u16,
        #[arg(long)]
        size_sqft: u32,
    },

    /// Transfer a unit to a new owner.
    Transfer {
        unit_id: String,
        #[arg(long)]
        to: String,
    },

    /// Archive a unit.
    Archive { unit_id: String },

    /// List units.
    Units {
        /// Include archived units.
        #[arg(long)]
        all: bool,
    },

    /// Record usage against a unit's open period.
    Record {
        unit_id: String,
        /// Litres used.
        amount: i64,
        /// Idempotency key for the submission.
        #[arg(long)]
        key: String,
        /// Fail unless this period is the open one.
        #[arg(long)]
        period: Option<u64>,
        /// Submit as this resident instead of the admin principal.
        #[arg(long = "as")]
        as_principal: Option<String>,
    },

    /// Show a unit's open-period balance.
    Balance { unit_id: String },

    /// Show a unit's periods and the usage events of one of them.
    History {
        unit_id: String,
        /// Period number; the latest period when omitted.
        #[arg(long)]
        period: Option<u64>,
    },

    /// Close and roll a unit's due period, bootstrapping units with none.
    Roll {
        unit_id: String,
        /// Roll this period specifically.
        #[arg(long)]
        period: Option<u64>,
    },
}

/// Everything a command needs.
pub struct CommandContext {
    pub services: LedgerServices,
    pub store: Arc<dyn LedgerStore>,
    pub admin: CallerContext,
    pub format: OutputFormat,
}

/// Run a one-shot operator command.
pub async fn run(cmd: &Command, ctx: &CommandContext) -> Result<(), Box<dyn std::error::Error>> {
    let svc = &ctx.services;
    let json = ctx.format == OutputFormat::Json;

    match cmd {
        Command::Run => {
            return Err("`run` is handled by the scheduler".into());
        }
        Command::Register {
            unit_id,
            principal,
            floor,
            unit_number,
            residents,
            size_sqft,
        } => {
            let unit_id = match unit_id {
                Some(id) => id.clone(),
                None => UnitId::from_floor_unit(*floor, *unit_number)?.to_string(),
            };
            let request = RegisterUnitRequest {
                unit_id,
                principal: principal.clone(),
                profile: UnitProfile {
                    floor: *floor,
                    unit_number: *unit_number,
                    residents: *residents,
                    unit_size_sqft: *size_sqft,
                },
            };
            let uid = svc.registry.register(&ctx.admin, &request).await?;
            let unit = svc.registry.resolve(&uid).await?;
            print_units(&[unit], json);
        }
        Command::Transfer { unit_id, to } => {
            let uid = UnitId::parse(unit_id)?;
            let unit = svc.registry.transfer_ownership(&ctx.admin, &uid, to).await?;
            print_units(&[unit], json);
        }
        Command::Archive { unit_id } => {
            let uid = UnitId::parse(unit_id)?;
            let unit = svc.registry.archive(&ctx.admin, &uid).await?;
            print_units(&[unit], json);
        }
        Command::Units { all } => {
            let units = svc.registry.list_units(*all).await?;
            print_units(&units, json);
        }
        Command::Record {
            unit_id,
            amount,
            key,
            period,
            as_principal,
        } => {
            let caller = match as_principal {
                Some(p) => CallerContext::resident(Principal::parse(p)?),
                None => ctx.admin.clone(),
            };
            let request = RecordUsageRequest {
                unit_id: unit_id.clone(),
                amount: *amount,
                idempotency_key: key.clone(),
                expected_period: *period,
            };
            let event = svc.usage.record_usage(&caller, &request).await?;
            if json {
                println!("{}", format_json(&event));
            } else {
                println!("{}", format_table(&[EventRow::from(&event)]));
            }
        }
        Command::Balance { unit_id } => {
            let uid = UnitId::parse(unit_id)?;
            let balance = svc.usage.current_balance(&uid).await?;
            if json {
                println!("{}", format_json(&balance));
            } else {
                println!("{}", format_table(&[BalanceRow::from(&balance)]));
            }
        }
        Command::History { unit_id, period } => {
            let uid = UnitId::parse(unit_id)?;
            let periods = ctx.store.list_periods(&uid).await?;
            let period_id = match period {
                Some(p) => PeriodId(*p),
                None => match periods.last() {
                    Some(p) => p.period_id,
                    None => {
                        return Err(AquaError::NotOpen(format!(
                            "unit {} has no periods",
                            uid
                        ))
                        .into())
                    }
                },
            };
            let events = svc.usage.history(&uid, period_id).await?.collect_all().await?;
            if json {
                println!(
                    "{}",
                    format_json(&serde_json::json!({
                        "periods": periods,
                        "period_id": period_id,
                        "events": events,
                    }))
                );
            } else {
                let rows: Vec<PeriodRow> = periods.iter().map(PeriodRow::from).collect();
                println!("{}", format_table(&rows));
                println!();
                println!("Usage in {} ({} events)", period_id, events.len());
                let rows: Vec<EventRow> = events.iter().map(EventRow::from).collect();
                println!("{}", format_table(&rows));
            }
        }
        Command::Roll { unit_id, period } => {
            let uid = UnitId::parse(unit_id)?;
            let result = match period {
                Some(p) => svc.reconciler.close_and_roll_period(&uid, PeriodId(*p)).await,
                None => svc.reconciler.close_and_roll(&uid).await,
            };
            match result {
                Ok(outcome) => print_roll(&outcome, json),
                Err(AquaError::NotOpen(_)) if period.is_none() => {
                    let opened = svc.reconciler.bootstrap(&uid).await?;
                    if json {
                        println!("{}", format_json(&opened));
                    } else {
                        println!("Bootstrapped unit {}", uid);
                        println!("{}", format_table(&[PeriodRow::from(&opened)]));
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    Ok(())
}

fn print_units(units: &[aqua_core::unit::Unit], json: bool) {
    if json {
        println!("{}", format_json(&units));
    } else {
        let rows: Vec<UnitRow> = units.iter().map(UnitRow::from).collect();
        println!("{}", format_table(&rows));
    }
}

fn print_roll(outcome: &RollOutcome, json: bool) {
    if json {
        println!("{}", format_json(outcome));
        return;
    }
    match outcome {
        RollOutcome::Rolled { closed, opened } | RollOutcome::Resumed { closed, opened } => {
            if matches!(outcome, RollOutcome::Resumed { .. }) {
                println!("Resumed interrupted roll");
            }
            println!("{}", describe_closed(closed));
            println!("{}", format_table(&[PeriodRow::from(opened)]));
        }
        RollOutcome::AlreadyRolled {
            period_id,
            successor,
        } => {
            println!("{} was already rolled into {}", period_id, successor);
        }
        RollOutcome::NotDue { period_id, due_at } => {
            println!("{} is not due until {}", period_id, due_at);
        }
    }
}
