// crates/aqua-daemon/src/config.rs
//
// Runtime configuration for the Aqua daemon.
// Loaded from a TOML file or populated with defaults.

use serde::Deserialize;
use std::fs;

use aqua_ledger::{AllocationPolicy, LedgerConfig, LedgerPolicy, RetryPolicy, RolloverPolicy};

/// Runtime configuration for the daemon.
#[derive(Debug, Clone, Deserialize)]
pub struct DaemonConfig {
    /// Directory holding the RocksDB ledger.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Log level used when RUST_LOG is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Principal operator commands act as.
    #[serde(default = "default_admin_principal")]
    pub admin_principal: String,

    /// Seconds between reconciliation sweeps.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,

    /// Base URL of the usage forecast service.
    #[serde(default = "default_forecast_url")]
    pub forecast_url: String,

    /// Events fetched per page when listing usage history.
    #[serde(default = "default_history_page_size")]
    pub history_page_size: usize,

    #[serde(default)]
    pub allocation: AllocationPolicy,

    #[serde(default)]
    pub ledger: LedgerPolicy,

    #[serde(default)]
    pub rollover: RolloverPolicy,

    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_data_dir() -> String {
    "~/.aqua/data".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_admin_principal() -> String {
    "facility-admin".to_string()
}

fn default_tick_interval_secs() -> u64 {
    300
}

fn default_forecast_url() -> String {
    "http://127.0.0.1:5000".to_string()
}

fn default_history_page_size() -> usize {
    256
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_level: default_log_level(),
            admin_principal: default_admin_principal(),
            tick_interval_secs: default_tick_interval_secs(),
            forecast_url: default_forecast_url(),
            history_page_size: default_history_page_size(),
            allocation: AllocationPolicy::default(),
            ledger: LedgerPolicy::default(),
            rollover: RolloverPolicy::default(),
            retry: RetryPolicy::default(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from a TOML file at the given path.
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = fs::read_to_string(path)?;
        let config: DaemonConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Policy handed to the ledger services.
    pub fn ledger_config(&self) -> LedgerConfig {
        let mut ledger = self.ledger.clone();
        ledger.history_page_size = self.history_page_size;
        LedgerConfig {
            allocation: self.allocation.clone(),
            ledger,
            rollover: self.rollover.clone(),
            retry: self.retry.clone(),
        }
    }
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}/{}", home.display(), rest);
        }
    }
    path.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use aqua_core::period::PeriodCadence;
    use aqua_core::token::Tokens;

    #[test]
    fn test_empty_file_gives_defaults() {
        let config: DaemonConfig = toml::from_str("").unwrap();
        assert_eq!(config.tick_interval_secs, 300);
        assert_eq!(config.allocation.default_allocation, Tokens::new(300));
        assert!(!config.ledger.debt_mode);
        assert_eq!(config.rollover.max_carry_over, Tokens::zero());
    }

    #[test]
    fn test_sections_parse() {
        let config: DaemonConfig = toml::from_str(
            r#"
            data_dir = "/var/lib/aqua"
            forecast_url = "http://forecast.internal:5000"
            history_page_size = 50

            [allocation]
            sample_window = 14
            headroom = 1.2
            cadence = "weekly"

            [ledger]
            debt_mode = true
            debt_floor = -200

            [rollover]
            max_carry_over = 150

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.data_dir, "/var/lib/aqua");
        assert_eq!(config.allocation.sample_window, 14);
        assert_eq!(config.allocation.cadence, PeriodCadence::Weekly);
        assert_eq!(config.allocation.min_allocation, Tokens::new(50));
        assert_eq!(config.retry.max_attempts, 3);

        let ledger = config.ledger_config();
        assert!(ledger.validate().is_ok());
        assert_eq!(ledger.ledger.history_page_size, 50);
        assert_eq!(ledger.ledger.effective_floor(), Tokens::new(-200));
        assert_eq!(ledger.rollover.max_carry_over, Tokens::new(150));
    }

    #[test]
    fn test_expand_tilde_leaves_absolute_paths() {
        assert_eq!(expand_tilde("/data/aqua"), "/data/aqua");
    }
}
