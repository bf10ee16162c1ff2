use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Top-level configuration, loaded once and snapshotted per cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PalisadeConfig {
    pub reconciler: ReconcilerConfig,
    pub exchange: ExchangeConfig,
    pub symbols: SymbolTable,
}

impl Default for PalisadeConfig {
    fn default() -> Self {
        Self {
            reconciler: ReconcilerConfig::default(),
            exchange: ExchangeConfig::default(),
            symbols: SymbolTable::default(),
        }
    }
}

impl PalisadeConfig {
    /// Checks cross-field invariants that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns a description of the first violated invariant.
    pub fn validate(&self) -> Result<(), String> {
        if self.reconciler.poll_interval.is_zero() {
            return Err("reconciler.poll_interval must be positive".to_string());
        }
        if self.reconciler.cycle_deadline < self.reconciler.poll_interval {
            return Err(
                "reconciler.cycle_deadline must be at least the poll interval".to_string()
            );
        }
        if self.reconciler.max_concurrent_symbols == 0 {
            return Err("reconciler.max_concurrent_symbols must be at least 1".to_string());
        }
        if self.exchange.mutations_per_minute == 0 {
            return Err("exchange.mutations_per_minute must be at least 1".to_string());
        }
        if self.exchange.reads_per_minute == 0 {
            return Err("exchange.reads_per_minute must be at least 1".to_string());
        }
        if self.symbols.default_tick_size <= Decimal::ZERO {
            return Err("symbols.default_tick_size must be positive".to_string());
        }
        if self.symbols.default_size_step <= Decimal::ZERO {
            return Err("symbols.default_size_step must be positive".to_string());
        }
        Ok(())
    }

    /// Resolves the effective settings for one symbol.
    ///
    /// Pure lookup against the immutable snapshot: overrides first, table
    /// defaults otherwise.
    #[must_use]
    pub fn symbol_settings(&self, symbol: &str) -> SymbolSettings {
        let defaults = &self.symbols;
        match self.symbols.overrides.get(symbol) {
            Some(o) => SymbolSettings {
                tick_size: o.tick_size.unwrap_or(defaults.default_tick_size),
                size_step: o.size_step.unwrap_or(defaults.default_size_step),
                tolerance_ticks: o
                    .tolerance_ticks
                    .unwrap_or(self.reconciler.tolerance_ticks),
                remediation_enabled: o.remediation_enabled.unwrap_or(true),
            },
            None => SymbolSettings {
                tick_size: defaults.default_tick_size,
                size_step: defaults.default_size_step,
                tolerance_ticks: self.reconciler.tolerance_ticks,
                remediation_enabled: true,
            },
        }
    }
}

/// How take-profit sizes are computed against a partially filled position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TakeProfitPolicy {
    /// Size legs from the original fractions; clamp the total to what is
    /// left of the position.
    Strict,
    /// Re-scale fractions proportionally so they cover the remaining size.
    Renormalize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Cadence of reconciliation passes.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,

    /// Hard ceiling on one cycle's duration; slower cycles are aborted.
    #[serde(with = "humantime_serde")]
    pub cycle_deadline: Duration,

    /// How long shutdown waits for in-flight remediation to drain.
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// Upper bound on symbols reconciled concurrently within one cycle.
    pub max_concurrent_symbols: usize,

    /// In-cycle retry policy for transient gateway failures.
    pub retry: RetryConfig,

    /// Consecutive non-ok cycles before the notification sink is invoked.
    pub alert_after_cycles: u32,

    /// Take-profit sizing policy for partially filled positions.
    pub take_profit_policy: TakeProfitPolicy,

    /// Price tolerance, expressed in instrument ticks, below which a live
    /// trigger price is considered equal to the expected one.
    pub tolerance_ticks: u32,

    /// Maximum age of an accepted signal relative to position open time for
    /// it to still count as the originating signal.
    #[serde(with = "humantime_serde")]
    pub target_staleness: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            cycle_deadline: Duration::from_secs(120),
            shutdown_timeout: Duration::from_secs(15),
            max_concurrent_symbols: 8,
            retry: RetryConfig::default(),
            alert_after_cycles: 3,
            take_profit_policy: TakeProfitPolicy::Renormalize,
            tolerance_ticks: 2,
            target_staleness: Duration::from_secs(6 * 3600),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the initial attempt.
    pub max_retries: u32,

    /// First backoff delay; doubles each retry.
    #[serde(with = "humantime_serde")]
    pub base_backoff: Duration,

    /// Backoff ceiling.
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// REST base URL.
    pub base_url: String,

    /// Per-request timeout.
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,

    /// Client-side quota for read endpoints.
    pub reads_per_minute: u32,

    /// Client-side quota for order mutations (place/cancel), shared across
    /// all symbols.
    pub mutations_per_minute: u32,

    /// Bitget product type for the mix API.
    pub product_type: String,

    /// Environment variable holding the API key.
    pub api_key_env: String,

    /// Environment variable holding the API secret.
    pub api_secret_env: String,

    /// Environment variable holding the API passphrase.
    pub passphrase_env: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.bitget.com".to_string(),
            request_timeout: Duration::from_secs(10),
            reads_per_minute: 240,
            mutations_per_minute: 60,
            product_type: "USDT-FUTURES".to_string(),
            api_key_env: "BITGET_API_KEY".to_string(),
            api_secret_env: "BITGET_API_SECRET".to_string(),
            passphrase_env: "BITGET_PASSPHRASE".to_string(),
        }
    }
}

/// Per-symbol instrument table with workspace-wide defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolTable {
    /// Tick size applied when a symbol has no override.
    pub default_tick_size: Decimal,

    /// Size step applied when a symbol has no override.
    pub default_size_step: Decimal,

    /// Symbol-keyed overrides.
    pub overrides: HashMap<String, SymbolOverride>,
}

impl Default for SymbolTable {
    fn default() -> Self {
        Self {
            default_tick_size: Decimal::new(1, 1), // 0.1
            default_size_step: Decimal::new(1, 3), // 0.001
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SymbolOverride {
    pub tick_size: Option<Decimal>,
    pub size_step: Option<Decimal>,
    pub tolerance_ticks: Option<u32>,
    pub remediation_enabled: Option<bool>,
}

/// Effective settings for one symbol after override resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct SymbolSettings {
    pub tick_size: Decimal,
    pub size_step: Decimal,
    pub tolerance_ticks: u32,
    pub remediation_enabled: bool,
}

impl SymbolSettings {
    /// Absolute price tolerance for this symbol.
    #[must_use]
    pub fn price_tolerance(&self) -> Decimal {
        self.tick_size * Decimal::from(self.tolerance_ticks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = PalisadeConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let mut config = PalisadeConfig::default();
        config.reconciler.poll_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_deadline_shorter_than_interval_rejected() {
        let mut config = PalisadeConfig::default();
        config.reconciler.cycle_deadline = Duration::from_secs(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_symbol_settings_defaults() {
        let config = PalisadeConfig::default();
        let settings = config.symbol_settings("BTCUSDT");
        assert_eq!(settings.tick_size, dec!(0.1));
        assert_eq!(settings.tolerance_ticks, 2);
        assert!(settings.remediation_enabled);
    }

    #[test]
    fn test_symbol_settings_override() {
        let mut config = PalisadeConfig::default();
        config.symbols.overrides.insert(
            "BTCUSDT".to_string(),
            SymbolOverride {
                tick_size: Some(dec!(0.5)),
                size_step: None,
                tolerance_ticks: Some(100),
                remediation_enabled: Some(false),
            },
        );

        let settings = config.symbol_settings("BTCUSDT");
        assert_eq!(settings.tick_size, dec!(0.5));
        assert_eq!(settings.size_step, dec!(0.001));
        assert_eq!(settings.tolerance_ticks, 100);
        assert!(!settings.remediation_enabled);

        // Other symbols keep the defaults
        let other = config.symbol_settings("ETHUSDT");
        assert!(other.remediation_enabled);
    }

    #[test]
    fn test_price_tolerance() {
        let settings = SymbolSettings {
            tick_size: dec!(0.5),
            size_step: dec!(0.001),
            tolerance_ticks: 100,
            remediation_enabled: true,
        };
        assert_eq!(settings.price_tolerance(), dec!(50));
    }

    #[test]
    fn test_config_toml_round_trip() {
        let config = PalisadeConfig::default();
        let toml = toml::to_string(&config).unwrap();
        let back: PalisadeConfig = toml::from_str(&toml).unwrap();
        assert_eq!(
            back.reconciler.poll_interval,
            config.reconciler.poll_interval
        );
        assert_eq!(back.exchange.base_url, config.exchange.base_url);
    }
}
