//! TOML configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use ledgerless::Symbol;
use rustc_hash::FxHashMap;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub lots: LotConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Paper,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_kind")]
    pub kind: BrokerKind,
    #[serde(default = "default_account_file")]
    pub account_file: String,
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_call_attempts")]
    pub max_call_attempts: u32,
    #[serde(default = "default_backoff_initial")]
    pub backoff_initial_ms: u64,
    #[serde(default = "default_backoff_max")]
    pub backoff_max_ms: u64,
}

fn default_broker_kind() -> BrokerKind {
    BrokerKind::Paper
}
fn default_account_file() -> String {
    "paper_account.json".into()
}
fn default_call_timeout() -> u64 {
    10
}
fn default_call_attempts() -> u32 {
    3
}
fn default_backoff_initial() -> u64 {
    200
}
fn default_backoff_max() -> u64 {
    5_000
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: default_broker_kind(),
            account_file: default_account_file(),
            call_timeout_secs: default_call_timeout(),
            max_call_attempts: default_call_attempts(),
            backoff_initial_ms: default_backoff_initial(),
            backoff_max_ms: default_backoff_max(),
        }
    }
}

impl BrokerConfig {
    /// Longest one guarded broker call can take: every attempt may need a
    /// reconnect and the call itself, each under the call timeout, with a
    /// capped backoff between attempts.
    pub fn call_bound(&self) -> Duration {
        let attempts = self.max_call_attempts.max(1);
        Duration::from_secs(self.call_timeout_secs) * 2 * attempts
            + Duration::from_millis(self.backoff_max_ms) * (attempts - 1)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_margin")]
    pub safety_margin_pct: f64,
    #[serde(default = "default_downgrade_retries")]
    pub max_downgrade_retries: u32,
    #[serde(default = "default_downgrade_factor")]
    pub downgrade_factor: f64,
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
    #[serde(default = "default_order_timeout")]
    pub order_timeout_secs: u64,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_poll_max_interval")]
    pub poll_max_interval_ms: u64,
    #[serde(default = "default_interval")]
    pub order_interval_ms: u64,
    #[serde(default)]
    pub limit_offset_bps: u32,
    #[serde(default = "default_max_orders")]
    pub max_orders_per_run: usize,
    #[serde(default = "default_pending_buffer")]
    pub pending_buy_buffer: f64,
    #[serde(default = "default_zombie_window")]
    pub zombie_match_window_secs: u64,
    #[serde(default = "default_zombie_grace")]
    pub zombie_grace_secs: u64,
    #[serde(default = "default_pass_lock_timeout")]
    pub pass_lock_timeout_secs: u64,
}

fn default_margin() -> f64 {
    0.02
}
fn default_downgrade_retries() -> u32 {
    3
}
fn default_downgrade_factor() -> f64 {
    0.5
}
fn default_cooldown() -> u64 {
    2_400
}
fn default_order_timeout() -> u64 {
    120
}
fn default_poll_interval() -> u64 {
    500
}
fn default_poll_max_interval() -> u64 {
    5_000
}
fn default_interval() -> u64 {
    100
}
fn default_max_orders() -> usize {
    50
}
fn default_pending_buffer() -> f64 {
    1.015
}
fn default_zombie_window() -> u64 {
    300
}
fn default_zombie_grace() -> u64 {
    30
}
fn default_pass_lock_timeout() -> u64 {
    30
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            safety_margin_pct: default_margin(),
            max_downgrade_retries: default_downgrade_retries(),
            downgrade_factor: default_downgrade_factor(),
            cooldown_secs: default_cooldown(),
            order_timeout_secs: default_order_timeout(),
            poll_interval_ms: default_poll_interval(),
            poll_max_interval_ms: default_poll_max_interval(),
            order_interval_ms: default_interval(),
            limit_offset_bps: 0,
            max_orders_per_run: default_max_orders(),
            pending_buy_buffer: default_pending_buffer(),
            zombie_match_window_secs: default_zombie_window(),
            zombie_grace_secs: default_zombie_grace(),
            pass_lock_timeout_secs: default_pass_lock_timeout(),
        }
    }
}

impl ExecutionConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }

    pub fn order_timeout(&self) -> Duration {
        Duration::from_secs(self.order_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn poll_max_interval(&self) -> Duration {
        Duration::from_millis(self.poll_max_interval_ms)
    }

    pub fn pass_lock_timeout(&self) -> Duration {
        Duration::from_secs(self.pass_lock_timeout_secs)
    }

    pub fn order_interval(&self) -> Duration {
        Duration::from_millis(self.order_interval_ms)
    }
}

/// Broker calls made for one submission outside its polling window: the
/// submit, the pending-list check after an ambiguous submit, the poll that
/// straddles the deadline, the cancel and the status read after it.
const CALLS_PER_SUBMISSION: u32 = 5;

/// Lot sizes: per symbol, per market (the dotted prefix or suffix of a
/// symbol such as `SHSE.600000`), then the default.
#[derive(Debug, Clone, Deserialize)]
pub struct LotConfig {
    #[serde(default = "default_lot")]
    pub default: u64,
    #[serde(default)]
    pub markets: FxHashMap<String, u64>,
    #[serde(default)]
    pub symbols: FxHashMap<String, u64>,
}

fn default_lot() -> u64 {
    1
}

impl Default for LotConfig {
    fn default() -> Self {
        Self {
            default: default_lot(),
            markets: FxHashMap::default(),
            symbols: FxHashMap::default(),
        }
    }
}

impl LotConfig {
    /// Minimum tradable increment for `symbol`.
    pub fn lot_size(&self, symbol: &Symbol) -> u64 {
        if let Some(&lot) = self.symbols.get(symbol.as_str()) {
            return lot;
        }
        symbol
            .components()
            .find_map(|part| self.markets.get(part).copied())
            .unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub let_winners_run: bool,
    #[serde(default = "default_winner_tolerance")]
    pub winner_tolerance: f64,
    #[serde(default)]
    pub min_trade_usd: f64,
    #[serde(default)]
    pub drift_threshold: f64,
    #[serde(default)]
    pub capital_cap_usd: Option<f64>,
}

fn default_winner_tolerance() -> f64 {
    0.05
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            let_winners_run: false,
            winner_tolerance: default_winner_tolerance(),
            min_trade_usd: 0.0,
            drift_threshold: 0.0,
            capital_cap_usd: None,
        }
    }
}

impl PolicyConfig {
    pub fn min_trade_cents(&self) -> i64 {
        (self.min_trade_usd * 100.0) as i64
    }

    pub fn capital_cap_cents(&self) -> Option<i64> {
        self.capital_cap_usd.map(|usd| (usd * 100.0) as i64)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_dir")]
    pub dir: String,
    #[serde(default = "default_audit_file")]
    pub audit_file: String,
}

fn default_log_dir() -> String {
    "./logs".into()
}
fn default_audit_file() -> String {
    "audit.jsonl".into()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            audit_file: default_audit_file(),
        }
    }
}

impl Config {
    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::ConfigRead {
            path: path.to_path_buf(),
            source: e,
        })?;
        Self::from_toml(&contents)
    }

    /// Parse and validate config from TOML text.
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate config invariants.
    fn validate(&self) -> Result<()> {
        if self.account.id.is_empty() {
            return Err(Error::Config("account id must not be empty".into()));
        }

        let b = &self.broker;
        if b.call_timeout_secs == 0 {
            return Err(Error::Config("call_timeout_secs must be > 0".into()));
        }
        if b.max_call_attempts == 0 {
            return Err(Error::Config("max_call_attempts must be >= 1".into()));
        }
        if b.backoff_initial_ms > b.backoff_max_ms {
            return Err(Error::Config(
                "backoff_initial_ms must be <= backoff_max_ms".into(),
            ));
        }

        let e = &self.execution;
        if !(0.0..1.0).contains(&e.safety_margin_pct) {
            return Err(Error::Config(
                "safety_margin_pct must be in [0.0, 1.0)".into(),
            ));
        }
        if e.downgrade_factor <= 0.0 || e.downgrade_factor >= 1.0 {
            return Err(Error::Config(
                "downgrade_factor must be in (0.0, 1.0)".into(),
            ));
        }
        if e.order_timeout_secs == 0 {
            return Err(Error::Config("order_timeout_secs must be > 0".into()));
        }
        if e.poll_interval_ms == 0 || e.poll_interval_ms > e.poll_max_interval_ms {
            return Err(Error::Config(
                "poll_interval_ms must be in [1, poll_max_interval_ms]".into(),
            ));
        }
        if e.cooldown_secs == 0 {
            return Err(Error::Config("cooldown_secs must be > 0".into()));
        }
        let lifetime = self.order_lifetime();
        if e.cooldown() < lifetime {
            return Err(Error::Config(format!(
                "cooldown_secs ({}) must cover the longest order lifetime ({}s); \
                 raise it or lower order_timeout_secs, max_downgrade_retries or the broker call bounds",
                e.cooldown_secs,
                lifetime.as_secs_f64().ceil()
            )));
        }
        if e.max_orders_per_run == 0 {
            return Err(Error::Config("max_orders_per_run must be > 0".into()));
        }
        if e.pending_buy_buffer < 1.0 {
            return Err(Error::Config("pending_buy_buffer must be >= 1.0".into()));
        }
        if e.limit_offset_bps >= 10_000 {
            return Err(Error::Config("limit_offset_bps must be < 10000".into()));
        }

        if self.lots.default == 0
            || self.lots.markets.values().any(|&l| l == 0)
            || self.lots.symbols.values().any(|&l| l == 0)
        {
            return Err(Error::Config("lot sizes must be >= 1".into()));
        }

        let p = &self.policy;
        if p.winner_tolerance < 0.0 || p.winner_tolerance > 1.0 {
            return Err(Error::Config(
                "winner_tolerance must be in [0.0, 1.0]".into(),
            ));
        }
        if p.min_trade_usd < 0.0 {
            return Err(Error::Config("min_trade_usd must be >= 0".into()));
        }
        if p.drift_threshold < 0.0 {
            return Err(Error::Config("drift_threshold must be >= 0".into()));
        }
        if matches!(p.capital_cap_usd, Some(cap) if cap <= 0.0) {
            return Err(Error::Config("capital_cap_usd must be > 0".into()));
        }
        Ok(())
    }

    /// Longest one submission can keep its order working before it is final
    /// or given up: the polling window, one backoff step and the broker
    /// calls around it.
    pub fn submission_bound(&self) -> Duration {
        let e = &self.execution;
        e.order_timeout() + e.poll_max_interval() + self.broker.call_bound() * CALLS_PER_SUBMISSION
    }

    /// Longest an admission lock must survive for one order: pacing plus
    /// the first submission and every downgrade retry.
    pub fn order_lifetime(&self) -> Duration {
        let e = &self.execution;
        e.order_interval() + self.submission_bound() * (e.max_downgrade_retries + 1)
    }

    /// Full path to the audit log file.
    pub fn audit_path(&self) -> PathBuf {
        Path::new(&self.logging.dir).join(&self.logging.audit_file)
    }

    /// Paper account file backing the `paper` broker.
    pub fn account_file(&self) -> PathBuf {
        PathBuf::from(&self.broker.account_file)
    }
}
