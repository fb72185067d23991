//! Configuration for flow-bot.
//!
//! Supports loading from a TOML file. All tunable pipeline parameters live
//! here: regime thresholds, weight tables, trigger rules, risk limits,
//! execution degradation chains, protection SLAs and DCA ladders.
//!
//! Weight tables are immutable once loaded; a configuration reload produces a
//! fresh snapshot that is swapped in wholesale, never mutated in place.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;

use flow_common::Timeframe;

/// Top-level configuration for the trading pipeline.
#[derive(Debug, Clone, Deserialize)]
pub struct BotConfig {
    /// Symbols the bot is allowed to trade. Doubles as the risk allow-list.
    pub symbols: Vec<String>,

    #[serde(default)]
    pub market: MarketConfig,

    #[serde(default)]
    pub regime: RegimeConfig,

    #[serde(default)]
    pub weights: WeightsConfig,

    #[serde(default)]
    pub thresholds: ThresholdConfig,

    #[serde(default)]
    pub trigger: TriggerConfig,

    #[serde(default)]
    pub risk: RiskConfig,

    #[serde(default)]
    pub execution: ExecutionConfig,

    #[serde(default)]
    pub protection: ProtectionConfig,

    #[serde(default)]
    pub dca: DcaConfig,

    #[serde(default)]
    pub cycle: CycleConfig,
}

impl BotConfig {
    /// Load configuration from a TOML file and validate it.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_toml(&raw)
    }

    /// Parse configuration from a TOML string and validate it.
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: BotConfig = toml::from_str(raw).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field consistency. Fails fast on nonsense bounds.
    pub fn validate(&self) -> Result<()> {
        if self.symbols.is_empty() {
            bail!("symbols list must not be empty");
        }
        if self.regime.adx_range_on > self.regime.adx_trend_on {
            bail!(
                "regime.adx_range_on ({}) must not exceed regime.adx_trend_on ({})",
                self.regime.adx_range_on,
                self.regime.adx_trend_on
            );
        }
        if self.regime.atr_pct_min >= self.regime.atr_pct_max {
            bail!("regime.atr_pct_min must be below regime.atr_pct_max");
        }
        if self.risk.min_leverage == 0 || self.risk.min_leverage > self.risk.max_leverage {
            bail!(
                "risk leverage bounds invalid: [{}, {}]",
                self.risk.min_leverage,
                self.risk.max_leverage
            );
        }
        if self.risk.min_position_fraction > self.risk.max_position_fraction {
            bail!("risk position fraction bounds invalid");
        }
        if self.dca.drawdown_thresholds.len() != self.dca.size_multipliers.len() {
            bail!(
                "dca ladder mismatch: {} thresholds vs {} multipliers",
                self.dca.drawdown_thresholds.len(),
                self.dca.size_multipliers.len()
            );
        }
        let mut prev = 0.0f64;
        for t in &self.dca.drawdown_thresholds {
            if *t <= prev {
                bail!("dca.drawdown_thresholds must be strictly increasing");
            }
            prev = *t;
        }
        if self.cycle.max_active_symbols == 0 {
            bail!("cycle.max_active_symbols must be at least 1");
        }
        self.weights.trend.validate("weights.trend")?;
        self.weights.range.validate("weights.range")?;
        Ok(())
    }
}

/// Market context aggregation parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Width of an aggregation bucket in seconds.
    pub bucket_seconds: u64,

    /// Timeframes to aggregate. The longest one bounds sample retention.
    pub timeframes: Vec<Timeframe>,

    /// EMA smoothing factor for the per-symbol liquidity baseline.
    pub liquidity_ema_alpha: f64,

    /// Floor for the liquidity baseline denominator.
    pub liquidity_min_base: f64,

    /// Symmetric clip applied to the normalized liquidity delta.
    pub liquidity_clip: f64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            bucket_seconds: 15,
            timeframes: vec![Timeframe::M1, Timeframe::M5, Timeframe::M15, Timeframe::H4],
            liquidity_ema_alpha: 0.2,
            liquidity_min_base: 1.0,
            liquidity_clip: 3.0,
        }
    }
}

impl MarketConfig {
    /// Retention horizon: the longest configured timeframe.
    pub fn retention(&self) -> Duration {
        let secs = self
            .timeframes
            .iter()
            .map(|t| t.seconds())
            .max()
            .unwrap_or(4 * 3600);
        Duration::from_secs(secs)
    }
}

/// How firmly the EMA order locks trend direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DirectionLockMode {
    /// Always follow EMA order.
    Hard,
    /// Lock only when ADX and the EMA gap are both decisive, else no-trade.
    Soft,
    /// No directional restriction.
    Off,
}

/// Regime classification thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RegimeConfig {
    /// Timeframe whose indicators feed the classifier.
    pub timeframe: Timeframe,

    /// Timeframe whose aggregates feed directional scoring.
    pub score_timeframe: Timeframe,

    /// ADX at or above this is a trend.
    pub adx_trend_on: f64,

    /// ADX at or below this is a range. Between the two is the dead zone.
    pub adx_range_on: f64,

    /// ATR% band. Outside it the market is untradeable.
    pub atr_pct_min: f64,
    pub atr_pct_max: f64,

    pub direction_lock_mode: DirectionLockMode,

    /// Soft mode: ADX must exceed adx_trend_on by this margin to lock.
    pub soft_adx_buffer: f64,

    /// Soft mode: |ema_fast - ema_slow| / |ema_slow| must exceed this to lock.
    pub soft_ema_band_pct: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            timeframe: Timeframe::M15,
            score_timeframe: Timeframe::M5,
            adx_trend_on: 25.0,
            adx_range_on: 18.0,
            atr_pct_min: 0.002,
            atr_pct_max: 0.02,
            direction_lock_mode: DirectionLockMode::Hard,
            soft_adx_buffer: 4.0,
            soft_ema_band_pct: 0.001,
        }
    }
}

/// One scoring weight table. Factors are combined as
/// `clip(sum(w_i * max(±factor_i, 0)), 0, 1)`.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WeightTable {
    pub cvd: f64,
    pub cvd_momentum: f64,
    pub oi_delta: f64,
    pub funding: f64,
    pub depth: f64,
    pub imbalance: f64,
    pub liquidity: f64,
}

impl WeightTable {
    fn validate(&self, label: &str) -> Result<()> {
        let all = [
            self.cvd,
            self.cvd_momentum,
            self.oi_delta,
            self.funding,
            self.depth,
            self.imbalance,
            self.liquidity,
        ];
        if all.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            bail!("{label}: weights must be finite and non-negative");
        }
        if all.iter().sum::<f64>() <= 0.0 {
            bail!("{label}: at least one weight must be positive");
        }
        Ok(())
    }
}

impl Default for WeightTable {
    fn default() -> Self {
        // Trend-table defaults; the range table overrides via serde.
        Self {
            cvd: 0.24,
            cvd_momentum: 0.14,
            oi_delta: 0.22,
            funding: 0.10,
            depth: 0.15,
            imbalance: 0.15,
            liquidity: 0.12,
        }
    }
}

/// Regime-keyed weight tables.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    pub trend: WeightTable,
    pub range: WeightTable,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        Self {
            trend: WeightTable::default(),
            range: WeightTable {
                cvd: 0.10,
                cvd_momentum: 0.35,
                oi_delta: 0.05,
                funding: 0.05,
                depth: 0.10,
                imbalance: 0.55,
                liquidity: 0.12,
            },
        }
    }
}

/// Open/close score thresholds.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ThresholdConfig {
    pub long_open: f64,
    pub short_open: f64,
    pub close: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            long_open: 0.35,
            short_open: 0.35,
            close: 0.45,
        }
    }
}

/// Comparison operator used by signal-pool rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOp {
    Gt,
    Ge,
    Lt,
    Le,
    Eq,
    Ne,
    Between,
}

/// One signal-pool rule: compare a metric against a threshold.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolRule {
    #[serde(default)]
    pub name: String,

    /// Metric key resolved against the market snapshot
    /// (plus the pseudo-metrics `long_score` / `short_score`).
    pub metric: String,

    pub operator: RuleOp,
    pub threshold: f64,

    /// Upper bound for `between`.
    #[serde(default)]
    pub threshold_max: Option<f64>,

    /// Resolve the metric from this timeframe instead of the snapshot root.
    #[serde(default)]
    pub timeframe: Option<Timeframe>,

    /// Restrict the rule to one side; both sides when absent.
    #[serde(default)]
    pub side: Option<flow_common::PositionSide>,
}

/// How rule passes combine into a pool verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum PoolLogic {
    #[default]
    And,
    Or,
}

/// Trigger gate configuration: dedup plus the signal pool.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TriggerConfig {
    /// Window during which a repeated (symbol, trigger type) is suppressed.
    pub dedup_window_secs: u64,

    /// Master switch for the signal pool. Disabled means entries pass.
    pub pool_enabled: bool,

    /// Let scheduled (heartbeat) evaluations bypass the pool rules.
    pub scheduled_bypass: bool,

    /// Identifier for edge-state keying.
    pub pool_id: String,

    /// Minimum side score before rules are even consulted.
    pub min_long_score: f64,
    pub min_short_score: f64,

    pub rules: Vec<PoolRule>,
    pub logic: PoolLogic,

    /// When positive, overrides AND/OR with a minimum pass count.
    pub min_pass_count: usize,

    /// Pass only on false→true transitions when enabled.
    pub edge_trigger_enabled: bool,

    /// Suppress repeat passes for this long after an edge fires.
    pub edge_cooldown_secs: u64,
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            dedup_window_secs: 10,
            pool_enabled: true,
            scheduled_bypass: true,
            pool_id: "default_pool".to_string(),
            min_long_score: 0.0,
            min_short_score: 0.0,
            rules: Vec::new(),
            logic: PoolLogic::And,
            min_pass_count: 0,
            edge_trigger_enabled: true,
            edge_cooldown_secs: 60,
        }
    }
}

/// Risk gate configuration: stateless bounds and the account circuit breaker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub min_leverage: u32,
    pub max_leverage: u32,

    /// Bounds on the fraction of balance committed per entry.
    pub min_position_fraction: Decimal,
    pub max_position_fraction: Decimal,

    /// Hard reject (never clamp) quotes deviating more than this percent
    /// from the trusted mark price.
    pub price_deviation_limit_pct: f64,

    /// Daily realized loss (percent of day-start equity) that trips the
    /// daily breaker.
    pub max_daily_loss_pct: f64,

    /// Consecutive losing closes that trip the streak breaker.
    pub max_consecutive_losses: u32,

    /// Independent cooldowns, one clock per breaker.
    pub daily_loss_cooldown_secs: u64,
    pub consecutive_loss_cooldown_secs: u64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            min_leverage: 2,
            max_leverage: 20,
            min_position_fraction: Decimal::new(8, 2),  // 0.08
            max_position_fraction: Decimal::new(100, 2), // 1.00
            price_deviation_limit_pct: 1.0,
            max_daily_loss_pct: 5.0,
            max_consecutive_losses: 5,
            daily_loss_cooldown_secs: 6 * 3600,
            consecutive_loss_cooldown_secs: 2 * 3600,
        }
    }
}

/// Retry/fallback settings for one leg (open or close) of the router.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LegConfig {
    /// Total IOC attempts (first try included).
    pub ioc_retries: u32,

    /// Price slide per retry, in basis points.
    pub ioc_step_bps: f64,

    pub gtc_fallback: bool,
    pub market_fallback: bool,
}

impl Default for LegConfig {
    fn default() -> Self {
        Self {
            ioc_retries: 1,
            ioc_step_bps: 10.0,
            gtc_fallback: true,
            market_fallback: false,
        }
    }
}

/// Execution router configuration. Open and close legs are independent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    pub open: LegConfig,
    pub close: LegConfig,

    /// Abort entries when the venue rejects a leverage sync.
    pub strict_leverage_sync: bool,

    /// Entry slippage allowance applied to the aggressive IOC price.
    pub entry_slippage_pct: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            open: LegConfig::default(),
            close: LegConfig {
                ioc_retries: 4,
                ioc_step_bps: 10.0,
                gtc_fallback: true,
                market_fallback: false,
            },
            strict_leverage_sync: true,
            entry_slippage_pct: 0.1,
        }
    }
}

/// Protective-order policy.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProtectionConfig {
    /// Take-profit / stop-loss distances as fractions of entry price.
    pub take_profit_pct: f64,
    pub stop_loss_pct: f64,

    /// Flatten the fill when TP/SL placement comes back incomplete.
    pub rollback_on_incomplete: bool,

    /// Go straight to closing when an in-flight repair attempt fails.
    pub close_on_repair_fail: bool,

    /// Maximum seconds a position may sit unprotected before a forced
    /// flatten becomes mandatory.
    pub sla_secs: u64,

    /// Minimum spacing between unprotected-position alerts.
    pub alert_cooldown_secs: u64,
}

impl Default for ProtectionConfig {
    fn default() -> Self {
        Self {
            take_profit_pct: 0.03,
            stop_loss_pct: 0.01,
            rollback_on_incomplete: true,
            close_on_repair_fail: false,
            sla_secs: 300,
            alert_cooldown_secs: 120,
        }
    }
}

/// DCA ladder: ordered drawdown thresholds with per-stage size multipliers.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DcaConfig {
    /// Drawdown fractions (0.02 = 2% adverse move) in ascending order.
    pub drawdown_thresholds: Vec<f64>,

    /// Multiplier applied to the base add quantity per stage.
    pub size_multipliers: Vec<f64>,

    pub max_stages: usize,
}

impl Default for DcaConfig {
    fn default() -> Self {
        Self {
            drawdown_thresholds: Vec::new(),
            size_multipliers: Vec::new(),
            max_stages: 0,
        }
    }
}

/// Cycle-level orchestration settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CycleConfig {
    /// Concurrent open-position cap across all symbols.
    pub max_active_symbols: usize,

    /// Default fraction of balance committed per entry.
    pub position_fraction: Decimal,

    /// Default leverage when scoring does not pick one.
    pub default_leverage: u32,

    /// Soft wall-clock budget per cycle; remaining symbols are skipped
    /// (and logged) once exceeded.
    pub soft_budget_secs: u64,

    /// How often regimes are reclassified, in cycles. 1 = every cycle.
    pub regime_cadence_cycles: u32,
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            max_active_symbols: 1,
            position_fraction: Decimal::new(20, 2), // 0.20
            default_leverage: 2,
            soft_budget_secs: 60,
            regime_cadence_cycles: 3,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            symbols = ["BTCUSDT", "ETHUSDT"]
        "#
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config = BotConfig::from_toml(minimal_toml()).unwrap();
        assert_eq!(config.symbols.len(), 2);
        assert_eq!(config.regime.adx_trend_on, 25.0);
        assert_eq!(config.trigger.dedup_window_secs, 10);
        assert_eq!(config.execution.close.ioc_retries, 4);
        assert!(config.execution.open.gtc_fallback);
        assert!(!config.execution.open.market_fallback);
        assert_eq!(config.cycle.max_active_symbols, 1);
    }

    #[test]
    fn test_empty_symbols_rejected() {
        let result = BotConfig::from_toml("symbols = []");
        assert!(result.is_err());
    }

    #[test]
    fn test_inverted_adx_bands_rejected() {
        let toml = r#"
            symbols = ["BTCUSDT"]
            [regime]
            adx_trend_on = 15.0
            adx_range_on = 20.0
        "#;
        let err = BotConfig::from_toml(toml).unwrap_err();
        assert!(err.to_string().contains("adx_range_on"));
    }

    #[test]
    fn test_dca_ladder_must_match() {
        let toml = r#"
            symbols = ["BTCUSDT"]
            [dca]
            drawdown_thresholds = [0.02, 0.05]
            size_multipliers = [1.0]
            max_stages = 2
        "#;
        assert!(BotConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_dca_thresholds_must_increase() {
        let toml = r#"
            symbols = ["BTCUSDT"]
            [dca]
            drawdown_thresholds = [0.05, 0.02]
            size_multipliers = [1.0, 1.5]
            max_stages = 2
        "#;
        assert!(BotConfig::from_toml(toml).is_err());
    }

    #[test]
    fn test_full_sections_parse() {
        let toml = r#"
            symbols = ["BTCUSDT"]

            [regime]
            timeframe = "15m"
            direction_lock_mode = "soft"
            soft_adx_buffer = 5.0

            [weights.trend]
            cvd = 0.3

            [thresholds]
            long_open = 0.22
            short_open = 0.22
            close = 0.32

            [trigger]
            dedup_window_secs = 30
            edge_cooldown_secs = 90

            [[trigger.rules]]
            name = "cvd_floor"
            metric = "cvd_ratio"
            operator = "ge"
            threshold = 0.1
            timeframe = "5m"
            side = "LONG"

            [risk]
            max_daily_loss_pct = 5.0
            max_consecutive_losses = 3

            [execution.open]
            ioc_retries = 3
            ioc_step_bps = 15.0

            [protection]
            sla_secs = 120

            [dca]
            drawdown_thresholds = [0.02, 0.04]
            size_multipliers = [1.0, 1.5]
            max_stages = 2

            [cycle]
            max_active_symbols = 3
        "#;
        let config = BotConfig::from_toml(toml).unwrap();
        assert_eq!(config.regime.direction_lock_mode, DirectionLockMode::Soft);
        assert_eq!(config.weights.trend.cvd, 0.3);
        assert_eq!(config.thresholds.close, 0.32);
        assert_eq!(config.trigger.rules.len(), 1);
        assert_eq!(config.trigger.rules[0].operator, RuleOp::Ge);
        assert_eq!(config.execution.open.ioc_retries, 3);
        assert_eq!(config.dca.max_stages, 2);
        assert_eq!(config.cycle.max_active_symbols, 3);
    }

    #[test]
    fn test_market_retention_is_longest_timeframe() {
        let config = BotConfig::from_toml(minimal_toml()).unwrap();
        assert_eq!(config.market.retention(), Duration::from_secs(4 * 3600));
    }
}
