//! Market context aggregation: raw per-symbol samples into multi-timeframe
//! rolling aggregates.
//!
//! Samples are bucketed into fixed-width time windows (last write wins per
//! bucket) and evicted past the longest configured timeframe. Each requested
//! timeframe is summarized per cycle:
//!
//! - `cvd_ratio`: sum over buckets
//! - `cvd_momentum`: last bucket minus first bucket
//! - `oi_delta_ratio` / `depth_ratio` / `imbalance` / `liquidity_delta_norm`:
//!   mean over buckets
//! - `funding_rate`: last bucket (point in time)
//!
//! A timeframe whose window holds no buckets degrades to an explicit
//! insufficient-sample marker, never a silent zero.
//!
//! NOTE: the directional-flow input (`cvd_ratio`) is a price-change proxy,
//! not true trade-derived flow. Downstream thresholds are calibrated to the
//! proxy; do not "fix" it here.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use flow_common::{Symbol, Timeframe};

use crate::config::MarketConfig;

/// Trend-filter indicators computed upstream on the regime timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendFilter {
    pub ema_fast: f64,
    pub ema_slow: f64,
    pub adx: f64,
    pub atr_pct: f64,
}

/// One raw market-data poll for a symbol.
///
/// Produced by the market data provider; a transient upstream failure yields
/// no sample at all rather than a fabricated one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawSample {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub change_24h_pct: f64,
    pub bid_depth_notional: Decimal,
    pub ask_depth_notional: Decimal,
    pub funding_rate: f64,
    pub open_interest: f64,
    /// Regime indicators, when the provider has enough history to compute
    /// them. Absent during warmup.
    pub trend_filter: Option<TrendFilter>,
}

/// Derived metrics for one aggregation bucket.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct BucketMetrics {
    cvd_ratio: f64,
    oi_delta_ratio: f64,
    depth_ratio: f64,
    imbalance: f64,
    liquidity_delta_norm: f64,
    funding_rate: f64,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    /// Bucket start, epoch seconds aligned to the bucket width.
    start: i64,
    metrics: BucketMetrics,
}

/// Rolling aggregate for one timeframe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TimeframeAggregate {
    pub cvd_ratio: f64,
    pub cvd_momentum: f64,
    pub oi_delta_ratio: f64,
    pub depth_ratio: f64,
    pub imbalance: f64,
    pub liquidity_delta_norm: f64,
    pub funding_rate: f64,
    pub sample_count: usize,
}

impl TimeframeAggregate {
    /// Resolve a metric by key, with the short aliases rule authors use.
    pub fn metric(&self, key: &str) -> Option<f64> {
        match key {
            "cvd" | "cvd_ratio" => Some(self.cvd_ratio),
            "cvd_momentum" => Some(self.cvd_momentum),
            "oi_delta" | "oi_delta_ratio" => Some(self.oi_delta_ratio),
            "depth" | "depth_ratio" => Some(self.depth_ratio),
            "imbalance" => Some(self.imbalance),
            "liq_norm" | "liquidity_delta_norm" => Some(self.liquidity_delta_norm),
            "funding" | "funding_rate" => Some(self.funding_rate),
            _ => None,
        }
    }
}

/// A timeframe slot in a snapshot: either a usable aggregate or an explicit
/// insufficient-sample marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimeframeSlice {
    Ready(TimeframeAggregate),
    Insufficient { reason: String },
}

impl TimeframeSlice {
    /// The aggregate, when this slice is usable.
    pub fn ready(&self) -> Option<&TimeframeAggregate> {
        match self {
            TimeframeSlice::Ready(agg) => Some(agg),
            TimeframeSlice::Insufficient { .. } => None,
        }
    }
}

/// Ephemeral per-cycle market view for one symbol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSnapshot {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub funding_rate: f64,
    pub open_interest: f64,
    /// Weighted magnitude of the latest bucket's metrics in [0, 1].
    /// Weak heuristic separating signal-driven polls from heartbeats;
    /// nothing else should hang off it.
    pub signal_strength: f64,
    pub trend_filter: Option<TrendFilter>,
    /// The latest bucket viewed as a single-sample aggregate. Fallback
    /// context when a scoring timeframe has insufficient samples.
    pub latest: Option<TimeframeAggregate>,
    pub timeframes: BTreeMap<Timeframe, TimeframeSlice>,
}

impl MarketSnapshot {
    /// Usable aggregate for a timeframe, if present.
    pub fn timeframe(&self, tf: Timeframe) -> Option<&TimeframeAggregate> {
        self.timeframes.get(&tf).and_then(|s| s.ready())
    }
}

#[derive(Debug, Clone, Copy)]
struct LastSeen {
    price: f64,
    open_interest: f64,
    total_depth: f64,
}

#[derive(Debug, Default)]
struct SymbolHistory {
    buckets: VecDeque<Bucket>,
    last_seen: Option<LastSeen>,
    /// EMA baseline for liquidity-delta normalization. Persists across
    /// cycles; seeded from the first observed depth.
    liquidity_ema: Option<f64>,
    latest_price: Decimal,
    latest_funding: f64,
    latest_oi: f64,
    latest_trend_filter: Option<TrendFilter>,
    latest_ts: Option<DateTime<Utc>>,
}

/// Turns raw samples into multi-timeframe rolling aggregates.
///
/// Owned by the orchestrator; the only cross-cycle state it carries is the
/// bounded bucket history and the per-symbol liquidity EMA baselines.
#[derive(Debug)]
pub struct MarketContextAggregator {
    config: MarketConfig,
    retention: Duration,
    history: HashMap<Symbol, SymbolHistory>,
}

impl MarketContextAggregator {
    pub fn new(config: MarketConfig) -> Self {
        let retention = config.retention();
        Self {
            config,
            retention,
            history: HashMap::new(),
        }
    }

    /// Ingest one raw sample.
    ///
    /// The first sample for a symbol only seeds the delta references; buckets
    /// start accumulating from the second sample onward.
    pub fn ingest(&mut self, sample: &RawSample) {
        let bucket_secs = self.config.bucket_seconds.max(1) as i64;
        let entry = self.history.entry(sample.symbol.clone()).or_default();

        let price = sample.price.to_f64().unwrap_or(0.0);
        let bid = sample.bid_depth_notional.to_f64().unwrap_or(0.0);
        let ask = sample.ask_depth_notional.to_f64().unwrap_or(0.0);
        let total_depth = bid + ask;

        entry.latest_price = sample.price;
        entry.latest_funding = sample.funding_rate;
        entry.latest_oi = sample.open_interest;
        entry.latest_ts = Some(sample.timestamp);
        if sample.trend_filter.is_some() {
            entry.latest_trend_filter = sample.trend_filter;
        }

        let Some(prev) = entry.last_seen else {
            entry.last_seen = Some(LastSeen {
                price,
                open_interest: sample.open_interest,
                total_depth,
            });
            entry.liquidity_ema = Some(total_depth.max(self.config.liquidity_min_base));
            return;
        };

        // Price-change proxy for directional flow.
        let cvd_ratio = if prev.price > 0.0 {
            (price - prev.price) / prev.price
        } else {
            0.0
        };
        let oi_delta_ratio = if prev.open_interest > 0.0 {
            (sample.open_interest - prev.open_interest) / prev.open_interest
        } else {
            0.0
        };
        let depth_ratio = if ask > 0.0 { bid / ask } else { 1.0 };
        let imbalance = if total_depth > 0.0 {
            (bid - ask) / total_depth
        } else {
            0.0
        };

        let alpha = self.config.liquidity_ema_alpha.clamp(0.0, 1.0);
        let ema_prev = entry
            .liquidity_ema
            .unwrap_or(self.config.liquidity_min_base);
        let ema = alpha * total_depth + (1.0 - alpha) * ema_prev;
        entry.liquidity_ema = Some(ema);
        let liquidity_delta = total_depth - prev.total_depth;
        let denom = self.config.liquidity_min_base.max(ema);
        let clip = self.config.liquidity_clip.abs();
        let liquidity_delta_norm = (liquidity_delta / denom).clamp(-clip, clip);

        let metrics = BucketMetrics {
            cvd_ratio,
            oi_delta_ratio,
            depth_ratio,
            imbalance,
            liquidity_delta_norm,
            funding_rate: sample.funding_rate,
        };

        let bucket_start = sample.timestamp.timestamp().div_euclid(bucket_secs) * bucket_secs;
        match entry.buckets.back_mut() {
            // Last write wins within a bucket.
            Some(last) if last.start == bucket_start => last.metrics = metrics,
            Some(last) if last.start > bucket_start => {
                // Out-of-order sample older than the open bucket; drop it.
            }
            _ => entry.buckets.push_back(Bucket {
                start: bucket_start,
                metrics,
            }),
        }

        let cutoff = sample.timestamp.timestamp() - self.retention.as_secs() as i64;
        while entry.buckets.front().is_some_and(|b| b.start < cutoff) {
            entry.buckets.pop_front();
        }

        entry.last_seen = Some(LastSeen {
            price,
            open_interest: sample.open_interest,
            total_depth,
        });
    }

    /// Build the per-cycle snapshot for a symbol.
    ///
    /// Returns `None` when no sample has ever been ingested for the symbol.
    pub fn snapshot(&self, symbol: &Symbol, now: DateTime<Utc>) -> Option<MarketSnapshot> {
        let entry = self.history.get(symbol)?;
        entry.latest_ts?;

        let mut timeframes = BTreeMap::new();
        for tf in &self.config.timeframes {
            let window_start = now.timestamp() - tf.seconds() as i64;
            let in_window: Vec<&Bucket> = entry
                .buckets
                .iter()
                .filter(|b| b.start >= window_start)
                .collect();
            let slice = if in_window.is_empty() {
                TimeframeSlice::Insufficient {
                    reason: format!("no samples in {tf} window"),
                }
            } else {
                TimeframeSlice::Ready(aggregate(&in_window))
            };
            timeframes.insert(*tf, slice);
        }

        let signal_strength = entry
            .buckets
            .back()
            .map(|b| signal_strength(&b.metrics))
            .unwrap_or(0.0);
        let latest = entry.buckets.back().map(|b| aggregate(&[b]));

        Some(MarketSnapshot {
            symbol: symbol.clone(),
            timestamp: now,
            price: entry.latest_price,
            funding_rate: entry.latest_funding,
            open_interest: entry.latest_oi,
            signal_strength,
            trend_filter: entry.latest_trend_filter,
            latest,
            timeframes,
        })
    }

    /// Number of buckets currently retained for a symbol.
    pub fn bucket_count(&self, symbol: &Symbol) -> usize {
        self.history.get(symbol).map_or(0, |h| h.buckets.len())
    }
}

fn aggregate(buckets: &[&Bucket]) -> TimeframeAggregate {
    let n = buckets.len() as f64;
    let first = buckets.first().expect("non-empty window");
    let last = buckets.last().expect("non-empty window");

    let cvd_ratio: f64 = buckets.iter().map(|b| b.metrics.cvd_ratio).sum();
    let cvd_momentum = last.metrics.cvd_ratio - first.metrics.cvd_ratio;
    let oi_delta_ratio = buckets.iter().map(|b| b.metrics.oi_delta_ratio).sum::<f64>() / n;
    let depth_ratio = buckets.iter().map(|b| b.metrics.depth_ratio).sum::<f64>() / n;
    let imbalance = buckets.iter().map(|b| b.metrics.imbalance).sum::<f64>() / n;
    let liquidity_delta_norm = buckets
        .iter()
        .map(|b| b.metrics.liquidity_delta_norm)
        .sum::<f64>()
        / n;

    TimeframeAggregate {
        cvd_ratio,
        cvd_momentum,
        oi_delta_ratio,
        depth_ratio,
        imbalance,
        liquidity_delta_norm,
        funding_rate: last.metrics.funding_rate,
        sample_count: buckets.len(),
    }
}

/// Weighted magnitude of one bucket's metrics, clipped to [0, 1].
fn signal_strength(m: &BucketMetrics) -> f64 {
    let strength = m.cvd_ratio.abs() * 0.25
        + m.oi_delta_ratio.abs() * 0.25
        + m.funding_rate.abs() * 0.10
        + (m.depth_ratio - 1.0).abs() * 0.10
        + m.imbalance.abs() * 0.15
        + m.liquidity_delta_norm.abs() * 0.10;
    strength.clamp(0.0, 1.0)
}
