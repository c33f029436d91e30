//! Core domain types shared across the control layer.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

// ── Regimes ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RegimeType {
    StrongTrend,
    WeakTrend,
    MeanReversion,
    GammaSqueeze,
    Pinning,
    HighVolatility,
    Normal,
}

impl RegimeType {
    /// Every regime except `Normal`, in scoring order.
    pub const SCORED: [RegimeType; 6] = [
        RegimeType::StrongTrend,
        RegimeType::WeakTrend,
        RegimeType::MeanReversion,
        RegimeType::GammaSqueeze,
        RegimeType::Pinning,
        RegimeType::HighVolatility,
    ];

    pub const ALL: [RegimeType; 7] = [
        RegimeType::StrongTrend,
        RegimeType::WeakTrend,
        RegimeType::MeanReversion,
        RegimeType::GammaSqueeze,
        RegimeType::Pinning,
        RegimeType::HighVolatility,
        RegimeType::Normal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::StrongTrend => "strong_trend",
            Self::WeakTrend => "weak_trend",
            Self::MeanReversion => "mean_reversion",
            Self::GammaSqueeze => "gamma_squeeze",
            Self::Pinning => "pinning",
            Self::HighVolatility => "high_volatility",
            Self::Normal => "normal",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|r| r.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

impl fmt::Display for RegimeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TradingSession {
    PreMarket,
    Opening,
    Midday,
    Closing,
    AfterHours,
}

/// Market-wide context, already normalized by the ingestion collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketContextFeatures {
    /// Share of SPX options volume in same-day expiries (0–1).
    pub spx_0dte_share: f64,
    pub put_call_ratio: f64,
    /// Proxy for dealer gamma concentrated near spot (0–1).
    pub gamma_concentration: f64,
    #[serde(default)]
    pub regime_hint: Option<String>,
    pub session: TradingSession,
    pub weekday: Weekday,
    pub hour: u32,
    pub as_of: DateTime<Utc>,
}

impl MarketContextFeatures {
    /// Favorable-but-neutral context substituted when ingestion fails.
    pub fn neutral(now: DateTime<Utc>) -> Self {
        Self {
            spx_0dte_share: 0.35,
            put_call_ratio: 1.0,
            gamma_concentration: 0.3,
            regime_hint: None,
            session: TradingSession::Midday,
            weekday: now.weekday(),
            hour: now.hour(),
            as_of: now,
        }
    }
}

/// Volume profile for one instrument over the current session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VolumeProfileFeatures {
    pub instrument: String,
    pub point_of_control: f64,
    pub value_area_high: f64,
    pub value_area_low: f64,
    #[serde(default)]
    pub high_volume_nodes: Vec<f64>,
    #[serde(default)]
    pub low_volume_nodes: Vec<f64>,
    pub total_volume: f64,
}

impl VolumeProfileFeatures {
    /// Value-area width as a fraction of the point of control.
    pub fn value_area_width_pct(&self) -> f64 {
        if self.point_of_control <= 0.0 {
            return 0.0;
        }
        (self.value_area_high - self.value_area_low) / self.point_of_control
    }

    /// Distance of the POC from the value-area midpoint, normalized to [0, 1].
    pub fn imbalance(&self) -> f64 {
        let half_width = (self.value_area_high - self.value_area_low) / 2.0;
        if half_width <= 0.0 {
            return 0.0;
        }
        let mid = (self.value_area_high + self.value_area_low) / 2.0;
        ((self.point_of_control - mid).abs() / half_width).clamp(0.0, 1.0)
    }
}

/// Immutable regime classification. Superseded, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegimeVerdict {
    pub regime: RegimeType,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
    pub contributing_factors: Vec<String>,
    pub component_scores: BTreeMap<String, f64>,
}

// ── Policies ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PolicyType {
    AggressiveTrend,
    ConservativeTrend,
    MeanReversion,
    GammaSqueeze,
    RangeBound,
    Defensive,
}

impl PolicyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AggressiveTrend => "aggressive_trend",
            Self::ConservativeTrend => "conservative_trend",
            Self::MeanReversion => "mean_reversion",
            Self::GammaSqueeze => "gamma_squeeze",
            Self::RangeBound => "range_bound",
            Self::Defensive => "defensive",
        }
    }
}

impl fmt::Display for PolicyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Trading parameters for one policy activation. Replaced, never mutated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyParameters {
    /// Max fraction of equity risked on a single position.
    pub max_position_size: f64,
    pub risk_reward_min: f64,
    pub max_concurrent_trades: u32,
    pub max_daily_trades: u32,
    pub min_confidence: f64,
    pub confluence_required: u32,
    pub stop_multiplier: f64,
    pub target_multiplier: f64,
    pub trailing_stop: bool,
    pub timeframe_weights: BTreeMap<String, f64>,
    pub indicator_weights: BTreeMap<String, f64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PolicyPerformance {
    pub trades: u32,
    pub win_rate: f64,
    pub avg_r_multiple: f64,
    pub performance_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyState {
    pub policy_type: PolicyType,
    pub parameters: PolicyParameters,
    pub regime: RegimeType,
    pub regime_confidence: f64,
    /// When the current regime type was first accepted.
    pub regime_since: DateTime<Utc>,
    pub active_since: DateTime<Utc>,
    pub last_update: DateTime<Utc>,
    pub performance: PolicyPerformance,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PolicyEvent {
    Activated,
    Finalized,
}

/// Append-only policy history row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRecord {
    pub policy_type: PolicyType,
    pub event: PolicyEvent,
    pub regime: RegimeType,
    pub regime_confidence: f64,
    pub parameters: PolicyParameters,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub performance: Option<PolicyPerformance>,
}

// ── Signals ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    pub fn sign(&self) -> f64 {
        match self {
            Self::Buy => 1.0,
            Self::Sell => -1.0,
        }
    }
}

/// Feature vector captured when a signal is emitted.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SignalFeatures {
    #[serde(default)]
    pub technical: BTreeMap<String, f64>,
    #[serde(default)]
    pub volume_profile: BTreeMap<String, f64>,
    #[serde(default)]
    pub market_context: BTreeMap<String, f64>,
}

impl SignalFeatures {
    /// Flattened `group.name` → value view of every finite feature.
    pub fn numeric_features(&self) -> impl Iterator<Item = (String, f64)> + '_ {
        let groups = [
            ("technical", &self.technical),
            ("volume_profile", &self.volume_profile),
            ("market_context", &self.market_context),
        ];
        groups.into_iter().flat_map(|(group, values)| {
            values
                .iter()
                .filter(|(_, v)| v.is_finite())
                .map(move |(name, v)| (format!("{group}.{name}"), *v))
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalSnapshot {
    pub signal_id: String,
    pub instrument: String,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub target_price: f64,
    #[serde(default)]
    pub features: SignalFeatures,
    #[serde(default)]
    pub rationale: String,
    pub confidence: f64,
    pub source: String,
    /// Regime in force when the signal was emitted.
    #[serde(default)]
    pub regime: Option<RegimeType>,
    pub created_at: DateTime<Utc>,
}

impl SignalSnapshot {
    /// Price distance of one R.
    pub fn risk_per_unit(&self) -> f64 {
        (self.entry_price - self.stop_loss).abs()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SignalOutcome {
    Pending,
    TakeProfitHit,
    StopLossHit,
    Timeout,
    ManualExit,
    Cancelled,
}

impl SignalOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::TakeProfitHit => "take_profit_hit",
            Self::StopLossHit => "stop_loss_hit",
            Self::Timeout => "timeout",
            Self::ManualExit => "manual_exit",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        [
            Self::Pending,
            Self::TakeProfitHit,
            Self::StopLossHit,
            Self::Timeout,
            Self::ManualExit,
            Self::Cancelled,
        ]
        .into_iter()
        .find(|o| o.as_str().eq_ignore_ascii_case(raw.trim()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SignalOutcomeRecord {
    pub signal_id: String,
    pub outcome: SignalOutcome,
    #[serde(default)]
    pub exit_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub exit_price: Option<f64>,
    #[serde(default)]
    pub r_multiple: Option<f64>,
    #[serde(default)]
    pub mae: Option<f64>,
    #[serde(default)]
    pub mfe: Option<f64>,
    #[serde(default)]
    pub holding_time_secs: Option<i64>,
    #[serde(default)]
    pub exit_reason: Option<String>,
}

impl SignalOutcomeRecord {
    pub fn pending(signal_id: impl Into<String>) -> Self {
        Self {
            signal_id: signal_id.into(),
            outcome: SignalOutcome::Pending,
            exit_time: None,
            exit_price: None,
            r_multiple: None,
            mae: None,
            mfe: None,
            holding_time_secs: None,
            exit_reason: None,
        }
    }
}

/// A snapshot joined with its resolved outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub snapshot: SignalSnapshot,
    pub outcome: SignalOutcomeRecord,
}

impl TradeRecord {
    pub fn r_multiple(&self) -> f64 {
        self.outcome.r_multiple.unwrap_or(0.0)
    }
}

// ── Sizing ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SizingRequest {
    pub instrument: String,
    pub signal_id: String,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub confidence: f64,
    pub regime: RegimeType,
}

impl SizingRequest {
    pub fn from_snapshot(snapshot: &SignalSnapshot, regime: RegimeType) -> Self {
        Self {
            instrument: snapshot.instrument.clone(),
            signal_id: snapshot.signal_id.clone(),
            entry_price: snapshot.entry_price,
            stop_loss: snapshot.stop_loss,
            confidence: snapshot.confidence,
            regime,
        }
    }
}

/// Immutable sizing verdict with every intermediate factor recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSizeDecision {
    pub instrument: String,
    pub signal_id: String,
    pub regime: RegimeType,
    /// Fraction of equity to put at risk.
    pub recommended_size: f64,
    pub max_allowed: f64,
    pub risk_level: RiskLevel,
    pub kelly_raw: f64,
    pub kelly_adjusted: f64,
    pub adjustment_factors: BTreeMap<String, f64>,
    pub portfolio_risk_used_pct: f64,
    pub reason: String,
    pub decided_at: DateTime<Utc>,
}
