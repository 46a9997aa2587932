use crate::timeframe::Timeframe;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Strategy kinds registered with the supervisor.
///
/// `Hft` bots are driven by an external engine; the supervisor persists
/// their configuration but never schedules them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
pub enum StrategyKind {
    #[default]
    #[serde(rename = "DEFAULT")]
    Default,
    #[serde(rename = "PRO_MAX")]
    ProMax,
    #[serde(rename = "ALPHA_FLOW")]
    AlphaFlow,
    #[serde(rename = "HFT")]
    Hft,
}

impl StrategyKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Default => "DEFAULT",
            Self::ProMax => "PRO_MAX",
            Self::AlphaFlow => "ALPHA_FLOW",
            Self::Hft => "HFT",
        }
    }

    /// Externally managed kinds are excluded from `list_traditional` and
    /// from supervisor scheduling/recovery.
    #[must_use]
    pub const fn is_externally_managed(self) -> bool {
        matches!(self, Self::Hft)
    }

    /// `ALPHA_FLOW` only makes sense on closed candles.
    #[must_use]
    pub const fn forces_candle_close(self) -> bool {
        matches!(self, Self::AlphaFlow)
    }

    #[must_use]
    pub const fn all() -> [Self; 4] {
        [Self::Default, Self::ProMax, Self::AlphaFlow, Self::Hft]
    }
}

/// When the decision loop fires.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
pub enum ExecutionMode {
    /// Fixed 60-second cadence, immediate first tick.
    #[default]
    #[serde(rename = "REALTIME")]
    Realtime,
    /// Aligned to the close of the bot's timeframe; no immediate tick.
    #[serde(rename = "ON_CANDLE_CLOSE")]
    OnCandleClose,
}

/// Persisted lifecycle state of a bot.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    #[default]
    Stopped,
    Starting,
    Running,
    Error,
}

impl BotStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Error => "error",
        }
    }

    /// States from which a start is permitted.
    #[must_use]
    pub const fn startable(self) -> bool {
        matches!(self, Self::Stopped | Self::Error | Self::Starting)
    }
}

impl std::str::FromStr for BotStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "stopped" => Self::Stopped,
            "starting" => Self::Starting,
            "running" => Self::Running,
            "error" => Self::Error,
            _ => anyhow::bail!("Unknown bot status: '{s}'"),
        })
    }
}

/// Trailing-stop knobs. Distances are percentages of price; the ATR
/// multipliers only apply in hybrid mode.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrailingParams {
    /// Explicit arming threshold in unrealized-P&L percent. When absent the
    /// engine derives the threshold from `min_profit_percentage`.
    #[serde(default)]
    pub activation_pct: Option<Decimal>,
    #[serde(default = "default_trailing_distance")]
    pub distance_pct: Decimal,
    #[serde(default = "default_initial_stop_atr")]
    pub initial_stop_atr_multiplier: Decimal,
    #[serde(default = "default_trailing_stop_atr")]
    pub trailing_stop_atr_multiplier: Decimal,
    #[serde(default = "default_partial_tp_atr")]
    pub partial_take_profit_atr_multiplier: Decimal,
    #[serde(default = "default_partial_tp_pct")]
    pub partial_take_profit_percentage: Decimal,
}

impl TrailingParams {
    /// Resolves the arming threshold: the explicit field wins, otherwise the
    /// bot's minimum-profit target.
    #[must_use]
    pub fn resolved_activation_pct(&self, min_profit_percentage: Decimal) -> Decimal {
        self.activation_pct.unwrap_or(min_profit_percentage)
    }
}

impl Default for TrailingParams {
    fn default() -> Self {
        Self {
            activation_pct: None,
            distance_pct: default_trailing_distance(),
            initial_stop_atr_multiplier: default_initial_stop_atr(),
            trailing_stop_atr_multiplier: default_trailing_stop_atr(),
            partial_take_profit_atr_multiplier: default_partial_tp_atr(),
            partial_take_profit_percentage: default_partial_tp_pct(),
        }
    }
}

/// Feature switches, all defaulting to the conservative side.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FeatureSwitches {
    #[serde(default = "default_true")]
    pub enable_trailing_stop: bool,
    #[serde(default)]
    pub enable_post_only: bool,
    #[serde(default = "default_true")]
    pub enable_market_fallback: bool,
    #[serde(default = "default_true")]
    pub enable_orphan_monitor: bool,
    #[serde(default = "default_true")]
    pub enable_pending_monitor: bool,
    #[serde(default)]
    pub enable_heikin_ashi: bool,
    #[serde(default)]
    pub enable_hybrid_stop_strategy: bool,
}

impl Default for FeatureSwitches {
    fn default() -> Self {
        Self {
            enable_trailing_stop: true,
            enable_post_only: false,
            enable_market_fallback: true,
            enable_orphan_monitor: true,
            enable_pending_monitor: true,
            enable_heikin_ashi: false,
            enable_hybrid_stop_strategy: false,
        }
    }
}

/// Strategy-specific knobs, tagged by the owning strategy kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "strategy")]
pub enum StrategyParams {
    #[serde(rename = "DEFAULT")]
    Default {
        #[serde(default = "default_lookback")]
        lookback: usize,
        #[serde(default = "default_momentum_threshold")]
        momentum_threshold_pct: Decimal,
    },
    #[serde(rename = "PRO_MAX")]
    ProMax {
        #[serde(default = "default_lookback")]
        lookback: usize,
        #[serde(default = "default_momentum_threshold")]
        momentum_threshold_pct: Decimal,
        #[serde(default = "default_volume_factor")]
        volume_confirmation_factor: Decimal,
    },
    #[serde(rename = "ALPHA_FLOW")]
    AlphaFlow {
        #[serde(default = "default_lookback")]
        lookback: usize,
        #[serde(default = "default_flow_strength")]
        min_flow_strength: Decimal,
    },
    #[serde(rename = "HFT")]
    Hft {},
}

impl StrategyParams {
    #[must_use]
    pub fn for_kind(kind: StrategyKind) -> Self {
        match kind {
            StrategyKind::Default => Self::Default {
                lookback: default_lookback(),
                momentum_threshold_pct: default_momentum_threshold(),
            },
            StrategyKind::ProMax => Self::ProMax {
                lookback: default_lookback(),
                momentum_threshold_pct: default_momentum_threshold(),
                volume_confirmation_factor: default_volume_factor(),
            },
            StrategyKind::AlphaFlow => Self::AlphaFlow {
                lookback: default_lookback(),
                min_flow_strength: default_flow_strength(),
            },
            StrategyKind::Hft => Self::Hft {},
        }
    }

    #[must_use]
    pub const fn kind(&self) -> StrategyKind {
        match self {
            Self::Default { .. } => StrategyKind::Default,
            Self::ProMax { .. } => StrategyKind::ProMax,
            Self::AlphaFlow { .. } => StrategyKind::AlphaFlow,
            Self::Hft {} => StrategyKind::Hft,
        }
    }
}

/// Full configuration of one bot, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub bot_id: i64,
    pub bot_name: String,
    pub strategy: StrategyKind,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub timeframe: Timeframe,
    #[serde(default)]
    pub execution_mode: ExecutionMode,

    #[serde(default = "default_capital_percentage")]
    pub capital_percentage: Decimal,
    #[serde(default = "default_max_open_orders")]
    pub max_open_orders: u32,
    #[serde(default = "default_max_negative_pnl_stop")]
    pub max_negative_pnl_stop_pct: Decimal,
    #[serde(default = "default_min_profit")]
    pub min_profit_percentage: Decimal,
    #[serde(default = "default_max_slippage")]
    pub max_slippage_pct: Decimal,

    #[serde(default)]
    pub trailing: TrailingParams,
    #[serde(default)]
    pub features: FeatureSwitches,
    #[serde(default)]
    pub strategy_params: Option<StrategyParams>,

    /// Symbols the bot may trade. Empty means all.
    #[serde(default)]
    pub authorized_tokens: Vec<String>,

    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub status: BotStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub next_validation_at: Option<DateTime<Utc>>,

    /// Stable integer prefix tagging this bot's orders on the exchange.
    /// Assigned at creation, immutable afterwards.
    pub bot_client_order_id: u32,
    /// Monotone per-bot submission counter.
    #[serde(default)]
    pub order_counter: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BotConfig {
    /// ClientOrderId prefix owning all of this bot's submissions.
    #[must_use]
    pub fn client_order_prefix(&self) -> String {
        format!("{}_{}_", self.bot_id, self.bot_client_order_id)
    }

    #[must_use]
    pub fn owns_client_order_id(&self, client_order_id: &str) -> bool {
        client_order_id.starts_with(&self.client_order_prefix())
    }

    /// Execution mode after strategy coercion: `ALPHA_FLOW` and Heikin-Ashi
    /// analysis only operate on closed candles.
    #[must_use]
    pub const fn effective_execution_mode(&self) -> ExecutionMode {
        if self.strategy.forces_candle_close() || self.features.enable_heikin_ashi {
            ExecutionMode::OnCandleClose
        } else {
            self.execution_mode
        }
    }

    /// True when the configured symbol set admits `symbol`.
    #[must_use]
    pub fn symbol_authorized(&self, symbol: &str) -> bool {
        self.authorized_tokens.is_empty() || self.authorized_tokens.iter().any(|s| s == symbol)
    }
}

/// Caller-supplied fields of a new bot; everything else is assigned by the
/// config store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBot {
    pub bot_name: String,
    pub strategy: StrategyKind,
    pub api_key: String,
    pub api_secret: String,
    #[serde(default)]
    pub timeframe: Timeframe,
    #[serde(default)]
    pub execution_mode: ExecutionMode,
    #[serde(default = "default_capital_percentage")]
    pub capital_percentage: Decimal,
    #[serde(default = "default_max_open_orders")]
    pub max_open_orders: u32,
    #[serde(default = "default_max_negative_pnl_stop")]
    pub max_negative_pnl_stop_pct: Decimal,
    #[serde(default = "default_min_profit")]
    pub min_profit_percentage: Decimal,
    #[serde(default = "default_max_slippage")]
    pub max_slippage_pct: Decimal,
    #[serde(default)]
    pub trailing: TrailingParams,
    #[serde(default)]
    pub features: FeatureSwitches,
    #[serde(default)]
    pub strategy_params: Option<StrategyParams>,
    #[serde(default)]
    pub authorized_tokens: Vec<String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Partial update applied through `ConfigStore::update`. Carries no
/// `status` on purpose: status transitions go through `set_status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BotConfigPatch {
    pub bot_name: Option<String>,
    pub strategy: Option<StrategyKind>,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub timeframe: Option<Timeframe>,
    pub execution_mode: Option<ExecutionMode>,
    pub capital_percentage: Option<Decimal>,
    pub max_open_orders: Option<u32>,
    pub max_negative_pnl_stop_pct: Option<Decimal>,
    pub min_profit_percentage: Option<Decimal>,
    pub max_slippage_pct: Option<Decimal>,
    pub trailing: Option<TrailingParams>,
    pub features: Option<FeatureSwitches>,
    pub strategy_params: Option<StrategyParams>,
    pub authorized_tokens: Option<Vec<String>>,
    pub enabled: Option<bool>,
}

const fn default_true() -> bool {
    true
}

fn default_capital_percentage() -> Decimal {
    Decimal::from(20)
}

const fn default_max_open_orders() -> u32 {
    1
}

fn default_max_negative_pnl_stop() -> Decimal {
    Decimal::from(-10)
}

fn default_min_profit() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

fn default_max_slippage() -> Decimal {
    Decimal::new(5, 1) // 0.5%
}

fn default_trailing_distance() -> Decimal {
    Decimal::new(15, 1) // 1.5%
}

fn default_initial_stop_atr() -> Decimal {
    Decimal::from(2)
}

fn default_trailing_stop_atr() -> Decimal {
    Decimal::new(15, 1)
}

fn default_partial_tp_atr() -> Decimal {
    Decimal::ONE
}

fn default_partial_tp_pct() -> Decimal {
    Decimal::from(50)
}

const fn default_lookback() -> usize {
    20
}

fn default_momentum_threshold() -> Decimal {
    Decimal::new(3, 1) // 0.3%
}

fn default_volume_factor() -> Decimal {
    Decimal::new(12, 1) // 1.2x
}

fn default_flow_strength() -> Decimal {
    Decimal::new(6, 1) // 0.6
}
