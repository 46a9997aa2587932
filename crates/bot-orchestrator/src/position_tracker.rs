use crate::config_store::ConfigStore;
use crate::order_service::{
    parse_decimal, parse_time, CloseType, OrderClose, OrderService, OrderStatus,
};
use crate::store::Database;
use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use perpbot_core::BotConfig;
use perpbot_exchange::{Credentials, ExchangeClient, Fill, Side};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::{BTreeSet, HashMap};
use std::str::FromStr;
use std::sync::Arc;

/// Window of history replayed by the sweep.
const SWEEP_WINDOW: Duration = Duration::days(7);
/// Convention for a profit factor with wins and no losses.
const PROFIT_FACTOR_CAP: f64 = 999.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Long => "LONG",
            Self::Short => "SHORT",
        }
    }

    /// `Bid` opens or grows a long, `Ask` a short.
    #[must_use]
    pub const fn from_fill_side(side: Side) -> Self {
        match side {
            Side::Bid => Self::Long,
            Side::Ask => Self::Short,
        }
    }
}

impl FromStr for PositionSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "LONG" => Self::Long,
            "SHORT" => Self::Short,
            _ => bail!("Unknown position side: '{s}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionStatus {
    Open,
    PartiallyClosed,
    Closed,
}

impl PositionStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::PartiallyClosed => "PARTIALLY_CLOSED",
            Self::Closed => "CLOSED",
        }
    }
}

impl FromStr for PositionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "OPEN" => Self::Open,
            "PARTIALLY_CLOSED" => Self::PartiallyClosed,
            "CLOSED" => Self::Closed,
            _ => bail!("Unknown position status: '{s}'"),
        })
    }
}

/// One durable position interval for a `(bot, symbol)` pair.
#[derive(Debug, Clone)]
pub struct PositionRecord {
    pub position_id: i64,
    pub bot_id: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub initial_quantity: Decimal,
    pub current_quantity: Decimal,
    pub pnl: Decimal,
    pub status: PositionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Execution report as fed into the tracker.
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub bot_id: i64,
    pub symbol: String,
    pub side: Side,
    pub quantity: Decimal,
    pub price: Decimal,
    pub external_order_id: Option<String>,
    pub client_order_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl FillEvent {
    #[must_use]
    pub fn from_fill(bot_id: i64, fill: &Fill) -> Self {
        Self {
            bot_id,
            symbol: fill.symbol.clone(),
            side: fill.side,
            quantity: fill.quantity.abs(),
            price: fill.price,
            external_order_id: fill.order_id.clone(),
            client_order_id: fill.client_id.clone(),
            timestamp: fill.timestamp,
        }
    }
}

/// In-memory position arithmetic shared by the event path and the sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PositionState {
    pub side: PositionSide,
    pub entry_price: Decimal,
    pub initial_quantity: Decimal,
    pub current_quantity: Decimal,
    pub pnl: Decimal,
}

impl PositionState {
    #[must_use]
    pub fn open(side: PositionSide, quantity: Decimal, price: Decimal) -> Self {
        Self {
            side,
            entry_price: price,
            initial_quantity: quantity,
            current_quantity: quantity,
            pnl: Decimal::ZERO,
        }
    }

    #[must_use]
    pub fn status(&self) -> PositionStatus {
        if self.current_quantity.is_zero() {
            PositionStatus::Closed
        } else if self.current_quantity == self.initial_quantity {
            PositionStatus::Open
        } else {
            PositionStatus::PartiallyClosed
        }
    }

    /// Applies one fill. A same-side fill scales the position and blends
    /// the entry; an opposite fill reduces it and realizes P&L. Returns
    /// the realized delta.
    pub fn apply_fill(&mut self, fill_side: Side, quantity: Decimal, price: Decimal) -> Decimal {
        let fill_direction = PositionSide::from_fill_side(fill_side);
        if fill_direction == self.side {
            let total = self.current_quantity + quantity;
            if !total.is_zero() {
                self.entry_price =
                    (self.entry_price * self.current_quantity + price * quantity) / total;
            }
            self.initial_quantity += quantity;
            self.current_quantity += quantity;
            return Decimal::ZERO;
        }

        let close_qty = quantity.min(self.current_quantity);
        let delta = match self.side {
            PositionSide::Long => (price - self.entry_price) * close_qty,
            PositionSide::Short => (self.entry_price - price) * close_qty,
        };
        self.pnl += delta;
        self.current_quantity -= close_qty;
        delta
    }
}

/// One completed (or still-open) reconstructed trade.
#[derive(Debug, Clone)]
pub struct TradeOutcome {
    pub symbol: String,
    pub entry_price: Decimal,
    pub initial_quantity: Decimal,
    pub pnl: Decimal,
    pub closed: bool,
}

/// Aggregate statistics over a bot's reconstructed trades.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PnlStats {
    pub total_trades: u32,
    pub wins: u32,
    pub losses: u32,
    pub win_rate: f64,
    pub profit_factor: f64,
    pub avg_pnl: Decimal,
    pub max_win: Decimal,
    pub max_loss: Decimal,
    pub total_pnl: Decimal,
    pub max_drawdown: Decimal,
    pub total_volume: Decimal,
}

/// Fill-driven position reconstruction and P&L accounting.
///
/// Reads only the bot's own records, never a global account view, which is
/// what lets the supervisor share an account with manual trading.
#[derive(Clone)]
pub struct PositionTracker {
    pool: SqlitePool,
    configs: ConfigStore,
    orders: OrderService,
    client: Arc<ExchangeClient>,
}

impl PositionTracker {
    #[must_use]
    pub fn new(
        db: &Database,
        configs: ConfigStore,
        orders: OrderService,
        client: Arc<ExchangeClient>,
    ) -> Self {
        Self {
            pool: db.pool().clone(),
            configs,
            orders,
            client,
        }
    }

    /// Processes one execution report.
    ///
    /// Fills that do not carry the bot's clientOrderId prefix, or that
    /// predate the bot's creation, are ignored: they belong to another bot
    /// or to the account's pre-existing history.
    ///
    /// # Errors
    /// Fails when a ledger or position write fails.
    pub async fn on_fill(
        &self,
        bot: &BotConfig,
        fill: &FillEvent,
    ) -> Result<Option<PositionRecord>> {
        let owned = fill
            .client_order_id
            .as_deref()
            .is_some_and(|id| bot.owns_client_order_id(id));
        if !owned {
            return Ok(None);
        }
        if fill.timestamp < bot.created_at {
            tracing::debug!(
                "Bot {} ignoring pre-creation fill on {} at {}",
                bot.bot_id,
                fill.symbol,
                fill.timestamp
            );
            return Ok(None);
        }

        // Order side-effect first: a PENDING order matching this fill
        // becomes FILLED.
        if let Some(external_id) = fill.external_order_id.as_deref() {
            if !self.orders.mark_filled(external_id, fill.timestamp).await? {
                if let Some(client_id) = fill.client_order_id.as_deref() {
                    self.orders
                        .mark_filled_by_client_id(client_id, Some(external_id), fill.timestamp)
                        .await?;
                }
            }
        } else if let Some(client_id) = fill.client_order_id.as_deref() {
            self.orders
                .mark_filled_by_client_id(client_id, None, fill.timestamp)
                .await?;
        }

        let existing = self.latest_open_position(bot.bot_id, &fill.symbol).await?;
        let record = match existing {
            None => {
                let state = PositionState::open(
                    PositionSide::from_fill_side(fill.side),
                    fill.quantity.abs(),
                    fill.price,
                );
                self.insert_position(bot.bot_id, &fill.symbol, &state).await?
            }
            Some(mut record) => {
                let mut state = PositionState {
                    side: record.side,
                    entry_price: record.entry_price,
                    initial_quantity: record.initial_quantity,
                    current_quantity: record.current_quantity,
                    pnl: record.pnl,
                };
                state.apply_fill(fill.side, fill.quantity.abs(), fill.price);
                self.update_position(record.position_id, &state).await?;

                record.side = state.side;
                record.entry_price = state.entry_price;
                record.initial_quantity = state.initial_quantity;
                record.current_quantity = state.current_quantity;
                record.pnl = state.pnl;
                record.status = state.status();
                record
            }
        };

        if record.status == PositionStatus::Closed {
            self.close_entry_orders(bot, &record, fill).await?;
        }

        Ok(Some(record))
    }

    /// Sweep mode: replays the bot's fills of the last 7 days over its
    /// entry symbols and aggregates trade statistics. Pure with respect to
    /// the durable stores, so repeated sweeps agree.
    ///
    /// # Errors
    /// Fails when the exchange reads fail.
    pub async fn track_bot_positions(&self, bot: &BotConfig) -> Result<PnlStats> {
        let credentials = Credentials::new(&bot.api_key, &bot.api_secret);

        let symbols: BTreeSet<String> = self
            .orders
            .list_all_for_bot(bot.bot_id)
            .await?
            .into_iter()
            .filter(|o| o.order_type.is_entry())
            .map(|o| o.symbol)
            .collect();
        if symbols.is_empty() {
            return Ok(PnlStats::default());
        }

        let now = Utc::now();
        let mut fills: Vec<Fill> = Vec::new();
        for symbol in &symbols {
            match self
                .client
                .get_fill_history(&credentials, Some(symbol), now - SWEEP_WINDOW, now, 1000, "PERP")
                .await
            {
                Ok(page) => fills.extend(page),
                Err(e) => {
                    // One symbol failing must not abort the sweep.
                    tracing::warn!(
                        "Bot {} fill history failed for {}: {e}",
                        bot.bot_id,
                        symbol
                    );
                }
            }
        }

        let events: Vec<FillEvent> = fills
            .iter()
            .map(|f| FillEvent::from_fill(bot.bot_id, f))
            .collect();
        let trades = replay_fills(bot, &events);
        Ok(compute_stats(&trades))
    }

    /// Aggregate over a bounded recent window, for the per-tick summary.
    ///
    /// # Errors
    /// Fails when the exchange reads fail.
    pub async fn recent_pnl_summary(&self, bot: &BotConfig, window: Duration) -> Result<PnlStats> {
        let credentials = Credentials::new(&bot.api_key, &bot.api_secret);
        let now = Utc::now();
        let fills = self
            .client
            .get_fill_history(&credentials, None, now - window, now, 1000, "PERP")
            .await?;
        let events: Vec<FillEvent> = fills
            .iter()
            .map(|f| FillEvent::from_fill(bot.bot_id, f))
            .collect();
        Ok(compute_stats(&replay_fills(bot, &events)))
    }

    /// The bot's open positions, from its own records only.
    ///
    /// # Errors
    /// Fails when the read fails.
    pub async fn get_bot_open_positions(&self, bot_id: i64) -> Result<Vec<PositionRecord>> {
        let rows = sqlx::query(&format!(
            "{POSITION_SELECT} WHERE bot_id = ?1 AND status IN ('OPEN', 'PARTIALLY_CLOSED') \
             ORDER BY symbol"
        ))
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_position).collect()
    }

    /// Statistics over the bot's recorded closed positions.
    ///
    /// # Errors
    /// Fails when the read fails.
    pub async fn get_bot_pnl_stats(&self, bot_id: i64) -> Result<PnlStats> {
        let rows = sqlx::query(&format!(
            "{POSITION_SELECT} WHERE bot_id = ?1 ORDER BY created_at"
        ))
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;
        let trades: Vec<TradeOutcome> = rows
            .into_iter()
            .map(row_to_position)
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .map(|p| TradeOutcome {
                symbol: p.symbol,
                entry_price: p.entry_price,
                initial_quantity: p.initial_quantity,
                pnl: p.pnl,
                closed: p.status == PositionStatus::Closed,
            })
            .collect();
        Ok(compute_stats(&trades))
    }

    async fn latest_open_position(
        &self,
        bot_id: i64,
        symbol: &str,
    ) -> Result<Option<PositionRecord>> {
        let row = sqlx::query(&format!(
            "{POSITION_SELECT} WHERE bot_id = ?1 AND symbol = ?2 \
             AND status IN ('OPEN', 'PARTIALLY_CLOSED') \
             ORDER BY position_id DESC LIMIT 1"
        ))
        .bind(bot_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_position).transpose()
    }

    async fn insert_position(
        &self,
        bot_id: i64,
        symbol: &str,
        state: &PositionState,
    ) -> Result<PositionRecord> {
        let now = Utc::now();
        let row = sqlx::query(
            r"
            INSERT INTO positions (bot_id, symbol, side, entry_price, initial_quantity,
                                   current_quantity, pnl, status, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
            RETURNING position_id
            ",
        )
        .bind(bot_id)
        .bind(symbol)
        .bind(state.side.as_str())
        .bind(state.entry_price.to_string())
        .bind(state.initial_quantity.to_string())
        .bind(state.current_quantity.to_string())
        .bind(state.pnl.to_string())
        .bind(state.status().as_str())
        .bind(now.to_rfc3339())
        .fetch_one(&self.pool)
        .await?;

        Ok(PositionRecord {
            position_id: row.get(0),
            bot_id,
            symbol: symbol.to_string(),
            side: state.side,
            entry_price: state.entry_price,
            initial_quantity: state.initial_quantity,
            current_quantity: state.current_quantity,
            pnl: state.pnl,
            status: state.status(),
            created_at: now,
            updated_at: now,
        })
    }

    async fn update_position(&self, position_id: i64, state: &PositionState) -> Result<()> {
        sqlx::query(
            r"
            UPDATE positions
            SET entry_price = ?2, initial_quantity = ?3, current_quantity = ?4,
                pnl = ?5, status = ?6, updated_at = ?7
            WHERE position_id = ?1
            ",
        )
        .bind(position_id)
        .bind(state.entry_price.to_string())
        .bind(state.initial_quantity.to_string())
        .bind(state.current_quantity.to_string())
        .bind(state.pnl.to_string())
        .bind(state.status().as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// When a position drains to zero, its entry orders' fill chains are
    /// complete; record their closure on the ledger.
    async fn close_entry_orders(
        &self,
        bot: &BotConfig,
        position: &PositionRecord,
        closing_fill: &FillEvent,
    ) -> Result<()> {
        let entries: Vec<_> = self
            .orders
            .list_all_for_bot(bot.bot_id)
            .await?
            .into_iter()
            .filter(|o| {
                o.symbol == position.symbol
                    && o.status == OrderStatus::Filled
                    && o.order_type.is_entry()
            })
            .collect();

        for order in entries {
            let Some(external_id) = order.external_order_id.as_deref() else {
                continue;
            };
            let cost = position.entry_price * order.quantity;
            let share = if position.initial_quantity.is_zero() {
                Decimal::ZERO
            } else {
                position.pnl * order.quantity / position.initial_quantity
            };
            let pnl_pct = if cost.is_zero() {
                Decimal::ZERO
            } else {
                share / cost * Decimal::ONE_HUNDRED
            };
            self.orders
                .mark_closed(
                    external_id,
                    &OrderClose {
                        close_price: closing_fill.price,
                        close_quantity: order.quantity,
                        close_time: closing_fill.timestamp,
                        close_type: CloseType::Auto,
                        pnl: share,
                        pnl_pct,
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Shared handle used by callers that only need config lookups.
    #[must_use]
    pub const fn configs(&self) -> &ConfigStore {
        &self.configs
    }
}

const POSITION_SELECT: &str = r"
    SELECT position_id, bot_id, symbol, side, entry_price, initial_quantity,
           current_quantity, pnl, status, created_at, updated_at
    FROM positions";

pub(crate) fn row_to_position(row: sqlx::sqlite::SqliteRow) -> Result<PositionRecord> {
    Ok(PositionRecord {
        position_id: row.get(0),
        bot_id: row.get(1),
        symbol: row.get(2),
        side: row.get::<String, _>(3).parse()?,
        entry_price: parse_decimal(&row.get::<String, _>(4))?,
        initial_quantity: parse_decimal(&row.get::<String, _>(5))?,
        current_quantity: parse_decimal(&row.get::<String, _>(6))?,
        pnl: parse_decimal(&row.get::<String, _>(7))?,
        status: row.get::<String, _>(8).parse()?,
        created_at: parse_time(&row.get::<String, _>(9))?,
        updated_at: parse_time(&row.get::<String, _>(10))?,
    })
}

/// Replays owned fills in timestamp order into per-symbol trade sequences.
#[must_use]
pub fn replay_fills(bot: &BotConfig, fills: &[FillEvent]) -> Vec<TradeOutcome> {
    let mut ordered: Vec<&FillEvent> = fills
        .iter()
        .filter(|f| {
            f.client_order_id
                .as_deref()
                .is_some_and(|id| bot.owns_client_order_id(id))
                && f.timestamp >= bot.created_at
        })
        .collect();
    ordered.sort_by_key(|f| f.timestamp);

    let mut open: HashMap<String, PositionState> = HashMap::new();
    let mut trades: Vec<TradeOutcome> = Vec::new();

    for fill in ordered {
        let state = open.remove(&fill.symbol);
        let mut state = match state {
            Some(state) => state,
            None => {
                open.insert(
                    fill.symbol.clone(),
                    PositionState::open(
                        PositionSide::from_fill_side(fill.side),
                        fill.quantity.abs(),
                        fill.price,
                    ),
                );
                continue;
            }
        };

        state.apply_fill(fill.side, fill.quantity.abs(), fill.price);
        if state.status() == PositionStatus::Closed {
            trades.push(TradeOutcome {
                symbol: fill.symbol.clone(),
                entry_price: state.entry_price,
                initial_quantity: state.initial_quantity,
                pnl: state.pnl,
                closed: true,
            });
        } else {
            open.insert(fill.symbol.clone(), state);
        }
    }

    for (symbol, state) in open {
        trades.push(TradeOutcome {
            symbol,
            entry_price: state.entry_price,
            initial_quantity: state.initial_quantity,
            pnl: state.pnl,
            closed: false,
        });
    }
    trades
}

/// Aggregates trade outcomes into the dashboard statistics.
#[must_use]
pub fn compute_stats(trades: &[TradeOutcome]) -> PnlStats {
    let closed: Vec<&TradeOutcome> = trades.iter().filter(|t| t.closed).collect();
    let total_trades = closed.len() as u32;

    let mut stats = PnlStats {
        total_trades,
        ..PnlStats::default()
    };
    if closed.is_empty() {
        return stats;
    }

    let mut wins_pnl = Decimal::ZERO;
    let mut losses_pnl = Decimal::ZERO;
    let mut equity = Decimal::ZERO;
    let mut peak = Decimal::ZERO;

    for trade in &closed {
        stats.total_pnl += trade.pnl;
        stats.total_volume += trade.entry_price * trade.initial_quantity;
        if trade.pnl > Decimal::ZERO {
            stats.wins += 1;
            wins_pnl += trade.pnl;
            stats.max_win = stats.max_win.max(trade.pnl);
        } else if trade.pnl < Decimal::ZERO {
            stats.losses += 1;
            losses_pnl += trade.pnl;
            stats.max_loss = stats.max_loss.min(trade.pnl);
        }

        equity += trade.pnl;
        peak = peak.max(equity);
        stats.max_drawdown = stats.max_drawdown.max(peak - equity);
    }

    stats.win_rate = f64::from(stats.wins) / f64::from(total_trades) * 100.0;
    stats.avg_pnl = stats.total_pnl / Decimal::from(total_trades);
    stats.profit_factor = if stats.wins > 0 && stats.losses == 0 {
        PROFIT_FACTOR_CAP
    } else if losses_pnl.is_zero() {
        0.0
    } else {
        let wins: f64 = wins_pnl.try_into().unwrap_or(0.0);
        let losses: f64 = losses_pnl.abs().try_into().unwrap_or(1.0);
        wins / losses
    };

    stats
}
