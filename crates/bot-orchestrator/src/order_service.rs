use crate::config_store::ConfigStore;
use crate::store::Database;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use perpbot_core::{BotConfig, BusEvent, EventBus, IntentKind, IntentSide, OrderIntent};
use perpbot_exchange::{
    Credentials, ExchangeClient, ExchangeError, Fill, OpenOrder, PlaceOrderRequest, Side,
};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;

/// How long a PENDING order may stay unknown to the exchange before it is
/// written off as a ghost.
const GHOST_TTL: Duration = Duration::minutes(10);
/// Window of fills consulted during reconciliation.
const SYNC_FILL_WINDOW: Duration = Duration::hours(24);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderStatus {
    Pending,
    Filled,
    Cancelled,
    Closed,
    Expired,
}

impl OrderStatus {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Filled => "FILLED",
            Self::Cancelled => "CANCELLED",
            Self::Closed => "CLOSED",
            Self::Expired => "EXPIRED",
        }
    }
}

impl FromStr for OrderStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "PENDING" => Self::Pending,
            "FILLED" => Self::Filled,
            "CANCELLED" => Self::Cancelled,
            "CLOSED" => Self::Closed,
            "EXPIRED" => Self::Expired,
            _ => bail!("Unknown order status: '{s}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }

    #[must_use]
    pub const fn to_wire(self) -> Side {
        match self {
            Self::Buy => Side::Bid,
            Self::Sell => Side::Ask,
        }
    }
}

impl From<Side> for OrderSide {
    fn from(side: Side) -> Self {
        match side {
            Side::Bid => Self::Buy,
            Side::Ask => Self::Sell,
        }
    }
}

impl FromStr for OrderSide {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "BUY" => Self::Buy,
            "SELL" => Self::Sell,
            _ => bail!("Unknown order side: '{s}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderKind {
    Market,
    Limit,
    StopLoss,
    TakeProfit,
    ReduceOnlyStop,
    ReduceOnlyLimit,
}

impl OrderKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Market => "MARKET",
            Self::Limit => "LIMIT",
            Self::StopLoss => "STOP_LOSS",
            Self::TakeProfit => "TAKE_PROFIT",
            Self::ReduceOnlyStop => "REDUCE_ONLY_STOP",
            Self::ReduceOnlyLimit => "REDUCE_ONLY_LIMIT",
        }
    }

    /// Entry kinds open or grow a position; everything else reduces one.
    #[must_use]
    pub const fn is_entry(self) -> bool {
        matches!(self, Self::Market | Self::Limit)
    }
}

impl FromStr for OrderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "MARKET" => Self::Market,
            "LIMIT" => Self::Limit,
            "STOP_LOSS" => Self::StopLoss,
            "TAKE_PROFIT" => Self::TakeProfit,
            "REDUCE_ONLY_STOP" => Self::ReduceOnlyStop,
            "REDUCE_ONLY_LIMIT" => Self::ReduceOnlyLimit,
            _ => bail!("Unknown order kind: '{s}'"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseType {
    Auto,
    Manual,
}

impl CloseType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "AUTO",
            Self::Manual => "MANUAL",
        }
    }
}

impl FromStr for CloseType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "AUTO" => Self::Auto,
            "MANUAL" => Self::Manual,
            _ => bail!("Unknown close type: '{s}'"),
        })
    }
}

/// One row of the local order ledger.
#[derive(Debug, Clone)]
pub struct OrderRecord {
    pub client_order_id: String,
    pub external_order_id: Option<String>,
    pub bot_id: i64,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub timestamp: DateTime<Utc>,
    pub exchange_created_at: Option<DateTime<Utc>>,
    pub close_price: Option<Decimal>,
    pub close_quantity: Option<Decimal>,
    pub close_time: Option<DateTime<Utc>>,
    pub close_type: Option<CloseType>,
    pub pnl: Option<Decimal>,
    pub pnl_pct: Option<Decimal>,
}

/// What a caller submits; identifiers are assigned by the service.
#[derive(Debug, Clone)]
pub struct SubmitPayload {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

/// Closure details recorded when an entry order's fill chain completes.
#[derive(Debug, Clone)]
pub struct OrderClose {
    pub close_price: Decimal,
    pub close_quantity: Decimal,
    pub close_time: DateTime<Utc>,
    pub close_type: CloseType,
    pub pnl: Decimal,
    pub pnl_pct: Decimal,
}

/// Durable ledger of every order the bots have submitted, plus the
/// reconciliation sweeps that keep it agreeing with the exchange.
#[derive(Clone)]
pub struct OrderService {
    pool: SqlitePool,
    configs: ConfigStore,
    client: Arc<ExchangeClient>,
    bus: EventBus,
}

impl OrderService {
    #[must_use]
    pub fn new(
        db: &Database,
        configs: ConfigStore,
        client: Arc<ExchangeClient>,
        bus: EventBus,
    ) -> Self {
        Self {
            pool: db.pool().clone(),
            configs,
            client,
            bus,
        }
    }

    // ------------------------------------------------------------------
    // Ledger writes
    // ------------------------------------------------------------------

    /// Records a PENDING submission under a freshly assigned clientOrderId.
    ///
    /// # Errors
    /// Fails when the bot is unknown or the write fails.
    pub async fn register_submission(
        &self,
        bot_id: i64,
        payload: &SubmitPayload,
    ) -> Result<String> {
        let client_order_id = self.configs.next_order_id(bot_id).await?;
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r"
            INSERT INTO orders (client_order_id, bot_id, symbol, side, order_type,
                                quantity, price, status, timestamp, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', ?8, ?8, ?8)
            ",
        )
        .bind(&client_order_id)
        .bind(bot_id)
        .bind(&payload.symbol)
        .bind(payload.side.as_str())
        .bind(payload.order_type.as_str())
        .bind(payload.quantity.to_string())
        .bind(payload.price.map(|p| p.to_string()))
        .bind(&now)
        .execute(&self.pool)
        .await?;

        Ok(client_order_id)
    }

    /// Fills in the exchange-assigned id once the submission is accepted.
    ///
    /// # Errors
    /// Fails when the order is unknown or the write fails.
    pub async fn confirm_accepted(
        &self,
        client_order_id: &str,
        external_order_id: &str,
        exchange_created_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let result = sqlx::query(
            r"
            UPDATE orders SET external_order_id = ?2, exchange_created_at = ?3, updated_at = ?4
            WHERE client_order_id = ?1
            ",
        )
        .bind(client_order_id)
        .bind(external_order_id)
        .bind(exchange_created_at.map(|t| t.to_rfc3339()))
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("Order '{client_order_id}' not found");
        }
        Ok(())
    }

    /// PENDING → FILLED. A no-op for orders already past PENDING, so fill
    /// replays are harmless.
    ///
    /// # Errors
    /// Fails when the write fails.
    pub async fn mark_filled(&self, external_order_id: &str, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE orders
            SET status = 'FILLED',
                exchange_created_at = COALESCE(exchange_created_at, ?2),
                updated_at = ?3
            WHERE external_order_id = ?1 AND status = 'PENDING'
            ",
        )
        .bind(external_order_id)
        .bind(at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Same transition, keyed by clientOrderId (used when a fill carries no
    /// exchange order id we know).
    ///
    /// # Errors
    /// Fails when the write fails.
    pub async fn mark_filled_by_client_id(
        &self,
        client_order_id: &str,
        external_order_id: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE orders
            SET status = 'FILLED',
                external_order_id = COALESCE(external_order_id, ?2),
                exchange_created_at = COALESCE(exchange_created_at, ?3),
                updated_at = ?4
            WHERE client_order_id = ?1 AND status = 'PENDING'
            ",
        )
        .bind(client_order_id)
        .bind(external_order_id)
        .bind(at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// FILLED → CLOSED with realized P&L. Invoked by the position tracker
    /// when a position drains to zero, or by reconciliation when the
    /// exchange confirms a closure the ledger missed.
    ///
    /// # Errors
    /// Fails when the write fails.
    pub async fn mark_closed(&self, external_order_id: &str, close: &OrderClose) -> Result<bool> {
        let result = sqlx::query(
            r"
            UPDATE orders
            SET status = 'CLOSED', close_price = ?2, close_quantity = ?3, close_time = ?4,
                close_type = ?5, pnl = ?6, pnl_pct = ?7, updated_at = ?8
            WHERE external_order_id = ?1 AND status = 'FILLED'
            ",
        )
        .bind(external_order_id)
        .bind(close.close_price.to_string())
        .bind(close.close_quantity.to_string())
        .bind(close.close_time.to_rfc3339())
        .bind(close.close_type.as_str())
        .bind(close.pnl.to_string())
        .bind(close.pnl_pct.to_string())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Terminal transition for ghosts and expired entries.
    ///
    /// # Errors
    /// Fails when the write fails.
    pub async fn mark_inactive(&self, client_order_id: &str, status: OrderStatus) -> Result<bool> {
        debug_assert!(matches!(
            status,
            OrderStatus::Cancelled | OrderStatus::Expired
        ));
        let result = sqlx::query(
            r"
            UPDATE orders SET status = ?2, updated_at = ?3
            WHERE client_order_id = ?1 AND status = 'PENDING'
            ",
        )
        .bind(client_order_id)
        .bind(status.as_str())
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Hard delete on bot removal.
    ///
    /// # Errors
    /// Fails when the write fails.
    pub async fn clear_orders_by_bot_id(&self, bot_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM orders WHERE bot_id = ?1")
            .bind(bot_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // Ledger reads
    // ------------------------------------------------------------------

    /// Non-terminal orders: PENDING submissions plus FILLED entries whose
    /// fill chain has not closed yet.
    ///
    /// # Errors
    /// Fails when the read fails.
    pub async fn list_open_for_bot(&self, bot_id: i64) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query(ORDER_SELECT_BY_BOT_AND_STATUS)
            .bind(bot_id)
            .bind("PENDING")
            .bind("FILLED")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_order).collect()
    }

    /// # Errors
    /// Fails when the read fails.
    pub async fn list_all_for_bot(&self, bot_id: i64) -> Result<Vec<OrderRecord>> {
        let rows = sqlx::query(&format!("{ORDER_SELECT} WHERE bot_id = ?1 ORDER BY timestamp"))
            .bind(bot_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_order).collect()
    }

    /// # Errors
    /// Fails when the read fails.
    pub async fn get_by_external_id(&self, external_order_id: &str) -> Result<Option<OrderRecord>> {
        let row = sqlx::query(&format!("{ORDER_SELECT} WHERE external_order_id = ?1"))
            .bind(external_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_order).transpose()
    }

    /// # Errors
    /// Fails when the read fails.
    pub async fn get_by_client_id(&self, client_order_id: &str) -> Result<Option<OrderRecord>> {
        let row = sqlx::query(&format!("{ORDER_SELECT} WHERE client_order_id = ?1"))
            .bind(client_order_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_order).transpose()
    }

    // ------------------------------------------------------------------
    // Submission pipeline
    // ------------------------------------------------------------------

    /// Submits the strategy's intents: sizes them against collateral,
    /// respects `max_open_orders` and the authorized-token set, records
    /// each submission, and confirms acceptance.
    ///
    /// # Errors
    /// Fails only on ledger errors; per-intent exchange rejections are
    /// logged and skipped.
    pub async fn submit_intents(&self, bot: &BotConfig, intents: &[OrderIntent]) -> Result<u32> {
        if intents.is_empty() {
            return Ok(0);
        }
        let credentials = Credentials::new(&bot.api_key, &bot.api_secret);
        let mut open = self
            .list_open_for_bot(bot.bot_id)
            .await?
            .into_iter()
            .filter(|o| o.status == OrderStatus::Pending)
            .count() as u32;
        let mut submitted = 0;

        for intent in intents {
            if !bot.symbol_authorized(&intent.symbol) {
                tracing::debug!(
                    "Bot {} skipping unauthorized symbol {}",
                    bot.bot_id,
                    intent.symbol
                );
                continue;
            }
            if open >= bot.max_open_orders {
                tracing::debug!(
                    "Bot {} at max open orders ({}), deferring remaining intents",
                    bot.bot_id,
                    bot.max_open_orders
                );
                break;
            }

            let quantity = match self.size_intent(bot, &credentials, intent).await {
                Ok(q) if q > Decimal::ZERO => q,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Bot {} sizing failed for {}: {e}", bot.bot_id, intent.symbol);
                    continue;
                }
            };

            let (kind, side) = intent_to_order(intent);
            let payload = SubmitPayload {
                symbol: intent.symbol.clone(),
                side,
                order_type: kind,
                quantity,
                price: intent.price,
            };
            let client_order_id = self.register_submission(bot.bot_id, &payload).await?;

            match self
                .place_with_fallback(bot, &credentials, intent, &payload, &client_order_id)
                .await
            {
                Ok(ack) => {
                    self.confirm_accepted(
                        &client_order_id,
                        &ack.id,
                        ack.created_at.and_then(DateTime::from_timestamp_millis),
                    )
                    .await?;
                    open += 1;
                    submitted += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        "Bot {} order rejected for {}: {e}",
                        bot.bot_id,
                        intent.symbol
                    );
                    self.mark_inactive(&client_order_id, OrderStatus::Cancelled)
                        .await?;
                }
            }
        }

        Ok(submitted)
    }

    async fn place_with_fallback(
        &self,
        bot: &BotConfig,
        credentials: &Credentials,
        intent: &OrderIntent,
        payload: &SubmitPayload,
        client_order_id: &str,
    ) -> Result<perpbot_exchange::OrderAck, ExchangeError> {
        let wire_side = payload.side.to_wire();
        let request = match intent.kind {
            IntentKind::MarketEntry => {
                PlaceOrderRequest::market(&payload.symbol, wire_side, payload.quantity)
            }
            IntentKind::LimitEntry => PlaceOrderRequest::limit(
                &payload.symbol,
                wire_side,
                payload.quantity,
                intent.price.unwrap_or_default(),
            )
            .with_post_only(bot.features.enable_post_only),
            IntentKind::ReduceOnlyStop => PlaceOrderRequest::reduce_only_stop(
                &payload.symbol,
                wire_side,
                payload.quantity,
                intent.trigger_price.unwrap_or_default(),
            ),
            IntentKind::ReduceOnlyLimit => {
                let mut r = PlaceOrderRequest::limit(
                    &payload.symbol,
                    wire_side,
                    payload.quantity,
                    intent.price.unwrap_or_default(),
                );
                r.reduce_only = Some(true);
                r
            }
        }
        .with_client_id(client_order_id);

        match self.client.place_order(credentials, &request).await {
            Ok(ack) => Ok(ack),
            // A post-only limit crossing the book comes back as an API
            // rejection; fall through to a market order when allowed.
            Err(ExchangeError::Api { code, message })
                if intent.kind == IntentKind::LimitEntry
                    && bot.features.enable_post_only
                    && bot.features.enable_market_fallback =>
            {
                tracing::info!(
                    "Bot {} post-only limit rejected ({code}: {message}); falling back to market",
                    bot.bot_id
                );
                let fallback =
                    PlaceOrderRequest::market(&payload.symbol, wire_side, payload.quantity)
                        .with_client_id(client_order_id);
                self.client.place_order(credentials, &fallback).await
            }
            Err(e) => Err(e),
        }
    }

    /// Sizes an intent from available collateral and `capital_percentage`;
    /// the intent's own quantity is a floor for reduce-only orders.
    async fn size_intent(
        &self,
        bot: &BotConfig,
        credentials: &Credentials,
        intent: &OrderIntent,
    ) -> Result<Decimal> {
        if !matches!(intent.kind, IntentKind::MarketEntry | IntentKind::LimitEntry) {
            return Ok(intent.quantity);
        }
        let Some(price) = intent.price.filter(|p| !p.is_zero()) else {
            return Ok(intent.quantity);
        };

        let collateral = self.client.get_collateral(credentials).await?;
        let Some(equity) = collateral
            .net_equity_available
            .or(collateral.net_equity)
            .filter(|e| *e > Decimal::ZERO)
        else {
            return Ok(intent.quantity);
        };

        let notional = equity * bot.capital_percentage / Decimal::ONE_HUNDRED;
        Ok((notional / price).round_dp(4))
    }

    // ------------------------------------------------------------------
    // Reconciliation
    // ------------------------------------------------------------------

    /// Brings the local ledger into agreement with the exchange. Each rule
    /// is idempotent; with no market activity in between, a second pass
    /// changes nothing.
    ///
    /// # Errors
    /// Fails when the exchange reads fail; per-order patch failures are
    /// logged and skipped.
    pub async fn sync_with_exchange(&self, bot: &BotConfig) -> Result<u32> {
        let credentials = Credentials::new(&bot.api_key, &bot.api_secret);
        let now = Utc::now();

        let exchange_open = self
            .client
            .get_open_orders(&credentials, None, "PERP")
            .await
            .context("Failed to fetch open orders")?;
        let fills = self
            .client
            .get_fill_history(
                &credentials,
                None,
                now - SYNC_FILL_WINDOW,
                now,
                1000,
                "PERP",
            )
            .await
            .context("Failed to fetch fill history")?;

        let local = self.list_all_for_bot(bot.bot_id).await?;
        let plan = plan_sync(&local, &exchange_open, &fills, bot, now);

        let mut synced = 0;
        for action in plan {
            let applied = match &action {
                SyncAction::MarkFilled {
                    client_order_id,
                    external_order_id,
                    at,
                } => {
                    self.mark_filled_by_client_id(client_order_id, external_order_id.as_deref(), *at)
                        .await
                }
                SyncAction::CancelGhost { client_order_id } => {
                    self.mark_inactive(client_order_id, OrderStatus::Cancelled)
                        .await
                }
                SyncAction::PatchClose {
                    external_order_id,
                    close,
                } => self.mark_closed(external_order_id, close).await,
            };
            match applied {
                Ok(true) => {
                    tracing::info!("Bot {} sync applied {:?}", bot.bot_id, action.describe());
                    synced += 1;
                }
                Ok(false) => {}
                Err(e) => tracing::warn!("Bot {} sync step failed: {e}", bot.bot_id),
            }
        }

        Ok(synced)
    }

    /// Cancels reduce-only orders on the exchange that no longer have a
    /// matching open position. The full-account variant scans every symbol
    /// with open reduce-only orders; the local variant only symbols the
    /// ledger knows.
    ///
    /// # Errors
    /// Fails when the exchange reads fail; per-symbol cancel failures are
    /// logged and do not abort the sweep.
    pub async fn scan_and_cleanup_orphans(&self, bot: &BotConfig, full_scan: bool) -> Result<u32> {
        let credentials = Credentials::new(&bot.api_key, &bot.api_secret);

        let open_orders = self
            .client
            .get_open_orders(&credentials, None, "PERP")
            .await
            .context("Failed to fetch open orders")?;

        let local_symbols: Option<HashSet<String>> = if full_scan {
            None
        } else {
            let rows: Vec<String> =
                sqlx::query_scalar("SELECT DISTINCT symbol FROM orders WHERE bot_id = ?1")
                    .bind(bot.bot_id)
                    .fetch_all(&self.pool)
                    .await?;
            Some(rows.into_iter().collect())
        };

        let open_position_symbols = self.open_position_symbols(bot.bot_id).await?;
        let orphans = select_orphans(
            &open_orders,
            &open_position_symbols,
            local_symbols.as_ref(),
            bot,
        );
        let mut cancelled = 0;

        for order in orphans {
            match self
                .client
                .cancel_order(&credentials, &order.symbol, &order.id)
                .await
            {
                Ok(()) => {
                    tracing::info!(
                        "Bot {} cancelled orphan reduce-only order {} on {}",
                        bot.bot_id,
                        order.id,
                        order.symbol
                    );
                    cancelled += 1;
                }
                Err(e) if e.is_not_found() => cancelled += 1,
                Err(e) => {
                    tracing::warn!(
                        "Bot {} failed to cancel orphan {} on {}: {e}",
                        bot.bot_id,
                        order.id,
                        order.symbol
                    );
                }
            }
        }

        if cancelled > 0 {
            self.bus.publish(BusEvent::OrphanOrdersCleanup {
                bot_id: bot.bot_id,
                cancelled,
                timestamp: Utc::now(),
            });
        }
        Ok(cancelled)
    }

    /// Cancels entry limits that outlived their TTL or drifted past the
    /// slippage budget.
    ///
    /// # Errors
    /// Fails when the exchange reads fail; per-order failures are logged.
    pub async fn expire_stale_pending(&self, bot: &BotConfig) -> Result<u32> {
        let credentials = Credentials::new(&bot.api_key, &bot.api_secret);
        let now = Utc::now();
        let pending: Vec<OrderRecord> = self
            .list_open_for_bot(bot.bot_id)
            .await?
            .into_iter()
            .filter(|o| o.status == OrderStatus::Pending && o.order_type == OrderKind::Limit)
            .collect();
        if pending.is_empty() {
            return Ok(0);
        }

        let tickers = self.client.get_tickers(None).await?;
        let last_prices: HashMap<&str, Decimal> = tickers
            .iter()
            .map(|t| (t.symbol.as_str(), t.last_price))
            .collect();

        let mut cancelled = 0;
        for order in &pending {
            let expired = now - order.timestamp > GHOST_TTL;
            let slipped = match (order.price, last_prices.get(order.symbol.as_str())) {
                (Some(price), Some(last)) if !price.is_zero() => {
                    let drift_pct = ((*last - price) / price * Decimal::ONE_HUNDRED).abs();
                    drift_pct > bot.max_slippage_pct
                }
                _ => false,
            };
            if !expired && !slipped {
                continue;
            }

            if let Some(external_id) = order.external_order_id.as_deref() {
                match self
                    .client
                    .cancel_order(&credentials, &order.symbol, external_id)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => {
                        tracing::warn!(
                            "Bot {} failed to cancel stale order {}: {e}",
                            bot.bot_id,
                            order.client_order_id
                        );
                        continue;
                    }
                }
            }

            let status = if expired {
                OrderStatus::Expired
            } else {
                OrderStatus::Cancelled
            };
            if self.mark_inactive(&order.client_order_id, status).await? {
                tracing::info!(
                    "Bot {} retired stale limit {} ({})",
                    bot.bot_id,
                    order.client_order_id,
                    if expired { "ttl" } else { "slippage" }
                );
                cancelled += 1;
            }
        }

        if cancelled > 0 {
            self.bus.publish(BusEvent::PendingOrdersUpdate {
                bot_id: bot.bot_id,
                cancelled,
                timestamp: Utc::now(),
            });
        }
        Ok(cancelled)
    }

    /// Ensures every open position carries a matching reduce-only
    /// take-profit order at the bot's minimum-profit distance.
    ///
    /// # Errors
    /// Fails when the exchange reads fail; per-symbol placement failures
    /// are logged.
    pub async fn ensure_take_profit_orders(&self, bot: &BotConfig) -> Result<u32> {
        let credentials = Credentials::new(&bot.api_key, &bot.api_secret);
        let open_positions = self.open_positions(bot.bot_id).await?;
        if open_positions.is_empty() {
            return Ok(0);
        }

        let open_orders = self
            .client
            .get_open_orders(&credentials, None, "PERP")
            .await?;
        let covered: HashSet<&str> = open_orders
            .iter()
            .filter(|o| o.is_reduce_only() && owns_order(bot, o))
            .map(|o| o.symbol.as_str())
            .collect();

        let mut placed = 0;
        for (symbol, side, entry_price, quantity) in &open_positions {
            if covered.contains(symbol.as_str()) {
                continue;
            }

            let offset = *entry_price * bot.min_profit_percentage / Decimal::ONE_HUNDRED;
            let (target, wire_side) = match side.as_str() {
                "LONG" => (*entry_price + offset, Side::Ask),
                _ => (*entry_price - offset, Side::Bid),
            };

            let payload = SubmitPayload {
                symbol: symbol.clone(),
                side: wire_side.into(),
                order_type: OrderKind::TakeProfit,
                quantity: *quantity,
                price: Some(target),
            };
            let client_order_id = self.register_submission(bot.bot_id, &payload).await?;

            let mut request =
                PlaceOrderRequest::limit(symbol.clone(), wire_side, *quantity, target)
                    .with_client_id(&client_order_id);
            request.reduce_only = Some(true);

            match self.client.place_order(&credentials, &request).await {
                Ok(ack) => {
                    self.confirm_accepted(
                        &client_order_id,
                        &ack.id,
                        ack.created_at.and_then(DateTime::from_timestamp_millis),
                    )
                    .await?;
                    self.bus.publish(BusEvent::TakeProfitUpdate {
                        bot_id: bot.bot_id,
                        symbol: symbol.clone(),
                        placed: true,
                        timestamp: Utc::now(),
                    });
                    placed += 1;
                }
                Err(e) => {
                    self.mark_inactive(&client_order_id, OrderStatus::Cancelled)
                        .await?;
                    tracing::warn!(
                        "Bot {} failed to place take-profit on {}: {e}",
                        bot.bot_id,
                        symbol
                    );
                }
            }
        }

        Ok(placed)
    }

    async fn open_position_symbols(&self, bot_id: i64) -> Result<HashSet<String>> {
        let rows: Vec<String> = sqlx::query_scalar(
            r"
            SELECT DISTINCT symbol FROM positions
            WHERE bot_id = ?1 AND status IN ('OPEN', 'PARTIALLY_CLOSED')
            ",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().collect())
    }

    async fn open_positions(&self, bot_id: i64) -> Result<Vec<(String, String, Decimal, Decimal)>> {
        let rows = sqlx::query(
            r"
            SELECT symbol, side, entry_price, current_quantity FROM positions
            WHERE bot_id = ?1 AND status IN ('OPEN', 'PARTIALLY_CLOSED')
            ",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok((
                    row.get::<String, _>(0),
                    row.get::<String, _>(1),
                    parse_decimal(&row.get::<String, _>(2))?,
                    parse_decimal(&row.get::<String, _>(3))?,
                ))
            })
            .collect()
    }
}

const ORDER_SELECT: &str = r"
    SELECT client_order_id, external_order_id, bot_id, symbol, side, order_type,
           quantity, price, status, timestamp, exchange_created_at,
           close_price, close_quantity, close_time, close_type, pnl, pnl_pct
    FROM orders";

const ORDER_SELECT_BY_BOT_AND_STATUS: &str = r"
    SELECT client_order_id, external_order_id, bot_id, symbol, side, order_type,
           quantity, price, status, timestamp, exchange_created_at,
           close_price, close_quantity, close_time, close_type, pnl, pnl_pct
    FROM orders WHERE bot_id = ?1 AND status IN (?2, ?3) ORDER BY timestamp";

/// One reconciliation step. Planning is pure; execution applies each step
/// independently and idempotently.
#[derive(Debug, Clone)]
pub enum SyncAction {
    MarkFilled {
        client_order_id: String,
        external_order_id: Option<String>,
        at: DateTime<Utc>,
    },
    CancelGhost {
        client_order_id: String,
    },
    PatchClose {
        external_order_id: String,
        close: OrderClose,
    },
}

impl SyncAction {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::MarkFilled {
                client_order_id, ..
            } => format!("mark-filled {client_order_id}"),
            Self::CancelGhost { client_order_id } => format!("cancel-ghost {client_order_id}"),
            Self::PatchClose {
                external_order_id, ..
            } => format!("patch-close {external_order_id}"),
        }
    }
}

/// Computes the reconciliation steps for one bot from its local ledger and
/// the exchange's view. Running the resulting plan and re-planning against
/// the updated ledger yields an empty plan.
#[must_use]
pub fn plan_sync(
    local: &[OrderRecord],
    exchange_open: &[OpenOrder],
    fills: &[Fill],
    bot: &BotConfig,
    now: DateTime<Utc>,
) -> Vec<SyncAction> {
    let open_external: HashSet<&str> = exchange_open.iter().map(|o| o.id.as_str()).collect();
    let open_client: HashSet<&str> = exchange_open
        .iter()
        .filter_map(|o| o.client_id.as_deref())
        .collect();
    let fills_by_client = group_fills_by_client(fills);

    let mut plan = Vec::new();
    for order in local {
        match order.status {
            OrderStatus::Pending => {
                if let Some(order_fills) = fills_by_client.get(order.client_order_id.as_str()) {
                    // Status correction: the exchange filled it.
                    let at = order_fills.iter().map(|f| f.timestamp).min().unwrap_or(now);
                    let external = order_fills
                        .iter()
                        .find_map(|f| f.order_id.clone())
                        .or_else(|| order.external_order_id.clone());
                    plan.push(SyncAction::MarkFilled {
                        client_order_id: order.client_order_id.clone(),
                        external_order_id: external,
                        at,
                    });
                    continue;
                }

                let known_open = order
                    .external_order_id
                    .as_deref()
                    .is_some_and(|id| open_external.contains(id))
                    || open_client.contains(order.client_order_id.as_str());
                if !known_open && now - order.timestamp > GHOST_TTL {
                    plan.push(SyncAction::CancelGhost {
                        client_order_id: order.client_order_id.clone(),
                    });
                }
            }
            OrderStatus::Filled if order.order_type.is_entry() => {
                // Missed fills: an exit chain completed on the exchange
                // that the ledger never recorded.
                if let Some(close) = reconstruct_exit(order, bot, fills) {
                    if let Some(external_id) = order.external_order_id.clone() {
                        plan.push(SyncAction::PatchClose {
                            external_order_id: external_id,
                            close,
                        });
                    }
                }
            }
            _ => {}
        }
    }
    plan
}

/// Reduce-only exchange orders owned by the bot with no matching open
/// position locally. `local_symbols` of `None` means a full-account scan.
#[must_use]
pub fn select_orphans<'a>(
    open_orders: &'a [OpenOrder],
    open_position_symbols: &HashSet<String>,
    local_symbols: Option<&HashSet<String>>,
    bot: &BotConfig,
) -> Vec<&'a OpenOrder> {
    open_orders
        .iter()
        .filter(|o| o.is_reduce_only())
        .filter(|o| owns_order(bot, o))
        .filter(|o| match local_symbols {
            Some(symbols) => symbols.contains(&o.symbol),
            None => true,
        })
        .filter(|o| !open_position_symbols.contains(&o.symbol))
        .collect()
}

fn intent_to_order(intent: &OrderIntent) -> (OrderKind, OrderSide) {
    let kind = match intent.kind {
        IntentKind::MarketEntry => OrderKind::Market,
        IntentKind::LimitEntry => OrderKind::Limit,
        IntentKind::ReduceOnlyStop => OrderKind::ReduceOnlyStop,
        IntentKind::ReduceOnlyLimit => OrderKind::ReduceOnlyLimit,
    };
    let side = match intent.side {
        IntentSide::Buy => OrderSide::Buy,
        IntentSide::Sell => OrderSide::Sell,
    };
    (kind, side)
}

fn owns_order(bot: &BotConfig, order: &OpenOrder) -> bool {
    order
        .client_id
        .as_deref()
        .is_some_and(|id| bot.owns_client_order_id(id))
}

fn group_fills_by_client(fills: &[Fill]) -> HashMap<&str, Vec<&Fill>> {
    let mut map: HashMap<&str, Vec<&Fill>> = HashMap::new();
    for fill in fills {
        if let Some(client_id) = fill.client_id.as_deref() {
            map.entry(client_id).or_default().push(fill);
        }
    }
    map
}

/// Reconstructs the exit of a FILLED entry order from the bot's own
/// opposite-side fills after the entry. Returns `None` while the exit
/// chain is incomplete.
fn reconstruct_exit(order: &OrderRecord, bot: &BotConfig, fills: &[Fill]) -> Option<OrderClose> {
    let entry_price = order.price?;
    let entry_after = order.exchange_created_at.unwrap_or(order.timestamp);
    let exit_side = match order.side {
        OrderSide::Buy => Side::Ask,
        OrderSide::Sell => Side::Bid,
    };

    let mut closed_qty = Decimal::ZERO;
    let mut notional = Decimal::ZERO;
    let mut last_time = entry_after;
    for fill in fills {
        if fill.symbol != order.symbol
            || fill.side != exit_side
            || fill.timestamp < entry_after
            || !fill
                .client_id
                .as_deref()
                .is_some_and(|id| bot.owns_client_order_id(id))
        {
            continue;
        }
        let take = fill.quantity.min(order.quantity - closed_qty);
        if take <= Decimal::ZERO {
            break;
        }
        closed_qty += take;
        notional += take * fill.price;
        last_time = last_time.max(fill.timestamp);
    }

    if closed_qty < order.quantity || closed_qty.is_zero() {
        return None;
    }

    let close_price = notional / closed_qty;
    let pnl = match order.side {
        OrderSide::Buy => (close_price - entry_price) * closed_qty,
        OrderSide::Sell => (entry_price - close_price) * closed_qty,
    };
    let cost = entry_price * closed_qty;
    let pnl_pct = if cost.is_zero() {
        Decimal::ZERO
    } else {
        pnl / cost * Decimal::ONE_HUNDRED
    };

    Some(OrderClose {
        close_price,
        close_quantity: closed_qty,
        close_time: last_time,
        close_type: CloseType::Auto,
        pnl,
        pnl_pct,
    })
}

fn row_to_order(row: sqlx::sqlite::SqliteRow) -> Result<OrderRecord> {
    Ok(OrderRecord {
        client_order_id: row.get(0),
        external_order_id: row.get(1),
        bot_id: row.get(2),
        symbol: row.get(3),
        side: row.get::<String, _>(4).parse()?,
        order_type: row.get::<String, _>(5).parse()?,
        quantity: parse_decimal(&row.get::<String, _>(6))?,
        price: parse_opt_decimal(row.get::<Option<String>, _>(7))?,
        status: row.get::<String, _>(8).parse()?,
        timestamp: parse_time(&row.get::<String, _>(9))?,
        exchange_created_at: parse_opt_time(row.get::<Option<String>, _>(10))?,
        close_price: parse_opt_decimal(row.get::<Option<String>, _>(11))?,
        close_quantity: parse_opt_decimal(row.get::<Option<String>, _>(12))?,
        close_time: parse_opt_time(row.get::<Option<String>, _>(13))?,
        close_type: row
            .get::<Option<String>, _>(14)
            .map(|s| s.parse())
            .transpose()?,
        pnl: parse_opt_decimal(row.get::<Option<String>, _>(15))?,
        pnl_pct: parse_opt_decimal(row.get::<Option<String>, _>(16))?,
    })
}

pub(crate) fn parse_decimal(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).with_context(|| format!("Invalid decimal '{s}'"))
}

pub(crate) fn parse_opt_decimal(s: Option<String>) -> Result<Option<Decimal>> {
    s.as_deref().map(parse_decimal).transpose()
}

pub(crate) fn parse_time(s: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(s)?.with_timezone(&Utc))
}

pub(crate) fn parse_opt_time(s: Option<String>) -> Result<Option<DateTime<Utc>>> {
    s.as_deref().map(parse_time).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn bot() -> BotConfig {
        serde_json::from_value(serde_json::json!({
            "bot_id": 1, "bot_name": "b1", "strategy": "DEFAULT",
            "api_key": "k", "api_secret": "s", "bot_client_order_id": 7,
            "created_at": "2025-06-01T00:00:00Z", "updated_at": "2025-06-01T00:00:00Z"
        }))
        .unwrap()
    }

    fn fill(side: Side, qty: Decimal, price: Decimal, client_id: &str, at: &str) -> Fill {
        Fill {
            symbol: "SOL_USDC_PERP".to_string(),
            side,
            quantity: qty,
            price,
            order_id: Some("x1".to_string()),
            client_id: Some(client_id.to_string()),
            timestamp: at.parse().unwrap(),
            fee: None,
        }
    }

    fn entry_order(qty: Decimal, price: Decimal) -> OrderRecord {
        OrderRecord {
            client_order_id: "1_7_1".to_string(),
            external_order_id: Some("e1".to_string()),
            bot_id: 1,
            symbol: "SOL_USDC_PERP".to_string(),
            side: OrderSide::Buy,
            order_type: OrderKind::Limit,
            quantity: qty,
            price: Some(price),
            status: OrderStatus::Filled,
            timestamp: "2025-06-01T10:00:00Z".parse().unwrap(),
            exchange_created_at: Some("2025-06-01T10:00:00Z".parse().unwrap()),
            close_price: None,
            close_quantity: None,
            close_time: None,
            close_type: None,
            pnl: None,
            pnl_pct: None,
        }
    }

    #[test]
    fn reconstruct_exit_needs_full_opposite_chain() {
        let order = entry_order(dec!(3), dec!(100));
        let partial = vec![fill(Side::Ask, dec!(2), dec!(110), "1_7_2", "2025-06-01T11:00:00Z")];
        assert!(reconstruct_exit(&order, &bot(), &partial).is_none());

        let complete = vec![
            fill(Side::Ask, dec!(2), dec!(110), "1_7_2", "2025-06-01T11:00:00Z"),
            fill(Side::Ask, dec!(1), dec!(120), "1_7_3", "2025-06-01T12:00:00Z"),
        ];
        let close = reconstruct_exit(&order, &bot(), &complete).unwrap();
        assert_eq!(close.close_quantity, dec!(3));
        // VWAP exit (2*110 + 1*120) / 3
        assert_eq!(close.close_price.round_dp(4), dec!(113.3333));
        assert_eq!(close.pnl.round_dp(2), dec!(40.00));
        assert_eq!(close.close_type, CloseType::Auto);
    }

    #[test]
    fn reconstruct_exit_ignores_foreign_and_earlier_fills() {
        let order = entry_order(dec!(2), dec!(100));
        let fills = vec![
            // Wrong owner prefix.
            fill(Side::Ask, dec!(2), dec!(110), "2_9_1", "2025-06-01T11:00:00Z"),
            // Before the entry.
            fill(Side::Ask, dec!(2), dec!(110), "1_7_9", "2025-06-01T09:00:00Z"),
        ];
        assert!(reconstruct_exit(&order, &bot(), &fills).is_none());
    }

    #[test]
    fn short_entry_pnl_is_inverted() {
        let mut order = entry_order(dec!(2), dec!(100));
        order.side = OrderSide::Sell;
        let fills = vec![fill(Side::Bid, dec!(2), dec!(90), "1_7_2", "2025-06-01T11:00:00Z")];
        let close = reconstruct_exit(&order, &bot(), &fills).unwrap();
        assert_eq!(close.pnl, dec!(20));
        assert_eq!(close.pnl_pct, dec!(10));
    }

    fn open_order(id: &str, client_id: &str, symbol: &str, reduce_only: bool) -> OpenOrder {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "clientId": client_id,
            "symbol": symbol,
            "side": "Ask",
            "orderType": "Limit",
            "quantity": "1",
            "reduceOnly": reduce_only,
        }))
        .unwrap()
    }

    #[test]
    fn plan_cancels_ghosts_past_ttl_only() {
        let mut fresh = entry_order(dec!(1), dec!(100));
        fresh.status = OrderStatus::Pending;
        fresh.client_order_id = "1_7_4".to_string();
        fresh.external_order_id = None;

        let mut stale = fresh.clone();
        stale.client_order_id = "1_7_5".to_string();

        // 5 minutes after the fresh order, 11 after the stale one.
        fresh.timestamp = "2025-06-01T10:06:00Z".parse().unwrap();
        stale.timestamp = "2025-06-01T10:00:00Z".parse().unwrap();
        let now = "2025-06-01T10:11:00Z".parse().unwrap();

        let plan = plan_sync(&[fresh, stale], &[], &[], &bot(), now);
        assert_eq!(plan.len(), 1);
        assert!(matches!(
            &plan[0],
            SyncAction::CancelGhost { client_order_id } if client_order_id == "1_7_5"
        ));
    }

    #[test]
    fn plan_prefers_fill_correction_over_ghost_cancel() {
        let mut pending = entry_order(dec!(1), dec!(100));
        pending.status = OrderStatus::Pending;
        pending.external_order_id = None;
        pending.timestamp = "2025-06-01T09:00:00Z".parse().unwrap();
        let now: DateTime<Utc> = "2025-06-01T10:00:00Z".parse().unwrap();

        let fills = vec![fill(Side::Bid, dec!(1), dec!(100), "1_7_1", "2025-06-01T09:01:00Z")];
        let plan = plan_sync(&[pending], &[], &fills, &bot(), now);
        assert_eq!(plan.len(), 1);
        assert!(matches!(&plan[0], SyncAction::MarkFilled { .. }));
    }

    #[test]
    fn plan_keeps_pending_orders_the_exchange_still_shows() {
        let mut pending = entry_order(dec!(1), dec!(100));
        pending.status = OrderStatus::Pending;
        pending.timestamp = "2025-06-01T09:00:00Z".parse().unwrap();
        let now: DateTime<Utc> = "2025-06-01T10:00:00Z".parse().unwrap();

        let open = vec![open_order("e1", "1_7_1", "SOL_USDC_PERP", false)];
        let plan = plan_sync(&[pending], &open, &[], &bot(), now);
        assert!(plan.is_empty());
    }

    #[test]
    fn plan_patches_missed_close_for_filled_entry() {
        let order = entry_order(dec!(2), dec!(100));
        let fills = vec![fill(Side::Ask, dec!(2), dec!(120), "1_7_2", "2025-06-01T11:00:00Z")];
        let now: DateTime<Utc> = "2025-06-01T12:00:00Z".parse().unwrap();

        let plan = plan_sync(&[order], &[], &fills, &bot(), now);
        assert_eq!(plan.len(), 1);
        match &plan[0] {
            SyncAction::PatchClose { close, .. } => assert_eq!(close.pnl, dec!(40)),
            other => panic!("unexpected action: {other:?}"),
        }
    }

    #[test]
    fn select_orphans_scopes_and_filters() {
        let bot = bot();
        let open_orders = vec![
            open_order("1", "1_7_1", "BTC_USDC_PERP", true),  // orphan
            open_order("2", "1_7_2", "SOL_USDC_PERP", true),  // covered by position
            open_order("3", "2_9_1", "ETH_USDC_PERP", true),  // foreign bot
            open_order("4", "1_7_3", "DOGE_USDC_PERP", false), // not reduce-only
        ];
        let positions: HashSet<String> = ["SOL_USDC_PERP".to_string()].into();

        let full = select_orphans(&open_orders, &positions, None, &bot);
        assert_eq!(full.len(), 1);
        assert_eq!(full[0].id, "1");

        // Local scope without BTC records sees nothing.
        let local: HashSet<String> = ["SOL_USDC_PERP".to_string()].into();
        assert!(select_orphans(&open_orders, &positions, Some(&local), &bot).is_empty());
    }

    #[test]
    fn order_enums_round_trip() {
        for status in [
            OrderStatus::Pending,
            OrderStatus::Filled,
            OrderStatus::Cancelled,
            OrderStatus::Closed,
            OrderStatus::Expired,
        ] {
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        for kind in [
            OrderKind::Market,
            OrderKind::Limit,
            OrderKind::StopLoss,
            OrderKind::TakeProfit,
            OrderKind::ReduceOnlyStop,
            OrderKind::ReduceOnlyLimit,
        ] {
            assert_eq!(kind.as_str().parse::<OrderKind>().unwrap(), kind);
        }
        assert!(OrderKind::Market.is_entry());
        assert!(!OrderKind::ReduceOnlyStop.is_entry());
    }
}
