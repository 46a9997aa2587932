use crate::config_store::ConfigStore;
use crate::order_service::{parse_opt_decimal, parse_time};
use crate::position_tracker::{PositionRecord, PositionSide};
use crate::store::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use perpbot_core::{BotConfig, BusEvent, EventBus, MarketSnapshot};
use perpbot_exchange::{Credentials, ExchangeClient, PlaceOrderRequest, Side};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Arc;

/// Armed trailing-stop state for one `(bot, symbol)`.
#[derive(Debug, Clone)]
pub struct TrailingState {
    pub bot_id: i64,
    pub symbol: String,
    pub active_stop_order_id: Option<String>,
    /// Highest favorable price seen for longs, lowest for shorts.
    pub best_price: Option<Decimal>,
    pub last_trigger_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Per-symbol trailing-stop state machine: arms once unrealized profit
/// clears the activation threshold, then ratchets a reduce-only stop
/// behind the favorable extreme. At most one armed state per
/// `(bot, symbol)`; the engine cancels any previous stop before placing a
/// replacement, so it never double-places.
#[derive(Clone)]
pub struct TrailingStopEngine {
    pool: SqlitePool,
    configs: ConfigStore,
    client: Arc<ExchangeClient>,
    bus: EventBus,
}

impl TrailingStopEngine {
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

    /// One trailing cycle over the bot's open positions. `markets` is the
    /// strategy's market context from the current tick; its ATR feeds the
    /// hybrid mode.
    ///
    /// # Errors
    /// Fails when position or price reads fail; per-symbol stop actions
    /// log and continue.
    pub async fn run_cycle(&self, bot: &BotConfig, markets: &[MarketSnapshot]) -> Result<()> {
        let positions = self.open_positions(bot.bot_id).await?;
        if positions.is_empty() {
            return Ok(());
        }

        let credentials = Credentials::new(&bot.api_key, &bot.api_secret);
        let atr_by_symbol: HashMap<&str, Decimal> = markets
            .iter()
            .filter_map(|m| m.atr.map(|atr| (m.symbol.as_str(), atr)))
            .collect();
        let marks = self.mark_prices(&credentials, markets).await;

        for position in &positions {
            let Some(mark) = marks.get(position.symbol.as_str()).copied() else {
                continue;
            };

            // Max-loss guard runs before any trailing arithmetic: a
            // position past its loss budget is flattened at market.
            let pnl_pct = unrealized_pnl_pct(position, mark);
            if pnl_pct <= bot.max_negative_pnl_stop_pct {
                if let Err(e) = self
                    .close_at_market(bot, &credentials, position, pnl_pct)
                    .await
                {
                    tracing::warn!(
                        "Bot {} max-loss close failed for {}: {e:#}",
                        bot.bot_id,
                        position.symbol
                    );
                }
                continue;
            }

            let atr = atr_by_symbol.get(position.symbol.as_str()).copied();
            if let Err(e) = self
                .advance_symbol(bot, &credentials, position, mark, atr)
                .await
            {
                tracing::warn!(
                    "Bot {} trailing cycle failed for {}: {e:#}",
                    bot.bot_id,
                    position.symbol
                );
            }
        }
        Ok(())
    }

    /// Reduce-only market exit for a position past `max_negative_pnl_stop_pct`.
    async fn close_at_market(
        &self,
        bot: &BotConfig,
        credentials: &Credentials,
        position: &PositionRecord,
        pnl_pct: Decimal,
    ) -> Result<()> {
        tracing::warn!(
            "Bot {} closing {} at market: unrealized {}% breaches stop at {}%",
            bot.bot_id,
            position.symbol,
            pnl_pct.round_dp(2),
            bot.max_negative_pnl_stop_pct
        );

        // Cancel the armed stop first so the exits cannot double-fill.
        if let Some(state) = self.get_state(bot.bot_id, &position.symbol).await? {
            if let Some(stop_id) = state.active_stop_order_id.as_deref() {
                match self
                    .client
                    .cancel_order(credentials, &position.symbol, stop_id)
                    .await
                {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e).context("Failed to cancel stop before max-loss exit"),
                }
            }
            self.delete_state(bot.bot_id, &position.symbol).await?;
        }

        let side = match position.side {
            PositionSide::Long => Side::Ask,
            PositionSide::Short => Side::Bid,
        };
        let client_order_id = self.configs.next_order_id(bot.bot_id).await?;
        let mut request = PlaceOrderRequest::market(
            position.symbol.clone(),
            side,
            position.current_quantity,
        )
        .with_client_id(client_order_id);
        request.reduce_only = Some(true);
        self.client
            .place_order(credentials, &request)
            .await
            .context("Failed to place max-loss market exit")?;
        Ok(())
    }

    async fn advance_symbol(
        &self,
        bot: &BotConfig,
        credentials: &Credentials,
        position: &PositionRecord,
        mark: Decimal,
        atr: Option<Decimal>,
    ) -> Result<()> {
        let state = self.get_state(bot.bot_id, &position.symbol).await?;
        let distance_pct = distance_pct(bot, atr, mark);

        match state {
            None => {
                let profit_pct = unrealized_pnl_pct(position, mark);
                let activation = bot
                    .trailing
                    .resolved_activation_pct(bot.min_profit_percentage);
                if profit_pct < activation {
                    return Ok(());
                }

                // Hybrid mode arms at the wider initial-stop distance and
                // pairs the stop with a partial take-profit.
                let arming_distance = if bot.features.enable_hybrid_stop_strategy {
                    initial_distance_pct(bot, atr, mark)
                } else {
                    distance_pct
                };
                let trigger = trigger_price(position.side, mark, arming_distance);
                let stop_id = self
                    .place_stop(bot, credentials, position, trigger)
                    .await?;
                if bot.features.enable_hybrid_stop_strategy {
                    if let Some(atr) = atr {
                        if let Err(e) = self
                            .place_partial_take_profit(bot, credentials, position, atr)
                            .await
                        {
                            tracing::warn!(
                                "Bot {} partial take-profit failed on {}: {e:#}",
                                bot.bot_id,
                                position.symbol
                            );
                        }
                    }
                }
                self.upsert_state(bot.bot_id, &position.symbol, Some(&stop_id), mark, trigger)
                    .await?;
                self.bus.publish(BusEvent::TrailingStopUpdate {
                    bot_id: bot.bot_id,
                    symbol: position.symbol.clone(),
                    trigger_price: trigger,
                    timestamp: Utc::now(),
                });
                tracing::info!(
                    "Bot {} armed trailing stop on {} at {} ({}% behind {})",
                    bot.bot_id,
                    position.symbol,
                    trigger,
                    distance_pct,
                    mark
                );
            }
            Some(state) => {
                let best = state.best_price.unwrap_or(mark);
                let improved = match position.side {
                    PositionSide::Long => mark > best,
                    PositionSide::Short => mark < best,
                };
                if !improved {
                    return Ok(());
                }

                let trigger = trigger_price(position.side, mark, distance_pct);
                // Only ratchet in the protective direction.
                let tightens = match (position.side, state.last_trigger_price) {
                    (_, None) => true,
                    (PositionSide::Long, Some(prev)) => trigger > prev,
                    (PositionSide::Short, Some(prev)) => trigger < prev,
                };
                if !tightens {
                    return Ok(());
                }

                if let Some(stop_id) = state.active_stop_order_id.as_deref() {
                    match self
                        .client
                        .cancel_order(credentials, &position.symbol, stop_id)
                        .await
                    {
                        Ok(()) => {}
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e).context("Failed to cancel previous stop"),
                    }
                }

                let stop_id = self
                    .place_stop(bot, credentials, position, trigger)
                    .await?;
                self.upsert_state(bot.bot_id, &position.symbol, Some(&stop_id), mark, trigger)
                    .await?;
                self.bus.publish(BusEvent::TrailingStopUpdate {
                    bot_id: bot.bot_id,
                    symbol: position.symbol.clone(),
                    trigger_price: trigger,
                    timestamp: Utc::now(),
                });
            }
        }
        Ok(())
    }

    async fn place_stop(
        &self,
        bot: &BotConfig,
        credentials: &Credentials,
        position: &PositionRecord,
        trigger: Decimal,
    ) -> Result<String> {
        let side = match position.side {
            PositionSide::Long => Side::Ask,
            PositionSide::Short => Side::Bid,
        };
        let client_order_id = self.configs.next_order_id(bot.bot_id).await?;
        let request = PlaceOrderRequest::reduce_only_stop(
            position.symbol.clone(),
            side,
            position.current_quantity,
            trigger,
        )
        .with_client_id(client_order_id);

        let ack = self
            .client
            .place_order(credentials, &request)
            .await
            .context("Failed to place trailing stop")?;
        Ok(ack.id)
    }

    /// Partial exit at `entry ± atr · partialTakeProfitAtrMultiplier`, for
    /// `partialTakeProfitPercentage` of the position.
    async fn place_partial_take_profit(
        &self,
        bot: &BotConfig,
        credentials: &Credentials,
        position: &PositionRecord,
        atr: Decimal,
    ) -> Result<()> {
        let offset = atr * bot.trailing.partial_take_profit_atr_multiplier;
        let (price, side) = match position.side {
            PositionSide::Long => (position.entry_price + offset, Side::Ask),
            PositionSide::Short => (position.entry_price - offset, Side::Bid),
        };
        let quantity = (position.current_quantity * bot.trailing.partial_take_profit_percentage
            / Decimal::ONE_HUNDRED)
            .round_dp(4);
        if quantity.is_zero() {
            return Ok(());
        }

        let client_order_id = self.configs.next_order_id(bot.bot_id).await?;
        let mut request =
            PlaceOrderRequest::limit(position.symbol.clone(), side, quantity, price)
                .with_client_id(client_order_id);
        request.reduce_only = Some(true);
        self.client
            .place_order(credentials, &request)
            .await
            .context("Failed to place partial take-profit")?;
        Ok(())
    }

    /// Removes trailing states whose position is gone from the exchange.
    ///
    /// # Errors
    /// Fails when the exchange read fails.
    pub async fn clean_orphaned_trailing_states(
        &self,
        credentials: &Credentials,
        bot_id: i64,
    ) -> Result<u32> {
        let positions = self.client.get_positions_cached(credentials).await?;
        let open_symbols: Vec<&str> = positions
            .iter()
            .filter(|p| p.is_open())
            .map(|p| p.symbol.as_str())
            .collect();

        let states = self.list_states(bot_id).await?;
        let mut removed = 0;
        for state in states {
            if open_symbols.contains(&state.symbol.as_str()) {
                continue;
            }
            self.delete_state(bot_id, &state.symbol).await?;
            tracing::info!(
                "Bot {} removed trailing state for {} (no open position)",
                bot_id,
                state.symbol
            );
            removed += 1;
        }
        Ok(removed)
    }

    /// Reconciles `active_stop_order_id` with the exchange's reduce-only
    /// orders. A position without its stop gets one recreated (ATR
    /// distance when available, configured distance otherwise); a failed
    /// recreation clears the stale id.
    ///
    /// # Errors
    /// Fails when the exchange reads fail.
    pub async fn sync_active_stops(&self, bot: &BotConfig) -> Result<()> {
        let credentials = Credentials::new(&bot.api_key, &bot.api_secret);
        let states = self.list_states(bot.bot_id).await?;
        if states.is_empty() {
            return Ok(());
        }

        let open_orders = self
            .client
            .get_open_orders(&credentials, None, "PERP")
            .await?;
        let positions = self.open_positions(bot.bot_id).await?;
        let positions_by_symbol: HashMap<&str, &PositionRecord> =
            positions.iter().map(|p| (p.symbol.as_str(), p)).collect();

        for state in states {
            let stop_live = state.active_stop_order_id.as_deref().is_some_and(|id| {
                open_orders
                    .iter()
                    .any(|o| o.id == id && o.is_reduce_only())
            });
            if stop_live {
                continue;
            }

            let Some(position) = positions_by_symbol.get(state.symbol.as_str()) else {
                // No position either; the cleaner owns this row.
                continue;
            };

            let mark = state.best_price.unwrap_or(position.entry_price);
            let distance = distance_pct(bot, None, mark);
            let trigger = trigger_price(position.side, mark, distance);

            match self.place_stop(bot, &credentials, position, trigger).await {
                Ok(stop_id) => {
                    self.upsert_state(bot.bot_id, &state.symbol, Some(&stop_id), mark, trigger)
                        .await?;
                    tracing::info!(
                        "Bot {} recreated missing trailing stop on {} at {}",
                        bot.bot_id,
                        state.symbol,
                        trigger
                    );
                }
                Err(e) => {
                    tracing::warn!(
                        "Bot {} could not recreate stop on {}: {e:#}; clearing stale id",
                        bot.bot_id,
                        state.symbol
                    );
                    self.clear_active_stop(bot.bot_id, &state.symbol).await?;
                }
            }
        }
        Ok(())
    }

    /// # Errors
    /// Fails when the write fails.
    pub async fn clear_states_by_bot_id(&self, bot_id: i64) -> Result<u64> {
        let result = sqlx::query("DELETE FROM trailing_states WHERE bot_id = ?1")
            .bind(bot_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // ------------------------------------------------------------------
    // State persistence
    // ------------------------------------------------------------------

    /// # Errors
    /// Fails when the read fails.
    pub async fn get_state(&self, bot_id: i64, symbol: &str) -> Result<Option<TrailingState>> {
        let row = sqlx::query(&format!(
            "{STATE_SELECT} WHERE bot_id = ?1 AND symbol = ?2"
        ))
        .bind(bot_id)
        .bind(symbol)
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_state).transpose()
    }

    async fn list_states(&self, bot_id: i64) -> Result<Vec<TrailingState>> {
        let rows = sqlx::query(&format!("{STATE_SELECT} WHERE bot_id = ?1"))
            .bind(bot_id)
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(row_to_state).collect()
    }

    async fn upsert_state(
        &self,
        bot_id: i64,
        symbol: &str,
        stop_order_id: Option<&str>,
        best_price: Decimal,
        trigger: Decimal,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r"
            INSERT INTO trailing_states (bot_id, symbol, active_stop_order_id, best_price,
                                         last_trigger_price, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            ON CONFLICT(bot_id, symbol) DO UPDATE SET
                active_stop_order_id = excluded.active_stop_order_id,
                best_price = excluded.best_price,
                last_trigger_price = excluded.last_trigger_price,
                updated_at = excluded.updated_at
            ",
        )
        .bind(bot_id)
        .bind(symbol)
        .bind(stop_order_id)
        .bind(best_price.to_string())
        .bind(trigger.to_string())
        .bind(&now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear_active_stop(&self, bot_id: i64, symbol: &str) -> Result<()> {
        sqlx::query(
            r"
            UPDATE trailing_states SET active_stop_order_id = NULL, updated_at = ?3
            WHERE bot_id = ?1 AND symbol = ?2
            ",
        )
        .bind(bot_id)
        .bind(symbol)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete_state(&self, bot_id: i64, symbol: &str) -> Result<()> {
        sqlx::query("DELETE FROM trailing_states WHERE bot_id = ?1 AND symbol = ?2")
            .bind(bot_id)
            .bind(symbol)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn open_positions(&self, bot_id: i64) -> Result<Vec<PositionRecord>> {
        let rows = sqlx::query(
            r"
            SELECT position_id, bot_id, symbol, side, entry_price, initial_quantity,
                   current_quantity, pnl, status, created_at, updated_at
            FROM positions
            WHERE bot_id = ?1 AND status IN ('OPEN', 'PARTIALLY_CLOSED')
            ",
        )
        .bind(bot_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(crate::position_tracker::row_to_position)
            .collect()
    }

    /// Mark prices per symbol: strategy context first, the cached
    /// exchange positions as fallback.
    async fn mark_prices(
        &self,
        credentials: &Credentials,
        markets: &[MarketSnapshot],
    ) -> HashMap<String, Decimal> {
        let mut marks: HashMap<String, Decimal> = markets
            .iter()
            .map(|m| (m.symbol.clone(), m.last_price))
            .collect();

        match self.client.get_positions_cached(credentials).await {
            Ok(positions) => {
                for position in positions {
                    if let Some(mark) = position.mark_price {
                        marks.entry(position.symbol).or_insert(mark);
                    }
                }
            }
            Err(e) => {
                tracing::debug!("Mark-price fallback unavailable: {e}");
            }
        }
        marks
    }
}

const STATE_SELECT: &str = r"
    SELECT bot_id, symbol, active_stop_order_id, best_price, last_trigger_price,
           created_at, updated_at
    FROM trailing_states";

fn row_to_state(row: sqlx::sqlite::SqliteRow) -> Result<TrailingState> {
    Ok(TrailingState {
        bot_id: row.get(0),
        symbol: row.get(1),
        active_stop_order_id: row.get(2),
        best_price: parse_opt_decimal(row.get::<Option<String>, _>(3))?,
        last_trigger_price: parse_opt_decimal(row.get::<Option<String>, _>(4))?,
        created_at: parse_time(&row.get::<String, _>(5))?,
        updated_at: parse_time(&row.get::<String, _>(6))?,
    })
}

/// Stop distance in percent of price. In hybrid mode the distance comes
/// from the ATR and its multiplier; otherwise the configured percentage.
#[must_use]
pub fn distance_pct(bot: &BotConfig, atr: Option<Decimal>, mark: Decimal) -> Decimal {
    if bot.features.enable_hybrid_stop_strategy {
        if let Some(atr) = atr {
            if !mark.is_zero() {
                return (atr * bot.trailing.trailing_stop_atr_multiplier / mark
                    * Decimal::ONE_HUNDRED)
                    .max(Decimal::new(1, 1));
            }
        }
    }
    bot.trailing.distance_pct
}

/// Arming distance for hybrid mode, from the initial-stop multiplier.
#[must_use]
pub fn initial_distance_pct(bot: &BotConfig, atr: Option<Decimal>, mark: Decimal) -> Decimal {
    if let Some(atr) = atr {
        if !mark.is_zero() {
            return (atr * bot.trailing.initial_stop_atr_multiplier / mark
                * Decimal::ONE_HUNDRED)
                .max(Decimal::new(1, 1));
        }
    }
    bot.trailing.distance_pct
}

/// Unrealized P&L percent of a position at `mark`.
#[must_use]
pub fn unrealized_pnl_pct(position: &PositionRecord, mark: Decimal) -> Decimal {
    if position.entry_price.is_zero() {
        return Decimal::ZERO;
    }
    let raw = (mark - position.entry_price) / position.entry_price * Decimal::ONE_HUNDRED;
    match position.side {
        PositionSide::Long => raw,
        PositionSide::Short => -raw,
    }
}

/// Stop trigger `distance_pct` behind `mark`, on the protective side.
#[must_use]
pub fn trigger_price(side: PositionSide, mark: Decimal, distance_pct: Decimal) -> Decimal {
    let offset = mark * distance_pct / Decimal::ONE_HUNDRED;
    match side {
        PositionSide::Long => mark - offset,
        PositionSide::Short => mark + offset,
    }
}
