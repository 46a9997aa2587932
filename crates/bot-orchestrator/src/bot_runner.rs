use crate::config_store::ConfigStore;
use crate::monitor::{run_monitor, MonitorKind};
use crate::order_service::OrderService;
use crate::position_tracker::PositionTracker;
use crate::trailing_stop::TrailingStopEngine;
use anyhow::{Context, Result};
use chrono::{Duration as ChronoDuration, Utc};
use perpbot_core::{BotConfig, BotStatus, BusEvent, EventBus, ExecutionMode, StrategyRegistry};
use perpbot_exchange::{Credentials, ExchangeClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Fixed decision cadence in REALTIME mode.
const REALTIME_PERIOD: Duration = Duration::from_secs(60);
/// Hard ceiling on one ON_CANDLE_CLOSE decision tick.
const CANDLE_TICK_TIMEOUT: Duration = Duration::from_secs(180);
/// Window of the per-tick P&L summary.
const SUMMARY_WINDOW_HOURS: i64 = 24;

/// Collaborators a runner needs; built once at startup and cloned per bot.
#[derive(Clone)]
pub struct RunnerDeps {
    pub configs: ConfigStore,
    pub orders: OrderService,
    pub positions: PositionTracker,
    pub trailing: TrailingStopEngine,
    pub client: Arc<ExchangeClient>,
    pub bus: EventBus,
    pub registry: Arc<StrategyRegistry>,
}

/// Handle to one live bot's tasks. Dropping it does NOT stop the bot;
/// call [`stop`](Self::stop).
pub struct RunnerHandle {
    bot_id: i64,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunnerHandle {
    /// Signals every task and waits until none of them can fire a timer
    /// again. An in-flight monitor callback finishes first; its reschedule
    /// is dropped.
    pub async fn stop(mut self) {
        let _ = self.stop_tx.send(true);
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    tracing::warn!("Bot {} task ended abnormally: {e}", self.bot_id);
                }
            }
        }
    }

    #[must_use]
    pub const fn bot_id(&self) -> i64 {
        self.bot_id
    }
}

/// Drives one bot: the decision loop plus its monitor loops, until
/// stopped. Operates on a frozen snapshot of the configuration; edits
/// take effect on restart.
pub struct BotRunner;

impl BotRunner {
    /// Spawns all tasks for `bot` and returns their handle.
    #[must_use]
    pub fn spawn(bot: BotConfig, deps: RunnerDeps) -> RunnerHandle {
        let (stop_tx, stop_rx) = watch::channel(false);
        let bot_id = bot.bot_id;
        let bot = Arc::new(bot);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(decision_loop(
            bot.clone(),
            deps.clone(),
            stop_rx.clone(),
        )));

        if bot.features.enable_pending_monitor {
            let bot = bot.clone();
            let orders = deps.orders.clone();
            tasks.push(tokio::spawn(run_monitor(
                MonitorKind::PendingOrders,
                bot_id,
                stop_rx.clone(),
                move |_state| {
                    let bot = bot.clone();
                    let orders = orders.clone();
                    async move {
                        orders.expire_stale_pending(&bot).await?;
                        orders.sync_with_exchange(&bot).await?;
                        Ok(())
                    }
                },
            )));
        }

        if bot.features.enable_orphan_monitor {
            let bot = bot.clone();
            let orders = deps.orders.clone();
            tasks.push(tokio::spawn(run_monitor(
                MonitorKind::OrphanOrders,
                bot_id,
                stop_rx.clone(),
                move |state| {
                    let bot = bot.clone();
                    let orders = orders.clone();
                    let full_scan = state.take_full_scan_due();
                    async move {
                        orders.scan_and_cleanup_orphans(&bot, full_scan).await?;
                        Ok(())
                    }
                },
            )));
        }

        {
            let bot = bot.clone();
            let orders = deps.orders.clone();
            tasks.push(tokio::spawn(run_monitor(
                MonitorKind::TakeProfit,
                bot_id,
                stop_rx.clone(),
                move |_state| {
                    let bot = bot.clone();
                    let orders = orders.clone();
                    async move {
                        orders.ensure_take_profit_orders(&bot).await?;
                        Ok(())
                    }
                },
            )));
        }

        if bot.features.enable_trailing_stop {
            {
                let bot = bot.clone();
                let trailing = deps.trailing.clone();
                tasks.push(tokio::spawn(run_monitor(
                    MonitorKind::TrailingCleaner,
                    bot_id,
                    stop_rx.clone(),
                    move |_state| {
                        let bot = bot.clone();
                        let trailing = trailing.clone();
                        async move {
                            let credentials = Credentials::new(&bot.api_key, &bot.api_secret);
                            trailing
                                .clean_orphaned_trailing_states(&credentials, bot.bot_id)
                                .await?;
                            Ok(())
                        }
                    },
                )));
            }
            {
                let bot = bot.clone();
                let trailing = deps.trailing.clone();
                tasks.push(tokio::spawn(run_monitor(
                    MonitorKind::TrailingSync,
                    bot_id,
                    stop_rx,
                    move |_state| {
                        let bot = bot.clone();
                        let trailing = trailing.clone();
                        async move {
                            trailing.sync_active_stops(&bot).await?;
                            Ok(())
                        }
                    },
                )));
            }
        }

        RunnerHandle {
            bot_id,
            stop_tx,
            tasks,
        }
    }
}

/// The decision schedule. REALTIME ticks immediately and then every 60
/// seconds; ON_CANDLE_CLOSE waits for the close of the bot's timeframe and
/// reschedules identically after every tick, success or failure, so a
/// throwing tick never stalls the calendar.
async fn decision_loop(bot: Arc<BotConfig>, deps: RunnerDeps, mut stop: watch::Receiver<bool>) {
    let mode = bot.effective_execution_mode();
    let mut first = true;

    loop {
        let delay = match mode {
            ExecutionMode::Realtime => {
                if first {
                    Duration::ZERO
                } else {
                    REALTIME_PERIOD
                }
            }
            ExecutionMode::OnCandleClose => bot.timeframe.next_close_delay(Utc::now()),
        };
        first = false;

        if !delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                _ = stop.wait_for(|stopped| *stopped) => return,
            }
        }
        if *stop.borrow() {
            return;
        }

        let tick = decision_tick(&bot, &deps);
        let result = match mode {
            ExecutionMode::OnCandleClose => {
                tokio::select! {
                    result = tokio::time::timeout(CANDLE_TICK_TIMEOUT, tick) => {
                        match result {
                            Ok(result) => result,
                            Err(_) => {
                                // Abandon the stuck tick; the next close is
                                // scheduled immediately by the loop.
                                tracing::warn!(
                                    "Bot {} decision tick exceeded {:?}; abandoned",
                                    bot.bot_id,
                                    CANDLE_TICK_TIMEOUT
                                );
                                continue;
                            }
                        }
                    }
                    _ = stop.wait_for(|stopped| *stopped) => return,
                }
            }
            ExecutionMode::Realtime => {
                tokio::select! {
                    result = tick => result,
                    _ = stop.wait_for(|stopped| *stopped) => return,
                }
            }
        };

        match result {
            Ok(next_run_at) => {
                deps.bus.publish(BusEvent::BotExecutionSuccess {
                    bot_id: bot.bot_id,
                    timestamp: Utc::now(),
                    next_run_at,
                });
            }
            Err(e) => {
                tracing::error!("Bot {} decision tick failed: {e:#}", bot.bot_id);
                if let Err(e) = deps
                    .configs
                    .set_status(bot.bot_id, BotStatus::Error, None)
                    .await
                {
                    tracing::warn!("Bot {} could not persist error status: {e}", bot.bot_id);
                }
                deps.bus.publish(BusEvent::BotExecutionError {
                    bot_id: bot.bot_id,
                    timestamp: Utc::now(),
                    message: format!("{e:#}"),
                });
            }
        }
    }
}

/// One decision tick. Returns the instant the next tick is due, which is
/// also persisted as `next_validation_at`.
async fn decision_tick(
    bot: &BotConfig,
    deps: &RunnerDeps,
) -> Result<chrono::DateTime<Utc>> {
    deps.configs
        .set_status(bot.bot_id, BotStatus::Running, None)
        .await
        .context("Failed to set running status")?;

    // Drop coalesced waiters from previous cycles before analyzing.
    deps.client.force_reset().await;

    let strategy = deps
        .registry
        .resolve(bot.strategy)
        .with_context(|| format!("Strategy {} not registered", bot.strategy.as_str()))?;
    let decision = strategy
        .analyze(bot.timeframe, bot)
        .await
        .context("Strategy analysis failed")?;

    let submitted = deps.orders.submit_intents(bot, &decision.intents).await?;
    if submitted > 0 {
        tracing::info!("Bot {} submitted {} orders", bot.bot_id, submitted);
    }

    if bot.features.enable_trailing_stop {
        deps.trailing
            .run_cycle(bot, &decision.markets)
            .await
            .context("Trailing-stop cycle failed")?;
    }

    // Best-effort daily summary; never fails the tick.
    match deps
        .positions
        .recent_pnl_summary(bot, ChronoDuration::hours(SUMMARY_WINDOW_HOURS))
        .await
    {
        Ok(stats) => {
            deps.bus.publish(BusEvent::DecisionAnalysis {
                bot_id: bot.bot_id,
                timestamp: Utc::now(),
                total_trades: stats.total_trades,
                total_pnl: stats.total_pnl,
                win_rate: stats.win_rate,
            });
        }
        Err(e) => {
            tracing::warn!("Bot {} P&L summary unavailable: {e:#}", bot.bot_id);
        }
    }

    let interval = match bot.effective_execution_mode() {
        ExecutionMode::Realtime => ChronoDuration::seconds(60),
        ExecutionMode::OnCandleClose => {
            ChronoDuration::milliseconds(bot.timeframe.as_millis())
        }
    };
    let next_run_at = match bot.effective_execution_mode() {
        ExecutionMode::Realtime => Utc::now() + interval,
        ExecutionMode::OnCandleClose => bot.timeframe.next_close(Utc::now()),
    };
    deps.configs
        .set_next_validation_at(bot.bot_id, next_run_at)
        .await?;

    Ok(next_run_at)
}
