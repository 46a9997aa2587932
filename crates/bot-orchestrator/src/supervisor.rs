use crate::bot_runner::{BotRunner, RunnerDeps, RunnerHandle};
use crate::config_store::ConfigStore;
use anyhow::{bail, Context, Result};
use chrono::Utc;
use perpbot_core::{BotStatus, BusEvent};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Delay between the stop and start halves of a restart.
const RESTART_DELAY: Duration = Duration::from_millis(500);

/// Owns the set of live bot runners and drives the persisted lifecycle
/// state machine:
///
/// ```text
/// stopped --start--> starting --first tick ok--> running
/// running --stop--> stopped
/// running --tick error--> error
/// error   --start(force)/recover--> starting
/// ```
pub struct BotSupervisor {
    configs: ConfigStore,
    deps: RunnerDeps,
    runners: RwLock<HashMap<i64, RunnerHandle>>,
}

impl BotSupervisor {
    #[must_use]
    pub fn new(configs: ConfigStore, deps: RunnerDeps) -> Arc<Self> {
        Arc::new(Self {
            configs,
            deps,
            runners: RwLock::new(HashMap::new()),
        })
    }

    /// Starts a bot. Fails on precondition violations (unknown bot,
    /// disabled, missing credentials, unregistered strategy, already
    /// running without `force_restart`) without touching the persisted
    /// error state.
    ///
    /// # Errors
    /// Returns the precondition or persistence error.
    pub async fn start_bot(&self, bot_id: i64, force_restart: bool) -> Result<()> {
        if self.runners.read().await.contains_key(&bot_id) {
            if !force_restart {
                bail!("Bot {bot_id} is already running");
            }
            self.stop_bot(bot_id, true).await?;
        }

        let config = self
            .configs
            .get(bot_id)
            .await?
            .with_context(|| format!("Bot {bot_id} not found"))?;
        if config.strategy.is_externally_managed() {
            bail!(
                "Bot {bot_id} uses externally managed strategy {}",
                config.strategy.as_str()
            );
        }
        if !self.configs.can_start(bot_id, &self.deps.registry).await? {
            bail!(
                "Bot {bot_id} cannot start (enabled: {}, status: {})",
                config.enabled,
                config.status.as_str()
            );
        }

        self.configs
            .set_status(bot_id, BotStatus::Starting, Some(Some(Utc::now())))
            .await?;
        self.deps.bus.publish(BusEvent::BotStarting {
            bot_id,
            timestamp: Utc::now(),
        });

        // Re-read so the runner's frozen snapshot carries the new status.
        let config = self
            .configs
            .get(bot_id)
            .await?
            .with_context(|| format!("Bot {bot_id} disappeared during start"))?;
        let handle = BotRunner::spawn(config, self.deps.clone());
        self.runners.write().await.insert(bot_id, handle);

        self.deps.bus.publish(BusEvent::BotStarted {
            bot_id,
            timestamp: Utc::now(),
        });
        tracing::info!("Bot {} started", bot_id);
        Ok(())
    }

    /// Stops a bot. Idempotent: succeeds even when no in-memory runner
    /// exists. Once this returns, no timer of the bot can fire again.
    ///
    /// # Errors
    /// Returns persistence errors from the status write.
    pub async fn stop_bot(&self, bot_id: i64, update_status: bool) -> Result<()> {
        let handle = self.runners.write().await.remove(&bot_id);
        if let Some(handle) = handle {
            handle.stop().await;
            tracing::info!("Bot {} runner stopped", bot_id);
        }

        if update_status {
            // A stop on a deleted bot is still a success.
            if self.configs.get(bot_id).await?.is_some() {
                self.configs
                    .set_status(bot_id, BotStatus::Stopped, Some(None))
                    .await?;
            }
            self.deps.bus.publish(BusEvent::BotStopped {
                bot_id,
                timestamp: Utc::now(),
            });
        }
        Ok(())
    }

    /// Stop, short pause, start. The old runner's timers are all cancelled
    /// before the new runner installs its own.
    ///
    /// # Errors
    /// Returns the stop or start error.
    pub async fn restart_bot(&self, bot_id: i64) -> Result<()> {
        self.stop_bot(bot_id, true).await?;
        tokio::time::sleep(RESTART_DELAY).await;
        self.start_bot(bot_id, false).await
    }

    /// On process boot: relaunches every traditional enabled bot whose
    /// persisted status says it was live (or wedged in error) when the
    /// process last died.
    ///
    /// # Errors
    /// Returns read errors; per-bot start failures are logged and skipped.
    pub async fn recover_all(&self) -> Result<Vec<i64>> {
        let candidates = self.configs.list_traditional().await?;
        let mut recovered = Vec::new();

        for config in candidates {
            if !config.enabled {
                continue;
            }
            if !matches!(
                config.status,
                BotStatus::Running | BotStatus::Starting | BotStatus::Error
            ) {
                continue;
            }

            // Clear the stale state so the start preconditions hold.
            if let Err(e) = self
                .configs
                .set_status(config.bot_id, BotStatus::Stopped, None)
                .await
            {
                tracing::error!("Recovery: could not reset bot {}: {e}", config.bot_id);
                continue;
            }
            match self.start_bot(config.bot_id, false).await {
                Ok(()) => {
                    tracing::info!("Recovered bot {} ({})", config.bot_id, config.bot_name);
                    recovered.push(config.bot_id);
                }
                Err(e) => {
                    tracing::error!("Recovery: failed to start bot {}: {e:#}", config.bot_id);
                }
            }
        }
        Ok(recovered)
    }

    /// Stops every running bot without touching persisted status, so the
    /// next boot's recovery relaunches them.
    pub async fn shutdown_all(&self) {
        let handles: Vec<RunnerHandle> = {
            let mut runners = self.runners.write().await;
            runners.drain().map(|(_, handle)| handle).collect()
        };
        let count = handles.len();
        for handle in handles {
            handle.stop().await;
        }
        if count > 0 {
            tracing::info!("Shut down {} bots", count);
        }
    }

    /// Bot ids with a live in-memory runner.
    #[must_use]
    pub async fn running_bots(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.runners.read().await.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    #[must_use]
    pub async fn is_running(&self, bot_id: i64) -> bool {
        self.runners.read().await.contains_key(&bot_id)
    }

    /// Deletes a bot: stops its runner, then cascades the removal of its
    /// orders, positions, and trailing states.
    ///
    /// # Errors
    /// Returns persistence errors.
    pub async fn delete_bot(&self, bot_id: i64) -> Result<()> {
        self.stop_bot(bot_id, false).await?;
        self.configs.delete(bot_id).await?;
        tracing::info!("Bot {} deleted", bot_id);
        Ok(())
    }

    #[must_use]
    pub const fn configs(&self) -> &ConfigStore {
        &self.configs
    }

    #[must_use]
    pub const fn deps(&self) -> &RunnerDeps {
        &self.deps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order_service::OrderService;
    use crate::position_tracker::PositionTracker;
    use crate::store::Database;
    use crate::trailing_stop::TrailingStopEngine;
    use async_trait::async_trait;
    use perpbot_core::{
        BotConfig, Decision, EventBus, NewBot, Strategy, StrategyKind, StrategyRegistry, Timeframe,
    };
    use perpbot_exchange::ExchangeClient;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingStrategy {
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl Strategy for CountingStrategy {
        async fn analyze(&self, _timeframe: Timeframe, _config: &BotConfig) -> Result<Decision> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Decision::default())
        }

        fn name(&self) -> &str {
            "counting"
        }
    }

    async fn supervisor(calls: Arc<AtomicU32>) -> Arc<BotSupervisor> {
        let db = Database::open_in_memory().await.unwrap();
        let configs = ConfigStore::new(&db);
        let bus = EventBus::default();
        let client = Arc::new(ExchangeClient::new("http://127.0.0.1:1"));
        let orders = OrderService::new(&db, configs.clone(), client.clone(), bus.clone());
        let positions =
            PositionTracker::new(&db, configs.clone(), orders.clone(), client.clone());
        let trailing =
            TrailingStopEngine::new(&db, configs.clone(), client.clone(), bus.clone());

        let mut registry = StrategyRegistry::new();
        registry.register(StrategyKind::Default, Arc::new(CountingStrategy { calls }));

        let deps = RunnerDeps {
            configs: configs.clone(),
            orders,
            positions,
            trailing,
            client,
            bus,
            registry: Arc::new(registry),
        };
        BotSupervisor::new(configs, deps)
    }

    async fn create_bot(supervisor: &BotSupervisor, name: &str) -> i64 {
        let new: NewBot = serde_json::from_value(serde_json::json!({
            "bot_name": name,
            "strategy": "DEFAULT",
            "api_key": "k",
            "api_secret": "s",
            "timeframe": "5m",
            "execution_mode": "REALTIME",
            "features": {
                "enable_trailing_stop": false,
                "enable_orphan_monitor": false,
                "enable_pending_monitor": false,
            }
        }))
        .unwrap();
        supervisor.configs().create(new).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn create_start_stop_lifecycle() {
        let calls = Arc::new(AtomicU32::new(0));
        let supervisor = supervisor(calls.clone()).await;
        let bot_id = create_bot(&supervisor, "b1").await;
        assert_eq!(bot_id, 1);

        supervisor.start_bot(bot_id, false).await.unwrap();
        assert!(supervisor.is_running(bot_id).await);

        // Within the first second the decision tick has run and the
        // persisted status is running.
        tokio::time::sleep(Duration::from_millis(900)).await;
        assert!(calls.load(Ordering::SeqCst) >= 1);
        let config = supervisor.configs().get(bot_id).await.unwrap().unwrap();
        assert_eq!(config.status, BotStatus::Running);
        assert!(config.start_time.is_some());

        supervisor.stop_bot(bot_id, true).await.unwrap();
        assert!(!supervisor.is_running(bot_id).await);
        let config = supervisor.configs().get(bot_id).await.unwrap().unwrap();
        assert_eq!(config.status, BotStatus::Stopped);

        // No further ticks after stop.
        let after = calls.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), after);
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_requires_force() {
        let calls = Arc::new(AtomicU32::new(0));
        let supervisor = supervisor(calls).await;
        let bot_id = create_bot(&supervisor, "b1").await;

        supervisor.start_bot(bot_id, false).await.unwrap();
        let err = supervisor.start_bot(bot_id, false).await.unwrap_err();
        assert!(err.to_string().contains("already running"));

        supervisor.start_bot(bot_id, true).await.unwrap();
        assert!(supervisor.is_running(bot_id).await);
        supervisor.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_without_runner() {
        let calls = Arc::new(AtomicU32::new(0));
        let supervisor = supervisor(calls).await;
        let bot_id = create_bot(&supervisor, "b1").await;

        supervisor.stop_bot(bot_id, true).await.unwrap();
        let config = supervisor.configs().get(bot_id).await.unwrap().unwrap();
        assert_eq!(config.status, BotStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn disabled_bot_fails_preconditions_without_error_status() {
        let calls = Arc::new(AtomicU32::new(0));
        let supervisor = supervisor(calls).await;
        let bot_id = create_bot(&supervisor, "b1").await;

        supervisor
            .configs()
            .update(
                bot_id,
                perpbot_core::BotConfigPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert!(supervisor.start_bot(bot_id, false).await.is_err());
        let config = supervisor.configs().get(bot_id).await.unwrap().unwrap();
        // Precondition failures never set the error state.
        assert_eq!(config.status, BotStatus::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn recover_all_relaunches_live_and_errored_bots() {
        let calls = Arc::new(AtomicU32::new(0));
        let supervisor = supervisor(calls).await;
        let running = create_bot(&supervisor, "was-running").await;
        let errored = create_bot(&supervisor, "was-error").await;
        let stopped = create_bot(&supervisor, "was-stopped").await;

        let configs = supervisor.configs();
        configs
            .set_status(running, BotStatus::Running, None)
            .await
            .unwrap();
        configs
            .set_status(errored, BotStatus::Error, None)
            .await
            .unwrap();
        configs
            .set_status(stopped, BotStatus::Stopped, None)
            .await
            .unwrap();

        let recovered = supervisor.recover_all().await.unwrap();
        assert_eq!(recovered, vec![running, errored]);
        assert!(supervisor.is_running(running).await);
        assert!(supervisor.is_running(errored).await);
        assert!(!supervisor.is_running(stopped).await);

        supervisor.shutdown_all().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_all_preserves_persisted_status() {
        let calls = Arc::new(AtomicU32::new(0));
        let supervisor = supervisor(calls).await;
        let bot_id = create_bot(&supervisor, "b1").await;

        supervisor.start_bot(bot_id, false).await.unwrap();
        tokio::time::sleep(Duration::from_millis(900)).await;
        supervisor.shutdown_all().await;

        assert!(!supervisor.is_running(bot_id).await);
        // Status still says running, which is what recovery keys off.
        let config = supervisor.configs().get(bot_id).await.unwrap().unwrap();
        assert_eq!(config.status, BotStatus::Running);
    }

    #[tokio::test(start_paused = true)]
    async fn delete_bot_stops_and_removes() {
        let calls = Arc::new(AtomicU32::new(0));
        let supervisor = supervisor(calls).await;
        let bot_id = create_bot(&supervisor, "b1").await;

        supervisor.start_bot(bot_id, false).await.unwrap();
        supervisor.delete_bot(bot_id).await.unwrap();
        assert!(!supervisor.is_running(bot_id).await);
        assert!(supervisor.configs().get(bot_id).await.unwrap().is_none());
    }
}
