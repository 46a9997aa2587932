use crate::store::Database;
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use perpbot_core::{BotConfig, BotConfigPatch, BotStatus, NewBot, StrategyRegistry};
use rand::Rng;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// Durable store of bot configurations and their lifecycle status.
///
/// Writes are single-row and atomic; a failed write leaves no partial
/// effect observable.
#[derive(Clone)]
pub struct ConfigStore {
    pool: SqlitePool,
}

impl ConfigStore {
    #[must_use]
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    /// Creates a bot: assigns `bot_id = max + 1`, a fresh random
    /// `bot_client_order_id`, status `stopped`, counter 0, and a first
    /// validation deadline 60 seconds out.
    ///
    /// # Errors
    ///
    /// Fails when `bot_name` collides or the write fails.
    pub async fn create(&self, new: NewBot) -> Result<i64> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let name_taken: Option<i64> =
            sqlx::query_scalar("SELECT bot_id FROM bots WHERE bot_name = ?1")
                .bind(&new.bot_name)
                .fetch_optional(&mut *tx)
                .await?;
        if name_taken.is_some() {
            bail!("Bot name '{}' already exists", new.bot_name);
        }

        let bot_id: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(bot_id), 0) + 1 FROM bots")
            .fetch_one(&mut *tx)
            .await?;

        let used: Vec<i64> = sqlx::query_scalar("SELECT bot_client_order_id FROM bots")
            .fetch_all(&mut *tx)
            .await?;
        let bot_client_order_id = pick_client_order_prefix(&used);

        let config = BotConfig {
            bot_id,
            bot_name: new.bot_name,
            strategy: new.strategy,
            api_key: new.api_key,
            api_secret: new.api_secret,
            timeframe: new.timeframe,
            execution_mode: new.execution_mode,
            capital_percentage: new.capital_percentage,
            max_open_orders: new.max_open_orders.max(1),
            max_negative_pnl_stop_pct: new.max_negative_pnl_stop_pct,
            min_profit_percentage: new.min_profit_percentage,
            max_slippage_pct: new.max_slippage_pct,
            trailing: new.trailing,
            features: new.features,
            strategy_params: new.strategy_params,
            authorized_tokens: new.authorized_tokens,
            enabled: new.enabled,
            status: BotStatus::Stopped,
            start_time: None,
            next_validation_at: Some(now + Duration::seconds(60)),
            bot_client_order_id,
            order_counter: 0,
            created_at: now,
            updated_at: now,
        };

        let config_json = serde_json::to_string(&config)?;
        sqlx::query(
            r"
            INSERT INTO bots (bot_id, bot_name, config_json, status, enabled,
                              bot_client_order_id, order_counter,
                              next_validation_at, created_at, updated_at)
            VALUES (?1, ?2, ?3, 'stopped', ?4, ?5, 0, ?6, ?7, ?7)
            ",
        )
        .bind(bot_id)
        .bind(&config.bot_name)
        .bind(config_json)
        .bind(config.enabled)
        .bind(i64::from(bot_client_order_id))
        .bind(config.next_validation_at.map(|t| t.to_rfc3339()))
        .bind(now.to_rfc3339())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(bot_id)
    }

    /// Applies a partial update. Status is not part of the patch type;
    /// transitions go through [`set_status`](Self::set_status).
    ///
    /// # Errors
    ///
    /// Fails when the bot does not exist, the new name collides, or the
    /// write fails.
    pub async fn update(&self, bot_id: i64, patch: BotConfigPatch) -> Result<()> {
        let mut config = self
            .get(bot_id)
            .await?
            .with_context(|| format!("Bot {bot_id} not found"))?;

        if let Some(bot_name) = patch.bot_name {
            if bot_name != config.bot_name {
                if self.get_by_name(&bot_name).await?.is_some() {
                    bail!("Bot name '{bot_name}' already exists");
                }
                config.bot_name = bot_name;
            }
        }
        if let Some(v) = patch.strategy {
            config.strategy = v;
        }
        if let Some(v) = patch.api_key {
            config.api_key = v;
        }
        if let Some(v) = patch.api_secret {
            config.api_secret = v;
        }
        if let Some(v) = patch.timeframe {
            config.timeframe = v;
        }
        if let Some(v) = patch.execution_mode {
            config.execution_mode = v;
        }
        if let Some(v) = patch.capital_percentage {
            config.capital_percentage = v;
        }
        if let Some(v) = patch.max_open_orders {
            config.max_open_orders = v.max(1);
        }
        if let Some(v) = patch.max_negative_pnl_stop_pct {
            config.max_negative_pnl_stop_pct = v;
        }
        if let Some(v) = patch.min_profit_percentage {
            config.min_profit_percentage = v;
        }
        if let Some(v) = patch.max_slippage_pct {
            config.max_slippage_pct = v;
        }
        if let Some(v) = patch.trailing {
            config.trailing = v;
        }
        if let Some(v) = patch.features {
            config.features = v;
        }
        if let Some(v) = patch.strategy_params {
            config.strategy_params = Some(v);
        }
        if let Some(v) = patch.authorized_tokens {
            config.authorized_tokens = v;
        }
        if let Some(v) = patch.enabled {
            config.enabled = v;
        }
        config.updated_at = Utc::now();

        let config_json = serde_json::to_string(&config)?;
        let result = sqlx::query(
            r"
            UPDATE bots SET bot_name = ?2, config_json = ?3, enabled = ?4, updated_at = ?5
            WHERE bot_id = ?1
            ",
        )
        .bind(bot_id)
        .bind(&config.bot_name)
        .bind(config_json)
        .bind(config.enabled)
        .bind(config.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            bail!("Bot {bot_id} not found");
        }
        Ok(())
    }

    /// Writes status and, when given, start time atomically. `None` leaves
    /// the stored start time untouched.
    ///
    /// # Errors
    ///
    /// Fails when the bot does not exist or the write fails.
    pub async fn set_status(
        &self,
        bot_id: i64,
        status: BotStatus,
        start_time: Option<Option<DateTime<Utc>>>,
    ) -> Result<()> {
        let now = Utc::now().to_rfc3339();
        let result = match start_time {
            Some(start_time) => {
                sqlx::query(
                    "UPDATE bots SET status = ?2, start_time = ?3, updated_at = ?4 WHERE bot_id = ?1",
                )
                .bind(bot_id)
                .bind(status.as_str())
                .bind(start_time.map(|t| t.to_rfc3339()))
                .bind(&now)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query("UPDATE bots SET status = ?2, updated_at = ?3 WHERE bot_id = ?1")
                    .bind(bot_id)
                    .bind(status.as_str())
                    .bind(&now)
                    .execute(&self.pool)
                    .await?
            }
        };

        if result.rows_affected() == 0 {
            bail!("Bot {bot_id} not found");
        }
        Ok(())
    }

    /// Atomically increments the per-bot counter and returns the full
    /// clientOrderId tag. Safe under concurrent calls: the increment and
    /// read happen in one statement.
    ///
    /// # Errors
    ///
    /// Fails when the bot does not exist or the write fails.
    pub async fn next_order_id(&self, bot_id: i64) -> Result<String> {
        let row = sqlx::query(
            r"
            UPDATE bots SET order_counter = order_counter + 1, updated_at = ?2
            WHERE bot_id = ?1
            RETURNING order_counter, bot_client_order_id
            ",
        )
        .bind(bot_id)
        .bind(Utc::now().to_rfc3339())
        .fetch_optional(&self.pool)
        .await?
        .with_context(|| format!("Bot {bot_id} not found"))?;

        let counter: i64 = row.get(0);
        let prefix: i64 = row.get(1);
        Ok(format!("{bot_id}_{prefix}_{counter}"))
    }

    /// # Errors
    /// Fails when the read or deserialization fails.
    pub async fn get(&self, bot_id: i64) -> Result<Option<BotConfig>> {
        let row = sqlx::query(
            r"
            SELECT config_json, status, enabled, order_counter, bot_client_order_id,
                   start_time, next_validation_at
            FROM bots WHERE bot_id = ?1
            ",
        )
        .bind(bot_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_config).transpose()
    }

    /// # Errors
    /// Fails when the read or deserialization fails.
    pub async fn get_by_name(&self, bot_name: &str) -> Result<Option<BotConfig>> {
        let row = sqlx::query(
            r"
            SELECT config_json, status, enabled, order_counter, bot_client_order_id,
                   start_time, next_validation_at
            FROM bots WHERE bot_name = ?1
            ",
        )
        .bind(bot_name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_config).transpose()
    }

    /// Resolves the owning bot of a full clientOrderId tag, verifying the
    /// embedded prefix actually belongs to it.
    ///
    /// # Errors
    /// Fails when the read fails.
    pub async fn get_by_client_order_id(&self, client_order_id: &str) -> Result<Option<BotConfig>> {
        let mut parts = client_order_id.split('_');
        let (Some(bot_id), Some(prefix), Some(_counter), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Ok(None);
        };
        let Ok(bot_id) = bot_id.parse::<i64>() else {
            return Ok(None);
        };

        let Some(config) = self.get(bot_id).await? else {
            return Ok(None);
        };
        if prefix.parse::<u32>() == Ok(config.bot_client_order_id) {
            Ok(Some(config))
        } else {
            Ok(None)
        }
    }

    /// # Errors
    /// Fails when the read or deserialization fails.
    pub async fn list_all(&self) -> Result<Vec<BotConfig>> {
        let rows = sqlx::query(
            r"
            SELECT config_json, status, enabled, order_counter, bot_client_order_id,
                   start_time, next_validation_at
            FROM bots ORDER BY bot_id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_config).collect()
    }

    /// All bots whose strategy the supervisor schedules itself.
    ///
    /// # Errors
    /// Fails when the read or deserialization fails.
    pub async fn list_traditional(&self) -> Result<Vec<BotConfig>> {
        Ok(self
            .list_all()
            .await?
            .into_iter()
            .filter(|c| !c.strategy.is_externally_managed())
            .collect())
    }

    /// Deletes a bot and everything it owns: orders, positions, trailing
    /// states.
    ///
    /// # Errors
    /// Fails when any delete fails; the transaction rolls back.
    pub async fn delete(&self, bot_id: i64) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM orders WHERE bot_id = ?1")
            .bind(bot_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM positions WHERE bot_id = ?1")
            .bind(bot_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM trailing_states WHERE bot_id = ?1")
            .bind(bot_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM bots WHERE bot_id = ?1")
            .bind(bot_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// True when the bot exists, is enabled, has credentials, a registered
    /// strategy, and a startable status.
    ///
    /// # Errors
    /// Fails when the read fails.
    pub async fn can_start(&self, bot_id: i64, registry: &StrategyRegistry) -> Result<bool> {
        let Some(config) = self.get(bot_id).await? else {
            return Ok(false);
        };
        Ok(config.enabled
            && !config.api_key.trim().is_empty()
            && !config.api_secret.trim().is_empty()
            && registry.contains(config.strategy)
            && config.status.startable())
    }

    /// # Errors
    /// Fails when the bot does not exist or the write fails.
    pub async fn set_next_validation_at(
        &self,
        bot_id: i64,
        next_validation_at: DateTime<Utc>,
    ) -> Result<()> {
        let result =
            sqlx::query("UPDATE bots SET next_validation_at = ?2, updated_at = ?3 WHERE bot_id = ?1")
                .bind(bot_id)
                .bind(next_validation_at.to_rfc3339())
                .bind(Utc::now().to_rfc3339())
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            bail!("Bot {bot_id} not found");
        }
        Ok(())
    }
}

/// Picks a random order prefix not used by any existing bot.
fn pick_client_order_prefix(used: &[i64]) -> u32 {
    let mut rng = rand::thread_rng();
    loop {
        let candidate: u32 = rng.gen_range(1_000..1_000_000);
        if !used.contains(&i64::from(candidate)) {
            return candidate;
        }
    }
}

/// Composes a `BotConfig` from a row: the JSON blob carries the full shape,
/// the hot columns are authoritative where they overlap.
fn row_to_config(row: sqlx::sqlite::SqliteRow) -> Result<BotConfig> {
    let config_json: String = row.get(0);
    let mut config: BotConfig = serde_json::from_str(&config_json)?;

    let status: String = row.get(1);
    config.status = status.parse()?;
    config.enabled = row.get::<bool, _>(2);
    config.order_counter = u64::try_from(row.get::<i64, _>(3)).unwrap_or(0);
    config.bot_client_order_id = u32::try_from(row.get::<i64, _>(4)).unwrap_or(0);
    config.start_time = parse_time(row.get::<Option<String>, _>(5))?;
    config.next_validation_at = parse_time(row.get::<Option<String>, _>(6))?;

    Ok(config)
}

fn parse_time(value: Option<String>) -> Result<Option<DateTime<Utc>>> {
    Ok(match value {
        Some(s) => Some(DateTime::parse_from_rfc3339(&s)?.with_timezone(&Utc)),
        None => None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use perpbot_core::{StrategyKind, Timeframe};
    use std::collections::HashSet;

    async fn store() -> ConfigStore {
        let db = Database::open_in_memory().await.unwrap();
        ConfigStore::new(&db)
    }

    fn new_bot(name: &str) -> NewBot {
        serde_json::from_value(serde_json::json!({
            "bot_name": name,
            "strategy": "DEFAULT",
            "api_key": "k",
            "api_secret": "s",
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn create_assigns_sequential_ids_and_defaults() {
        let store = store().await;
        let id1 = store.create(new_bot("b1")).await.unwrap();
        let id2 = store.create(new_bot("b2")).await.unwrap();
        assert_eq!(id1, 1);
        assert_eq!(id2, 2);

        let config = store.get(1).await.unwrap().unwrap();
        assert_eq!(config.status, BotStatus::Stopped);
        assert_eq!(config.order_counter, 0);
        assert!(config.bot_client_order_id >= 1_000);
        assert!(config.next_validation_at.is_some());
        assert_eq!(config.timeframe, Timeframe::M5);
    }

    #[tokio::test]
    async fn create_rejects_duplicate_name() {
        let store = store().await;
        store.create(new_bot("b1")).await.unwrap();
        let err = store.create(new_bot("b1")).await.unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[tokio::test]
    async fn client_order_prefixes_are_distinct() {
        let store = store().await;
        let mut seen = HashSet::new();
        for i in 0..5 {
            store.create(new_bot(&format!("b{i}"))).await.unwrap();
        }
        for config in store.list_all().await.unwrap() {
            assert!(seen.insert(config.bot_client_order_id));
        }
    }

    #[tokio::test]
    async fn next_order_id_is_monotone_and_unique_under_concurrency() {
        let store = store().await;
        let bot_id = store.create(new_bot("b1")).await.unwrap();
        let prefix = store.get(bot_id).await.unwrap().unwrap().bot_client_order_id;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let store = store.clone();
            handles.push(tokio::spawn(
                async move { store.next_order_id(bot_id).await },
            ));
        }

        let mut counters = Vec::new();
        for handle in handles {
            let id = handle.await.unwrap().unwrap();
            let parts: Vec<&str> = id.split('_').collect();
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[0], bot_id.to_string());
            assert_eq!(parts[1], prefix.to_string());
            counters.push(parts[2].parse::<u64>().unwrap());
        }

        let unique: HashSet<u64> = counters.iter().copied().collect();
        assert_eq!(unique.len(), 20);
        assert_eq!(*counters.iter().max().unwrap(), 20);
        assert_eq!(*counters.iter().min().unwrap(), 1);
    }

    #[tokio::test]
    async fn set_status_updates_status_and_start_time() {
        let store = store().await;
        let bot_id = store.create(new_bot("b1")).await.unwrap();

        let started = Utc::now();
        store
            .set_status(bot_id, BotStatus::Running, Some(Some(started)))
            .await
            .unwrap();
        let config = store.get(bot_id).await.unwrap().unwrap();
        assert_eq!(config.status, BotStatus::Running);
        assert_eq!(
            config.start_time.unwrap().timestamp(),
            started.timestamp()
        );

        // None leaves start_time untouched.
        store
            .set_status(bot_id, BotStatus::Error, None)
            .await
            .unwrap();
        let config = store.get(bot_id).await.unwrap().unwrap();
        assert_eq!(config.status, BotStatus::Error);
        assert!(config.start_time.is_some());
    }

    #[tokio::test]
    async fn get_by_client_order_id_verifies_prefix() {
        let store = store().await;
        let bot_id = store.create(new_bot("b1")).await.unwrap();
        let id = store.next_order_id(bot_id).await.unwrap();

        let found = store.get_by_client_order_id(&id).await.unwrap();
        assert_eq!(found.unwrap().bot_id, bot_id);

        let wrong_prefix = format!("{bot_id}_999_1");
        assert!(store
            .get_by_client_order_id(&wrong_prefix)
            .await
            .unwrap()
            .is_none());
        assert!(store.get_by_client_order_id("garbage").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_traditional_excludes_externally_managed() {
        let store = store().await;
        store.create(new_bot("b1")).await.unwrap();
        let mut hft = new_bot("hft");
        hft.strategy = StrategyKind::Hft;
        store.create(hft).await.unwrap();

        assert_eq!(store.list_all().await.unwrap().len(), 2);
        let traditional = store.list_traditional().await.unwrap();
        assert_eq!(traditional.len(), 1);
        assert_eq!(traditional[0].bot_name, "b1");
    }

    #[tokio::test]
    async fn update_patches_fields_but_not_status() {
        let store = store().await;
        let bot_id = store.create(new_bot("b1")).await.unwrap();
        store
            .set_status(bot_id, BotStatus::Running, None)
            .await
            .unwrap();

        let patch = BotConfigPatch {
            timeframe: Some(Timeframe::H1),
            enabled: Some(false),
            ..Default::default()
        };
        store.update(bot_id, patch).await.unwrap();

        let config = store.get(bot_id).await.unwrap().unwrap();
        assert_eq!(config.timeframe, Timeframe::H1);
        assert!(!config.enabled);
        // Status survives the patch untouched.
        assert_eq!(config.status, BotStatus::Running);
    }

    #[tokio::test]
    async fn can_start_respects_preconditions() {
        let store = store().await;
        let registry = StrategyRegistry::with_builtin(std::sync::Arc::new(NoKlines));
        let bot_id = store.create(new_bot("b1")).await.unwrap();

        assert!(store.can_start(bot_id, &registry).await.unwrap());

        store
            .set_status(bot_id, BotStatus::Running, None)
            .await
            .unwrap();
        assert!(!store.can_start(bot_id, &registry).await.unwrap());

        store
            .set_status(bot_id, BotStatus::Error, None)
            .await
            .unwrap();
        assert!(store.can_start(bot_id, &registry).await.unwrap());

        store
            .update(
                bot_id,
                BotConfigPatch {
                    enabled: Some(false),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(!store.can_start(bot_id, &registry).await.unwrap());

        assert!(!store.can_start(999, &registry).await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_cascading_and_terminal() {
        let store = store().await;
        let bot_id = store.create(new_bot("b1")).await.unwrap();
        store.delete(bot_id).await.unwrap();
        assert!(store.get(bot_id).await.unwrap().is_none());
    }

    struct NoKlines;

    #[async_trait::async_trait]
    impl perpbot_core::KlineSource for NoKlines {
        async fn klines(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            _limit: usize,
        ) -> Result<Vec<perpbot_core::Candle>> {
            Ok(Vec::new())
        }
    }
}
