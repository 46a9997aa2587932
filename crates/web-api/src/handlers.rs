use crate::server::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use chrono::{DateTime, Utc};
use perpbot_core::{BotConfig, BotConfigPatch, BotStatus, ExecutionMode, NewBot, StrategyKind, Timeframe};
use perpbot_exchange::Credentials;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Uniform `{success, error, data}` envelope for every endpoint.
#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: Serialize> Envelope<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            error: None,
            data: Some(data),
        })
    }

    fn fail(error: impl ToString) -> Json<Self> {
        Json(Self {
            success: false,
            error: Some(error.to_string()),
            data: None,
        })
    }
}

/// Bot as exposed to the dashboard; the secret never leaves the process.
#[derive(Debug, Serialize)]
pub struct BotView {
    pub bot_id: i64,
    pub bot_name: String,
    pub strategy: StrategyKind,
    pub timeframe: Timeframe,
    pub execution_mode: ExecutionMode,
    pub capital_percentage: Decimal,
    pub max_open_orders: u32,
    pub min_profit_percentage: Decimal,
    pub authorized_tokens: Vec<String>,
    pub enabled: bool,
    pub status: BotStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub next_validation_at: Option<DateTime<Utc>>,
    pub running: bool,
}

impl BotView {
    fn from_config(config: BotConfig, running: bool) -> Self {
        Self {
            bot_id: config.bot_id,
            bot_name: config.bot_name,
            strategy: config.strategy,
            timeframe: config.timeframe,
            execution_mode: config.execution_mode,
            capital_percentage: config.capital_percentage,
            max_open_orders: config.max_open_orders,
            min_profit_percentage: config.min_profit_percentage,
            authorized_tokens: config.authorized_tokens,
            enabled: config.enabled,
            status: config.status,
            start_time: config.start_time,
            next_validation_at: config.next_validation_at,
            running,
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Json<Envelope<serde_json::Value>> {
    match state.supervisor.configs().list_all().await {
        Ok(bots) => Envelope::ok(json!({
            "database_ready": true,
            "bots": bots.len(),
            "running": state.supervisor.running_bots().await.len(),
        })),
        Err(e) => Envelope::fail(format!("database not ready: {e}")),
    }
}

pub async fn list_bots(State(state): State<AppState>) -> Json<Envelope<Vec<BotView>>> {
    match state.supervisor.configs().list_all().await {
        Ok(configs) => {
            let mut views = Vec::with_capacity(configs.len());
            for config in configs {
                let running = state.supervisor.is_running(config.bot_id).await;
                views.push(BotView::from_config(config, running));
            }
            Envelope::ok(views)
        }
        Err(e) => Envelope::fail(e),
    }
}

pub async fn create_bot(
    State(state): State<AppState>,
    Json(new): Json<NewBot>,
) -> Json<Envelope<BotView>> {
    // Duplicate-credential warning path: the same key on two bots makes
    // fill attribution ambiguous on the account level.
    if let Ok(existing) = state.supervisor.configs().list_all().await {
        if let Some(other) = existing.iter().find(|c| c.api_key == new.api_key) {
            tracing::warn!(
                "Credentials of new bot '{}' already used by bot {} ({})",
                new.bot_name,
                other.bot_id,
                other.bot_name
            );
        }
    }

    match state.supervisor.configs().create(new).await {
        Ok(bot_id) => match state.supervisor.configs().get(bot_id).await {
            Ok(Some(config)) => Envelope::ok(BotView::from_config(config, false)),
            Ok(None) => Envelope::fail("bot vanished after creation"),
            Err(e) => Envelope::fail(e),
        },
        Err(e) => Envelope::fail(e),
    }
}

pub async fn get_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<i64>,
) -> Json<Envelope<BotView>> {
    match state.supervisor.configs().get(bot_id).await {
        Ok(Some(config)) => {
            let running = state.supervisor.is_running(bot_id).await;
            Envelope::ok(BotView::from_config(config, running))
        }
        Ok(None) => Envelope::fail(format!("bot {bot_id} not found")),
        Err(e) => Envelope::fail(e),
    }
}

pub async fn update_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<i64>,
    Json(patch): Json<BotConfigPatch>,
) -> Json<Envelope<BotView>> {
    if let Err(e) = state.supervisor.configs().update(bot_id, patch).await {
        return Envelope::fail(e);
    }
    match state.supervisor.configs().get(bot_id).await {
        Ok(Some(config)) => {
            let running = state.supervisor.is_running(bot_id).await;
            Envelope::ok(BotView::from_config(config, running))
        }
        Ok(None) => Envelope::fail(format!("bot {bot_id} not found")),
        Err(e) => Envelope::fail(e),
    }
}

pub async fn delete_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<i64>,
) -> Json<Envelope<serde_json::Value>> {
    match state.supervisor.delete_bot(bot_id).await {
        Ok(()) => Envelope::ok(json!({ "deleted": bot_id })),
        Err(e) => Envelope::fail(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub force: bool,
}

pub async fn start_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<i64>,
    Query(query): Query<StartQuery>,
) -> Json<Envelope<serde_json::Value>> {
    match state.supervisor.start_bot(bot_id, query.force).await {
        Ok(()) => Envelope::ok(json!({ "started": bot_id })),
        Err(e) => Envelope::fail(e),
    }
}

pub async fn stop_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<i64>,
) -> Json<Envelope<serde_json::Value>> {
    match state.supervisor.stop_bot(bot_id, true).await {
        Ok(()) => Envelope::ok(json!({ "stopped": bot_id })),
        Err(e) => Envelope::fail(e),
    }
}

pub async fn restart_bot(
    State(state): State<AppState>,
    Path(bot_id): Path<i64>,
) -> Json<Envelope<serde_json::Value>> {
    match state.supervisor.restart_bot(bot_id).await {
        Ok(()) => Envelope::ok(json!({ "restarted": bot_id })),
        Err(e) => Envelope::fail(e),
    }
}

/// Forces a reconciliation pass plus a position sweep for one bot.
pub async fn force_sync(
    State(state): State<AppState>,
    Path(bot_id): Path<i64>,
) -> Json<Envelope<serde_json::Value>> {
    let configs = state.supervisor.configs();
    let config = match configs.get(bot_id).await {
        Ok(Some(config)) => config,
        Ok(None) => return Envelope::fail(format!("bot {bot_id} not found")),
        Err(e) => return Envelope::fail(e),
    };

    let deps = state.supervisor.deps();
    let synced = match deps.orders.sync_with_exchange(&config).await {
        Ok(synced) => synced,
        Err(e) => return Envelope::fail(e),
    };
    match deps.positions.track_bot_positions(&config).await {
        Ok(stats) => Envelope::ok(json!({
            "orders_synced": synced,
            "stats": stats,
        })),
        Err(e) => Envelope::fail(e),
    }
}

#[derive(Debug, Serialize)]
pub struct StrategyInfo {
    pub name: &'static str,
    pub externally_managed: bool,
}

pub async fn list_strategies(State(state): State<AppState>) -> Json<Envelope<Vec<StrategyInfo>>> {
    let kinds = state.supervisor.deps().registry.known_kinds();
    Envelope::ok(
        kinds
            .into_iter()
            .map(|kind| StrategyInfo {
                name: kind.as_str(),
                externally_managed: kind.is_externally_managed(),
            })
            .collect(),
    )
}

/// Markets + tickers passthrough for the dashboard's symbol picker.
pub async fn available_tokens(
    State(state): State<AppState>,
) -> Json<Envelope<Vec<serde_json::Value>>> {
    let markets = match state.client.get_markets().await {
        Ok(markets) => markets,
        Err(e) => return Envelope::fail(e),
    };
    let tickers = match state.client.get_tickers(None).await {
        Ok(tickers) => tickers,
        Err(e) => return Envelope::fail(e),
    };

    let tokens = markets
        .into_iter()
        .filter(perpbot_exchange::Market::is_perp)
        .map(|market| {
            let ticker = tickers.iter().find(|t| t.symbol == market.symbol);
            json!({
                "symbol": market.symbol,
                "last_price": ticker.map(|t| t.last_price),
                "volume": ticker.and_then(|t| t.quote_volume),
            })
        })
        .collect();
    Envelope::ok(tokens)
}

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub api_key: String,
    pub api_secret: String,
}

/// Probes an authenticated endpoint to prove the credentials work.
pub async fn validate_credentials(
    State(state): State<AppState>,
    Json(request): Json<CredentialsRequest>,
) -> Json<Envelope<serde_json::Value>> {
    let credentials = Credentials::new(request.api_key, request.api_secret);
    if credentials.is_empty() {
        return Envelope::fail("credentials must not be empty");
    }
    match state.client.get_account(&credentials).await {
        Ok(_) => Envelope::ok(json!({ "valid": true })),
        Err(e) => Envelope::fail(format!("validation failed: {e}")),
    }
}

#[derive(Debug, Deserialize)]
pub struct DuplicateCheckRequest {
    pub api_key: String,
}

/// Scans stored configurations for another bot with the same key.
pub async fn check_duplicate_credentials(
    State(state): State<AppState>,
    Json(request): Json<DuplicateCheckRequest>,
) -> Json<Envelope<serde_json::Value>> {
    match state.supervisor.configs().list_all().await {
        Ok(configs) => {
            let duplicate = configs.iter().find(|c| c.api_key == request.api_key);
            Envelope::ok(json!({
                "duplicate": duplicate.is_some(),
                "bot_name": duplicate.map(|c| c.bot_name.clone()),
            }))
        }
        Err(e) => Envelope::fail(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_success_shape() {
        let Json(envelope) = Envelope::ok(json!({ "x": 1 }));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["success"], true);
        assert!(value.get("error").is_none());
        assert_eq!(value["data"]["x"], 1);
    }

    #[test]
    fn envelope_failure_shape() {
        let Json(envelope) = Envelope::<serde_json::Value>::fail("boom");
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["success"], false);
        assert_eq!(value["error"], "boom");
        assert!(value.get("data").is_none());
    }

    #[test]
    fn bot_view_has_no_secret_fields() {
        let config: BotConfig = serde_json::from_value(json!({
            "bot_id": 1, "bot_name": "b", "strategy": "DEFAULT",
            "api_key": "public-key", "api_secret": "very-secret",
            "bot_client_order_id": 7,
            "created_at": "2025-06-01T00:00:00Z", "updated_at": "2025-06-01T00:00:00Z"
        }))
        .unwrap();
        let view = BotView::from_config(config, false);
        let value = serde_json::to_value(&view).unwrap();
        assert!(value.get("api_secret").is_none());
        assert!(value.get("api_key").is_none());
        assert_eq!(value["bot_name"], "b");
    }
}
