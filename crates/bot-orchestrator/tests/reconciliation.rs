//! Ghost cleanup and reconciliation idempotence against the durable ledger.

use chrono::{Duration, Utc};
use perpbot_core::{EventBus, NewBot};
use perpbot_exchange::ExchangeClient;
use perpbot_orchestrator::order_service::plan_sync;
use perpbot_orchestrator::{
    ConfigStore, Database, OrderKind, OrderService, OrderSide, OrderStatus, SubmitPayload,
    SyncAction,
};
use rust_decimal_macros::dec;
use std::sync::Arc;

struct Harness {
    db: Database,
    configs: ConfigStore,
    orders: OrderService,
}

async fn harness() -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let configs = ConfigStore::new(&db);
    let bus = EventBus::default();
    let client = Arc::new(ExchangeClient::new("http://127.0.0.1:1"));
    let orders = OrderService::new(&db, configs.clone(), client, bus);
    Harness {
        db,
        configs,
        orders,
    }
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

async fn backdate_order(db: &Database, client_order_id: &str, minutes: i64) {
    let when = (Utc::now() - Duration::minutes(minutes)).to_rfc3339();
    sqlx::query("UPDATE orders SET timestamp = ?2 WHERE client_order_id = ?1")
        .bind(client_order_id)
        .bind(when)
        .execute(db.pool())
        .await
        .unwrap();
}

/// Applies a plan the way `sync_with_exchange` does, without the network.
async fn apply_plan(orders: &OrderService, plan: Vec<SyncAction>) -> u32 {
    let mut applied = 0;
    for action in plan {
        let changed = match &action {
            SyncAction::MarkFilled {
                client_order_id,
                external_order_id,
                at,
            } => orders
                .mark_filled_by_client_id(client_order_id, external_order_id.as_deref(), *at)
                .await
                .unwrap(),
            SyncAction::CancelGhost { client_order_id } => orders
                .mark_inactive(client_order_id, OrderStatus::Cancelled)
                .await
                .unwrap(),
            SyncAction::PatchClose {
                external_order_id,
                close,
            } => orders.mark_closed(external_order_id, close).await.unwrap(),
        };
        if changed {
            applied += 1;
        }
    }
    applied
}

#[tokio::test]
async fn ghost_order_is_cancelled_after_ttl() {
    let h = harness().await;
    let bot_id = h.configs.create(new_bot("b1")).await.unwrap();
    let bot = h.configs.get(bot_id).await.unwrap().unwrap();

    // A submission the exchange never confirmed.
    let client_order_id = h
        .orders
        .register_submission(
            bot_id,
            &SubmitPayload {
                symbol: "SOL-PERP".to_string(),
                side: OrderSide::Buy,
                order_type: OrderKind::Limit,
                quantity: dec!(1),
                price: Some(dec!(100)),
            },
        )
        .await
        .unwrap();
    backdate_order(&h.db, &client_order_id, 11).await;

    let local = h.orders.list_all_for_bot(bot_id).await.unwrap();
    let plan = plan_sync(&local, &[], &[], &bot, Utc::now());
    assert_eq!(plan.len(), 1);
    assert_eq!(apply_plan(&h.orders, plan).await, 1);

    let order = h
        .orders
        .get_by_client_id(&client_order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Cancelled);
}

#[tokio::test]
async fn young_pending_order_survives_reconciliation() {
    let h = harness().await;
    let bot_id = h.configs.create(new_bot("b1")).await.unwrap();
    let bot = h.configs.get(bot_id).await.unwrap().unwrap();

    let client_order_id = h
        .orders
        .register_submission(
            bot_id,
            &SubmitPayload {
                symbol: "SOL-PERP".to_string(),
                side: OrderSide::Buy,
                order_type: OrderKind::Limit,
                quantity: dec!(1),
                price: Some(dec!(100)),
            },
        )
        .await
        .unwrap();
    backdate_order(&h.db, &client_order_id, 5).await;

    let local = h.orders.list_all_for_bot(bot_id).await.unwrap();
    assert!(plan_sync(&local, &[], &[], &bot, Utc::now()).is_empty());

    let order = h
        .orders
        .get_by_client_id(&client_order_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Pending);
}

#[tokio::test]
async fn second_reconciliation_pass_is_a_no_op() {
    let h = harness().await;
    let bot_id = h.configs.create(new_bot("b1")).await.unwrap();
    let bot = h.configs.get(bot_id).await.unwrap().unwrap();

    for _ in 0..3 {
        let id = h
            .orders
            .register_submission(
                bot_id,
                &SubmitPayload {
                    symbol: "SOL-PERP".to_string(),
                    side: OrderSide::Buy,
                    order_type: OrderKind::Limit,
                    quantity: dec!(1),
                    price: Some(dec!(100)),
                },
            )
            .await
            .unwrap();
        backdate_order(&h.db, &id, 15).await;
    }

    let local = h.orders.list_all_for_bot(bot_id).await.unwrap();
    let plan = plan_sync(&local, &[], &[], &bot, Utc::now());
    assert_eq!(plan.len(), 3);
    assert_eq!(apply_plan(&h.orders, plan).await, 3);

    // Same exchange view, fresh ledger read: nothing left to do.
    let local = h.orders.list_all_for_bot(bot_id).await.unwrap();
    assert!(plan_sync(&local, &[], &[], &bot, Utc::now()).is_empty());
}

#[tokio::test]
async fn clear_orders_by_bot_id_removes_everything() {
    let h = harness().await;
    let bot_id = h.configs.create(new_bot("b1")).await.unwrap();

    for _ in 0..2 {
        h.orders
            .register_submission(
                bot_id,
                &SubmitPayload {
                    symbol: "SOL-PERP".to_string(),
                    side: OrderSide::Buy,
                    order_type: OrderKind::Market,
                    quantity: dec!(1),
                    price: None,
                },
            )
            .await
            .unwrap();
    }

    assert_eq!(h.orders.clear_orders_by_bot_id(bot_id).await.unwrap(), 2);
    assert!(h.orders.list_all_for_bot(bot_id).await.unwrap().is_empty());
}
