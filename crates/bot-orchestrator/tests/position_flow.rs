//! End-to-end fill accounting through the durable stores.

use chrono::{Duration, Utc};
use perpbot_core::{EventBus, NewBot};
use perpbot_exchange::{ExchangeClient, Side};
use perpbot_orchestrator::{
    ConfigStore, Database, FillEvent, OrderKind, OrderService, OrderSide, OrderStatus,
    PositionStatus, PositionTracker, SubmitPayload,
};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;

struct Harness {
    configs: ConfigStore,
    orders: OrderService,
    positions: PositionTracker,
}

async fn harness() -> Harness {
    let db = Database::open_in_memory().await.unwrap();
    let configs = ConfigStore::new(&db);
    let bus = EventBus::default();
    let client = Arc::new(ExchangeClient::new("http://127.0.0.1:1"));
    let orders = OrderService::new(&db, configs.clone(), client.clone(), bus);
    let positions = PositionTracker::new(&db, configs.clone(), orders.clone(), client);
    Harness {
        configs,
        orders,
        positions,
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

fn fill(
    bot_id: i64,
    symbol: &str,
    side: Side,
    quantity: Decimal,
    price: Decimal,
    client_order_id: &str,
    external: Option<&str>,
) -> FillEvent {
    FillEvent {
        bot_id,
        symbol: symbol.to_string(),
        side,
        quantity,
        price,
        external_order_id: external.map(String::from),
        client_order_id: Some(client_order_id.to_string()),
        timestamp: Utc::now(),
    }
}

#[tokio::test]
async fn fill_sequence_reconstructs_position_and_pnl() {
    let h = harness().await;
    let bot_id = h.configs.create(new_bot("b1")).await.unwrap();
    let bot = h.configs.get(bot_id).await.unwrap().unwrap();
    let prefix = bot.bot_client_order_id;

    // Open long 2 @ 100.
    let record = h
        .positions
        .on_fill(
            &bot,
            &fill(
                bot_id,
                "SOL-PERP",
                Side::Bid,
                dec!(2),
                dec!(100),
                &format!("{bot_id}_{prefix}_1"),
                None,
            ),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, PositionStatus::Open);
    assert_eq!(record.entry_price, dec!(100));
    assert_eq!(record.initial_quantity, dec!(2));
    assert_eq!(record.current_quantity, dec!(2));
    assert_eq!(record.pnl, Decimal::ZERO);

    // Scale by 1 @ 110: entry blends to 103.33…
    let record = h
        .positions
        .on_fill(
            &bot,
            &fill(
                bot_id,
                "SOL-PERP",
                Side::Bid,
                dec!(1),
                dec!(110),
                &format!("{bot_id}_{prefix}_2"),
                None,
            ),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.initial_quantity, dec!(3));
    assert_eq!(record.current_quantity, dec!(3));
    assert_eq!(record.entry_price.round_dp(4), dec!(103.3333));

    // Close 3 @ 120: pnl = (120 - 103.33…) * 3 = 50.
    let record = h
        .positions
        .on_fill(
            &bot,
            &fill(
                bot_id,
                "SOL-PERP",
                Side::Ask,
                dec!(3),
                dec!(120),
                &format!("{bot_id}_{prefix}_3"),
                None,
            ),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, PositionStatus::Closed);
    assert_eq!(record.current_quantity, Decimal::ZERO);
    assert_eq!(record.pnl.round_dp(2), dec!(50.00));

    // The open-positions view is empty again.
    assert!(h
        .positions
        .get_bot_open_positions(bot_id)
        .await
        .unwrap()
        .is_empty());

    let stats = h.positions.get_bot_pnl_stats(bot_id).await.unwrap();
    assert_eq!(stats.total_trades, 1);
    assert_eq!(stats.wins, 1);
    assert_eq!(stats.total_pnl.round_dp(2), dec!(50.00));
}

#[tokio::test]
async fn foreign_fills_never_touch_positions() {
    let h = harness().await;
    let bot_id = h.configs.create(new_bot("b1")).await.unwrap();
    let bot = h.configs.get(bot_id).await.unwrap().unwrap();

    // Another bot's prefix, a manual trade without client id, and a
    // pre-creation fill.
    let foreign = fill(bot_id, "SOL-PERP", Side::Bid, dec!(2), dec!(100), "99_123_1", None);
    assert!(h.positions.on_fill(&bot, &foreign).await.unwrap().is_none());

    let mut manual = fill(bot_id, "SOL-PERP", Side::Bid, dec!(2), dec!(100), "x", None);
    manual.client_order_id = None;
    assert!(h.positions.on_fill(&bot, &manual).await.unwrap().is_none());

    let mut early = fill(
        bot_id,
        "SOL-PERP",
        Side::Bid,
        dec!(2),
        dec!(100),
        &format!("{bot_id}_{}_1", bot.bot_client_order_id),
        None,
    );
    early.timestamp = bot.created_at - Duration::hours(1);
    assert!(h.positions.on_fill(&bot, &early).await.unwrap().is_none());

    assert!(h
        .positions
        .get_bot_open_positions(bot_id)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn closing_fill_chain_closes_the_entry_order() {
    let h = harness().await;
    let bot_id = h.configs.create(new_bot("b1")).await.unwrap();
    let bot = h.configs.get(bot_id).await.unwrap().unwrap();

    // Ledger: an accepted and filled entry order.
    let client_order_id = h
        .orders
        .register_submission(
            bot_id,
            &SubmitPayload {
                symbol: "SOL-PERP".to_string(),
                side: OrderSide::Buy,
                order_type: OrderKind::Limit,
                quantity: dec!(2),
                price: Some(dec!(100)),
            },
        )
        .await
        .unwrap();
    h.orders
        .confirm_accepted(&client_order_id, "ext-1", Some(Utc::now()))
        .await
        .unwrap();

    let entry = fill(
        bot_id,
        "SOL-PERP",
        Side::Bid,
        dec!(2),
        dec!(100),
        &client_order_id,
        Some("ext-1"),
    );
    h.positions.on_fill(&bot, &entry).await.unwrap().unwrap();
    let order = h
        .orders
        .get_by_external_id("ext-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Filled);

    // The exit drains the position; the entry order closes with its P&L.
    let exit_id = h.configs.next_order_id(bot_id).await.unwrap();
    let exit = fill(
        bot_id,
        "SOL-PERP",
        Side::Ask,
        dec!(2),
        dec!(120),
        &exit_id,
        Some("ext-2"),
    );
    h.positions.on_fill(&bot, &exit).await.unwrap().unwrap();

    let order = h
        .orders
        .get_by_external_id("ext-1")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.status, OrderStatus::Closed);
    assert_eq!(order.close_price, Some(dec!(120)));
    assert_eq!(order.pnl, Some(dec!(40)));
}
