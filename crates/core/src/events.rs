use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events published by the bot runtime and fanned out to subscribers
/// (currently the dashboard WebSocket layer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BusEvent {
    BotStarting {
        bot_id: i64,
        timestamp: DateTime<Utc>,
    },
    BotStarted {
        bot_id: i64,
        timestamp: DateTime<Utc>,
    },
    BotStopped {
        bot_id: i64,
        timestamp: DateTime<Utc>,
    },
    BotExecutionSuccess {
        bot_id: i64,
        timestamp: DateTime<Utc>,
        next_run_at: DateTime<Utc>,
    },
    BotExecutionError {
        bot_id: i64,
        timestamp: DateTime<Utc>,
        message: String,
    },
    DecisionAnalysis {
        bot_id: i64,
        timestamp: DateTime<Utc>,
        total_trades: u32,
        total_pnl: Decimal,
        win_rate: f64,
    },
    TrailingStopUpdate {
        bot_id: i64,
        symbol: String,
        trigger_price: Decimal,
        timestamp: DateTime<Utc>,
    },
    OrphanOrdersCleanup {
        bot_id: i64,
        cancelled: u32,
        timestamp: DateTime<Utc>,
    },
    PendingOrdersUpdate {
        bot_id: i64,
        cancelled: u32,
        timestamp: DateTime<Utc>,
    },
    TakeProfitUpdate {
        bot_id: i64,
        symbol: String,
        placed: bool,
        timestamp: DateTime<Utc>,
    },
    ConnectionEstablished {
        timestamp: DateTime<Utc>,
    },
}

impl BusEvent {
    #[must_use]
    pub const fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::BotStarting { timestamp, .. }
            | Self::BotStarted { timestamp, .. }
            | Self::BotStopped { timestamp, .. }
            | Self::BotExecutionSuccess { timestamp, .. }
            | Self::BotExecutionError { timestamp, .. }
            | Self::DecisionAnalysis { timestamp, .. }
            | Self::TrailingStopUpdate { timestamp, .. }
            | Self::OrphanOrdersCleanup { timestamp, .. }
            | Self::PendingOrdersUpdate { timestamp, .. }
            | Self::TakeProfitUpdate { timestamp, .. }
            | Self::ConnectionEstablished { timestamp } => *timestamp,
        }
    }
}

/// Process-local fan-out of runtime events.
///
/// Delivery is best-effort: publishing never blocks, and a subscriber that
/// falls behind the channel capacity loses its oldest messages.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<BusEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all current subscribers. A bus with no
    /// subscribers swallows the event.
    pub fn publish(&self, event: BusEvent) {
        if let Err(e) = self.tx.send(event) {
            tracing::trace!("Event dropped (no subscribers): {:?}", e.0);
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<BusEvent> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_screaming_type_tag() {
        let event = BusEvent::BotStarting {
            bot_id: 1,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "BOT_STARTING");
        assert_eq!(json["bot_id"], 1);
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn orphan_cleanup_event_carries_count() {
        let event = BusEvent::OrphanOrdersCleanup {
            bot_id: 3,
            cancelled: 2,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "ORPHAN_ORDERS_CLEANUP");
        assert_eq!(json["cancelled"], 2);
    }

    #[tokio::test]
    async fn publish_reaches_all_subscribers() {
        let bus = EventBus::new(8);
        let mut rx1 = bus.subscribe();
        let mut rx2 = bus.subscribe();

        bus.publish(BusEvent::BotStopped {
            bot_id: 9,
            timestamp: Utc::now(),
        });

        assert!(matches!(
            rx1.recv().await.unwrap(),
            BusEvent::BotStopped { bot_id: 9, .. }
        ));
        assert!(matches!(
            rx2.recv().await.unwrap(),
            BusEvent::BotStopped { bot_id: 9, .. }
        ));
    }

    #[tokio::test]
    async fn lagged_subscriber_loses_oldest_messages() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();

        for bot_id in 0..5 {
            bus.publish(BusEvent::BotStarted {
                bot_id,
                timestamp: Utc::now(),
            });
        }

        // First recv reports the lag; subsequent recvs see the newest events.
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(_))
        ));
        assert!(matches!(
            rx.recv().await.unwrap(),
            BusEvent::BotStarted { bot_id: 3, .. }
        ));
    }

    #[test]
    fn publish_without_subscribers_does_not_panic() {
        let bus = EventBus::default();
        bus.publish(BusEvent::ConnectionEstablished {
            timestamp: Utc::now(),
        });
    }
}
