pub mod bot_runner;
pub mod config_store;
pub mod monitor;
pub mod order_service;
pub mod position_tracker;
pub mod store;
pub mod supervisor;
pub mod trailing_stop;

pub use bot_runner::{BotRunner, RunnerDeps, RunnerHandle};
pub use config_store::ConfigStore;
pub use monitor::{IntervalProfile, MonitorKind, MonitorRateState};
pub use order_service::{
    CloseType, OrderClose, OrderKind, OrderRecord, OrderService, OrderSide, OrderStatus,
    SubmitPayload, SyncAction,
};
pub use position_tracker::{
    FillEvent, PnlStats, PositionRecord, PositionSide, PositionState, PositionStatus,
    PositionTracker, TradeOutcome,
};
pub use store::Database;
pub use supervisor::BotSupervisor;
pub use trailing_stop::{TrailingState, TrailingStopEngine};
