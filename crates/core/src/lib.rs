pub mod bot_config;
pub mod config;
pub mod config_loader;
pub mod events;
pub mod strategy;
pub mod timeframe;

pub use bot_config::{
    BotConfig, BotConfigPatch, BotStatus, ExecutionMode, FeatureSwitches, NewBot, StrategyKind,
    StrategyParams, TrailingParams,
};
pub use config::{AppConfig, CorsConfig, DatabaseConfig, ExchangeConfig, ServerConfig};
pub use config_loader::ConfigLoader;
pub use events::{BusEvent, EventBus};
pub use strategy::{
    heikin_ashi, Candle, Decision, IntentKind, IntentSide, KlineSource, MarketSnapshot,
    MomentumStrategy, OrderIntent, Strategy, StrategyRegistry,
};
pub use timeframe::Timeframe;
