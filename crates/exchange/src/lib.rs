pub mod client;
pub mod error;
pub mod models;
pub mod request_manager;
pub mod signing;

pub use client::ExchangeClient;
pub use error::{ExchangeError, ExchangeResult};
pub use models::{
    AccountSummary, Collateral, CollateralAsset, Fill, Kline, Market, OpenOrder, OrderAck,
    PlaceOrderRequest, Position, Side, Ticker,
};
pub use request_manager::RequestManager;
pub use signing::{Credentials, SignedHeaders};
