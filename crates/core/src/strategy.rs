use crate::bot_config::{BotConfig, StrategyKind, StrategyParams};
use crate::timeframe::Timeframe;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;

/// One candle as consumed by strategies.
#[derive(Debug, Clone, PartialEq)]
pub struct Candle {
    pub start_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Source of historical candles. Implemented by the exchange client;
/// stubbed in tests.
#[async_trait]
pub trait KlineSource: Send + Sync {
    async fn klines(&self, symbol: &str, timeframe: Timeframe, limit: usize)
        -> Result<Vec<Candle>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentSide {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntentKind {
    MarketEntry,
    LimitEntry,
    ReduceOnlyStop,
    ReduceOnlyLimit,
}

/// An order the strategy wants placed. Sizing against account capital is
/// the submitter's job; the strategy expresses quantity in base units.
#[derive(Debug, Clone)]
pub struct OrderIntent {
    pub symbol: String,
    pub side: IntentSide,
    pub kind: IntentKind,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub trigger_price: Option<Decimal>,
}

/// Per-symbol market context the strategy observed while analyzing. The
/// trailing-stop engine consumes `atr` in hybrid mode.
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub symbol: String,
    pub last_price: Decimal,
    pub atr: Option<Decimal>,
}

/// Outcome of one analysis pass.
#[derive(Debug, Clone, Default)]
pub struct Decision {
    pub intents: Vec<OrderIntent>,
    pub markets: Vec<MarketSnapshot>,
}

#[async_trait]
pub trait Strategy: Send + Sync {
    async fn analyze(&self, timeframe: Timeframe, config: &BotConfig) -> Result<Decision>;
    fn name(&self) -> &str;
}

/// Resolves strategy kinds to implementations. Built once at startup; the
/// supervisor refuses to start a bot whose kind is not registered.
pub struct StrategyRegistry {
    strategies: HashMap<StrategyKind, Arc<dyn Strategy>>,
}

impl StrategyRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            strategies: HashMap::new(),
        }
    }

    /// Registry with the built-in baseline wired to the given kline source.
    #[must_use]
    pub fn with_builtin(source: Arc<dyn KlineSource>) -> Self {
        let mut registry = Self::new();
        registry.register(
            StrategyKind::Default,
            Arc::new(MomentumStrategy::new(source.clone(), false)),
        );
        registry.register(
            StrategyKind::ProMax,
            Arc::new(MomentumStrategy::new(source.clone(), false)),
        );
        registry.register(
            StrategyKind::AlphaFlow,
            Arc::new(MomentumStrategy::new(source, true)),
        );
        registry
    }

    pub fn register(&mut self, kind: StrategyKind, strategy: Arc<dyn Strategy>) {
        self.strategies.insert(kind, strategy);
    }

    #[must_use]
    pub fn resolve(&self, kind: StrategyKind) -> Option<Arc<dyn Strategy>> {
        self.strategies.get(&kind).cloned()
    }

    #[must_use]
    pub fn contains(&self, kind: StrategyKind) -> bool {
        self.strategies.contains_key(&kind)
    }

    /// All schedulable kinds plus the externally managed ones, for the
    /// dashboard strategies listing.
    #[must_use]
    pub fn known_kinds(&self) -> Vec<StrategyKind> {
        StrategyKind::all()
            .into_iter()
            .filter(|k| k.is_externally_managed() || self.strategies.contains_key(k))
            .collect()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Converts candles to their Heikin-Ashi representation.
#[must_use]
pub fn heikin_ashi(candles: &[Candle]) -> Vec<Candle> {
    let four = Decimal::from(4);
    let two = Decimal::from(2);
    let mut out: Vec<Candle> = Vec::with_capacity(candles.len());

    for (i, c) in candles.iter().enumerate() {
        let ha_close = (c.open + c.high + c.low + c.close) / four;
        let ha_open = if i == 0 {
            (c.open + c.close) / two
        } else {
            let prev = &out[i - 1];
            (prev.open + prev.close) / two
        };
        out.push(Candle {
            start_time: c.start_time,
            open: ha_open,
            high: c.high.max(ha_open).max(ha_close),
            low: c.low.min(ha_open).min(ha_close),
            close: ha_close,
            volume: c.volume,
        });
    }
    out
}

/// Average true range over `period` candles; `None` until enough data.
#[must_use]
pub fn average_true_range(candles: &[Candle], period: usize) -> Option<Decimal> {
    if candles.len() < period + 1 || period == 0 {
        return None;
    }
    let mut sum = Decimal::ZERO;
    let start = candles.len() - period;
    for i in start..candles.len() {
        let prev_close = candles[i - 1].close;
        let c = &candles[i];
        let tr = (c.high - c.low)
            .max((c.high - prev_close).abs())
            .max((c.low - prev_close).abs());
        sum += tr;
    }
    Some(sum / Decimal::from(period as u64))
}

/// Baseline close-over-close momentum strategy backing the `DEFAULT` and
/// `PRO_MAX` kinds; with `heikin_ashi` set it analyzes smoothed candles
/// (the `ALPHA_FLOW` configuration).
pub struct MomentumStrategy {
    source: Arc<dyn KlineSource>,
    use_heikin_ashi: bool,
}

impl MomentumStrategy {
    #[must_use]
    pub fn new(source: Arc<dyn KlineSource>, use_heikin_ashi: bool) -> Self {
        Self {
            source,
            use_heikin_ashi,
        }
    }

    fn lookback(config: &BotConfig) -> usize {
        match &config.strategy_params {
            Some(
                StrategyParams::Default { lookback, .. }
                | StrategyParams::ProMax { lookback, .. }
                | StrategyParams::AlphaFlow { lookback, .. },
            ) => *lookback,
            _ => 20,
        }
    }

    fn threshold_pct(config: &BotConfig) -> Decimal {
        match &config.strategy_params {
            Some(
                StrategyParams::Default {
                    momentum_threshold_pct,
                    ..
                }
                | StrategyParams::ProMax {
                    momentum_threshold_pct,
                    ..
                },
            ) => *momentum_threshold_pct,
            _ => Decimal::new(3, 1),
        }
    }
}

#[async_trait]
impl Strategy for MomentumStrategy {
    async fn analyze(&self, timeframe: Timeframe, config: &BotConfig) -> Result<Decision> {
        let lookback = Self::lookback(config);
        let threshold = Self::threshold_pct(config);
        let mut decision = Decision::default();

        for symbol in &config.authorized_tokens {
            let raw = self
                .source
                .klines(symbol, timeframe, lookback + 15)
                .await
                .with_context(|| format!("Failed to fetch klines for {symbol}"))?;
            if raw.len() < lookback + 1 {
                tracing::debug!(
                    "Skipping {}: only {} candles for lookback {}",
                    symbol,
                    raw.len(),
                    lookback
                );
                continue;
            }

            let candles = if self.use_heikin_ashi || config.features.enable_heikin_ashi {
                heikin_ashi(&raw)
            } else {
                raw
            };

            let last = candles.last().map(|c| c.close).unwrap_or_default();
            let anchor = candles[candles.len() - 1 - lookback].close;
            if anchor.is_zero() || last.is_zero() {
                continue;
            }

            let momentum_pct = (last - anchor) / anchor * Decimal::ONE_HUNDRED;
            decision.markets.push(MarketSnapshot {
                symbol: symbol.clone(),
                last_price: last,
                atr: average_true_range(&candles, 14),
            });

            let side = if momentum_pct >= threshold {
                IntentSide::Buy
            } else if momentum_pct <= -threshold {
                IntentSide::Sell
            } else {
                continue;
            };

            // Quantity is a placeholder unit here; the order service sizes
            // it against account collateral and capital_percentage.
            decision.intents.push(OrderIntent {
                symbol: symbol.clone(),
                side,
                kind: IntentKind::LimitEntry,
                quantity: Decimal::ONE,
                price: Some(last),
                trigger_price: None,
            });
        }

        Ok(decision)
    }

    fn name(&self) -> &str {
        if self.use_heikin_ashi {
            "momentum-heikin-ashi"
        } else {
            "momentum"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn candle(open: Decimal, high: Decimal, low: Decimal, close: Decimal) -> Candle {
        Candle {
            start_time: Utc::now(),
            open,
            high,
            low,
            close,
            volume: dec!(10),
        }
    }

    #[test]
    fn heikin_ashi_close_is_ohlc_mean() {
        let candles = vec![candle(dec!(10), dec!(14), dec!(8), dec!(12))];
        let ha = heikin_ashi(&candles);
        assert_eq!(ha[0].close, dec!(11));
        assert_eq!(ha[0].open, dec!(11));
    }

    #[test]
    fn heikin_ashi_open_chains_from_previous_candle() {
        let candles = vec![
            candle(dec!(10), dec!(14), dec!(8), dec!(12)),
            candle(dec!(12), dec!(16), dec!(11), dec!(15)),
        ];
        let ha = heikin_ashi(&candles);
        // (prev ha_open + prev ha_close) / 2 = (11 + 11) / 2
        assert_eq!(ha[1].open, dec!(11));
        assert_eq!(ha[1].close, dec!(13.5));
        assert!(ha[1].high >= ha[1].open && ha[1].high >= ha[1].close);
        assert!(ha[1].low <= ha[1].open && ha[1].low <= ha[1].close);
    }

    #[test]
    fn atr_requires_enough_candles() {
        let candles = vec![candle(dec!(10), dec!(11), dec!(9), dec!(10)); 5];
        assert!(average_true_range(&candles, 14).is_none());
    }

    #[test]
    fn atr_of_constant_range_candles() {
        let candles = vec![candle(dec!(10), dec!(11), dec!(9), dec!(10)); 16];
        assert_eq!(average_true_range(&candles, 14), Some(dec!(2)));
    }

    struct FlatSource;

    #[async_trait]
    impl KlineSource for FlatSource {
        async fn klines(
            &self,
            _symbol: &str,
            _timeframe: Timeframe,
            limit: usize,
        ) -> Result<Vec<Candle>> {
            Ok(vec![candle(dec!(100), dec!(101), dec!(99), dec!(100)); limit])
        }
    }

    #[tokio::test]
    async fn flat_market_produces_no_intents() {
        let registry = StrategyRegistry::with_builtin(Arc::new(FlatSource));
        let strategy = registry.resolve(StrategyKind::Default).unwrap();

        let config: BotConfig = serde_json::from_str(
            r#"{
                "bot_id": 1, "bot_name": "b", "strategy": "DEFAULT",
                "api_key": "k", "api_secret": "s", "bot_client_order_id": 7,
                "authorized_tokens": ["SOL_USDC_PERP"],
                "created_at": "2025-06-01T00:00:00Z",
                "updated_at": "2025-06-01T00:00:00Z"
            }"#,
        )
        .unwrap();

        let decision = strategy.analyze(Timeframe::M5, &config).await.unwrap();
        assert!(decision.intents.is_empty());
        assert_eq!(decision.markets.len(), 1);
        assert_eq!(decision.markets[0].last_price, dec!(100));
    }

    #[test]
    fn registry_knows_externally_managed_kinds_without_impl() {
        let registry = StrategyRegistry::with_builtin(Arc::new(FlatSource));
        assert!(registry.contains(StrategyKind::Default));
        assert!(!registry.contains(StrategyKind::Hft));
        assert!(registry.known_kinds().contains(&StrategyKind::Hft));
    }
}
