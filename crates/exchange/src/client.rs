use crate::error::{ExchangeError, ExchangeResult};
use crate::models::{
    AccountSummary, ApiErrorBody, Collateral, Fill, Kline, Market, OpenOrder, OrderAck,
    PlaceOrderRequest, Position, Ticker,
};
use crate::request_manager::RequestManager;
use crate::signing::{sign_request, Credentials};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use perpbot_core::{Candle, KlineSource, Timeframe};
use reqwest::{Client, Method, Response, StatusCode};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const READ_TIMEOUT: Duration = Duration::from_secs(15);
const RETRY_TIMEOUT: Duration = Duration::from_secs(20);
const POSITIONS_CACHE_TTL: Duration = Duration::from_secs(10);
const FILL_PAGE_LIMIT: u32 = 500;

struct CachedPositions {
    fetched_at: Instant,
    positions: Vec<Position>,
}

/// Authenticated Backpack REST client.
///
/// All methods take explicit credentials; the client holds no ambient key.
/// The request coalescer and the per-credential positions cache live on the
/// instance, which the supervisor owns one of per process.
pub struct ExchangeClient {
    http: Client,
    retry_http: Client,
    base_url: String,
    request_manager: RequestManager,
    positions_cache: Mutex<HashMap<String, CachedPositions>>,
}

impl ExchangeClient {
    /// Creates a client against the given base URL.
    ///
    /// # Panics
    /// Panics if the TLS backend cannot be initialized.
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            http: Client::builder()
                .timeout(READ_TIMEOUT)
                .build()
                .expect("reqwest client"),
            retry_http: Client::builder()
                .timeout(RETRY_TIMEOUT)
                .build()
                .expect("reqwest client"),
            base_url,
            request_manager: RequestManager::new(),
            positions_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Drops coalesced in-flight reads so a fresh bot cycle never consumes
    /// a response that predates it.
    pub async fn force_reset(&self) {
        self.request_manager.force_reset().await;
    }

    // ------------------------------------------------------------------
    // Public endpoints
    // ------------------------------------------------------------------

    /// # Errors
    /// Returns an error when the request fails or the payload is malformed.
    pub async fn get_markets(&self) -> ExchangeResult<Vec<Market>> {
        let value = self.get_public("/api/v1/markets", &BTreeMap::new()).await?;
        parse_payload(value, "markets")
    }

    /// # Errors
    /// Returns an error when the request fails or the payload is malformed.
    pub async fn get_tickers(&self, window: Option<&str>) -> ExchangeResult<Vec<Ticker>> {
        let mut params = BTreeMap::new();
        if let Some(window) = window {
            params.insert("interval".to_string(), window.to_string());
        }
        let value = self.get_public("/api/v1/tickers", &params).await?;
        parse_payload(value, "tickers")
    }

    /// # Errors
    /// Returns an error when the request fails or the payload is malformed.
    pub async fn get_klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> ExchangeResult<Vec<Kline>> {
        let now = Utc::now().timestamp();
        let span = (timeframe.as_millis() / 1000) * limit as i64;
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), symbol.to_string());
        params.insert("interval".to_string(), timeframe.as_str().to_string());
        params.insert("startTime".to_string(), (now - span).to_string());
        let value = self.get_public("/api/v1/klines", &params).await?;
        parse_payload(value, "klines")
    }

    // ------------------------------------------------------------------
    // Authenticated endpoints
    // ------------------------------------------------------------------

    /// # Errors
    /// Returns an error when the request fails or the payload is malformed.
    pub async fn get_account(&self, credentials: &Credentials) -> ExchangeResult<AccountSummary> {
        let value = self
            .send_signed(
                Method::GET,
                "/api/v1/account",
                "accountQuery",
                BTreeMap::new(),
                None,
                credentials,
            )
            .await?;
        parse_payload(value, "account")
    }

    /// # Errors
    /// Returns an error when the request fails or the payload is malformed.
    pub async fn get_collateral(&self, credentials: &Credentials) -> ExchangeResult<Collateral> {
        let value = self
            .send_signed(
                Method::GET,
                "/api/v1/capital/collateral",
                "collateralQuery",
                BTreeMap::new(),
                None,
                credentials,
            )
            .await?;
        parse_payload(value, "collateral")
    }

    /// Open orders, optionally restricted to one symbol.
    ///
    /// # Errors
    /// Returns an error when the request fails or the payload is malformed.
    pub async fn get_open_orders(
        &self,
        credentials: &Credentials,
        symbol: Option<&str>,
        market_type: &str,
    ) -> ExchangeResult<Vec<OpenOrder>> {
        let mut params = BTreeMap::new();
        params.insert("marketType".to_string(), market_type.to_string());
        if let Some(symbol) = symbol {
            params.insert("symbol".to_string(), symbol.to_string());
        }
        let value = self
            .send_signed(
                Method::GET,
                "/api/v1/orders",
                "orderQueryAll",
                params,
                None,
                credentials,
            )
            .await?;
        parse_payload(value, "open orders")
    }

    /// Open positions. Rejects a payload shaped like an order book (a
    /// known exchange-side mixup) without touching the cache.
    ///
    /// # Errors
    /// Returns `InvalidResponse` for an order-book-shaped payload, or any
    /// transport/API error.
    pub async fn get_open_positions(
        &self,
        credentials: &Credentials,
    ) -> ExchangeResult<Vec<Position>> {
        let value = self
            .send_signed(
                Method::GET,
                "/api/v1/position",
                "positionQuery",
                BTreeMap::new(),
                None,
                credentials,
            )
            .await?;

        if looks_like_order_book(&value) {
            tracing::warn!(
                "Position endpoint returned an order-book payload; discarding response"
            );
            return Err(ExchangeError::InvalidResponse(
                "order-book payload where positions expected".to_string(),
            ));
        }

        let positions: Vec<Position> = parse_payload(value, "positions")?;

        let fingerprint = credentials.fingerprint();
        let mut cache = self.positions_cache.lock().await;
        cache.insert(
            fingerprint,
            CachedPositions {
                fetched_at: Instant::now(),
                positions: positions.clone(),
            },
        );

        Ok(positions)
    }

    /// Positions with a 10-second per-credential cache. On a rate-limit
    /// error a stale cached value is served instead, if one exists.
    ///
    /// # Errors
    /// Propagates the fetch error when no cached value can stand in.
    pub async fn get_positions_cached(
        &self,
        credentials: &Credentials,
    ) -> ExchangeResult<Vec<Position>> {
        let fingerprint = credentials.fingerprint();
        {
            let cache = self.positions_cache.lock().await;
            if let Some(entry) = cache.get(&fingerprint) {
                if entry.fetched_at.elapsed() < POSITIONS_CACHE_TTL {
                    return Ok(entry.positions.clone());
                }
            }
        }

        match self.get_open_positions(credentials).await {
            Ok(positions) => Ok(positions),
            Err(e) if e.is_rate_limited() => {
                let cache = self.positions_cache.lock().await;
                if let Some(entry) = cache.get(&fingerprint) {
                    tracing::warn!(
                        "Rate limited fetching positions; serving cached value ({}s old)",
                        entry.fetched_at.elapsed().as_secs()
                    );
                    Ok(entry.positions.clone())
                } else {
                    Err(e)
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Fill history, paginated until `limit` or the window is exhausted.
    ///
    /// # Errors
    /// Returns an error when any page fails or is malformed.
    pub async fn get_fill_history(
        &self,
        credentials: &Credentials,
        symbol: Option<&str>,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u32,
        market_type: &str,
    ) -> ExchangeResult<Vec<Fill>> {
        let mut fills: Vec<Fill> = Vec::new();
        let mut offset: u32 = 0;

        loop {
            let page_limit = FILL_PAGE_LIMIT.min(limit - fills.len() as u32);
            if page_limit == 0 {
                break;
            }

            let mut params = BTreeMap::new();
            params.insert("marketType".to_string(), market_type.to_string());
            params.insert("from".to_string(), from.timestamp_millis().to_string());
            params.insert("to".to_string(), to.timestamp_millis().to_string());
            params.insert("limit".to_string(), page_limit.to_string());
            params.insert("offset".to_string(), offset.to_string());
            if let Some(symbol) = symbol {
                params.insert("symbol".to_string(), symbol.to_string());
            }

            let value = self
                .send_signed(
                    Method::GET,
                    "/wapi/v1/history/fills",
                    "fillHistoryQueryAll",
                    params,
                    None,
                    credentials,
                )
                .await?;
            let page: Vec<Fill> = parse_payload(value, "fills")?;
            let page_len = page.len() as u32;
            fills.extend(page);

            if page_len < page_limit {
                break;
            }
            offset += page_len;
        }

        Ok(fills)
    }

    /// # Errors
    /// Returns an error when the request fails or the order is rejected.
    pub async fn place_order(
        &self,
        credentials: &Credentials,
        request: &PlaceOrderRequest,
    ) -> ExchangeResult<OrderAck> {
        let body = serde_json::to_value(request)
            .map_err(|e| ExchangeError::InvalidResponse(format!("unserializable order: {e}")))?;
        let params = body_params(&body);
        let value = self
            .send_signed(
                Method::POST,
                "/api/v1/order",
                "orderExecute",
                params,
                Some(body),
                credentials,
            )
            .await?;
        parse_payload(value, "order ack")
    }

    /// # Errors
    /// Returns `NotFound` for an unknown order, or any transport/API error.
    pub async fn cancel_order(
        &self,
        credentials: &Credentials,
        symbol: &str,
        order_id: &str,
    ) -> ExchangeResult<()> {
        let body = serde_json::json!({ "symbol": symbol, "orderId": order_id });
        let params = body_params(&body);
        self.send_signed(
            Method::DELETE,
            "/api/v1/order",
            "orderCancel",
            params,
            Some(body),
            credentials,
        )
        .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Transport
    // ------------------------------------------------------------------

    async fn get_public(
        &self,
        path: &str,
        params: &BTreeMap<String, String>,
    ) -> ExchangeResult<Value> {
        let url = build_url(&self.base_url, path, params);
        let key = format!("GET {url}");
        let http = self.http.clone();
        let retry_http = self.retry_http.clone();
        self.request_manager
            .run(&key, move || async move {
                let response = match http.get(&url).send().await {
                    Ok(response) => response,
                    Err(e) if e.is_timeout() => retry_http.get(&url).send().await?,
                    Err(e) => return Err(e.into()),
                };
                handle_response(response).await
            })
            .await
    }

    /// Signs and sends one authenticated request. Each attempt is signed
    /// exactly once; the timeout retry re-signs with a fresh timestamp.
    async fn send_signed(
        &self,
        method: Method,
        path: &str,
        instruction: &str,
        params: BTreeMap<String, String>,
        body: Option<Value>,
        credentials: &Credentials,
    ) -> ExchangeResult<Value> {
        let query = if body.is_some() { None } else { Some(&params) };
        let url = match query {
            Some(params) => build_url(&self.base_url, path, params),
            None => format!("{}{}", self.base_url, path),
        };

        let first = self
            .signed_attempt(&self.http, &method, &url, instruction, &params, &body, credentials)
            .await;

        let response = match first {
            Ok(response) => response,
            Err(ExchangeError::Transient(msg)) if msg.contains("timed out") => {
                tracing::debug!("Retrying {} {} with extended timeout", method, path);
                self.signed_attempt(
                    &self.retry_http,
                    &method,
                    &url,
                    instruction,
                    &params,
                    &body,
                    credentials,
                )
                .await?
            }
            Err(e) => return Err(e),
        };

        handle_response(response).await
    }

    async fn signed_attempt(
        &self,
        http: &Client,
        method: &Method,
        url: &str,
        instruction: &str,
        params: &BTreeMap<String, String>,
        body: &Option<Value>,
        credentials: &Credentials,
    ) -> ExchangeResult<Response> {
        let headers = sign_request(credentials, instruction, params, Utc::now().timestamp_millis())?;

        let mut request = http
            .request(method.clone(), url)
            .header("X-API-KEY", &headers.api_key)
            .header("X-SIGNATURE", &headers.signature)
            .header("X-TIMESTAMP", headers.timestamp.to_string())
            .header("X-WINDOW", headers.window.to_string());
        if let Some(body) = body {
            request = request.json(body);
        }

        request.send().await.map_err(|e| {
            if e.is_timeout() {
                ExchangeError::Transient(format!("request timed out: {e}"))
            } else {
                ExchangeError::Transient(e.to_string())
            }
        })
    }
}

#[async_trait]
impl KlineSource for ExchangeClient {
    async fn klines(
        &self,
        symbol: &str,
        timeframe: Timeframe,
        limit: usize,
    ) -> Result<Vec<Candle>> {
        let klines = self.get_klines(symbol, timeframe, limit).await?;
        let mut candles = Vec::with_capacity(klines.len());
        for k in klines {
            let start_time = DateTime::parse_from_rfc3339(&k.start)
                .map(|t| t.with_timezone(&Utc))
                .or_else(|_| {
                    // Klines may carry "YYYY-MM-DD HH:MM:SS" without a zone.
                    chrono::NaiveDateTime::parse_from_str(&k.start, "%Y-%m-%d %H:%M:%S")
                        .map(|t| t.and_utc())
                })?;
            candles.push(Candle {
                start_time,
                open: k.open,
                high: k.high,
                low: k.low,
                close: k.close,
                volume: k.volume,
            });
        }
        Ok(candles)
    }
}

fn build_url(base_url: &str, path: &str, params: &BTreeMap<String, String>) -> String {
    if params.is_empty() {
        return format!("{base_url}{path}");
    }
    let query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{base_url}{path}?{}", query.join("&"))
}

/// Flattens a JSON body into the sorted param map the signature covers.
fn body_params(body: &Value) -> BTreeMap<String, String> {
    let mut params = BTreeMap::new();
    if let Some(map) = body.as_object() {
        for (k, v) in map {
            let rendered = match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            params.insert(k.clone(), rendered);
        }
    }
    params
}

/// Order-book payloads carry `asks`/`bids` and no `symbol`/`netQuantity`.
fn looks_like_order_book(value: &Value) -> bool {
    let probe = |v: &Value| {
        let has_book = v.get("asks").is_some() || v.get("bids").is_some();
        let has_position = v.get("symbol").is_some() || v.get("netQuantity").is_some();
        has_book && !has_position
    };
    match value {
        Value::Object(_) => probe(value),
        Value::Array(items) => items.first().is_some_and(probe),
        _ => false,
    }
}

async fn handle_response(response: Response) -> ExchangeResult<Value> {
    let status = response.status();

    if status == StatusCode::TOO_MANY_REQUESTS {
        let body = response.text().await.unwrap_or_default();
        return Err(ExchangeError::RateLimited(body));
    }

    let text = response.text().await?;

    if status.is_success() {
        if text.is_empty() {
            return Ok(Value::Null);
        }
        return serde_json::from_str(&text)
            .map_err(|e| ExchangeError::InvalidResponse(format!("unparseable body: {e}")));
    }

    let body: ApiErrorBody = serde_json::from_str(&text).unwrap_or(ApiErrorBody {
        code: None,
        message: None,
    });
    Err(ExchangeError::from_api_body(
        status.as_u16(),
        body.code.unwrap_or_else(|| status.as_u16().to_string()),
        body.message.unwrap_or(text),
    ))
}

fn parse_payload<T: serde::de::DeserializeOwned>(value: Value, what: &str) -> ExchangeResult<T> {
    serde_json::from_value(value)
        .map_err(|e| ExchangeError::InvalidResponse(format!("unexpected {what} payload: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn order_book_shape_is_detected() {
        let book = json!({"asks": [["100", "1"]], "bids": [["99", "2"]]});
        assert!(looks_like_order_book(&book));

        let positions = json!([{"symbol": "SOL_USDC_PERP", "netQuantity": "1"}]);
        assert!(!looks_like_order_book(&positions));

        // A position payload that happens to carry depth fields is not
        // rejected, only the symbol-less book shape is.
        let hybrid = json!({"symbol": "X", "asks": []});
        assert!(!looks_like_order_book(&hybrid));

        let book_list = json!([{"asks": [], "bids": []}]);
        assert!(looks_like_order_book(&book_list));
    }

    #[test]
    fn url_builder_renders_sorted_query() {
        let mut params = BTreeMap::new();
        params.insert("symbol".to_string(), "SOL_USDC_PERP".to_string());
        params.insert("interval".to_string(), "5m".to_string());
        let url = build_url("https://x", "/api/v1/klines", &params);
        assert_eq!(url, "https://x/api/v1/klines?interval=5m&symbol=SOL_USDC_PERP");
    }

    #[test]
    fn body_params_flatten_scalars() {
        let body = json!({"symbol": "S", "quantity": "2", "reduceOnly": true});
        let params = body_params(&body);
        assert_eq!(params["symbol"], "S");
        assert_eq!(params["reduceOnly"], "true");
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let client = ExchangeClient::new("https://api.backpack.exchange/");
        assert_eq!(client.base_url, "https://api.backpack.exchange");
    }
}
