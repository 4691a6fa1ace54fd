//! Upbit REST client
//!
//! Public market data (tickers, paginated candles) and private account and
//! order endpoints. Every call goes through the shared rate limiter; private
//! calls carry a freshly signed bearer token.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::auth::{query_string, CredentialProvider, Credentials, TokenSigner};
use super::rate_limit::{RateLimiter, RequestGroup};
use super::{Exchange, ExchangeConnector, OrderInfo, OrderRequest, OrderState, Ticker};
use crate::error::ExchangeError;
use crate::types::{Candle, Timeframe};

pub const DEFAULT_BASE_URL: &str = "https://api.upbit.com";
const MAX_CANDLES_PER_REQUEST: usize = 200;
const CANDLE_TIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawCandle {
    candle_date_time_utc: String,
    opening_price: Decimal,
    high_price: Decimal,
    low_price: Decimal,
    trade_price: Decimal,
    candle_acc_trade_volume: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawTicker {
    market: String,
    trade_price: Decimal,
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct RawAccount {
    currency: String,
    balance: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawOrderTrade {
    volume: Decimal,
    funds: Decimal,
}

#[derive(Debug, Deserialize)]
struct RawOrder {
    uuid: String,
    state: String,
    #[serde(default)]
    executed_volume: Option<Decimal>,
    #[serde(default)]
    paid_fee: Option<Decimal>,
    #[serde(default)]
    trades: Vec<RawOrderTrade>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
}

fn parse_candle(raw: RawCandle, timeframe: Timeframe) -> Result<Candle, ExchangeError> {
    let open_time = NaiveDateTime::parse_from_str(&raw.candle_date_time_utc, CANDLE_TIME_FORMAT)
        .map_err(|e| {
            ExchangeError::Decode(format!(
                "bad candle time '{}': {}",
                raw.candle_date_time_utc, e
            ))
        })?
        .and_utc()
        .timestamp_millis();
    let span_ms = timeframe.minutes() as i64 * 60_000;
    Ok(Candle {
        open_time,
        open: raw.opening_price,
        high: raw.high_price,
        low: raw.low_price,
        close: raw.trade_price,
        volume: raw.candle_acc_trade_volume,
        close_time: open_time + span_ms - 1,
    })
}

fn parse_order(raw: RawOrder) -> Result<OrderInfo, ExchangeError> {
    let state = match raw.state.as_str() {
        "wait" | "watch" => OrderState::Wait,
        "done" => OrderState::Done,
        "cancel" => OrderState::Cancel,
        other => return Err(ExchangeError::Decode(format!("unknown order state: {other}"))),
    };
    let traded_volume: Decimal = raw.trades.iter().map(|t| t.volume).sum();
    let executed_funds: Decimal = raw.trades.iter().map(|t| t.funds).sum();
    Ok(OrderInfo {
        order_id: raw.uuid,
        state,
        executed_volume: raw.executed_volume.unwrap_or(traded_volume),
        executed_funds,
        paid_fee: raw.paid_fee.unwrap_or(Decimal::ZERO),
    })
}

/// Map a non-success response to an error; 401s are credential failures.
fn api_error(status: StatusCode, body: &str) -> ExchangeError {
    let detail = serde_json::from_str::<ErrorBody>(body).ok().map(|b| b.error);
    let message = match &detail {
        Some(d) if !d.message.is_empty() => format!("{} ({})", d.message, d.name),
        Some(d) => d.name.clone(),
        None => body.chars().take(200).collect(),
    };
    let invalid_key = detail
        .as_ref()
        .is_some_and(|d| matches!(d.name.as_str(), "invalid_access_key" | "jwt_verification"));
    if status == StatusCode::UNAUTHORIZED || invalid_key {
        ExchangeError::Unauthorized(message)
    } else {
        ExchangeError::Api {
            status: status.as_u16(),
            message,
        }
    }
}

/// Merge candle pages (newest-first, possibly overlapping) into an
/// ascending, de-duplicated series holding at most `count` bars.
fn merge_pages(pages: Vec<Vec<Candle>>, count: usize) -> Vec<Candle> {
    let by_time: BTreeMap<i64, Candle> = pages
        .into_iter()
        .flatten()
        .map(|c| (c.open_time, c))
        .collect();
    let skip = by_time.len().saturating_sub(count);
    by_time.into_values().skip(skip).collect()
}

fn format_cursor(open_time_ms: i64) -> Option<String> {
    DateTime::<Utc>::from_timestamp_millis(open_time_ms)
        .map(|t| t.format("%Y-%m-%dT%H:%M:%SZ").to_string())
}

fn candle_path(timeframe: Timeframe) -> String {
    match timeframe {
        Timeframe::D1 => "/v1/candles/days".to_string(),
        other => format!("/v1/candles/minutes/{}", other.minutes()),
    }
}

fn order_params(order: &OrderRequest) -> Vec<(String, String)> {
    let p = |k: &str, v: String| (k.to_string(), v);
    match order {
        OrderRequest::MarketBuy { pair, quote_amount } => vec![
            p("market", pair.clone()),
            p("side", "bid".into()),
            p("price", quote_amount.normalize().to_string()),
            p("ord_type", "price".into()),
        ],
        OrderRequest::MarketSell { pair, quantity } => vec![
            p("market", pair.clone()),
            p("side", "ask".into()),
            p("volume", quantity.normalize().to_string()),
            p("ord_type", "market".into()),
        ],
        OrderRequest::LimitBuy {
            pair,
            price,
            quantity,
        } => vec![
            p("market", pair.clone()),
            p("side", "bid".into()),
            p("volume", quantity.normalize().to_string()),
            p("price", price.normalize().to_string()),
            p("ord_type", "limit".into()),
        ],
    }
}

// ============================================================================
// Client
// ============================================================================

/// Upbit client. Holds credentials only for its own lifetime.
pub struct UpbitClient {
    http: Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
    credentials: Option<Credentials>,
}

impl UpbitClient {
    /// Market-data only client
    pub fn public(http: Client, base_url: &str, limiter: Arc<RateLimiter>) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            limiter,
            credentials: None,
        }
    }

    pub fn authenticated(
        http: Client,
        base_url: &str,
        limiter: Arc<RateLimiter>,
        credentials: Credentials,
    ) -> Self {
        Self {
            credentials: Some(credentials),
            ..Self::public(http, base_url, limiter)
        }
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(String, String)],
    ) -> Result<T, ExchangeError> {
        self.limiter.acquire(RequestGroup::Public).await;
        let url = format!("{}{}", self.base_url, path);
        let response = self.http.get(&url).query(params).send().await?;
        Self::decode(response).await
    }

    async fn private<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(String, String)>,
    ) -> Result<T, ExchangeError> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or_else(|| ExchangeError::MissingCredentials("public client".into()))?;

        // Sign after the limiter wait: the token is time-boxed
        self.limiter.acquire(RequestGroup::Private).await;
        let query = query_string(&params);
        let bearer = TokenSigner::new(credentials)
            .bearer(Some(&query), Utc::now().timestamp())?;

        let url = format!("{}{}", self.base_url, path);
        let request = self
            .http
            .request(method.clone(), &url)
            .header(reqwest::header::AUTHORIZATION, bearer);
        let request = if method == Method::POST {
            let body: BTreeMap<&str, &str> = params
                .iter()
                .map(|(k, v)| (k.as_str(), v.as_str()))
                .collect();
            request.json(&body)
        } else {
            request.query(&params)
        };

        debug!(%method, path, "Private exchange request");
        let response = request.send().await?;
        Self::decode(response).await
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ExchangeError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let err = api_error(status, &body);
            warn!(status = status.as_u16(), error = %err, "Exchange request failed");
            return Err(err);
        }
        serde_json::from_str(&body).map_err(|e| ExchangeError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Exchange for UpbitClient {
    async fn ticker(&self, pair: &str) -> Result<Ticker, ExchangeError> {
        let params = vec![("markets".to_string(), pair.to_string())];
        let raw: Vec<RawTicker> = self.public_get("/v1/ticker", &params).await?;
        let first = raw
            .into_iter()
            .next()
            .ok_or_else(|| ExchangeError::Decode(format!("no ticker for {pair}")))?;
        Ok(Ticker {
            pair: first.market,
            price: first.trade_price,
            timestamp: first.timestamp,
        })
    }

    async fn candles(
        &self,
        pair: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let path = candle_path(timeframe);
        let mut pages = Vec::new();
        let mut remaining = count;
        let mut cursor: Option<String> = None;

        while remaining > 0 {
            let batch = remaining.min(MAX_CANDLES_PER_REQUEST);
            let mut params = vec![
                ("market".to_string(), pair.to_string()),
                ("count".to_string(), batch.to_string()),
            ];
            if let Some(to) = &cursor {
                params.push(("to".to_string(), to.clone()));
            }

            let raw: Vec<RawCandle> = self.public_get(&path, &params).await?;
            let received = raw.len();
            let page = raw
                .into_iter()
                .map(|r| parse_candle(r, timeframe))
                .collect::<Result<Vec<_>, _>>()?;

            cursor = page
                .iter()
                .map(|c| c.open_time)
                .min()
                .and_then(format_cursor);
            pages.push(page);

            if received < batch || cursor.is_none() {
                break;
            }
            remaining -= received;
        }

        let candles = merge_pages(pages, count);
        debug!(pair, %timeframe, requested = count, received = candles.len(), "Fetched candles");
        Ok(candles)
    }

    async fn balance(&self, currency: &str) -> Result<Decimal, ExchangeError> {
        let accounts: Vec<RawAccount> = self.private(Method::GET, "/v1/accounts", vec![]).await?;
        Ok(accounts
            .into_iter()
            .find(|a| a.currency.eq_ignore_ascii_case(currency))
            .map(|a| a.balance)
            .unwrap_or(Decimal::ZERO))
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderInfo, ExchangeError> {
        let raw: RawOrder = self
            .private(Method::POST, "/v1/orders", order_params(order))
            .await?;
        parse_order(raw)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderInfo, ExchangeError> {
        let params = vec![("uuid".to_string(), order_id.to_string())];
        let raw: RawOrder = self.private(Method::DELETE, "/v1/order", params).await?;
        parse_order(raw)
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderInfo, ExchangeError> {
        let params = vec![("uuid".to_string(), order_id.to_string())];
        let raw: RawOrder = self.private(Method::GET, "/v1/order", params).await?;
        parse_order(raw)
    }
}

/// Creates one authenticated client per request, sharing the HTTP pool and
/// the rate limiter across every bot.
pub struct UpbitConnector {
    http: Client,
    base_url: String,
    limiter: Arc<RateLimiter>,
    credentials: Arc<dyn CredentialProvider>,
}

impl UpbitConnector {
    pub fn new(
        base_url: &str,
        limiter: Arc<RateLimiter>,
        credentials: Arc<dyn CredentialProvider>,
    ) -> Result<Self, ExchangeError> {
        let http = Client::builder().timeout(Duration::from_secs(30)).build()?;
        Ok(Self {
            http,
            base_url: base_url.to_string(),
            limiter,
            credentials,
        })
    }

    /// Unauthenticated client for historical data
    pub fn public_client(&self) -> UpbitClient {
        UpbitClient::public(self.http.clone(), &self.base_url, self.limiter.clone())
    }
}

impl ExchangeConnector for UpbitConnector {
    fn connect(&self, credential_ref: &str) -> Result<Arc<dyn Exchange>, ExchangeError> {
        let credentials = self.credentials.credentials(credential_ref)?;
        Ok(Arc::new(UpbitClient::authenticated(
            self.http.clone(),
            &self.base_url,
            self.limiter.clone(),
            credentials,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RateLimitConfig;
    use rust_decimal_macros::dec;

    fn candle_at(open_time: i64, close: Decimal) -> Candle {
        Candle {
            open_time,
            open: close,
            high: close,
            low: close,
            close,
            volume: dec!(1),
            close_time: open_time + 59_999,
        }
    }

    #[test]
    fn test_parse_candle() {
        let json = r#"{
            "market": "KRW-BTC",
            "candle_date_time_utc": "2024-01-01T00:05:00",
            "candle_date_time_kst": "2024-01-01T09:05:00",
            "opening_price": 56000000.0,
            "high_price": 56100000.0,
            "low_price": 55900000.0,
            "trade_price": 56050000.0,
            "timestamp": 1704067559000,
            "candle_acc_trade_price": 1234567.8,
            "candle_acc_trade_volume": 0.5,
            "unit": 5
        }"#;
        let raw: RawCandle = serde_json::from_str(json).unwrap();
        let candle = parse_candle(raw, Timeframe::M5).unwrap();
        assert_eq!(candle.open_time, 1_704_067_500_000);
        assert_eq!(candle.close_time, 1_704_067_500_000 + 300_000 - 1);
        assert_eq!(candle.close, dec!(56050000));
        assert_eq!(candle.volume, dec!(0.5));
    }

    #[test]
    fn test_merge_pages_dedups_and_sorts() {
        let page1 = vec![
            candle_at(300, dec!(3)),
            candle_at(200, dec!(2)),
            candle_at(100, dec!(1)),
        ];
        let page2 = vec![candle_at(100, dec!(1)), candle_at(0, dec!(0))];
        let merged = merge_pages(vec![page1, page2], 10);
        let times: Vec<i64> = merged.iter().map(|c| c.open_time).collect();
        assert_eq!(times, vec![0, 100, 200, 300]);

        let trimmed = merge_pages(vec![merged], 2);
        assert_eq!(trimmed[0].open_time, 200);
        assert_eq!(trimmed.len(), 2);
    }

    #[test]
    fn test_api_error_classification() {
        let body = r#"{"error":{"name":"invalid_access_key","message":"잘못된 엑세스 키입니다."}}"#;
        assert!(api_error(StatusCode::UNAUTHORIZED, body).is_fatal());

        let body = r#"{"error":{"name":"insufficient_funds_bid","message":"주문가능한 금액이 부족합니다."}}"#;
        let err = api_error(StatusCode::BAD_REQUEST, body);
        assert!(!err.is_fatal());
        assert!(matches!(err, ExchangeError::Api { status: 400, .. }));

        let err = api_error(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(!err.is_fatal());
    }

    #[test]
    fn test_parse_order_sums_trades() {
        let json = r#"{
            "uuid": "9ca023a5-851b-4fec-9f0a-48cd83c2eaae",
            "side": "bid",
            "ord_type": "price",
            "state": "cancel",
            "paid_fee": "2.5",
            "executed_volume": "0.0001",
            "trades": [
                {"price": "50000000", "volume": "0.00006", "funds": "3000"},
                {"price": "50000000", "volume": "0.00004", "funds": "2000"}
            ]
        }"#;
        let raw: RawOrder = serde_json::from_str(json).unwrap();
        let order = parse_order(raw).unwrap();
        assert_eq!(order.state, OrderState::Cancel);
        assert_eq!(order.executed_volume, dec!(0.0001));
        assert_eq!(order.executed_funds, dec!(5000));
        assert_eq!(order.avg_price(), Some(dec!(50000000)));
        assert_eq!(order.paid_fee, dec!(2.5));
    }

    #[test]
    fn test_order_params() {
        let params = order_params(&OrderRequest::MarketBuy {
            pair: "KRW-BTC".into(),
            quote_amount: dec!(10000.00),
        });
        assert_eq!(
            query_string(&params),
            "market=KRW-BTC&side=bid&price=10000&ord_type=price"
        );
    }

    #[test]
    fn test_candle_paths_and_cursor() {
        assert_eq!(candle_path(Timeframe::H4), "/v1/candles/minutes/240");
        assert_eq!(candle_path(Timeframe::D1), "/v1/candles/days");
        assert_eq!(
            format_cursor(1_704_067_500_000).unwrap(),
            "2024-01-01T00:05:00Z"
        );
    }

    const BASE_MS: i64 = 1_704_067_200_000;

    /// Exchange stand-in holding `total` minute candles from
    /// 2024-01-01T00:00:00Z. Pages come back newest-first, honouring
    /// `count` and an exclusive `to` cursor; every (count, to) is recorded.
    struct CandleFeed {
        total: i64,
        calls: std::sync::Mutex<Vec<(usize, Option<String>)>>,
    }

    async fn candle_page(
        axum::extract::State(feed): axum::extract::State<Arc<CandleFeed>>,
        axum::extract::Query(params): axum::extract::Query<BTreeMap<String, String>>,
    ) -> axum::Json<Vec<serde_json::Value>> {
        let count: usize = params["count"].parse().unwrap();
        let to = params.get("to").cloned();
        feed.calls.lock().unwrap().push((count, to.clone()));

        let before = to
            .map(|t| {
                NaiveDateTime::parse_from_str(&t, "%Y-%m-%dT%H:%M:%SZ")
                    .unwrap()
                    .and_utc()
                    .timestamp_millis()
            })
            .unwrap_or(i64::MAX);
        let rows = (0..feed.total)
            .rev()
            .map(|i| BASE_MS + i * 60_000)
            .filter(|t| *t < before)
            .take(count)
            .map(|t| {
                let time = DateTime::<Utc>::from_timestamp_millis(t).unwrap();
                serde_json::json!({
                    "candle_date_time_utc": time.format(CANDLE_TIME_FORMAT).to_string(),
                    "opening_price": 100.0,
                    "high_price": 101.0,
                    "low_price": 99.0,
                    "trade_price": 100.5,
                    "candle_acc_trade_volume": 2.0,
                })
            })
            .collect();
        axum::Json(rows)
    }

    async fn serve_candles(total: i64) -> (UpbitClient, Arc<CandleFeed>) {
        let feed = Arc::new(CandleFeed {
            total,
            calls: std::sync::Mutex::new(Vec::new()),
        });
        let app = axum::Router::new()
            .route("/v1/candles/minutes/1", axum::routing::get(candle_page))
            .with_state(feed.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let client = UpbitClient::public(
            Client::new(),
            &format!("http://{addr}"),
            Arc::new(RateLimiter::default()),
        );
        (client, feed)
    }

    #[tokio::test]
    async fn test_candles_page_backwards_past_the_per_call_limit() {
        let (client, feed) = serve_candles(1000).await;
        let candles = client.candles("KRW-BTC", Timeframe::M1, 450).await.unwrap();

        assert_eq!(candles.len(), 450);
        assert_eq!(candles.last().unwrap().open_time, BASE_MS + 999 * 60_000);
        assert_eq!(candles[0].open_time, BASE_MS + 550 * 60_000);
        assert!(candles.windows(2).all(|w| w[1].open_time - w[0].open_time == 60_000));

        let calls = feed.calls.lock().unwrap().clone();
        let counts: Vec<usize> = calls.iter().map(|(c, _)| *c).collect();
        assert_eq!(counts, vec![200, 200, 50]);
        assert_eq!(calls[0].1, None);
        // Each cursor is the oldest bar of the previous page
        assert_eq!(calls[1].1, format_cursor(BASE_MS + 800 * 60_000));
        assert_eq!(calls[2].1, format_cursor(BASE_MS + 600 * 60_000));
    }

    #[tokio::test]
    async fn test_candles_stop_on_short_page() {
        let (client, feed) = serve_candles(250).await;
        let candles = client.candles("KRW-BTC", Timeframe::M1, 600).await.unwrap();

        assert_eq!(candles.len(), 250);
        assert_eq!(candles[0].open_time, BASE_MS);
        let counts: Vec<usize> = feed.calls.lock().unwrap().iter().map(|(c, _)| *c).collect();
        assert_eq!(counts, vec![200, 200]);
    }

    type SeenTokens = Arc<std::sync::Mutex<Vec<(i64, i64)>>>;

    /// Records (token iat, arrival second) of every accounts request
    async fn accounts(
        axum::extract::State(seen): axum::extract::State<SeenTokens>,
        headers: axum::http::HeaderMap,
    ) -> axum::Json<Vec<serde_json::Value>> {
        use base64::engine::general_purpose::URL_SAFE_NO_PAD;
        use base64::Engine;

        let bearer = headers["authorization"].to_str().unwrap();
        let payload = bearer.trim_start_matches("Bearer ").split('.').nth(1).unwrap();
        let claims: serde_json::Value =
            serde_json::from_slice(&URL_SAFE_NO_PAD.decode(payload).unwrap()).unwrap();
        seen.lock()
            .unwrap()
            .push((claims["iat"].as_i64().unwrap(), Utc::now().timestamp()));
        axum::Json(vec![serde_json::json!({"currency": "KRW", "balance": "5000"})])
    }

    #[tokio::test]
    async fn test_queued_private_call_carries_fresh_token() {
        let seen: SeenTokens = Arc::default();
        let app = axum::Router::new()
            .route("/v1/accounts", axum::routing::get(accounts))
            .with_state(seen.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        // One private call per 2.1s: the second call queues
        let limiter = RateLimiter::new(&RateLimitConfig {
            public_per_window: 10,
            private_per_window: 1,
            window_ms: 2100,
        });
        let client = UpbitClient::authenticated(
            Client::new(),
            &format!("http://{addr}"),
            Arc::new(limiter),
            Credentials::new("access", "secret"),
        );

        assert_eq!(client.balance("KRW").await.unwrap(), dec!(5000));
        assert_eq!(client.balance("krw").await.unwrap(), dec!(5000));

        let seen = seen.lock().unwrap().clone();
        assert_eq!(seen.len(), 2);
        for (iat, arrived) in seen {
            assert!(arrived - iat <= 1, "token issued at {iat}, used at {arrived}");
        }
    }
}
