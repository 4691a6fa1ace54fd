//! Exchange boundary
//!
//! The bot runtime only talks to the `Exchange` trait. `UpbitClient` is the
//! REST implementation; tests substitute scripted fakes.

pub mod auth;
pub mod rate_limit;
pub mod upbit;

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::ExchangeError;
use crate::types::{Candle, Timeframe};

pub use auth::{CredentialProvider, Credentials};
pub use rate_limit::{RateLimitConfig, RateLimiter, RequestGroup};
pub use upbit::{UpbitClient, UpbitConnector};

/// Last-trade snapshot of a pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub pair: String,
    pub price: Decimal,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderRequest {
    /// Spend `quote_amount` of the quote currency
    MarketBuy { pair: String, quote_amount: Decimal },
    /// Sell `quantity` of the base currency
    MarketSell { pair: String, quantity: Decimal },
    LimitBuy {
        pair: String,
        price: Decimal,
        quantity: Decimal,
    },
}

impl OrderRequest {
    pub fn pair(&self) -> &str {
        match self {
            Self::MarketBuy { pair, .. }
            | Self::MarketSell { pair, .. }
            | Self::LimitBuy { pair, .. } => pair,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderState {
    /// Resting or still executing
    Wait,
    Done,
    Cancel,
}

/// Exchange-side view of an order
#[derive(Debug, Clone, PartialEq)]
pub struct OrderInfo {
    pub order_id: String,
    pub state: OrderState,
    /// Base quantity filled so far
    pub executed_volume: Decimal,
    /// Quote value of the fills, before fees
    pub executed_funds: Decimal,
    pub paid_fee: Decimal,
}

impl OrderInfo {
    pub fn avg_price(&self) -> Option<Decimal> {
        if self.executed_volume > Decimal::ZERO {
            Some(self.executed_funds / self.executed_volume)
        } else {
            None
        }
    }
}

#[async_trait]
pub trait Exchange: Send + Sync {
    async fn ticker(&self, pair: &str) -> Result<Ticker, ExchangeError>;

    /// Most recent `count` candles, ascending by open time
    async fn candles(
        &self,
        pair: &str,
        timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, ExchangeError>;

    /// Free balance of `currency`
    async fn balance(&self, currency: &str) -> Result<Decimal, ExchangeError>;

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderInfo, ExchangeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<OrderInfo, ExchangeError>;

    async fn get_order(&self, order_id: &str) -> Result<OrderInfo, ExchangeError>;
}

/// Builds an authenticated exchange client for a credential reference
pub trait ExchangeConnector: Send + Sync {
    fn connect(&self, credential_ref: &str) -> Result<Arc<dyn Exchange>, ExchangeError>;
}

/// Split "KRW-BTC" into (quote, base)
pub fn split_pair(pair: &str) -> Option<(&str, &str)> {
    let (quote, base) = pair.split_once('-')?;
    if quote.is_empty() || base.is_empty() {
        return None;
    }
    Some((quote, base))
}
