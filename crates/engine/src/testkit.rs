//! In-memory store and scripted exchange for runtime tests

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::api::{Exchange, ExchangeConnector, OrderInfo, OrderRequest, OrderState, Ticker};
use crate::bot::{BotRecord, BotStore, FillUpdate, StrategyRecord};
use crate::error::{ExchangeError, StoreError};
use crate::strategy::{Action, Condition, IndicatorSpec, Operand, Safety, StrategyConfig};
use crate::types::*;

pub fn candles_from(prices: &[f64]) -> Vec<Candle> {
    prices
        .iter()
        .enumerate()
        .map(|(i, &p)| {
            let price = Decimal::from_str_exact(&format!("{:.2}", p)).unwrap();
            Candle {
                open_time: (i as i64) * 60000,
                open: price,
                high: price + dec!(1),
                low: price - dec!(1),
                close: price,
                volume: dec!(100),
                close_time: ((i + 1) as i64) * 60000 - 1,
            }
        })
        .collect()
}

/// RSI(2) crossing above 30, all-in, -5% / +10%
pub fn rsi_cross_strategy() -> StrategyRecord {
    StrategyRecord {
        id: 10,
        name: "rsi-bounce".to_string(),
        pair: "KRW-BTC".to_string(),
        timeframe: Timeframe::M1,
        config: StrategyConfig {
            conditions: vec![Condition {
                left: IndicatorSpec::new("rsi").with_param("period", 2.0),
                operator: "crosses_above".to_string(),
                right: Operand::Number(30.0),
            }],
            logic: "and".to_string(),
            action: Action {
                order_type: "market_buy".to_string(),
                amount: dec!(100),
                limit_offset_pct: None,
            },
            safety: Safety {
                stop_loss: dec!(-5),
                take_profit: dec!(10),
                max_position: dec!(100),
            },
        },
    }
}

/// Strategy that signals on every bar
pub fn always_buy_strategy() -> StrategyRecord {
    let mut strategy = rsi_cross_strategy();
    strategy.config.conditions = vec![Condition {
        left: IndicatorSpec::new("price"),
        operator: "greater_than".to_string(),
        right: Operand::Number(0.0),
    }];
    strategy.config.safety = Safety::default();
    strategy
}

#[derive(Default)]
struct MemoryState {
    bots: HashMap<i64, BotRecord>,
    strategies: HashMap<i64, StrategyRecord>,
    trades: Vec<(i64, String, Trade)>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn with_bot(bot_id: i64, strategy: StrategyRecord, max_investment: Decimal) -> Self {
        let store = Self::default();
        store.add_bot(bot_id, strategy, max_investment);
        store
    }

    pub fn add_bot(&self, bot_id: i64, strategy: StrategyRecord, max_investment: Decimal) {
        let mut state = self.state.lock().unwrap();
        state.bots.insert(
            bot_id,
            BotRecord {
                id: bot_id,
                strategy_id: strategy.id,
                credential_ref: "main".to_string(),
                status: BotStatus::Idle,
                max_investment,
                position: None,
                total_profit: Decimal::ZERO,
                total_trades: 0,
                winning_trades: 0,
                last_error: None,
                fatal_error: false,
            },
        );
        state.strategies.insert(strategy.id, strategy);
    }

    pub fn bot(&self, bot_id: i64) -> BotRecord {
        self.state.lock().unwrap().bots[&bot_id].clone()
    }

    pub fn trades(&self, bot_id: i64) -> Vec<Trade> {
        self.state
            .lock()
            .unwrap()
            .trades
            .iter()
            .filter(|(id, _, _)| *id == bot_id)
            .map(|(_, _, t)| t.clone())
            .collect()
    }

    pub fn set_status_now(&self, bot_id: i64, status: BotStatus) {
        if let Some(bot) = self.state.lock().unwrap().bots.get_mut(&bot_id) {
            bot.status = status;
        }
    }
}

#[async_trait]
impl BotStore for MemoryStore {
    async fn load_bot(&self, bot_id: i64) -> Result<BotRecord, StoreError> {
        self.state
            .lock()
            .unwrap()
            .bots
            .get(&bot_id)
            .cloned()
            .ok_or(StoreError::BotNotFound(bot_id))
    }

    async fn load_strategy(&self, strategy_id: i64) -> Result<StrategyRecord, StoreError> {
        self.state
            .lock()
            .unwrap()
            .strategies
            .get(&strategy_id)
            .cloned()
            .ok_or(StoreError::StrategyNotFound(strategy_id))
    }

    async fn set_status(&self, bot_id: i64, status: BotStatus) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let bot = state
            .bots
            .get_mut(&bot_id)
            .ok_or(StoreError::BotNotFound(bot_id))?;
        bot.status = status;
        Ok(())
    }

    async fn record_error(&self, bot_id: i64, message: &str, fatal: bool) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let bot = state
            .bots
            .get_mut(&bot_id)
            .ok_or(StoreError::BotNotFound(bot_id))?;
        bot.last_error = Some(message.to_string());
        if fatal {
            bot.fatal_error = true;
            bot.status = BotStatus::Error;
        }
        Ok(())
    }

    async fn clear_error(&self, bot_id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let bot = state
            .bots
            .get_mut(&bot_id)
            .ok_or(StoreError::BotNotFound(bot_id))?;
        bot.last_error = None;
        bot.fatal_error = false;
        if bot.status == BotStatus::Error {
            bot.status = BotStatus::Running;
        }
        Ok(())
    }

    async fn apply_fill(&self, bot_id: i64, fill: &FillUpdate) -> Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let bot = state
            .bots
            .get_mut(&bot_id)
            .ok_or(StoreError::BotNotFound(bot_id))?;
        bot.position = fill.position.clone();
        bot.total_profit += fill.profit_delta;
        if let Some(won) = fill.won {
            bot.total_trades += 1;
            if won {
                bot.winning_trades += 1;
            }
        }
        state
            .trades
            .push((bot_id, fill.order_id.clone(), fill.trade.clone()));
        Ok(())
    }

    async fn bots_with_status(&self, status: BotStatus) -> Result<Vec<i64>, StoreError> {
        let mut ids: Vec<i64> = self
            .state
            .lock()
            .unwrap()
            .bots
            .values()
            .filter(|b| b.status == status)
            .map(|b| b.id)
            .collect();
        ids.sort_unstable();
        Ok(ids)
    }
}

/// Exchange that serves fixed candles and fills market orders at the last
/// close with the default 0.05% fee.
pub struct FakeExchange {
    candles: Mutex<Vec<Candle>>,
    balance: Decimal,
    unauthorized: AtomicBool,
    candle_failure: AtomicBool,
    limit_orders_rest: AtomicBool,
    candle_delay: Mutex<Duration>,
    orders: Mutex<HashMap<String, OrderInfo>>,
    last_order: Mutex<Option<OrderRequest>>,
    order_delay: Mutex<Duration>,
    placed: AtomicUsize,
    cancelled: AtomicUsize,
}

impl FakeExchange {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self {
            candles: Mutex::new(candles),
            balance: dec!(1000000),
            unauthorized: AtomicBool::new(false),
            candle_failure: AtomicBool::new(false),
            limit_orders_rest: AtomicBool::new(false),
            candle_delay: Mutex::new(Duration::ZERO),
            orders: Mutex::new(HashMap::new()),
            last_order: Mutex::new(None),
            order_delay: Mutex::new(Duration::ZERO),
            placed: AtomicUsize::new(0),
            cancelled: AtomicUsize::new(0),
        }
    }

    pub fn set_candles(&self, candles: Vec<Candle>) {
        *self.candles.lock().unwrap() = candles;
    }

    pub fn set_unauthorized(&self, on: bool) {
        self.unauthorized.store(on, Ordering::SeqCst);
    }

    pub fn set_candle_failure(&self, on: bool) {
        self.candle_failure.store(on, Ordering::SeqCst);
    }

    pub fn set_limit_orders_rest(&self, on: bool) {
        self.limit_orders_rest.store(on, Ordering::SeqCst);
    }

    pub fn set_candle_delay(&self, delay: Duration) {
        *self.candle_delay.lock().unwrap() = delay;
    }

    pub fn set_order_delay(&self, delay: Duration) {
        *self.order_delay.lock().unwrap() = delay;
    }

    pub fn last_order(&self) -> Option<OrderRequest> {
        self.last_order.lock().unwrap().clone()
    }

    pub fn orders_placed(&self) -> usize {
        self.placed.load(Ordering::SeqCst)
    }

    pub fn orders_cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn last_price(&self) -> Decimal {
        self.candles
            .lock()
            .unwrap()
            .last()
            .map(|c| c.close)
            .unwrap_or(Decimal::ZERO)
    }

    fn check_auth(&self) -> Result<(), ExchangeError> {
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(ExchangeError::Unauthorized("invalid_access_key".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Exchange for FakeExchange {
    async fn ticker(&self, pair: &str) -> Result<Ticker, ExchangeError> {
        Ok(Ticker {
            pair: pair.to_string(),
            price: self.last_price(),
            timestamp: 0,
        })
    }

    async fn candles(
        &self,
        _pair: &str,
        _timeframe: Timeframe,
        count: usize,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let delay = *self.candle_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.candle_failure.load(Ordering::SeqCst) {
            return Err(ExchangeError::Api {
                status: 503,
                message: "service unavailable".into(),
            });
        }
        let candles = self.candles.lock().unwrap();
        let skip = candles.len().saturating_sub(count);
        Ok(candles[skip..].to_vec())
    }

    async fn balance(&self, _currency: &str) -> Result<Decimal, ExchangeError> {
        self.check_auth()?;
        Ok(self.balance)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderInfo, ExchangeError> {
        self.check_auth()?;
        let delay = *self.order_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        *self.last_order.lock().unwrap() = Some(order.clone());
        let n = self.placed.fetch_add(1, Ordering::SeqCst) + 1;
        let order_id = format!("order-{n}");
        let price = self.last_price();
        let fee_rate = dec!(0.0005);

        let info = match order {
            OrderRequest::LimitBuy { .. } if self.limit_orders_rest.load(Ordering::SeqCst) =>
            {
                OrderInfo {
                    order_id: order_id.clone(),
                    state: OrderState::Wait,
                    executed_volume: Decimal::ZERO,
                    executed_funds: Decimal::ZERO,
                    paid_fee: Decimal::ZERO,
                }
            }
            OrderRequest::MarketBuy { quote_amount, .. } => {
                let fee = *quote_amount * fee_rate;
                let funds = *quote_amount - fee;
                OrderInfo {
                    order_id: order_id.clone(),
                    state: OrderState::Done,
                    executed_volume: funds / price,
                    executed_funds: funds,
                    paid_fee: fee,
                }
            }
            OrderRequest::MarketSell { quantity, .. } => {
                let funds = *quantity * price;
                OrderInfo {
                    order_id: order_id.clone(),
                    state: OrderState::Done,
                    executed_volume: *quantity,
                    executed_funds: funds,
                    paid_fee: funds * fee_rate,
                }
            }
            OrderRequest::LimitBuy {
                price, quantity, ..
            } => {
                let funds = *quantity * *price;
                OrderInfo {
                    order_id: order_id.clone(),
                    state: OrderState::Done,
                    executed_volume: *quantity,
                    executed_funds: funds,
                    paid_fee: funds * fee_rate,
                }
            }
        };
        self.orders
            .lock()
            .unwrap()
            .insert(order_id, info.clone());
        Ok(info)
    }

    async fn cancel_order(&self, order_id: &str) -> Result<OrderInfo, ExchangeError> {
        self.cancelled.fetch_add(1, Ordering::SeqCst);
        let mut orders = self.orders.lock().unwrap();
        let info = orders
            .get_mut(order_id)
            .ok_or_else(|| ExchangeError::InvalidRequest(format!("unknown order {order_id}")))?;
        info.state = OrderState::Cancel;
        Ok(info.clone())
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderInfo, ExchangeError> {
        self.orders
            .lock()
            .unwrap()
            .get(order_id)
            .cloned()
            .ok_or_else(|| ExchangeError::InvalidRequest(format!("unknown order {order_id}")))
    }
}

/// Connector handing out one shared fake
pub struct FakeConnector(pub Arc<FakeExchange>);

impl ExchangeConnector for FakeConnector {
    fn connect(&self, _credential_ref: &str) -> Result<Arc<dyn Exchange>, ExchangeError> {
        Ok(self.0.clone())
    }
}
