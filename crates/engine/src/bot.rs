//! Live bot runtime
//!
//! One `BotRunner` per active bot. Each cycle reloads the bot and its
//! strategy, fetches the latest candle window, evaluates the last bar and
//! either exits the open position or opens a new one. Cancellation is only
//! observed while fetching candles and while sleeping between cycles, so an
//! order and the bookkeeping that follows it always complete together.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::api::{split_pair, Exchange, ExchangeConnector, OrderInfo, OrderRequest, OrderState};
use crate::engine::{check_exit, position_size};
use crate::error::{CycleError, ExchangeError, StoreError};
use crate::evaluator::last_signal;
use crate::fees::FeeSchedule;
use crate::strategy::{CompiledStrategy, StrategyConfig};
use crate::types::*;
use crate::validator;

// ============================================================================
// Store boundary
// ============================================================================

/// A persisted strategy as the runtime sees it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: i64,
    pub name: String,
    pub pair: String,
    pub timeframe: Timeframe,
    pub config: StrategyConfig,
}

/// A persisted bot with its runtime state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BotRecord {
    pub id: i64,
    pub strategy_id: i64,
    pub credential_ref: String,
    pub status: BotStatus,
    pub max_investment: Decimal,
    pub position: Option<Position>,
    pub total_profit: Decimal,
    pub total_trades: u32,
    pub winning_trades: u32,
    pub last_error: Option<String>,
    pub fatal_error: bool,
}

/// A live fill together with the position change it causes
#[derive(Debug, Clone, PartialEq)]
pub struct FillUpdate {
    pub order_id: String,
    pub trade: Trade,
    /// Position after the fill; `None` once fully closed
    pub position: Option<Position>,
    pub profit_delta: Decimal,
    /// Set on exits: whether the round trip was profitable
    pub won: Option<bool>,
}

#[async_trait]
pub trait BotStore: Send + Sync {
    async fn load_bot(&self, bot_id: i64) -> Result<BotRecord, StoreError>;

    async fn load_strategy(&self, strategy_id: i64) -> Result<StrategyRecord, StoreError>;

    async fn set_status(&self, bot_id: i64, status: BotStatus) -> Result<(), StoreError>;

    /// Record a failed cycle. Fatal errors also move the bot to `error`.
    async fn record_error(&self, bot_id: i64, message: &str, fatal: bool)
        -> Result<(), StoreError>;

    /// Clear the last error; a bot in `error` returns to `running`.
    async fn clear_error(&self, bot_id: i64) -> Result<(), StoreError>;

    /// Append the trade and update position and totals atomically
    async fn apply_fill(&self, bot_id: i64, fill: &FillUpdate) -> Result<(), StoreError>;

    async fn bots_with_status(&self, status: BotStatus) -> Result<Vec<i64>, StoreError>;
}

// ============================================================================
// Settings
// ============================================================================

#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Candles fetched per cycle (raised to the strategy's warm-up if needed)
    pub candle_window: usize,
    /// Overrides the strategy timeframe as the inter-cycle wait
    pub cycle_interval: Option<Duration>,
    /// Wait after a cycle that failed before its strategy was known
    pub error_retry: Duration,
    pub fees: FeeSchedule,
    /// Order lookups before an open order is cancelled
    pub fill_poll_attempts: u32,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            candle_window: 200,
            cycle_interval: None,
            error_retry: Duration::from_secs(60),
            fees: FeeSchedule::default(),
            fill_poll_attempts: 5,
        }
    }
}

// ============================================================================
// Runner
// ============================================================================

enum CycleOutcome {
    Completed,
    Cancelled,
}

/// Everything one cycle needs, loaded fresh at its start
struct CycleContext {
    bot: BotRecord,
    strategy: StrategyRecord,
    compiled: CompiledStrategy,
    exchange: Arc<dyn Exchange>,
}

pub struct BotRunner {
    bot_id: i64,
    store: Arc<dyn BotStore>,
    connector: Arc<dyn ExchangeConnector>,
    settings: EngineSettings,
    interval: Duration,
}

impl BotRunner {
    pub fn new(
        bot_id: i64,
        store: Arc<dyn BotStore>,
        connector: Arc<dyn ExchangeConnector>,
        settings: EngineSettings,
    ) -> Self {
        let interval = settings.cycle_interval.unwrap_or(settings.error_retry);
        Self {
            bot_id,
            store,
            connector,
            settings,
            interval,
        }
    }

    /// Run cycles until `cancel` flips to true or its sender is dropped
    pub async fn run(mut self, mut cancel: watch::Receiver<bool>) {
        info!(bot_id = self.bot_id, "Bot loop started");
        loop {
            if *cancel.borrow_and_update() {
                break;
            }
            let Some(wait) = self.step(&mut cancel).await else {
                break;
            };
            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = cancel.changed() => break,
            }
        }
        info!(bot_id = self.bot_id, "Bot loop stopped");
    }

    /// One cycle plus error bookkeeping. Returns the wait before the next
    /// cycle, or `None` when cancelled.
    pub async fn step(&mut self, cancel: &mut watch::Receiver<bool>) -> Option<Duration> {
        match self.cycle(cancel).await {
            Ok(CycleOutcome::Cancelled) => return None,
            Ok(CycleOutcome::Completed) => {}
            Err(e) if e.is_fatal() => {
                error!(bot_id = self.bot_id, error = %e, "Fatal bot error");
                if let Err(store_err) = self.store.record_error(self.bot_id, &e.to_string(), true).await {
                    error!(bot_id = self.bot_id, error = %store_err, "Failed to record bot error");
                }
            }
            Err(e) => {
                warn!(bot_id = self.bot_id, error = %e, "Bot cycle failed");
                if let Err(store_err) = self.store.record_error(self.bot_id, &e.to_string(), false).await {
                    error!(bot_id = self.bot_id, error = %store_err, "Failed to record bot error");
                }
            }
        }
        Some(self.interval)
    }

    async fn load(&mut self) -> Result<CycleContext, CycleError> {
        let bot = self.store.load_bot(self.bot_id).await?;
        let strategy = self.store.load_strategy(bot.strategy_id).await?;
        self.interval = self
            .settings
            .cycle_interval
            .unwrap_or_else(|| strategy.timeframe.duration());
        let compiled = validator::compile(&strategy.config).map_err(|violations| {
            CycleError::InvalidStrategy(
                violations
                    .iter()
                    .map(|v| v.to_string())
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })?;
        let exchange = self.connector.connect(&bot.credential_ref)?;
        Ok(CycleContext {
            bot,
            strategy,
            compiled,
            exchange,
        })
    }

    async fn cycle(&mut self, cancel: &mut watch::Receiver<bool>) -> Result<CycleOutcome, CycleError> {
        let ctx = self.load().await?;
        let count = self
            .settings
            .candle_window
            .max(ctx.compiled.required_bars() + 1);

        let candles = tokio::select! {
            res = ctx.exchange.candles(&ctx.strategy.pair, ctx.strategy.timeframe, count) => res?,
            _ = cancel.changed() => return Ok(CycleOutcome::Cancelled),
        };

        let Some(last) = candles.last() else {
            debug!(bot_id = self.bot_id, "No candles returned");
            return Ok(CycleOutcome::Completed);
        };
        let price = last.close;
        let signal = last_signal(&ctx.compiled, &candles);
        let buy_side = ctx.compiled.action.order_type.is_buy();

        debug!(
            bot_id = self.bot_id,
            pair = %ctx.strategy.pair,
            price = %price,
            signal,
            in_position = ctx.bot.position.is_some(),
            "Cycle evaluated"
        );

        if let Some(position) = &ctx.bot.position {
            let reason = check_exit(position, price, &ctx.compiled.safety)
                .or_else(|| (!buy_side && signal).then_some(TradeReason::Signal));
            if let Some(reason) = reason {
                self.exit(&ctx, position, price, reason).await?;
            }
        } else if buy_side && signal {
            self.enter(&ctx, price).await?;
        }

        if ctx.bot.last_error.is_some() || ctx.bot.status == BotStatus::Error {
            self.store.clear_error(self.bot_id).await?;
        }
        Ok(CycleOutcome::Completed)
    }

    async fn enter(&self, ctx: &CycleContext, price: Decimal) -> Result<(), CycleError> {
        let pair = &ctx.strategy.pair;
        let (quote, _) = split_pair(pair)
            .ok_or_else(|| ExchangeError::InvalidRequest(format!("bad pair '{pair}'")))?;

        let balance = ctx.exchange.balance(quote).await?;
        let invest = position_size(
            balance.min(ctx.bot.max_investment),
            &ctx.compiled.action,
            &ctx.compiled.safety,
        );
        if !self.settings.fees.meets_minimum(invest) {
            debug!(bot_id = self.bot_id, invest = %invest, balance = %balance, "Entry below minimum order");
            return Ok(());
        }

        let order = if ctx.compiled.action.order_type.is_limit() {
            let limit = price * (Decimal::ONE - ctx.compiled.action.limit_offset_pct / dec!(100));
            if limit <= Decimal::ZERO {
                return Err(ExchangeError::InvalidRequest(format!("bad limit price {limit}")).into());
            }
            OrderRequest::LimitBuy {
                pair: pair.clone(),
                price: limit,
                quantity: (invest - self.settings.fees.fee_on(invest)) / limit,
            }
        } else {
            OrderRequest::MarketBuy {
                pair: pair.clone(),
                quote_amount: invest,
            }
        };

        let Some(info) = self.execute(ctx.exchange.as_ref(), &order).await? else {
            return Ok(());
        };
        let fill_price = info.avg_price().unwrap_or(price);
        let cost = info.executed_funds + info.paid_fee;
        let now = chrono::Utc::now().timestamp_millis();

        let fill = FillUpdate {
            order_id: info.order_id.clone(),
            trade: Trade {
                side: TradeSide::Buy,
                price: fill_price,
                quantity: info.executed_volume,
                total: cost,
                fee: info.paid_fee,
                profit: Decimal::ZERO,
                profit_pct: Decimal::ZERO,
                reason: TradeReason::Signal,
                timestamp: now,
            },
            position: Some(Position {
                entry_price: fill_price,
                quantity: info.executed_volume,
                cost,
                entry_time: now,
            }),
            profit_delta: Decimal::ZERO,
            won: None,
        };
        self.record(fill).await?;

        info!(
            bot_id = self.bot_id,
            pair = %pair,
            order_id = %info.order_id,
            price = %fill_price,
            qty = %info.executed_volume,
            "Entered position"
        );
        Ok(())
    }

    async fn exit(
        &self,
        ctx: &CycleContext,
        position: &Position,
        price: Decimal,
        reason: TradeReason,
    ) -> Result<(), CycleError> {
        let pair = &ctx.strategy.pair;
        // Exits never rest on the book, whatever the entry order type.
        let order = OrderRequest::MarketSell {
            pair: pair.clone(),
            quantity: position.quantity,
        };

        let Some(info) = self.execute(ctx.exchange.as_ref(), &order).await? else {
            return Ok(());
        };
        let sold = info.executed_volume.min(position.quantity);
        let fill_price = info.avg_price().unwrap_or(price);

        // Partial exits keep the remainder open with its share of the cost.
        let sold_cost = if position.quantity > Decimal::ZERO {
            position.cost * sold / position.quantity
        } else {
            position.cost
        };
        let remaining = position.quantity - sold;
        let proceeds = info.executed_funds - info.paid_fee;
        let profit = proceeds - sold_cost;
        let profit_pct = if sold_cost > Decimal::ZERO {
            profit / sold_cost * dec!(100)
        } else {
            Decimal::ZERO
        };

        let fill = FillUpdate {
            order_id: info.order_id.clone(),
            trade: Trade {
                side: TradeSide::Sell,
                price: fill_price,
                quantity: sold,
                total: proceeds,
                fee: info.paid_fee,
                profit,
                profit_pct,
                reason,
                timestamp: chrono::Utc::now().timestamp_millis(),
            },
            position: (remaining > Decimal::ZERO).then(|| Position {
                quantity: remaining,
                cost: position.cost - sold_cost,
                ..position.clone()
            }),
            profit_delta: profit,
            won: Some(profit > Decimal::ZERO),
        };
        self.record(fill).await?;

        info!(
            bot_id = self.bot_id,
            pair = %pair,
            order_id = %info.order_id,
            price = %fill_price,
            profit = %profit,
            reason = reason.as_str(),
            "Exited position"
        );
        Ok(())
    }

    /// Place an order and re-query it until it settles; an order still
    /// open after `fill_poll_attempts` lookups is cancelled and only its
    /// filled part counts. Returns `None` if nothing filled.
    async fn execute(
        &self,
        exchange: &dyn Exchange,
        order: &OrderRequest,
    ) -> Result<Option<OrderInfo>, ExchangeError> {
        let mut info = exchange.place_order(order).await?;
        let mut attempts = 0;
        while info.state == OrderState::Wait && attempts < self.settings.fill_poll_attempts {
            info = exchange.get_order(&info.order_id).await?;
            attempts += 1;
        }
        if info.state == OrderState::Wait {
            warn!(bot_id = self.bot_id, order_id = %info.order_id, "Order still open, cancelling");
            exchange.cancel_order(&info.order_id).await?;
            info = exchange.get_order(&info.order_id).await?;
        }
        if info.executed_volume > Decimal::ZERO {
            Ok(Some(info))
        } else {
            debug!(bot_id = self.bot_id, order_id = %info.order_id, pair = order.pair(), "Order did not fill");
            Ok(None)
        }
    }

    async fn record(&self, fill: FillUpdate) -> Result<(), CycleError> {
        if let Err(e) = self.store.apply_fill(self.bot_id, &fill).await {
            error!(
                bot_id = self.bot_id,
                order_id = %fill.order_id,
                side = fill.trade.side.as_str(),
                qty = %fill.trade.quantity,
                error = %e,
                "Order filled but bookkeeping failed"
            );
            return Err(e.into());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{candles_from, rsi_cross_strategy, FakeConnector, FakeExchange, MemoryStore};
    use rust_decimal_macros::dec;

    fn settings() -> EngineSettings {
        EngineSettings {
            candle_window: 5,
            cycle_interval: Some(Duration::from_millis(10)),
            ..EngineSettings::default()
        }
    }

    fn runner(store: &Arc<MemoryStore>, exchange: &Arc<FakeExchange>) -> BotRunner {
        BotRunner::new(
            1,
            store.clone(),
            Arc::new(FakeConnector(exchange.clone())),
            settings(),
        )
    }

    #[tokio::test]
    async fn test_cycle_enters_then_takes_profit() {
        let store = Arc::new(MemoryStore::with_bot(1, rsi_cross_strategy(), dec!(10000)));
        let exchange = Arc::new(FakeExchange::new(candles_from(&[100.0, 98.0, 96.0, 100.0])));
        let (_tx, mut rx) = watch::channel(false);
        let mut runner = runner(&store, &exchange);

        assert_eq!(runner.step(&mut rx).await, Some(Duration::from_millis(10)));
        let bot = store.bot(1);
        let position = bot.position.expect("position opened");
        assert_eq!(position.entry_price, dec!(100));
        assert_eq!(position.cost, dec!(10000));

        exchange.set_candles(candles_from(&[100.0, 98.0, 96.0, 100.0, 111.0]));
        runner.step(&mut rx).await;

        let bot = store.bot(1);
        assert!(bot.position.is_none());
        assert_eq!(bot.total_trades, 1);
        assert_eq!(bot.winning_trades, 1);
        assert!(bot.total_profit > dec!(1000));

        let trades = store.trades(1);
        assert_eq!(trades.len(), 2);
        assert_eq!(trades[1].reason, TradeReason::TakeProfit);
    }

    #[tokio::test]
    async fn test_no_entry_without_signal() {
        let store = Arc::new(MemoryStore::with_bot(1, rsi_cross_strategy(), dec!(10000)));
        let exchange = Arc::new(FakeExchange::new(candles_from(&[100.0, 101.0, 102.0, 103.0])));
        let (_tx, mut rx) = watch::channel(false);
        runner(&store, &exchange).step(&mut rx).await;
        assert!(store.bot(1).position.is_none());
        assert_eq!(exchange.orders_placed(), 0);
    }

    #[tokio::test]
    async fn test_entry_capped_by_max_investment_and_minimum() {
        let store = Arc::new(MemoryStore::with_bot(1, rsi_cross_strategy(), dec!(4000)));
        let exchange = Arc::new(FakeExchange::new(candles_from(&[100.0, 98.0, 96.0, 100.0])));
        let (_tx, mut rx) = watch::channel(false);
        runner(&store, &exchange).step(&mut rx).await;
        // 4000 is under the 5000 minimum order
        assert_eq!(exchange.orders_placed(), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_then_recovery() {
        let store = Arc::new(MemoryStore::with_bot(1, rsi_cross_strategy(), dec!(10000)));
        let exchange = Arc::new(FakeExchange::new(candles_from(&[100.0, 98.0, 96.0, 100.0])));
        exchange.set_unauthorized(true);
        let (_tx, mut rx) = watch::channel(false);
        let mut runner = runner(&store, &exchange);

        store.set_status_now(1, BotStatus::Running);
        runner.step(&mut rx).await;
        let bot = store.bot(1);
        assert_eq!(bot.status, BotStatus::Error);
        assert!(bot.fatal_error);
        assert!(bot.last_error.is_some());

        exchange.set_unauthorized(false);
        runner.step(&mut rx).await;
        let bot = store.bot(1);
        assert_eq!(bot.status, BotStatus::Running);
        assert!(!bot.fatal_error);
        assert!(bot.last_error.is_none());
        assert!(bot.position.is_some());
    }

    #[tokio::test]
    async fn test_transient_error_keeps_status() {
        let store = Arc::new(MemoryStore::with_bot(1, rsi_cross_strategy(), dec!(10000)));
        let exchange = Arc::new(FakeExchange::new(candles_from(&[100.0, 98.0, 96.0, 100.0])));
        exchange.set_candle_failure(true);
        let (_tx, mut rx) = watch::channel(false);
        store.set_status_now(1, BotStatus::Running);

        runner(&store, &exchange).step(&mut rx).await;
        let bot = store.bot(1);
        assert_eq!(bot.status, BotStatus::Running);
        assert!(!bot.fatal_error);
        assert!(bot.last_error.is_some());
    }

    #[tokio::test]
    async fn test_cancel_during_candle_fetch() {
        let store = Arc::new(MemoryStore::with_bot(1, rsi_cross_strategy(), dec!(10000)));
        let exchange = Arc::new(FakeExchange::new(candles_from(&[100.0, 98.0, 96.0, 100.0])));
        exchange.set_candle_delay(Duration::from_secs(5));
        let (tx, mut rx) = watch::channel(false);
        let mut runner = runner(&store, &exchange);

        let handle = tokio::spawn(async move { runner.step(&mut rx).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), None);
        assert_eq!(exchange.orders_placed(), 0);
    }

    #[tokio::test]
    async fn test_limit_strategy_exits_with_market_sell() {
        let mut strategy = rsi_cross_strategy();
        strategy.config.action.order_type = "limit_buy".to_string();
        strategy.config.action.limit_offset_pct = Some(dec!(1));
        let store = Arc::new(MemoryStore::with_bot(1, strategy, dec!(10000)));
        let exchange = Arc::new(FakeExchange::new(candles_from(&[100.0, 98.0, 96.0, 100.0])));
        let (_tx, mut rx) = watch::channel(false);
        let mut runner = runner(&store, &exchange);

        runner.step(&mut rx).await;
        let position = store.bot(1).position.expect("limit entry filled");
        assert!(position.entry_price > dec!(98.99) && position.entry_price < dec!(99.01));

        // Resting limits would never fill on the way down
        exchange.set_limit_orders_rest(true);
        exchange.set_candles(candles_from(&[100.0, 98.0, 96.0, 100.0, 90.0]));
        runner.step(&mut rx).await;

        assert!(matches!(
            exchange.last_order(),
            Some(OrderRequest::MarketSell { quantity, .. }) if quantity == position.quantity
        ));
        assert_eq!(exchange.orders_placed(), 2);
        assert_eq!(exchange.orders_cancelled(), 0);
        let bot = store.bot(1);
        assert!(bot.position.is_none());
        assert_eq!(bot.total_trades, 1);
        assert_eq!(store.trades(1)[1].reason, TradeReason::StopLoss);
    }

    #[tokio::test]
    async fn test_unfilled_limit_order_is_cancelled() {
        let mut strategy = rsi_cross_strategy();
        strategy.config.action.order_type = "limit_buy".to_string();
        strategy.config.action.limit_offset_pct = Some(dec!(1));
        let store = Arc::new(MemoryStore::with_bot(1, strategy, dec!(10000)));
        let exchange = Arc::new(FakeExchange::new(candles_from(&[100.0, 98.0, 96.0, 100.0])));
        exchange.set_limit_orders_rest(true);
        let (_tx, mut rx) = watch::channel(false);

        runner(&store, &exchange).step(&mut rx).await;
        assert_eq!(exchange.orders_placed(), 1);
        assert_eq!(exchange.orders_cancelled(), 1);
        assert!(store.bot(1).position.is_none());
        assert!(store.trades(1).is_empty());
    }
}
