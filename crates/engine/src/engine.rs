//! Bar-by-bar backtesting engine
//!
//! Replays a candle series through the evaluator with a single long
//! position at a time. Per bar: exit check on an open position first, then
//! entry on a fresh signal. Synchronous and pure.

use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use tracing::{debug, info};

use crate::error::BacktestError;
use crate::evaluator::signal_series;
use crate::fees::FeeSchedule;
use crate::strategy::{CompiledAction, CompiledStrategy, Safety, StrategyConfig};
use crate::types::*;
use crate::validator;

const MAX_EQUITY_POINTS: usize = 500;
const MS_PER_YEAR: f64 = 365.0 * 24.0 * 3600.0 * 1000.0;

/// Shared stop-loss / take-profit rule. A zero threshold is disabled.
pub fn check_exit(position: &Position, price: Decimal, safety: &Safety) -> Option<TradeReason> {
    let pnl_pct = position.pnl_pct(price);
    if safety.stop_loss < Decimal::ZERO && pnl_pct <= safety.stop_loss {
        return Some(TradeReason::StopLoss);
    }
    if safety.take_profit > Decimal::ZERO && pnl_pct >= safety.take_profit {
        return Some(TradeReason::TakeProfit);
    }
    None
}

/// Quote amount to commit out of `capital`
pub fn position_size(capital: Decimal, action: &CompiledAction, safety: &Safety) -> Decimal {
    let hundred = dec!(100);
    let by_amount = capital * action.amount / hundred;
    let by_cap = capital * safety.max_position / hundred;
    by_amount.min(by_cap).max(Decimal::ZERO)
}

/// Validate `config` and backtest it with the default fee schedule
pub fn run_backtest(
    candles: &[Candle],
    config: &StrategyConfig,
    initial_capital: Decimal,
) -> Result<BacktestResult, BacktestError> {
    let strategy = validator::compile(config).map_err(BacktestError::InvalidStrategy)?;
    Ok(BacktestEngine::new(FeeSchedule::default()).run(&strategy, candles, initial_capital))
}

/// Open position during simulation
struct OpenPosition {
    position: Position,
    entry_index: usize,
}

/// Backtesting engine that simulates bar-by-bar execution
pub struct BacktestEngine {
    fees: FeeSchedule,
}

impl BacktestEngine {
    pub fn new(fees: FeeSchedule) -> Self {
        Self { fees }
    }

    /// Run a compiled strategy over `candles`
    pub fn run(
        &self,
        strategy: &CompiledStrategy,
        candles: &[Candle],
        initial_capital: Decimal,
    ) -> BacktestResult {
        let required = strategy.required_bars();
        if candles.len() < required {
            info!(
                bars = candles.len(),
                required, "Not enough candles for backtest"
            );
            return BacktestResult {
                insufficient_data: Some(DataInsufficiency {
                    required,
                    available: candles.len(),
                }),
                ..BacktestResult::empty(candles, initial_capital)
            };
        }

        info!(
            bars = candles.len(),
            capital = %initial_capital,
            conditions = strategy.conditions.len(),
            order_type = strategy.action.order_type.as_str(),
            "Starting backtest"
        );

        let signals = signal_series(strategy, candles);
        let buy_side = strategy.action.order_type.is_buy();
        let safety = &strategy.safety;

        let mut cash = initial_capital;
        let mut position: Option<OpenPosition> = None;
        let mut trades: Vec<Trade> = Vec::new();
        let mut holding_bars: Vec<usize> = Vec::new();
        let mut equity: Vec<Decimal> = Vec::with_capacity(candles.len());

        for (i, candle) in candles.iter().enumerate() {
            let price = candle.close;

            if let Some(open) = &position {
                let reason = check_exit(&open.position, price, safety)
                    .or_else(|| (!buy_side && signals[i]).then_some(TradeReason::Signal));
                if let Some(reason) = reason {
                    if let Some(open) = position.take() {
                        cash += self.close(&open, candle, i, reason, &mut trades, &mut holding_bars);
                    }
                }
            } else if buy_side && signals[i] {
                let invest = position_size(cash, &strategy.action, safety);
                if !self.fees.meets_minimum(invest) {
                    debug!(invest = %invest, min = %self.fees.min_order, "Entry below minimum order");
                } else if let Some(fill) = self.fees.entry(invest, price) {
                    cash -= fill.cost;
                    trades.push(Trade {
                        side: TradeSide::Buy,
                        price,
                        quantity: fill.quantity,
                        total: fill.cost,
                        fee: fill.fee,
                        profit: Decimal::ZERO,
                        profit_pct: Decimal::ZERO,
                        reason: TradeReason::Signal,
                        timestamp: candle.open_time,
                    });
                    debug!(price = %price, qty = %fill.quantity, bar = i, "Opened position");
                    position = Some(OpenPosition {
                        position: Position {
                            entry_price: price,
                            quantity: fill.quantity,
                            cost: fill.cost,
                            entry_time: candle.open_time,
                        },
                        entry_index: i,
                    });
                }
            }

            let held = position
                .as_ref()
                .map(|p| p.position.quantity * price)
                .unwrap_or(Decimal::ZERO);
            equity.push(cash + held);
        }

        // Close any remaining open position at the last bar
        if let (Some(open), Some(last)) = (position.take(), candles.last()) {
            let last_index = candles.len() - 1;
            cash += self.close(
                &open,
                last,
                last_index,
                TradeReason::PeriodEnd,
                &mut trades,
                &mut holding_bars,
            );
            if let Some(e) = equity.last_mut() {
                *e = cash;
            }
        }

        let result = Self::summarize(candles, initial_capital, cash, trades, holding_bars, &equity);

        info!(
            total_trades = result.total_trades,
            win_rate = %result.win_rate,
            total_return_pct = %result.total_return_pct,
            max_drawdown_pct = %result.max_drawdown_pct,
            "Backtest complete"
        );

        result
    }

    /// Record the exit trade and return the proceeds
    fn close(
        &self,
        open: &OpenPosition,
        candle: &Candle,
        index: usize,
        reason: TradeReason,
        trades: &mut Vec<Trade>,
        holding_bars: &mut Vec<usize>,
    ) -> Decimal {
        let price = candle.close;
        let fill = self
            .fees
            .exit(open.position.quantity, price, open.position.cost);
        trades.push(Trade {
            side: TradeSide::Sell,
            price,
            quantity: open.position.quantity,
            total: fill.proceeds,
            fee: fill.fee,
            profit: fill.profit,
            profit_pct: fill.profit_pct,
            reason,
            timestamp: candle.open_time,
        });
        holding_bars.push(index - open.entry_index);
        debug!(
            entry = %open.position.entry_price,
            exit = %price,
            profit = %fill.profit,
            reason = reason.as_str(),
            "Closed position"
        );
        fill.proceeds
    }

    fn summarize(
        candles: &[Candle],
        initial_capital: Decimal,
        final_capital: Decimal,
        trades: Vec<Trade>,
        holding_bars: Vec<usize>,
        equity: &[Decimal],
    ) -> BacktestResult {
        let hundred = dec!(100);
        let exits: Vec<&Trade> = trades.iter().filter(|t| t.side == TradeSide::Sell).collect();

        let total_trades = exits.len() as u32;
        let winners: Vec<&&Trade> = exits.iter().filter(|t| t.profit > Decimal::ZERO).collect();
        let losers: Vec<&&Trade> = exits.iter().filter(|t| t.profit <= Decimal::ZERO).collect();
        let winning_trades = winners.len() as u32;
        let losing_trades = losers.len() as u32;

        let win_rate = if total_trades > 0 {
            Decimal::from(winning_trades) / Decimal::from(total_trades) * hundred
        } else {
            Decimal::ZERO
        };

        let total_return_pct = if initial_capital > Decimal::ZERO {
            (final_capital - initial_capital) / initial_capital * hundred
        } else {
            Decimal::ZERO
        };

        let buy_and_hold_return_pct = match (candles.first(), candles.last()) {
            (Some(first), Some(last)) if first.close > Decimal::ZERO => {
                (last.close - first.close) / first.close * hundred
            }
            _ => Decimal::ZERO,
        };

        // Profit factor = gross profits / gross losses
        let gross_profit: Decimal = winners.iter().map(|t| t.profit).sum();
        let gross_loss: Decimal = losers.iter().map(|t| t.profit.abs()).sum();
        let profit_factor = if gross_loss > Decimal::ZERO {
            gross_profit / gross_loss
        } else if gross_profit > Decimal::ZERO {
            dec!(999.99) // Infinite profit factor capped
        } else {
            Decimal::ZERO
        };

        let mean = |values: Vec<Decimal>| -> Decimal {
            if values.is_empty() {
                Decimal::ZERO
            } else {
                let n = Decimal::from(values.len() as u64);
                values.into_iter().sum::<Decimal>() / n
            }
        };
        let avg_win_pct = mean(winners.iter().map(|t| t.profit_pct).collect());
        let avg_loss_pct = mean(losers.iter().map(|t| t.profit_pct).collect());
        let avg_holding_bars = mean(
            holding_bars
                .iter()
                .map(|b| Decimal::from(*b as u64))
                .collect(),
        );

        let total_fees: Decimal = trades.iter().map(|t| t.fee).sum();

        BacktestResult {
            total_trades,
            winning_trades,
            losing_trades,
            final_capital,
            total_return_pct,
            buy_and_hold_return_pct,
            win_rate,
            max_drawdown_pct: Self::max_drawdown_pct(equity),
            sharpe_ratio: Self::calculate_sharpe(equity, Self::periods_per_year(candles)),
            profit_factor,
            avg_win_pct,
            avg_loss_pct,
            avg_holding_bars,
            total_fees,
            trades,
            equity_curve: Self::downsample(candles, equity),
            ..BacktestResult::empty(candles, initial_capital)
        }
    }

    fn max_drawdown_pct(equity: &[Decimal]) -> Decimal {
        let mut peak = Decimal::ZERO;
        let mut max_dd = Decimal::ZERO;
        for &e in equity {
            if e > peak {
                peak = e;
            }
            if peak > Decimal::ZERO {
                let dd = (peak - e) / peak * dec!(100);
                if dd > max_dd {
                    max_dd = dd;
                }
            }
        }
        max_dd
    }

    /// Bars per year implied by the spacing of the first two candles
    fn periods_per_year(candles: &[Candle]) -> f64 {
        match candles {
            [a, b, ..] if b.open_time > a.open_time => {
                MS_PER_YEAR / (b.open_time - a.open_time) as f64
            }
            _ => 365.0,
        }
    }

    /// Annualized Sharpe ratio from per-bar equity returns
    fn calculate_sharpe(equity: &[Decimal], periods_per_year: f64) -> Decimal {
        let values: Vec<f64> = equity.iter().filter_map(|e| e.to_f64()).collect();
        let returns: Vec<f64> = values
            .windows(2)
            .filter(|w| w[0] > 0.0)
            .map(|w| w[1] / w[0] - 1.0)
            .collect();
        if returns.len() < 2 {
            return Decimal::ZERO;
        }

        let n = returns.len() as f64;
        let mean = returns.iter().sum::<f64>() / n;
        let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
        let std_dev = variance.sqrt();

        if std_dev < 1e-12 {
            return Decimal::ZERO;
        }

        let sharpe = mean / std_dev * periods_per_year.sqrt();
        Decimal::from_f64(sharpe)
            .map(|d| d.round_dp(4))
            .unwrap_or(Decimal::ZERO)
    }

    fn downsample(candles: &[Candle], equity: &[Decimal]) -> Vec<EquityPoint> {
        let n = equity.len().min(candles.len());
        let point = |i: usize| EquityPoint {
            time: candles[i].open_time,
            equity: equity[i],
        };
        if n <= MAX_EQUITY_POINTS {
            return (0..n).map(point).collect();
        }
        (0..MAX_EQUITY_POINTS)
            .map(|i| point(i * (n - 1) / (MAX_EQUITY_POINTS - 1)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::{Action, Condition, IndicatorSpec, Operand};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rust_decimal_macros::dec;

    fn make_candles(prices: &[f64]) -> Vec<Candle> {
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

    fn rsi_cross_config(stop_loss: Decimal, take_profit: Decimal) -> StrategyConfig {
        StrategyConfig {
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
                stop_loss,
                take_profit,
                max_position: dec!(100),
            },
        }
    }

    #[test]
    fn test_take_profit_scenario() {
        let candles = make_candles(&[100.0, 98.0, 96.0, 100.0, 111.0]);
        let config = rsi_cross_config(dec!(-5), dec!(10));
        let result = run_backtest(&candles, &config, dec!(10000)).unwrap();

        assert_eq!(result.trades.len(), 2);
        assert_eq!(result.trades[0].side, TradeSide::Buy);
        assert_eq!(result.trades[0].price, dec!(100));
        assert_eq!(result.trades[1].side, TradeSide::Sell);
        assert_eq!(result.trades[1].reason, TradeReason::TakeProfit);
        assert_eq!(result.total_trades, 1);
        assert_eq!(result.winning_trades, 1);
        assert_eq!(result.profit_factor, dec!(999.99));
        assert_eq!(result.avg_holding_bars, dec!(1));
        assert!(result.total_return_pct > dec!(10));
        assert!(result.insufficient_data.is_none());
    }

    #[test]
    fn test_stop_loss_scenario() {
        let candles = make_candles(&[100.0, 98.0, 96.0, 100.0, 94.0]);
        let config = rsi_cross_config(dec!(-5), dec!(10));
        let result = run_backtest(&candles, &config, dec!(10000)).unwrap();

        assert_eq!(result.trades.len(), 2);
        assert_eq!(result.trades[1].reason, TradeReason::StopLoss);
        assert_eq!(result.losing_trades, 1);
        assert_eq!(result.profit_factor, Decimal::ZERO);
        assert!(result.avg_loss_pct < dec!(-6));
        assert!(result.max_drawdown_pct > dec!(6));
    }

    #[test]
    fn test_flat_then_spike_scenario() {
        let config = rsi_cross_config(dec!(-5), dec!(10));
        for (last, reason) in [(121.0, TradeReason::TakeProfit), (104.0, TradeReason::StopLoss)] {
            let candles = make_candles(&[100.0, 100.0, 100.0, 110.0, last]);
            let result = run_backtest(&candles, &config, dec!(10000)).unwrap();

            assert_eq!(result.trades.len(), 2);
            assert_eq!(result.trades[0].side, TradeSide::Buy);
            assert_eq!(result.trades[0].price, dec!(110));
            assert_eq!(result.trades[1].side, TradeSide::Sell);
            assert_eq!(result.trades[1].reason, reason);
            assert_eq!(result.total_trades, 1);
        }
    }

    #[test]
    fn test_spike_on_last_bar_closes_at_period_end() {
        let candles = make_candles(&[100.0, 100.0, 100.0, 100.0, 111.0]);
        let config = rsi_cross_config(dec!(-5), dec!(10));
        let result = run_backtest(&candles, &config, dec!(10000)).unwrap();

        assert_eq!(result.trades.len(), 2);
        assert_eq!(result.total_trades, 1);
        assert_eq!(result.trades[0].price, dec!(111));
        assert_eq!(result.trades[1].reason, TradeReason::PeriodEnd);
    }

    #[test]
    fn test_open_position_closes_at_period_end() {
        let candles = make_candles(&[100.0, 98.0, 96.0, 100.0, 101.0]);
        let config = rsi_cross_config(dec!(-5), dec!(10));
        let result = run_backtest(&candles, &config, dec!(10000)).unwrap();

        assert_eq!(result.trades.len(), 2);
        assert_eq!(result.trades[1].reason, TradeReason::PeriodEnd);
        assert_eq!(result.trades[1].price, dec!(101));
        assert_eq!(result.equity_curve.last().unwrap().equity, result.final_capital);
    }

    #[test]
    fn test_empty_and_short_series() {
        let config = rsi_cross_config(dec!(-5), dec!(10));
        for prices in [vec![], vec![100.0, 101.0, 102.0]] {
            let candles = make_candles(&prices);
            let result = run_backtest(&candles, &config, dec!(10000)).unwrap();
            assert_eq!(result.total_trades, 0);
            assert_eq!(result.total_return_pct, Decimal::ZERO);
            assert_eq!(result.sharpe_ratio, Decimal::ZERO);
            assert_eq!(result.final_capital, dec!(10000));
            assert!(result.trades.is_empty());
            assert_eq!(
                result.insufficient_data,
                Some(DataInsufficiency {
                    required: 5,
                    available: prices.len()
                })
            );
        }
    }

    #[test]
    fn test_constant_price_has_no_trades() {
        let candles = make_candles(&[100.0; 60]);
        let mut config = rsi_cross_config(dec!(-5), dec!(10));
        config.conditions.push(Condition {
            left: IndicatorSpec::new("price"),
            operator: "crosses_above".to_string(),
            right: Operand::Indicator(IndicatorSpec::new("sma").with_param("period", 10.0)),
        });
        config.logic = "or".to_string();
        let result = run_backtest(&candles, &config, dec!(10000)).unwrap();
        assert_eq!(result.total_trades, 0);
        assert_eq!(result.total_return_pct, Decimal::ZERO);
        assert_eq!(result.buy_and_hold_return_pct, Decimal::ZERO);
        assert_eq!(result.max_drawdown_pct, Decimal::ZERO);
        assert_eq!(result.equity_curve.len(), 60);
    }

    #[test]
    fn test_backtest_is_pure() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut price = 100.0_f64;
        let prices: Vec<f64> = (0..800)
            .map(|_| {
                price = (price * (1.0 + rng.gen_range(-0.02..0.02))).max(1.0);
                price
            })
            .collect();
        let candles = make_candles(&prices);
        let config = rsi_cross_config(dec!(-3), dec!(4));

        let a = serde_json::to_string(&run_backtest(&candles, &config, dec!(10000)).unwrap())
            .unwrap();
        let b = serde_json::to_string(&run_backtest(&candles, &config, dec!(10000)).unwrap())
            .unwrap();
        assert_eq!(a, b);

        let result = run_backtest(&candles, &config, dec!(10000)).unwrap();
        assert_eq!(result.equity_curve.len(), 500);
        assert_eq!(result.equity_curve[0].time, candles[0].open_time);
        assert_eq!(
            result.equity_curve.last().unwrap().time,
            candles.last().unwrap().open_time
        );
        // Entries and exits alternate, one position at a time
        for pair in result.trades.chunks(2) {
            assert_eq!(pair[0].side, TradeSide::Buy);
            if let Some(exit) = pair.get(1) {
                assert_eq!(exit.side, TradeSide::Sell);
            }
        }
    }

    #[test]
    fn test_entry_below_minimum_is_rejected() {
        let candles = make_candles(&[100.0, 98.0, 96.0, 100.0, 111.0]);
        let config = rsi_cross_config(dec!(-5), dec!(10));
        let result = run_backtest(&candles, &config, dec!(1000)).unwrap();
        assert!(result.trades.is_empty());
        assert_eq!(result.final_capital, dec!(1000));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = rsi_cross_config(dec!(5), dec!(10));
        config.action.amount = dec!(0);
        match run_backtest(&make_candles(&[100.0; 10]), &config, dec!(10000)) {
            Err(BacktestError::InvalidStrategy(v)) => assert_eq!(v.len(), 2),
            Ok(_) => panic!("expected invalid strategy"),
        }
    }

    #[test]
    fn test_sell_action_only_exits() {
        let candles = make_candles(&[100.0, 98.0, 96.0, 100.0, 111.0]);
        let mut config = rsi_cross_config(dec!(-5), dec!(10));
        config.action.order_type = "market_sell".to_string();
        let result = run_backtest(&candles, &config, dec!(10000)).unwrap();
        assert!(result.trades.is_empty());
    }

    #[test]
    fn test_check_exit_thresholds() {
        let pos = Position {
            entry_price: dec!(100),
            quantity: dec!(1),
            cost: dec!(100),
            entry_time: 0,
        };
        let safety = Safety {
            stop_loss: dec!(-5),
            take_profit: dec!(10),
            max_position: dec!(100),
        };
        assert_eq!(check_exit(&pos, dec!(95), &safety), Some(TradeReason::StopLoss));
        assert_eq!(check_exit(&pos, dec!(110), &safety), Some(TradeReason::TakeProfit));
        assert_eq!(check_exit(&pos, dec!(104), &safety), None);
        assert_eq!(check_exit(&pos, dec!(50), &Safety::default()), None);
    }

    #[test]
    fn test_position_size_respects_cap() {
        let action = CompiledAction {
            order_type: crate::strategy::OrderType::MarketBuy,
            amount: dec!(80),
            limit_offset_pct: Decimal::ZERO,
        };
        let safety = Safety {
            max_position: dec!(50),
            ..Safety::default()
        };
        assert_eq!(position_size(dec!(10000), &action, &safety), dec!(5000));
    }
}
