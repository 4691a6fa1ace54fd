//! SQLite-backed [`BotStore`]
//!
//! Converts between the TEXT-typed rows of the persistence crate and the
//! runtime's typed records. Any stored value that fails to parse surfaces
//! as [`StoreError::Corrupt`] instead of being silently defaulted.

use std::str::FromStr;

use async_trait::async_trait;
use persistence::repository::{
    BotRepository, BotRow, FillRecord, PositionColumns, StrategyRepository, StrategyRow,
    TradeInsert, TradeRepository, TradeRow,
};
use persistence::SqlitePool;
use rust_decimal::Decimal;

use crate::bot::{BotRecord, BotStore, FillUpdate, StrategyRecord};
use crate::error::StoreError;
use crate::strategy::StrategyConfig;
use crate::types::*;

#[derive(Clone)]
pub struct SqliteBotStore {
    pool: SqlitePool,
}

impl SqliteBotStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Most recent live trades of a bot, newest first
    pub async fn recent_trades(&self, bot_id: i64, limit: i64) -> Result<Vec<Trade>, StoreError> {
        TradeRepository::new(&self.pool)
            .list_for_bot(bot_id, limit)
            .await?
            .iter()
            .map(trade_from_row)
            .collect()
    }
}

fn decimal(field: &str, value: &str) -> Result<Decimal, StoreError> {
    Decimal::from_str(value).map_err(|e| StoreError::Corrupt(format!("{field} {value:?}: {e}")))
}

fn counter(field: &str, value: i64) -> Result<u32, StoreError> {
    u32::try_from(value).map_err(|_| StoreError::Corrupt(format!("{field} {value}")))
}

fn bot_from_row(row: BotRow) -> Result<BotRecord, StoreError> {
    let status = BotStatus::from_str(&row.status).map_err(StoreError::Corrupt)?;

    let position = match (
        row.position_entry_price.as_deref(),
        row.position_quantity.as_deref(),
        row.position_cost.as_deref(),
        row.position_entry_time,
    ) {
        (Some(price), Some(qty), Some(cost), Some(time)) => Some(Position {
            entry_price: decimal("position_entry_price", price)?,
            quantity: decimal("position_quantity", qty)?,
            cost: decimal("position_cost", cost)?,
            entry_time: time,
        }),
        (None, None, None, None) => None,
        _ => {
            return Err(StoreError::Corrupt(format!(
                "bot {} has a partially written position",
                row.id
            )))
        }
    };

    Ok(BotRecord {
        id: row.id,
        strategy_id: row.strategy_id,
        credential_ref: row.credential_ref,
        status,
        max_investment: decimal("max_investment", &row.max_investment)?,
        position,
        total_profit: decimal("total_profit", &row.total_profit)?,
        total_trades: counter("total_trades", row.total_trades)?,
        winning_trades: counter("winning_trades", row.winning_trades)?,
        last_error: row.last_error,
        fatal_error: row.fatal_error != 0,
    })
}

fn strategy_from_row(row: StrategyRow) -> Result<StrategyRecord, StoreError> {
    let timeframe = Timeframe::from_str(&row.timeframe).map_err(StoreError::Corrupt)?;
    let config: StrategyConfig = serde_json::from_str(&row.config)
        .map_err(|e| StoreError::Corrupt(format!("strategy {} config: {e}", row.id)))?;

    Ok(StrategyRecord {
        id: row.id,
        name: row.name,
        pair: row.pair,
        timeframe,
        config,
    })
}

fn trade_from_row(row: &TradeRow) -> Result<Trade, StoreError> {
    let side = match row.side.as_str() {
        "buy" => TradeSide::Buy,
        "sell" => TradeSide::Sell,
        other => return Err(StoreError::Corrupt(format!("trade side {other:?}"))),
    };

    Ok(Trade {
        side,
        price: decimal("price", &row.price)?,
        quantity: decimal("quantity", &row.quantity)?,
        total: decimal("total", &row.total)?,
        fee: decimal("fee", &row.fee)?,
        profit: decimal("profit", &row.profit)?,
        profit_pct: decimal("profit_pct", &row.profit_pct)?,
        reason: TradeReason::from_str(&row.reason).map_err(StoreError::Corrupt)?,
        timestamp: row.timestamp,
    })
}

fn fill_record(fill: &FillUpdate) -> FillRecord {
    let trade = &fill.trade;
    FillRecord {
        trade: TradeInsert {
            order_id: fill.order_id.clone(),
            side: trade.side.as_str().to_string(),
            price: trade.price,
            quantity: trade.quantity,
            total: trade.total,
            fee: trade.fee,
            profit: trade.profit,
            profit_pct: trade.profit_pct,
            reason: trade.reason.as_str().to_string(),
            timestamp: trade.timestamp,
        },
        position: fill.position.as_ref().map(|p| PositionColumns {
            entry_price: p.entry_price,
            quantity: p.quantity,
            cost: p.cost,
            entry_time: p.entry_time,
        }),
        profit_delta: fill.profit_delta,
        won: fill.won,
    }
}

#[async_trait]
impl BotStore for SqliteBotStore {
    async fn load_bot(&self, bot_id: i64) -> Result<BotRecord, StoreError> {
        let row = BotRepository::new(&self.pool)
            .get(bot_id)
            .await?
            .ok_or(StoreError::BotNotFound(bot_id))?;
        bot_from_row(row)
    }

    async fn load_strategy(&self, strategy_id: i64) -> Result<StrategyRecord, StoreError> {
        let row = StrategyRepository::new(&self.pool)
            .get(strategy_id)
            .await?
            .ok_or(StoreError::StrategyNotFound(strategy_id))?;
        strategy_from_row(row)
    }

    async fn set_status(&self, bot_id: i64, status: BotStatus) -> Result<(), StoreError> {
        if BotRepository::new(&self.pool)
            .set_status(bot_id, status.as_str())
            .await?
        {
            Ok(())
        } else {
            Err(StoreError::BotNotFound(bot_id))
        }
    }

    async fn record_error(&self, bot_id: i64, message: &str, fatal: bool) -> Result<(), StoreError> {
        if BotRepository::new(&self.pool)
            .record_error(bot_id, message, fatal)
            .await?
        {
            Ok(())
        } else {
            Err(StoreError::BotNotFound(bot_id))
        }
    }

    async fn clear_error(&self, bot_id: i64) -> Result<(), StoreError> {
        if BotRepository::new(&self.pool).clear_error(bot_id).await? {
            Ok(())
        } else {
            Err(StoreError::BotNotFound(bot_id))
        }
    }

    async fn apply_fill(&self, bot_id: i64, fill: &FillUpdate) -> Result<(), StoreError> {
        if BotRepository::new(&self.pool)
            .apply_fill(bot_id, &fill_record(fill))
            .await?
        {
            Ok(())
        } else {
            Err(StoreError::BotNotFound(bot_id))
        }
    }

    async fn bots_with_status(&self, status: BotStatus) -> Result<Vec<i64>, StoreError> {
        Ok(BotRepository::new(&self.pool)
            .ids_with_status(status.as_str())
            .await?)
    }
}
