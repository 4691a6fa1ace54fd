//! Bot repository: runtime state, error bookkeeping and fills

use crate::{DbError, DbResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use std::str::FromStr;

/// A persisted bot. Decimal columns are kept as TEXT.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BotRow {
    pub id: i64,
    pub strategy_id: i64,
    pub name: String,
    pub credential_ref: String,
    pub status: String,
    pub max_investment: String,
    pub position_entry_price: Option<String>,
    pub position_quantity: Option<String>,
    pub position_cost: Option<String>,
    pub position_entry_time: Option<i64>,
    pub total_profit: String,
    pub total_trades: i64,
    pub winning_trades: i64,
    pub last_error: Option<String>,
    pub fatal_error: i64,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

/// Fields for a new bot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewBot {
    pub strategy_id: i64,
    pub name: String,
    pub credential_ref: String,
    pub max_investment: Decimal,
}

/// Open position columns
#[derive(Debug, Clone, PartialEq)]
pub struct PositionColumns {
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub cost: Decimal,
    pub entry_time: i64,
}

/// One row of the live trade log
#[derive(Debug, Clone, PartialEq)]
pub struct TradeInsert {
    pub order_id: String,
    pub side: String,
    pub price: Decimal,
    pub quantity: Decimal,
    pub total: Decimal,
    pub fee: Decimal,
    pub profit: Decimal,
    pub profit_pct: Decimal,
    pub reason: String,
    pub timestamp: i64,
}

/// Everything a fill changes on a bot, written in one transaction
#[derive(Debug, Clone)]
pub struct FillRecord {
    pub trade: TradeInsert,
    /// Position after the fill; `None` clears the position columns
    pub position: Option<PositionColumns>,
    pub profit_delta: Decimal,
    /// Set on exits; counts a round trip
    pub won: Option<bool>,
}

const BOT_COLUMNS: &str = r#"id, strategy_id, name, credential_ref, status, max_investment,
    position_entry_price, position_quantity, position_cost, position_entry_time,
    total_profit, total_trades, winning_trades, last_error, fatal_error,
    created_at, updated_at"#;

pub struct BotRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> BotRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, bot: &NewBot) -> DbResult<i64> {
        let result = sqlx::query(
            "INSERT INTO bots (strategy_id, name, credential_ref, max_investment) VALUES (?, ?, ?, ?)",
        )
        .bind(bot.strategy_id)
        .bind(&bot.name)
        .bind(&bot.credential_ref)
        .bind(bot.max_investment.to_string())
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> DbResult<Option<BotRow>> {
        let sql = format!("SELECT {BOT_COLUMNS} FROM bots WHERE id = ?");
        let row = sqlx::query_as::<_, BotRow>(&sql)
            .bind(id)
            .fetch_optional(self.pool)
            .await?;

        Ok(row)
    }

    pub async fn ids_with_status(&self, status: &str) -> DbResult<Vec<i64>> {
        let ids: Vec<(i64,)> = sqlx::query_as("SELECT id FROM bots WHERE status = ? ORDER BY id")
            .bind(status)
            .fetch_all(self.pool)
            .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    /// Returns false when the bot does not exist
    pub async fn set_status(&self, id: i64, status: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE bots SET status = ?, updated_at = strftime('%s', 'now') WHERE id = ?",
        )
        .bind(status)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Store the last error; a fatal one also moves the bot to `error`
    pub async fn record_error(&self, id: i64, message: &str, fatal: bool) -> DbResult<bool> {
        let sql = if fatal {
            r#"UPDATE bots
               SET last_error = ?, fatal_error = 1, status = 'error', updated_at = strftime('%s', 'now')
               WHERE id = ?"#
        } else {
            "UPDATE bots SET last_error = ?, updated_at = strftime('%s', 'now') WHERE id = ?"
        };

        let result = sqlx::query(sql)
            .bind(message)
            .bind(id)
            .execute(self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Clear the last error; a bot in `error` goes back to `running`
    pub async fn clear_error(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query(
            r#"UPDATE bots
               SET last_error = NULL,
                   fatal_error = 0,
                   status = CASE WHEN status = 'error' THEN 'running' ELSE status END,
                   updated_at = strftime('%s', 'now')
               WHERE id = ?"#,
        )
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Append the trade, replace the position and bump the totals atomically.
    /// Returns false (and writes nothing) when the bot does not exist.
    pub async fn apply_fill(&self, id: i64, fill: &FillRecord) -> DbResult<bool> {
        let mut tx = self.pool.begin().await?;

        // Take the write lock before reading total_profit
        let touched = sqlx::query("UPDATE bots SET updated_at = strftime('%s', 'now') WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if touched.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        let (total_profit,): (String,) = sqlx::query_as("SELECT total_profit FROM bots WHERE id = ?")
            .bind(id)
            .fetch_one(&mut *tx)
            .await?;
        let total_profit = Decimal::from_str(&total_profit)
            .map_err(|e| DbError::Invalid(format!("bot {id} total_profit {total_profit:?}: {e}")))?;

        let trade = &fill.trade;
        sqlx::query(
            r#"INSERT INTO bot_trades
                (bot_id, order_id, side, price, quantity, total, fee, profit, profit_pct, reason, timestamp)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(id)
        .bind(&trade.order_id)
        .bind(&trade.side)
        .bind(trade.price.to_string())
        .bind(trade.quantity.to_string())
        .bind(trade.total.to_string())
        .bind(trade.fee.to_string())
        .bind(trade.profit.to_string())
        .bind(trade.profit_pct.to_string())
        .bind(&trade.reason)
        .bind(trade.timestamp)
        .execute(&mut *tx)
        .await?;

        let position = fill.position.as_ref();
        let (trades_inc, wins_inc) = match fill.won {
            Some(true) => (1_i64, 1_i64),
            Some(false) => (1, 0),
            None => (0, 0),
        };

        sqlx::query(
            r#"UPDATE bots
               SET position_entry_price = ?,
                   position_quantity = ?,
                   position_cost = ?,
                   position_entry_time = ?,
                   total_profit = ?,
                   total_trades = total_trades + ?,
                   winning_trades = winning_trades + ?,
                   updated_at = strftime('%s', 'now')
               WHERE id = ?"#,
        )
        .bind(position.map(|p| p.entry_price.to_string()))
        .bind(position.map(|p| p.quantity.to_string()))
        .bind(position.map(|p| p.cost.to_string()))
        .bind(position.map(|p| p.entry_time))
        .bind((total_profit + fill.profit_delta).to_string())
        .bind(trades_inc)
        .bind(wins_inc)
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }
}
