//! Trade log repository: read side of `bot_trades`

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A live trade as stored; decimals are TEXT
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TradeRow {
    pub id: i64,
    pub bot_id: i64,
    pub order_id: String,
    pub side: String,
    pub price: String,
    pub quantity: String,
    pub total: String,
    pub fee: String,
    pub profit: String,
    pub profit_pct: String,
    pub reason: String,
    pub timestamp: i64,
}

pub struct TradeRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> TradeRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    /// Most recent trades first
    pub async fn list_for_bot(&self, bot_id: i64, limit: i64) -> DbResult<Vec<TradeRow>> {
        let rows = sqlx::query_as::<_, TradeRow>(
            r#"SELECT id, bot_id, order_id, side, price, quantity, total, fee, profit,
                      profit_pct, reason, timestamp
               FROM bot_trades
               WHERE bot_id = ?
               ORDER BY timestamp DESC, id DESC
               LIMIT ?"#,
        )
        .bind(bot_id)
        .bind(limit)
        .fetch_all(self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn count_for_bot(&self, bot_id: i64) -> DbResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM bot_trades WHERE bot_id = ?")
            .bind(bot_id)
            .fetch_one(self.pool)
            .await?;

        Ok(count)
    }
}
