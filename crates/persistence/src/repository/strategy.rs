//! Strategy repository: declarative strategy definitions

use crate::DbResult;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};

/// A persisted strategy; `config` and `backtest_result` are JSON text
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct StrategyRow {
    pub id: i64,
    pub name: String,
    pub pair: String,
    pub timeframe: String,
    pub config: String,
    pub backtest_result: Option<String>,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

/// Fields for a new strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStrategy {
    pub name: String,
    pub pair: String,
    pub timeframe: String,
    pub config: String,
}

pub struct StrategyRepository<'a> {
    pool: &'a SqlitePool,
}

impl<'a> StrategyRepository<'a> {
    pub fn new(pool: &'a SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, strategy: &NewStrategy) -> DbResult<i64> {
        let result = sqlx::query(
            "INSERT INTO strategies (name, pair, timeframe, config) VALUES (?, ?, ?, ?)",
        )
        .bind(&strategy.name)
        .bind(&strategy.pair)
        .bind(&strategy.timeframe)
        .bind(&strategy.config)
        .execute(self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get(&self, id: i64) -> DbResult<Option<StrategyRow>> {
        let row = sqlx::query_as::<_, StrategyRow>(
            r#"SELECT id, name, pair, timeframe, config, backtest_result, created_at, updated_at
               FROM strategies WHERE id = ?"#,
        )
        .bind(id)
        .fetch_optional(self.pool)
        .await?;

        Ok(row)
    }

    pub async fn list(&self) -> DbResult<Vec<StrategyRow>> {
        let rows = sqlx::query_as::<_, StrategyRow>(
            r#"SELECT id, name, pair, timeframe, config, backtest_result, created_at, updated_at
               FROM strategies ORDER BY id"#,
        )
        .fetch_all(self.pool)
        .await?;

        Ok(rows)
    }

    /// Replace the config; the cached backtest no longer applies
    pub async fn update_config(&self, id: i64, config: &str) -> DbResult<bool> {
        let result = sqlx::query(
            r#"UPDATE strategies
               SET config = ?, backtest_result = NULL, updated_at = strftime('%s', 'now')
               WHERE id = ?"#,
        )
        .bind(config)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    /// Cache the latest backtest result JSON
    pub async fn save_backtest(&self, id: i64, result_json: &str) -> DbResult<bool> {
        let result = sqlx::query(
            "UPDATE strategies SET backtest_result = ?, updated_at = strftime('%s', 'now') WHERE id = ?",
        )
        .bind(result_json)
        .bind(id)
        .execute(self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn sample() -> NewStrategy {
        NewStrategy {
            name: "rsi bounce".to_string(),
            pair: "KRW-BTC".to_string(),
            timeframe: "15m".to_string(),
            config: r#"{"conditions":[]}"#.to_string(),
        }
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let db = Database::in_memory().await.unwrap();
        let repo = StrategyRepository::new(db.pool());

        let id = repo.create(&sample()).await.unwrap();
        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.name, "rsi bounce");
        assert_eq!(row.timeframe, "15m");
        assert!(row.backtest_result.is_none());

        assert!(repo.get(id + 100).await.unwrap().is_none());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_update_config_drops_cached_backtest() {
        let db = Database::in_memory().await.unwrap();
        let repo = StrategyRepository::new(db.pool());
        let id = repo.create(&sample()).await.unwrap();

        assert!(repo.save_backtest(id, r#"{"total_trades":3}"#).await.unwrap());
        assert!(repo.get(id).await.unwrap().unwrap().backtest_result.is_some());

        assert!(repo.update_config(id, r#"{"conditions":[1]}"#).await.unwrap());
        let row = repo.get(id).await.unwrap().unwrap();
        assert_eq!(row.config, r#"{"conditions":[1]}"#);
        assert!(row.backtest_result.is_none());

        assert!(!repo.update_config(999, "{}").await.unwrap());
    }
}
