//! Registered bot configurations and their periodic stats rows.

use anyhow::Result;
use serde::Serialize;
use serde_json::{Map, Value};
use sqlx::{Row, SqlitePool};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BotRecord {
    pub bot_id: String,
    pub platform: String,
    pub name: String,
    #[serde(skip_serializing)]
    pub token: String,
    pub model: String,
    pub system_prompt: String,
    pub status: String,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
    pub metadata: Map<String, Value>,
}

impl BotRecord {
    pub fn new(bot_id: &str, platform: &str, name: &str, token: &str, model: &str) -> Self {
        Self {
            bot_id: bot_id.to_string(),
            platform: platform.to_string(),
            name: name.to_string(),
            token: token.to_string(),
            model: model.to_string(),
            system_prompt: "default".to_string(),
            status: "registered".to_string(),
            created_at: None,
            updated_at: None,
            metadata: Map::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BotStatsRow {
    pub id: i64,
    pub bot_id: String,
    pub timestamp: Option<String>,
    pub messages_processed: i64,
    pub errors: i64,
    pub uptime_seconds: i64,
}

#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq)]
pub struct AggregateBotStats {
    pub total_bots: i64,
    pub running_bots: i64,
    pub messages_24h: i64,
    pub errors_24h: i64,
}

#[derive(Clone)]
pub struct BotConfigStorage {
    pool: SqlitePool,
}

impl BotConfigStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or update. `created_at` is kept on update.
    pub async fn save_bot(&self, bot: &BotRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO bot_configs \
             (bot_id, platform, name, token, model, system_prompt, status, metadata) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(bot_id) DO UPDATE SET \
                 platform = excluded.platform, name = excluded.name, token = excluded.token, \
                 model = excluded.model, system_prompt = excluded.system_prompt, \
                 status = excluded.status, metadata = excluded.metadata, \
                 updated_at = CURRENT_TIMESTAMP",
        )
        .bind(&bot.bot_id)
        .bind(&bot.platform)
        .bind(&bot.name)
        .bind(&bot.token)
        .bind(&bot.model)
        .bind(&bot.system_prompt)
        .bind(&bot.status)
        .bind(Value::Object(bot.metadata.clone()).to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_bot(&self, bot_id: &str) -> Result<Option<BotRecord>> {
        let row = sqlx::query("SELECT * FROM bot_configs WHERE bot_id = ?")
            .bind(bot_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(record_from_row))
    }

    /// Newest first.
    pub async fn get_all_bots(&self) -> Result<Vec<BotRecord>> {
        let rows = sqlx::query("SELECT * FROM bot_configs ORDER BY created_at DESC, rowid DESC")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(record_from_row).collect())
    }

    pub async fn delete_bot(&self, bot_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM bot_configs WHERE bot_id = ?")
            .bind(bot_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn update_bot_status(&self, bot_id: &str, status: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE bot_configs SET status = ?, updated_at = CURRENT_TIMESTAMP WHERE bot_id = ?",
        )
        .bind(status)
        .bind(bot_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn record_bot_stats(
        &self,
        bot_id: &str,
        messages_processed: i64,
        errors: i64,
        uptime_seconds: i64,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO bot_stats (bot_id, messages_processed, errors, uptime_seconds) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(bot_id)
        .bind(messages_processed)
        .bind(errors)
        .bind(uptime_seconds)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Most recent first.
    pub async fn get_bot_stats(&self, bot_id: &str, limit: i64) -> Result<Vec<BotStatsRow>> {
        let rows = sqlx::query(
            "SELECT id, bot_id, timestamp, messages_processed, errors, uptime_seconds \
             FROM bot_stats WHERE bot_id = ? ORDER BY timestamp DESC, id DESC LIMIT ?",
        )
        .bind(bot_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| BotStatsRow {
                id: row.get("id"),
                bot_id: row.get("bot_id"),
                timestamp: row.get("timestamp"),
                messages_processed: row.get::<Option<i64>, _>("messages_processed").unwrap_or(0),
                errors: row.get::<Option<i64>, _>("errors").unwrap_or(0),
                uptime_seconds: row.get::<Option<i64>, _>("uptime_seconds").unwrap_or(0),
            })
            .collect())
    }

    pub async fn get_all_stats(&self) -> Result<AggregateBotStats> {
        let total_bots: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM bot_configs")
            .fetch_one(&self.pool)
            .await?;
        let running_bots: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM bot_configs WHERE status = 'running'")
                .fetch_one(&self.pool)
                .await?;
        let (messages_24h, errors_24h): (i64, i64) = sqlx::query_as(
            "SELECT COALESCE(SUM(messages_processed), 0), COALESCE(SUM(errors), 0) \
             FROM bot_stats WHERE datetime(timestamp) > datetime('now', '-1 day')",
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(AggregateBotStats {
            total_bots,
            running_bots,
            messages_24h,
            errors_24h,
        })
    }
}

fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> BotRecord {
    let metadata = row
        .get::<Option<String>, _>("metadata")
        .and_then(|s| serde_json::from_str::<Map<String, Value>>(&s).ok())
        .unwrap_or_default();
    BotRecord {
        bot_id: row.get("bot_id"),
        platform: row.get("platform"),
        name: row.get("name"),
        token: row.get("token"),
        model: row.get("model"),
        system_prompt: row
            .get::<Option<String>, _>("system_prompt")
            .unwrap_or_else(|| "default".to_string()),
        status: row
            .get::<Option<String>, _>("status")
            .unwrap_or_else(|| "registered".to_string()),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db;
    use crate::migrate::migrate_pool;

    async fn storage() -> (tempfile::TempDir, BotConfigStorage) {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::with_db_path(dir.path().join("bot.sqlite"));
        let pool = db::connect(&config).await.unwrap();
        migrate_pool(&pool).await.unwrap();
        (dir, BotConfigStorage::new(pool))
    }

    #[tokio::test]
    async fn test_save_is_upsert() {
        let (_dir, storage) = storage().await;
        let mut bot = BotRecord::new("tg1", "telegram", "Support", "secret", "gpt-4o");
        bot.metadata.insert("team".into(), Value::String("growth".into()));
        storage.save_bot(&bot).await.unwrap();

        bot.model = "claude-sonnet-4-20250514".into();
        storage.save_bot(&bot).await.unwrap();

        let all = storage.get_all_bots().await.unwrap();
        assert_eq!(all.len(), 1);
        let stored = storage.get_bot("tg1").await.unwrap().unwrap();
        assert_eq!(stored.model, "claude-sonnet-4-20250514");
        assert_eq!(stored.system_prompt, "default");
        assert_eq!(stored.metadata["team"], "growth");
        assert!(stored.created_at.is_some());
    }

    #[tokio::test]
    async fn test_status_stats_and_cascade() {
        let (_dir, storage) = storage().await;
        storage
            .save_bot(&BotRecord::new("d1", "discord", "D", "t", "gpt-4o"))
            .await
            .unwrap();
        storage
            .save_bot(&BotRecord::new("s1", "slack", "S", "t", "gpt-4o"))
            .await
            .unwrap();
        assert!(storage.update_bot_status("d1", "running").await.unwrap());
        assert!(!storage.update_bot_status("nope", "running").await.unwrap());

        storage.record_bot_stats("d1", 12, 1, 3600).await.unwrap();
        storage.record_bot_stats("d1", 3, 0, 60).await.unwrap();

        let stats = storage.get_bot_stats("d1", 10).await.unwrap();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats[0].messages_processed, 3);

        assert_eq!(
            storage.get_all_stats().await.unwrap(),
            AggregateBotStats { total_bots: 2, running_bots: 1, messages_24h: 15, errors_24h: 1 }
        );

        assert!(storage.delete_bot("d1").await.unwrap());
        assert!(storage.get_bot_stats("d1", 10).await.unwrap().is_empty());
        assert!(storage.get_bot("d1").await.unwrap().is_none());
    }

    #[test]
    fn test_token_is_not_serialized() {
        let bot = BotRecord::new("x", "telegram", "X", "very-secret", "gpt-4o");
        let json = serde_json::to_string(&bot).unwrap();
        assert!(!json.contains("very-secret"));
    }
}
