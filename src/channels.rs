use crate::config::ChannelConfig;
use chrono::Utc;
use sqlx::{Pool, Row, Sqlite};

#[derive(Clone)]
pub struct ChannelStore {
    pool: Pool<Sqlite>,
}

impl ChannelStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS channels (
                id TEXT PRIMARY KEY,
                api_type TEXT NOT NULL,
                config_json TEXT NOT NULL,
                enabled INTEGER NOT NULL DEFAULT 1,
                priority INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn create_channel(
        &self,
        channel: &ChannelConfig,
        priority: i64,
    ) -> Result<(), String> {
        if channel.id.trim().is_empty() {
            return Err("channel id is required".to_string());
        }
        if channel.base_url.trim().is_empty() {
            return Err("base_url is required".to_string());
        }
        let config_json = serde_json::to_string(channel).map_err(|e| e.to_string())?;
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO channels (id, api_type, config_json, enabled, priority, created_at, updated_at)
               VALUES (?, ?, ?, 1, ?, ?, ?)"#,
        )
        .bind(&channel.id)
        .bind(&channel.api_type)
        .bind(&config_json)
        .bind(priority)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), String> {
        let result = sqlx::query("UPDATE channels SET enabled = ?, updated_at = ? WHERE id = ?")
            .bind(enabled)
            .bind(Utc::now().to_rfc3339())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        if result.rows_affected() == 0 {
            return Err(format!("channel not found: {id}"));
        }
        Ok(())
    }

    pub async fn list_enabled_channels(&self) -> Result<Vec<ChannelConfig>, String> {
        let rows = sqlx::query(
            r#"SELECT id, config_json FROM channels
               WHERE enabled = 1 ORDER BY priority DESC, created_at ASC"#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let mut channels = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id").map_err(|e| e.to_string())?;
            let config_json: String = row.try_get("config_json").map_err(|e| e.to_string())?;
            match serde_json::from_str::<ChannelConfig>(&config_json) {
                Ok(channel) => channels.push(channel),
                Err(err) => {
                    tracing::warn!(channel_id = %id, error = %err, "skipping unreadable channel");
                }
            }
        }
        Ok(channels)
    }

    /// Highest-priority enabled channel that lists `model`.
    pub async fn find_channel_for_model(
        &self,
        model: &str,
    ) -> Result<Option<ChannelConfig>, String> {
        Ok(self
            .list_enabled_channels()
            .await?
            .into_iter()
            .find(|channel| channel.serves(model)))
    }
}
