use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Pool, Row, Sqlite};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySettings {
    pub streaming_timeout_seconds: u64,
    pub ping_interval_enabled: bool,
    pub ping_interval_seconds: u64,
    pub pre_consumed_quota: u64,
    pub quota_per_unit: f64,
    pub request_timeout_ms: u64,
    pub default_model_ratio: f64,
    pub model_price: HashMap<String, f64>,
    pub model_ratio: HashMap<String, f64>,
    pub completion_ratio: HashMap<String, f64>,
    pub audio_ratio: HashMap<String, f64>,
    pub group_ratio: HashMap<String, f64>,
    pub updated_at: DateTime<Utc>,
}

fn default_group_ratio() -> HashMap<String, f64> {
    let mut m = HashMap::new();
    m.insert("default".to_string(), 1.0);
    m
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            streaming_timeout_seconds: 120,
            ping_interval_enabled: false,
            ping_interval_seconds: 10,
            pre_consumed_quota: 500,
            quota_per_unit: 500_000.0,
            request_timeout_ms: 30000,
            default_model_ratio: 37.5,
            model_price: HashMap::new(),
            model_ratio: HashMap::new(),
            completion_ratio: HashMap::new(),
            audio_ratio: HashMap::new(),
            group_ratio: default_group_ratio(),
            updated_at: Utc::now(),
        }
    }
}

#[derive(Clone)]
pub struct SettingsStore {
    pool: Pool<Sqlite>,
}

fn encode_map(map: &HashMap<String, f64>) -> Result<String, String> {
    serde_json::to_string(map).map_err(|e| e.to_string())
}

impl SettingsStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS system_settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        let store = Self { pool };
        store.ensure_defaults().await?;
        Ok(store)
    }

    async fn ensure_defaults(&self) -> Result<(), String> {
        let defaults = RelaySettings::default();
        self.set_if_not_exists(
            "streaming_timeout_seconds",
            &defaults.streaming_timeout_seconds.to_string(),
        )
        .await?;
        self.set_if_not_exists(
            "ping_interval_enabled",
            &defaults.ping_interval_enabled.to_string(),
        )
        .await?;
        self.set_if_not_exists(
            "ping_interval_seconds",
            &defaults.ping_interval_seconds.to_string(),
        )
        .await?;
        self.set_if_not_exists(
            "pre_consumed_quota",
            &defaults.pre_consumed_quota.to_string(),
        )
        .await?;
        self.set_if_not_exists("quota_per_unit", &defaults.quota_per_unit.to_string())
            .await?;
        self.set_if_not_exists(
            "request_timeout_ms",
            &defaults.request_timeout_ms.to_string(),
        )
        .await?;
        self.set_if_not_exists(
            "default_model_ratio",
            &defaults.default_model_ratio.to_string(),
        )
        .await?;
        self.set_if_not_exists("model_price", &encode_map(&defaults.model_price)?)
            .await?;
        self.set_if_not_exists("model_ratio", &encode_map(&defaults.model_ratio)?)
            .await?;
        self.set_if_not_exists(
            "completion_ratio",
            &encode_map(&defaults.completion_ratio)?,
        )
        .await?;
        self.set_if_not_exists("audio_ratio", &encode_map(&defaults.audio_ratio)?)
            .await?;
        self.set_if_not_exists("group_ratio", &encode_map(&defaults.group_ratio)?)
            .await?;
        Ok(())
    }

    async fn set_if_not_exists(&self, key: &str, value: &str) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT OR IGNORE INTO system_settings (key, value, updated_at) VALUES (?, ?, ?)",
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, String> {
        let row = sqlx::query("SELECT value FROM system_settings WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(row.map(|r| r.try_get("value").unwrap_or_default()))
    }

    pub async fn set(&self, key: &str, value: &str) -> Result<(), String> {
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            "INSERT INTO system_settings (key, value, updated_at) VALUES (?, ?, ?)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        )
        .bind(key)
        .bind(value)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Reads every setting; unparsable values fall back to their defaults so a
    /// bad edit never blocks relaying.
    pub async fn get_all(&self) -> Result<RelaySettings, String> {
        let rows = sqlx::query("SELECT key, value, updated_at FROM system_settings")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| e.to_string())?;

        let mut settings = RelaySettings::default();
        let mut latest_update = settings.updated_at;

        for row in rows {
            let key: String = row.try_get("key").map_err(|e| e.to_string())?;
            let value: String = row.try_get("value").map_err(|e| e.to_string())?;
            let updated_at_str: String = row.try_get("updated_at").map_err(|e| e.to_string())?;

            if let Ok(updated_at) = DateTime::parse_from_rfc3339(&updated_at_str) {
                let updated_at = updated_at.with_timezone(&Utc);
                if updated_at > latest_update {
                    latest_update = updated_at;
                }
            }

            match key.as_str() {
                "streaming_timeout_seconds" => {
                    settings.streaming_timeout_seconds = value.parse().unwrap_or(120);
                }
                "ping_interval_enabled" => {
                    settings.ping_interval_enabled = value.parse().unwrap_or(false);
                }
                "ping_interval_seconds" => {
                    settings.ping_interval_seconds = value.parse().unwrap_or(10);
                }
                "pre_consumed_quota" => {
                    settings.pre_consumed_quota = value.parse().unwrap_or(500);
                }
                "quota_per_unit" => {
                    settings.quota_per_unit = value.parse().unwrap_or(500_000.0);
                }
                "request_timeout_ms" => {
                    settings.request_timeout_ms = value.parse().unwrap_or(30000);
                }
                "default_model_ratio" => {
                    settings.default_model_ratio = value.parse().unwrap_or(37.5);
                }
                "model_price" => {
                    if let Ok(map) = serde_json::from_str(&value) {
                        settings.model_price = map;
                    }
                }
                "model_ratio" => {
                    if let Ok(map) = serde_json::from_str(&value) {
                        settings.model_ratio = map;
                    }
                }
                "completion_ratio" => {
                    if let Ok(map) = serde_json::from_str(&value) {
                        settings.completion_ratio = map;
                    }
                }
                "audio_ratio" => {
                    if let Ok(map) = serde_json::from_str(&value) {
                        settings.audio_ratio = map;
                    }
                }
                "group_ratio" => {
                    if let Ok(map) = serde_json::from_str(&value) {
                        settings.group_ratio = map;
                    }
                }
                _ => {}
            }
        }

        settings.updated_at = latest_update;
        Ok(settings)
    }

    pub async fn set_ratio_map(
        &self,
        key: &str,
        map: &HashMap<String, f64>,
    ) -> Result<(), String> {
        self.set(key, &encode_map(map)?).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn store() -> (SettingsStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("settings.db");
        let options = sqlx::sqlite::SqliteConnectOptions::new()
            .filename(&path)
            .create_if_missing(true);
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        (SettingsStore::new(pool).await.unwrap(), temp_dir)
    }

    #[tokio::test]
    async fn defaults_are_seeded_once() {
        let (store, _dir) = store().await;
        assert_eq!(
            store.get("streaming_timeout_seconds").await.unwrap(),
            Some("120".to_string())
        );
        store.set("ping_interval_enabled", "true").await.unwrap();
        store.ensure_defaults().await.unwrap();
        let settings = store.get_all().await.unwrap();
        assert!(settings.ping_interval_enabled);
        assert_eq!(settings.pre_consumed_quota, 500);
        assert_eq!(settings.group_ratio.get("default"), Some(&1.0));
    }

    #[tokio::test]
    async fn malformed_values_fall_back_to_defaults() {
        let (store, _dir) = store().await;
        store.set("ping_interval_seconds", "soon").await.unwrap();
        store.set("model_ratio", "{not json").await.unwrap();
        let settings = store.get_all().await.unwrap();
        assert_eq!(settings.ping_interval_seconds, 10);
        assert!(settings.model_ratio.is_empty());
    }

    #[tokio::test]
    async fn ratio_maps_round_trip_through_settings() {
        let (store, _dir) = store().await;
        let mut ratios = HashMap::new();
        ratios.insert("grok-3".to_string(), 1.5);
        store.set_ratio_map("model_ratio", &ratios).await.unwrap();
        let settings = store.get_all().await.unwrap();
        assert_eq!(settings.model_ratio.get("grok-3"), Some(&1.5));
    }
}
