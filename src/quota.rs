use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use sqlx::{Pool, Row, Sqlite};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerErrorKind {
    NotFound,
    InsufficientQuota,
    Conflict,
    Internal,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct LedgerError {
    pub kind: LedgerErrorKind,
    pub message: String,
}

impl LedgerError {
    fn new(kind: LedgerErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    fn internal(err: impl ToString) -> Self {
        Self::new(LedgerErrorKind::Internal, err.to_string())
    }
}

#[derive(Debug)]
pub struct Reservation {
    pub id: String,
    pub user_id: String,
    pub amount: u64,
    pub prior_quota: i64,
}

/// What a settlement charged for, persisted next to the ledger movement.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Settlement {
    pub request_id: String,
    pub channel_id: String,
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model_ratio: f64,
    pub group_ratio: f64,
    pub completion_ratio: f64,
    pub model_price: Option<f64>,
    pub use_price: bool,
}

#[async_trait]
pub trait QuotaLedger: Send + Sync {
    async fn pre_consume(&self, user_id: &str, amount: u64) -> Result<Reservation, LedgerError>;

    async fn rollback(&self, reservation: &Reservation) -> Result<(), LedgerError>;

    async fn settle(
        &self,
        reservation: &Reservation,
        true_cost: u64,
        settlement: &Settlement,
    ) -> Result<(), LedgerError>;
}

/// Owns a pending reservation. `settle` and `rollback` consume the guard;
/// dropping it while still pending schedules a rollback on the runtime.
pub struct ReservationGuard {
    ledger: Arc<dyn QuotaLedger>,
    reservation: Option<Reservation>,
}

impl ReservationGuard {
    pub async fn acquire(
        ledger: Arc<dyn QuotaLedger>,
        user_id: &str,
        amount: u64,
    ) -> Result<Self, LedgerError> {
        let reservation = ledger.pre_consume(user_id, amount).await?;
        Ok(Self {
            ledger,
            reservation: Some(reservation),
        })
    }

    pub async fn settle(
        mut self,
        true_cost: u64,
        settlement: &Settlement,
    ) -> Result<(), LedgerError> {
        let Some(reservation) = self.reservation.take() else {
            return Ok(());
        };
        self.ledger
            .settle(&reservation, true_cost, settlement)
            .await
    }

    pub async fn rollback(mut self) -> Result<(), LedgerError> {
        let Some(reservation) = self.reservation.take() else {
            return Ok(());
        };
        self.ledger.rollback(&reservation).await
    }
}

impl Drop for ReservationGuard {
    fn drop(&mut self) {
        let Some(reservation) = self.reservation.take() else {
            return;
        };
        tracing::warn!(
            reservation_id = %reservation.id,
            user_id = %reservation.user_id,
            amount = reservation.amount,
            "reservation dropped while pending, rolling back"
        );
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let ledger = self.ledger.clone();
                handle.spawn(async move {
                    if let Err(err) = ledger.rollback(&reservation).await {
                        tracing::error!(
                            reservation_id = %reservation.id,
                            error = %err,
                            "deferred rollback failed"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::error!(
                    reservation_id = %reservation.id,
                    "no runtime available for deferred rollback"
                );
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaUser {
    pub id: String,
    pub group: String,
    pub quota: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub user_id: String,
    pub kind: String,
    pub delta: i64,
    pub quota_after: i64,
    pub meta: Value,
    pub created_at: DateTime<Utc>,
}

pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

fn to_quota(amount: u64) -> Result<i64, LedgerError> {
    i64::try_from(amount).map_err(|_| LedgerError::internal("quota amount overflow"))
}

#[derive(Clone)]
pub struct QuotaStore {
    pool: Pool<Sqlite>,
}

impl QuotaStore {
    pub async fn new(pool: Pool<Sqlite>) -> Result<Self, String> {
        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                token_hash TEXT NOT NULL UNIQUE,
                user_group TEXT NOT NULL DEFAULT 'default',
                quota INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS quota_reservations (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id),
                amount INTEGER NOT NULL,
                prior_quota INTEGER NOT NULL,
                state TEXT NOT NULL CHECK (state IN ('pending', 'settled', 'rolled_back')),
                created_at TEXT NOT NULL,
                resolved_at TEXT
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query(
            r#"CREATE TABLE IF NOT EXISTS quota_ledger (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                delta INTEGER NOT NULL,
                quota_after INTEGER NOT NULL,
                meta_json TEXT NOT NULL DEFAULT '{}',
                created_at TEXT NOT NULL
            )"#,
        )
        .execute(&pool)
        .await
        .map_err(|e| e.to_string())?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_quota_ledger_user ON quota_ledger(user_id)")
            .execute(&pool)
            .await
            .map_err(|e| e.to_string())?;

        Ok(Self { pool })
    }

    pub async fn create_user(
        &self,
        token: &str,
        group: &str,
        quota: i64,
    ) -> Result<QuotaUser, String> {
        let id = format!("usr_{}", uuid::Uuid::new_v4().simple());
        let now = Utc::now().to_rfc3339();
        sqlx::query(
            r#"INSERT INTO users (id, token_hash, user_group, quota, created_at, updated_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(&id)
        .bind(hash_token(token))
        .bind(group)
        .bind(quota)
        .bind(&now)
        .bind(&now)
        .execute(&self.pool)
        .await
        .map_err(|e| e.to_string())?;
        Ok(QuotaUser {
            id,
            group: group.to_string(),
            quota,
        })
    }

    pub async fn find_user_by_token(&self, token: &str) -> Result<Option<QuotaUser>, String> {
        let row = sqlx::query("SELECT id, user_group, quota FROM users WHERE token_hash = ?")
            .bind(hash_token(token))
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())?;
        let Some(row) = row else {
            return Ok(None);
        };
        Ok(Some(QuotaUser {
            id: row.try_get("id").map_err(|e| e.to_string())?,
            group: row.try_get("user_group").map_err(|e| e.to_string())?,
            quota: row.try_get("quota").map_err(|e| e.to_string())?,
        }))
    }

    pub async fn get_quota(&self, user_id: &str) -> Result<Option<i64>, String> {
        sqlx::query_scalar::<_, i64>("SELECT quota FROM users WHERE id = ?")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| e.to_string())
    }

    pub async fn list_ledger_entries(&self, user_id: &str) -> Result<Vec<LedgerEntry>, String> {
        let rows = sqlx::query(
            r#"SELECT id, user_id, kind, delta, quota_after, meta_json, created_at
               FROM quota_ledger WHERE user_id = ? ORDER BY id ASC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| e.to_string())?;

        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let meta_json: String = row.try_get("meta_json").map_err(|e| e.to_string())?;
            let created_at: String = row.try_get("created_at").map_err(|e| e.to_string())?;
            entries.push(LedgerEntry {
                id: row.try_get("id").map_err(|e| e.to_string())?,
                user_id: row.try_get("user_id").map_err(|e| e.to_string())?,
                kind: row.try_get("kind").map_err(|e| e.to_string())?,
                delta: row.try_get("delta").map_err(|e| e.to_string())?,
                quota_after: row.try_get("quota_after").map_err(|e| e.to_string())?,
                meta: serde_json::from_str(&meta_json).unwrap_or(Value::Null),
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .map_err(|e| e.to_string())?,
            });
        }
        Ok(entries)
    }

    /// Marks a pending reservation resolved; fails with `Conflict` if it was
    /// already settled or rolled back.
    async fn resolve_reservation_tx(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        reservation: &Reservation,
        state: &str,
        now: &str,
    ) -> Result<(), LedgerError> {
        let result = sqlx::query(
            "UPDATE quota_reservations SET state = ?, resolved_at = ? WHERE id = ? AND state = 'pending'",
        )
        .bind(state)
        .bind(now)
        .bind(&reservation.id)
        .execute(&mut **tx)
        .await
        .map_err(LedgerError::internal)?;
        if result.rows_affected() == 0 {
            return Err(LedgerError::new(
                LedgerErrorKind::Conflict,
                format!("reservation {} already resolved", reservation.id),
            ));
        }
        Ok(())
    }

    /// Applies `delta` to the user's quota and returns the new balance.
    async fn adjust_quota_tx(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        user_id: &str,
        delta: i64,
        now: &str,
    ) -> Result<i64, LedgerError> {
        let quota_after = sqlx::query_scalar::<_, i64>(
            "UPDATE users SET quota = quota + ?, updated_at = ? WHERE id = ? RETURNING quota",
        )
        .bind(delta)
        .bind(now)
        .bind(user_id)
        .fetch_optional(&mut **tx)
        .await
        .map_err(LedgerError::internal)?;
        quota_after.ok_or_else(|| LedgerError::new(LedgerErrorKind::NotFound, "user not found"))
    }

    async fn insert_ledger_tx(
        tx: &mut sqlx::Transaction<'_, Sqlite>,
        user_id: &str,
        kind: &str,
        delta: i64,
        quota_after: i64,
        meta: &Value,
        now: &str,
    ) -> Result<(), LedgerError> {
        sqlx::query(
            r#"INSERT INTO quota_ledger (user_id, kind, delta, quota_after, meta_json, created_at)
               VALUES (?, ?, ?, ?, ?, ?)"#,
        )
        .bind(user_id)
        .bind(kind)
        .bind(delta)
        .bind(quota_after)
        .bind(meta.to_string())
        .bind(now)
        .execute(&mut **tx)
        .await
        .map_err(LedgerError::internal)?;
        Ok(())
    }
}

#[async_trait]
impl QuotaLedger for QuotaStore {
    async fn pre_consume(&self, user_id: &str, amount: u64) -> Result<Reservation, LedgerError> {
        let amount_quota = to_quota(amount)?;
        let now = Utc::now().to_rfc3339();
        let mut tx = self.pool.begin().await.map_err(LedgerError::internal)?;
        // Debit first: a transaction opened by a read cannot upgrade to a
        // write after another connection commits.
        let debited = sqlx::query_as::<_, (i64, i64)>(
            r#"UPDATE users SET quota = quota - ?, updated_at = ?
               WHERE id = ? AND quota > 0 AND quota >= ?
               RETURNING quota + ?, quota"#,
        )
        .bind(amount_quota)
        .bind(&now)
        .bind(user_id)
        .bind(amount_quota)
        .bind(amount_quota)
        .fetch_optional(&mut *tx)
        .await
        .map_err(LedgerError::internal)?;

        let Some((prior_quota, quota_after)) = debited else {
            let current = sqlx::query_scalar::<_, i64>("SELECT quota FROM users WHERE id = ?")
                .bind(user_id)
                .fetch_optional(&mut *tx)
                .await
                .map_err(LedgerError::internal)?;
            return Err(match current {
                None => LedgerError::new(LedgerErrorKind::NotFound, "user not found"),
                Some(quota) => LedgerError::new(
                    LedgerErrorKind::InsufficientQuota,
                    format!("user quota {quota} is not enough for {amount}"),
                ),
            });
        };

        let id = uuid::Uuid::new_v4().to_string();
        sqlx::query(
            r#"INSERT INTO quota_reservations (id, user_id, amount, prior_quota, state, created_at)
               VALUES (?, ?, ?, ?, 'pending', ?)"#,
        )
        .bind(&id)
        .bind(user_id)
        .bind(amount_quota)
        .bind(prior_quota)
        .bind(&now)
        .execute(&mut *tx)
        .await
        .map_err(LedgerError::internal)?;

        Self::insert_ledger_tx(
            &mut tx,
            user_id,
            "pre_consume",
            -amount_quota,
            quota_after,
            &serde_json::json!({ "reservation_id": id }),
            &now,
        )
        .await?;
        tx.commit().await.map_err(LedgerError::internal)?;

        metrics::counter!("quota_pre_consume_total").increment(1);
        Ok(Reservation {
            id,
            user_id: user_id.to_string(),
            amount,
            prior_quota,
        })
    }

    async fn rollback(&self, reservation: &Reservation) -> Result<(), LedgerError> {
        let amount_quota = to_quota(reservation.amount)?;
        let mut tx = self.pool.begin().await.map_err(LedgerError::internal)?;
        let now = Utc::now().to_rfc3339();
        Self::resolve_reservation_tx(&mut tx, reservation, "rolled_back", &now).await?;
        let quota_after =
            Self::adjust_quota_tx(&mut tx, &reservation.user_id, amount_quota, &now).await?;
        Self::insert_ledger_tx(
            &mut tx,
            &reservation.user_id,
            "rollback",
            amount_quota,
            quota_after,
            &serde_json::json!({ "reservation_id": reservation.id }),
            &now,
        )
        .await?;
        tx.commit().await.map_err(LedgerError::internal)?;

        metrics::counter!("quota_rollback_total").increment(1);
        Ok(())
    }

    async fn settle(
        &self,
        reservation: &Reservation,
        true_cost: u64,
        settlement: &Settlement,
    ) -> Result<(), LedgerError> {
        let reserved = to_quota(reservation.amount)?;
        let cost = to_quota(true_cost)?;
        let delta = reserved - cost;
        let mut tx = self.pool.begin().await.map_err(LedgerError::internal)?;
        let now = Utc::now().to_rfc3339();
        Self::resolve_reservation_tx(&mut tx, reservation, "settled", &now).await?;
        let quota_after =
            Self::adjust_quota_tx(&mut tx, &reservation.user_id, delta, &now).await?;

        let mut meta = serde_json::to_value(settlement).map_err(LedgerError::internal)?;
        if let Value::Object(map) = &mut meta {
            map.insert("reservation_id".to_string(), Value::from(reservation.id.clone()));
            map.insert("reserved".to_string(), Value::from(reserved));
            map.insert("true_cost".to_string(), Value::from(cost));
        }
        Self::insert_ledger_tx(
            &mut tx,
            &reservation.user_id,
            "settle",
            delta,
            quota_after,
            &meta,
            &now,
        )
        .await?;
        tx.commit().await.map_err(LedgerError::internal)?;

        metrics::counter!("quota_settle_total").increment(1);
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// In-memory ledger that counts every resolution per reservation.
    #[derive(Default)]
    pub struct CountingLedger {
        pub settled: Mutex<Vec<(String, u64)>>,
        pub rolled_back: Mutex<Vec<String>>,
        next_id: Mutex<u64>,
    }

    #[async_trait]
    impl QuotaLedger for CountingLedger {
        async fn pre_consume(
            &self,
            user_id: &str,
            amount: u64,
        ) -> Result<Reservation, LedgerError> {
            let mut next_id = self.next_id.lock().unwrap();
            *next_id += 1;
            Ok(Reservation {
                id: format!("r{}", *next_id),
                user_id: user_id.to_string(),
                amount,
                prior_quota: 1_000_000,
            })
        }

        async fn rollback(&self, reservation: &Reservation) -> Result<(), LedgerError> {
            self.rolled_back
                .lock()
                .unwrap()
                .push(reservation.id.clone());
            Ok(())
        }

        async fn settle(
            &self,
            reservation: &Reservation,
            true_cost: u64,
            _settlement: &Settlement,
        ) -> Result<(), LedgerError> {
            self.settled
                .lock()
                .unwrap()
                .push((reservation.id.clone(), true_cost));
            Ok(())
        }
    }
}
