//! SQLite-backed coordination store (sqlx)
//!
//! Timestamps are stored as epoch milliseconds so expiry comparisons stay in
//! SQL. Acquisition runs inside one transaction whose first statement is a
//! write, so concurrent acquirers from other processes serialise on SQLite's
//! write lock (with sqlx's busy timeout) instead of racing a read-then-write.

use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use super::{AcquireResult, CoordinationStore, SlotLease};
use crate::error::{CampaignError, Result};
use crate::types::{AdmissionClass, CampaignId, ExecutionId};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS resource_slots (
        execution_id    TEXT PRIMARY KEY,
        campaign_id     TEXT NOT NULL UNIQUE,
        admission_class TEXT NOT NULL,
        owner           TEXT NOT NULL,
        acquired_at     INTEGER NOT NULL,
        expires_at      INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_resource_slots_class
        ON resource_slots (admission_class, expires_at)",
    "CREATE TABLE IF NOT EXISTS campaign_failures (
        campaign_id TEXT PRIMARY KEY,
        failures    INTEGER NOT NULL DEFAULT 0
    )",
];

/// Coordination store over a sqlx SQLite pool
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema. In-memory URLs are pinned to a single
    /// connection, since every SQLite memory connection is its own database.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);
        let max_connections = if url.contains(":memory:") { 1 } else { max_connections.max(1) };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        for statement in SCHEMA {
            sqlx::query(statement).execute(&pool).await?;
        }

        info!(url = %url, "Coordination store ready");
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| CampaignError::store(format!("Invalid timestamp in store: {}", ms)))
}

fn parse_class(value: &str) -> Result<AdmissionClass> {
    match value {
        "voice" => Ok(AdmissionClass::Voice),
        "sms" => Ok(AdmissionClass::Sms),
        other => Err(CampaignError::store(format!("Unknown admission class in store: {}", other))),
    }
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    async fn try_acquire(&self, lease: SlotLease, quota: u32, now: DateTime<Utc>) -> Result<AcquireResult> {
        let mut tx = self.pool.begin().await?;
        let now_ms = to_millis(now);

        let reclaimed = sqlx::query(
            "DELETE FROM resource_slots
             WHERE expires_at <= ?1 AND (admission_class = ?2 OR campaign_id = ?3)",
        )
        .bind(now_ms)
        .bind(lease.class.as_str())
        .bind(lease.campaign_id.as_str())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if reclaimed > 0 {
            debug!(class = %lease.class, reclaimed, "Reclaimed expired slot leases");
        }

        let held: Option<String> =
            sqlx::query_scalar("SELECT execution_id FROM resource_slots WHERE campaign_id = ?1")
                .bind(lease.campaign_id.as_str())
                .fetch_optional(&mut *tx)
                .await?;
        if let Some(execution_id) = held {
            tx.rollback().await?;
            return Ok(AcquireResult::CampaignHeld {
                execution_id: ExecutionId(execution_id),
            });
        }

        let inserted = sqlx::query(
            "INSERT INTO resource_slots
                (execution_id, campaign_id, admission_class, owner, acquired_at, expires_at)
             SELECT ?1, ?2, ?3, ?4, ?5, ?6
             WHERE (SELECT COUNT(*) FROM resource_slots WHERE admission_class = ?3) < ?7",
        )
        .bind(lease.execution_id.as_str())
        .bind(lease.campaign_id.as_str())
        .bind(lease.class.as_str())
        .bind(&lease.owner)
        .bind(to_millis(lease.acquired_at))
        .bind(to_millis(lease.expires_at))
        .bind(i64::from(quota))
        .execute(&mut *tx)
        .await;

        let inserted = match inserted {
            Ok(result) => result.rows_affected() == 1,
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                // lost a race with another instance admitting the same campaign
                tx.rollback().await?;
                let holder: Option<String> =
                    sqlx::query_scalar("SELECT execution_id FROM resource_slots WHERE campaign_id = ?1")
                        .bind(lease.campaign_id.as_str())
                        .fetch_optional(&self.pool)
                        .await?;
                return Ok(AcquireResult::CampaignHeld {
                    execution_id: holder.map(ExecutionId).unwrap_or(lease.execution_id),
                });
            }
            Err(e) => return Err(e.into()),
        };

        let active: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM resource_slots WHERE admission_class = ?1")
                .bind(lease.class.as_str())
                .fetch_one(&mut *tx)
                .await?;
        tx.commit().await?;

        let active = active as u32;
        if inserted {
            Ok(AcquireResult::Granted { active })
        } else {
            Ok(AcquireResult::Exhausted { active })
        }
    }

    async fn release(&self, class: AdmissionClass, execution_id: &ExecutionId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM resource_slots WHERE execution_id = ?1 AND admission_class = ?2")
            .bind(execution_id.as_str())
            .bind(class.as_str())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn heartbeat(
        &self,
        class: AdmissionClass,
        execution_id: &ExecutionId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE resource_slots SET expires_at = ?1
             WHERE execution_id = ?2 AND admission_class = ?3 AND expires_at > ?4",
        )
        .bind(to_millis(expires_at))
        .bind(execution_id.as_str())
        .bind(class.as_str())
        .bind(to_millis(now))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn active(&self, class: AdmissionClass, now: DateTime<Utc>) -> Result<Vec<SlotLease>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM resource_slots WHERE admission_class = ?1 AND expires_at <= ?2")
            .bind(class.as_str())
            .bind(to_millis(now))
            .execute(&mut *tx)
            .await?;

        let rows = sqlx::query(
            "SELECT execution_id, campaign_id, admission_class, owner, acquired_at, expires_at
             FROM resource_slots WHERE admission_class = ?1 ORDER BY acquired_at",
        )
        .bind(class.as_str())
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        rows.iter()
            .map(|row| -> Result<SlotLease> {
                Ok(SlotLease {
                    execution_id: ExecutionId(row.try_get("execution_id")?),
                    campaign_id: CampaignId(row.try_get("campaign_id")?),
                    class: parse_class(row.try_get::<&str, _>("admission_class")?)?,
                    owner: row.try_get("owner")?,
                    acquired_at: from_millis(row.try_get("acquired_at")?)?,
                    expires_at: from_millis(row.try_get("expires_at")?)?,
                })
            })
            .collect()
    }

    async fn increment_failures(&self, campaign_id: &CampaignId) -> Result<u64> {
        let failures: i64 = sqlx::query_scalar(
            "INSERT INTO campaign_failures (campaign_id, failures) VALUES (?1, 1)
             ON CONFLICT(campaign_id) DO UPDATE SET failures = failures + 1
             RETURNING failures",
        )
        .bind(campaign_id.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(failures as u64)
    }

    async fn failures(&self, campaign_id: &CampaignId) -> Result<u64> {
        let failures: Option<i64> =
            sqlx::query_scalar("SELECT failures FROM campaign_failures WHERE campaign_id = ?1")
                .bind(campaign_id.as_str())
                .fetch_optional(&self.pool)
                .await?;
        Ok(failures.unwrap_or(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn lease(execution: &str, campaign: &str, class: AdmissionClass, now: DateTime<Utc>) -> SlotLease {
        SlotLease {
            execution_id: execution.into(),
            campaign_id: campaign.into(),
            class,
            owner: "instance-a".to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn test_conditional_insert_respects_quota() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();

        let granted = store.try_acquire(lease("e1", "a", AdmissionClass::Voice, now), 1, now).await.unwrap();
        assert_eq!(granted, AcquireResult::Granted { active: 1 });

        let denied = store.try_acquire(lease("e2", "b", AdmissionClass::Voice, now), 1, now).await.unwrap();
        assert_eq!(denied, AcquireResult::Exhausted { active: 1 });

        assert!(store.release(AdmissionClass::Voice, &"e1".into()).await.unwrap());
        let regranted = store.try_acquire(lease("e2", "b", AdmissionClass::Voice, now), 1, now).await.unwrap();
        assert_eq!(regranted, AcquireResult::Granted { active: 1 });
    }

    #[tokio::test]
    async fn test_duplicate_campaign_reports_holder() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();

        store.try_acquire(lease("e1", "a", AdmissionClass::Voice, now), 3, now).await.unwrap();
        let dup = store.try_acquire(lease("e2", "a", AdmissionClass::Voice, now), 3, now).await.unwrap();
        assert_eq!(dup, AcquireResult::CampaignHeld { execution_id: "e1".into() });
    }

    #[tokio::test]
    async fn test_expiry_and_heartbeat() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();

        store.try_acquire(lease("e1", "a", AdmissionClass::Sms, now), 1, now).await.unwrap();
        let extended = now + Duration::seconds(120);
        assert!(store.heartbeat(AdmissionClass::Sms, &"e1".into(), now, extended).await.unwrap());

        // still live thanks to the heartbeat
        let active = store.active(AdmissionClass::Sms, now + Duration::seconds(90)).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].campaign_id, CampaignId::from("a"));

        let active = store.active(AdmissionClass::Sms, now + Duration::seconds(121)).await.unwrap();
        assert!(active.is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_after_expiry_is_refused() {
        let store = SqliteStore::in_memory().await.unwrap();
        let now = Utc::now();
        store.try_acquire(lease("e1", "a", AdmissionClass::Voice, now), 1, now).await.unwrap();

        // row is still present, only its expiry has passed
        let late = now + Duration::seconds(300);
        let revived = store
            .heartbeat(AdmissionClass::Voice, &"e1".into(), late, late + Duration::seconds(60))
            .await
            .unwrap();
        assert!(!revived);
        assert!(store.active(AdmissionClass::Voice, late).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failure_counter_upsert() {
        let store = SqliteStore::in_memory().await.unwrap();
        let campaign: CampaignId = "camp".into();
        assert_eq!(store.increment_failures(&campaign).await.unwrap(), 1);
        assert_eq!(store.increment_failures(&campaign).await.unwrap(), 2);
        assert_eq!(store.failures(&campaign).await.unwrap(), 2);
    }
}
