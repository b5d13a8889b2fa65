//! `PrimaryStore`. The optional durable tier. Configured by
//! `PRIMARY_DB_URL`; the service operates without it, falling back to
//! `MemoryRing` + `ThreatLog` for reads.
//!
//! Pool creation follows `hub/db.rs`, and the trait shape follows
//! `storage/persistence.rs`'s `PersistenceLayer`, generalized from a single
//! advisory table to the packet schema.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use super::ring::HistoryFilter;
use crate::types::{OwnerId, Packet, ThreatRecord};

#[derive(Debug, Error)]
pub enum PrimaryStoreError {
    #[error("primary store unavailable: {0}")]
    Unavailable(String),
}

/// Pluggable durable backend. Implementations must be `Send + Sync` since
/// every owner's pipeline task shares one handle behind an `Arc`.
#[async_trait]
pub trait PrimaryStore: Send + Sync {
    async fn insert_packet(&self, packet: &Packet) -> Result<(), PrimaryStoreError>;
    async fn query_packets(&self, owner: &OwnerId, filter: &HistoryFilter) -> Result<Vec<Packet>, PrimaryStoreError>;
    async fn count_packets(&self, owner: &OwnerId) -> Result<u64, PrimaryStoreError>;
    async fn count_threats_since(&self, owner: &OwnerId, since: DateTime<Utc>) -> Result<u64, PrimaryStoreError>;
    async fn threats_since(&self, owner: &OwnerId, since: DateTime<Utc>) -> Result<Vec<ThreatRecord>, PrimaryStoreError>;
    async fn earliest_timestamp(&self, owner: &OwnerId) -> Result<Option<DateTime<Utc>>, PrimaryStoreError>;
    /// Deletes every stored packet, for `POST /api/admin/reset-mongo`.
    async fn reset_all(&self) -> Result<(), PrimaryStoreError>;
    fn backend_name(&self) -> &'static str;
}

#[cfg(feature = "primary-store")]
pub use postgres_impl::PostgresStore;

#[cfg(feature = "primary-store")]
mod postgres_impl {
    use super::*;
    use sqlx::postgres::PgPoolOptions;
    use sqlx::{PgPool, Row};
    use std::time::Duration;

    /// Packet documents stored as JSONB alongside the indexed columns
    /// `(owner_id, timestamp desc)`,
    /// `(owner_id, is_anomaly, timestamp desc)`, `(owner_id, source_ip, timestamp desc)`.
    pub struct PostgresStore {
        pool: PgPool,
    }

    impl PostgresStore {
        pub async fn connect(database_url: &str) -> Result<Self, PrimaryStoreError> {
            let pool = PgPoolOptions::new()
                .max_connections(20)
                .acquire_timeout(Duration::from_secs(10))
                .connect(database_url)
                .await
                .map_err(|e| PrimaryStoreError::Unavailable(e.to_string()))?;

            sqlx::query(
                r#"
                CREATE TABLE IF NOT EXISTS packets (
                    id TEXT PRIMARY KEY,
                    owner_id TEXT NOT NULL,
                    ts TIMESTAMPTZ NOT NULL,
                    is_anomaly BOOLEAN NOT NULL,
                    source_ip TEXT NOT NULL,
                    doc JSONB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS packets_owner_ts_idx ON packets (owner_id, ts DESC);
                CREATE INDEX IF NOT EXISTS packets_owner_anomaly_ts_idx ON packets (owner_id, is_anomaly, ts DESC);
                CREATE INDEX IF NOT EXISTS packets_owner_ip_ts_idx ON packets (owner_id, source_ip, ts DESC);
                "#,
            )
            .execute(&pool)
            .await
            .map_err(|e| PrimaryStoreError::Unavailable(e.to_string()))?;

            Ok(Self { pool })
        }
    }

    #[async_trait]
    impl PrimaryStore for PostgresStore {
        async fn insert_packet(&self, packet: &Packet) -> Result<(), PrimaryStoreError> {
            let doc = serde_json::to_value(packet)
                .map_err(|e| PrimaryStoreError::Unavailable(e.to_string()))?;

            sqlx::query(
                "INSERT INTO packets (id, owner_id, ts, is_anomaly, source_ip, doc) \
                 VALUES ($1, $2, $3, $4, $5, $6) ON CONFLICT (id) DO NOTHING",
            )
            .bind(&packet.id)
            .bind(packet.owner_id.as_str())
            .bind(packet.timestamp)
            .bind(packet.is_anomaly)
            .bind(&packet.source_ip)
            .bind(doc)
            .execute(&self.pool)
            .await
            .map_err(|e| PrimaryStoreError::Unavailable(e.to_string()))?;

            Ok(())
        }

        async fn query_packets(&self, owner: &OwnerId, filter: &HistoryFilter) -> Result<Vec<Packet>, PrimaryStoreError> {
            let rows = sqlx::query(
                "SELECT doc FROM packets WHERE owner_id = $1 \
                 AND ($2::timestamptz IS NULL OR ts >= $2) \
                 AND ($3::boolean IS NULL OR is_anomaly = $3) \
                 AND ($4::text IS NULL OR source_ip = $4) \
                 ORDER BY ts DESC LIMIT $5",
            )
            .bind(owner.as_str())
            .bind(filter.since)
            .bind(filter.anomaly)
            .bind(filter.source_ip.as_deref())
            .bind(filter.limit as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PrimaryStoreError::Unavailable(e.to_string()))?;

            rows.into_iter()
                .map(|row| {
                    let doc: serde_json::Value = row.get("doc");
                    serde_json::from_value(doc).map_err(|e| PrimaryStoreError::Unavailable(e.to_string()))
                })
                .collect()
        }

        async fn count_packets(&self, owner: &OwnerId) -> Result<u64, PrimaryStoreError> {
            let row = sqlx::query("SELECT COUNT(*) AS n FROM packets WHERE owner_id = $1")
                .bind(owner.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| PrimaryStoreError::Unavailable(e.to_string()))?;
            let n: i64 = row.get("n");
            Ok(n as u64)
        }

        async fn count_threats_since(&self, owner: &OwnerId, since: DateTime<Utc>) -> Result<u64, PrimaryStoreError> {
            let row = sqlx::query(
                "SELECT COUNT(*) AS n FROM packets WHERE owner_id = $1 AND is_anomaly = true AND ts >= $2",
            )
            .bind(owner.as_str())
            .bind(since)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| PrimaryStoreError::Unavailable(e.to_string()))?;
            let n: i64 = row.get("n");
            Ok(n as u64)
        }

        async fn threats_since(&self, owner: &OwnerId, since: DateTime<Utc>) -> Result<Vec<ThreatRecord>, PrimaryStoreError> {
            let rows = sqlx::query(
                "SELECT doc FROM packets WHERE owner_id = $1 AND is_anomaly = true AND ts >= $2 ORDER BY ts DESC",
            )
            .bind(owner.as_str())
            .bind(since)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| PrimaryStoreError::Unavailable(e.to_string()))?;

            rows.into_iter()
                .map(|row| {
                    let doc: serde_json::Value = row.get("doc");
                    let packet: Packet = serde_json::from_value(doc)
                        .map_err(|e| PrimaryStoreError::Unavailable(e.to_string()))?;
                    Ok(ThreatRecord::from(&packet))
                })
                .collect()
        }

        async fn earliest_timestamp(&self, owner: &OwnerId) -> Result<Option<DateTime<Utc>>, PrimaryStoreError> {
            let row = sqlx::query("SELECT MIN(ts) AS earliest FROM packets WHERE owner_id = $1")
                .bind(owner.as_str())
                .fetch_one(&self.pool)
                .await
                .map_err(|e| PrimaryStoreError::Unavailable(e.to_string()))?;
            Ok(row.get("earliest"))
        }

        async fn reset_all(&self) -> Result<(), PrimaryStoreError> {
            sqlx::query("TRUNCATE TABLE packets")
                .execute(&self.pool)
                .await
                .map_err(|e| PrimaryStoreError::Unavailable(e.to_string()))?;
            Ok(())
        }

        fn backend_name(&self) -> &'static str {
            "postgres"
        }
    }
}
