//! Storage Layer. Three tiers, written in parallel, none blocking
//! the Broadcaster: an optional durable `PrimaryStore`, an always-on
//! `MemoryRing`, and an always-on append-only `ThreatLog`.

pub mod primary;
pub mod ring;
pub mod threat_log;

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};

pub use primary::{PrimaryStore, PrimaryStoreError};
#[cfg(feature = "primary-store")]
pub use primary::PostgresStore;
pub use ring::{HistoryFilter, MemoryRing};
pub use threat_log::ThreatLog;

use crate::types::{OwnerId, Packet, ThreatRecord};

/// Composes the three tiers behind the single `persist`/read API the
/// Pipeline and HTTP handlers use. `primary` is `None` when
/// `PRIMARY_DB_URL` is unset or the connection failed at startup.
pub struct Storage {
    primary: Option<Arc<dyn PrimaryStore>>,
    ring: MemoryRing,
    threat_log: ThreatLog,
}

/// Outcome of a read that may have silently fallen back to a lesser tier.
pub struct ReadResult<T> {
    pub data: T,
    /// Set when `PrimaryStore` was configured but the read fell back to
    /// `MemoryRing`+`ThreatLog` — surfaced as a soft warning to the caller.
    pub degraded: bool,
}

impl Storage {
    pub fn new(primary: Option<Arc<dyn PrimaryStore>>, ring: MemoryRing, threat_log: ThreatLog) -> Self {
        Self { primary, ring, threat_log }
    }

    pub fn has_primary(&self) -> bool {
        self.primary.is_some()
    }

    /// Writes `packet` to every tier. `MemoryRing` always succeeds
    /// in-process; `PrimaryStore` is attempted but never awaited by the
    /// caller's broadcast path — failures are logged and otherwise
    /// swallowed — storage is best-effort from the caller's perspective.
    pub fn persist(&self, packet: Packet) {
        self.ring.push(packet.clone());

        if packet.is_anomaly {
            self.threat_log.append(ThreatRecord::from(&packet));
        }

        if let Some(primary) = self.primary.clone() {
            tokio::spawn(async move {
                if let Err(e) = primary.insert_packet(&packet).await {
                    tracing::warn!(error = %e, packet_id = %packet.id, "primary store write failed");
                }
            });
        }
    }

    /// Read plan for per-owner history: PrimaryStore when
    /// available, else filter MemoryRing in memory.
    pub async fn history(&self, owner: &OwnerId, filter: HistoryFilter) -> ReadResult<Vec<Packet>> {
        if let Some(primary) = &self.primary {
            match primary.query_packets(owner, &filter).await {
                Ok(packets) => return ReadResult { data: packets, degraded: false },
                Err(e) => {
                    tracing::warn!(error = %e, "primary store read failed; falling back to memory ring");
                }
            }
        }

        ReadResult { data: self.ring.range(owner, &filter), degraded: self.primary.is_some() }
    }

    /// All-time packet count for `owner`.
    pub async fn count_packets(&self, owner: &OwnerId) -> ReadResult<u64> {
        if let Some(primary) = &self.primary {
            match primary.count_packets(owner).await {
                Ok(n) => return ReadResult { data: n, degraded: false },
                Err(e) => tracing::warn!(error = %e, "primary store count failed; falling back"),
            }
        }
        ReadResult { data: self.ring.count(owner), degraded: self.primary.is_some() }
    }

    /// THREAT count within the last `since_hours` for `owner`. Falls back to
    /// the union of `MemoryRing` and `ThreatLog`, not the ring alone — the
    /// ring is bounded by `MEM_RING_CAPACITY` and can evict a THREAT record
    /// that the log (bounded only by `THREAT_RETENTION_HOURS`) still has.
    pub async fn count_threats(&self, owner: &OwnerId, since: DateTime<Utc>) -> ReadResult<u64> {
        if let Some(primary) = &self.primary {
            match primary.count_threats_since(owner, since).await {
                Ok(n) => return ReadResult { data: n, degraded: false },
                Err(e) => tracing::warn!(error = %e, "primary store threat count failed; falling back"),
            }
        }
        let merged = self.merged_threats_since(owner, since).await;
        ReadResult { data: merged.len() as u64, degraded: self.primary.is_some() }
    }

    /// THREAT records in `[since, now)` for the Aggregator.
    pub async fn threats_since(&self, owner: &OwnerId, since: DateTime<Utc>) -> ReadResult<Vec<ThreatRecord>> {
        if let Some(primary) = &self.primary {
            match primary.threats_since(owner, since).await {
                Ok(records) => return ReadResult { data: records, degraded: false },
                Err(e) => tracing::warn!(error = %e, "primary store threat read failed; falling back"),
            }
        }
        let merged = self.merged_threats_since(owner, since).await;
        ReadResult { data: merged, degraded: self.primary.is_some() }
    }

    /// Unions `MemoryRing`'s live THREAT packets with `ThreatLog`'s durable
    /// records, keyed by `(owner_id, timestamp)` since every packet's
    /// timestamp is stamped once at classification time. Either source may
    /// hold records the other has already evicted (ring: capacity; log:
    /// never evicts within retention, but only hydrates the ring with
    /// however many fit at startup).
    async fn merged_threats_since(&self, owner: &OwnerId, since: DateTime<Utc>) -> Vec<ThreatRecord> {
        let ring_threats = self.ring.threats_since(owner, since);
        let log_threats = self.threat_log.records_since(owner, since).await;

        let mut seen = HashSet::with_capacity(ring_threats.len() + log_threats.len());
        let mut merged = Vec::with_capacity(ring_threats.len() + log_threats.len());

        for packet in &ring_threats {
            if seen.insert((packet.owner_id.clone(), packet.timestamp)) {
                merged.push(ThreatRecord::from(packet));
            }
        }
        for record in log_threats {
            if seen.insert((record.owner_id.clone(), record.timestamp)) {
                merged.push(record);
            }
        }
        merged
    }

    /// Earliest packet timestamp for `owner`, across whichever tier can
    /// answer — used for `from=account`.
    pub async fn earliest_timestamp(&self, owner: &OwnerId) -> Option<DateTime<Utc>> {
        if let Some(primary) = &self.primary {
            if let Ok(Some(ts)) = primary.earliest_timestamp(owner).await {
                return Some(ts);
            }
        }
        self.ring.earliest_timestamp(owner)
    }

    /// `POST /api/admin/reset-mongo`: deletes all stored packets across
    /// every tier the process can reach. The `ThreatLog` file is left
    /// alone deliberately — it is reconciled by its own retention pass on
    /// the next restart, not by this admin action, since it never serves
    /// live reads directly.
    pub async fn reset_all(&self) -> Result<(), PrimaryStoreError> {
        self.ring.clear_all();
        if let Some(primary) = &self.primary {
            primary.reset_all().await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) {
        self.threat_log.flush_and_close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::primary::tests::FakePrimaryStore;
    use crate::types::AttackVector;

    fn packet(owner: &OwnerId, is_anomaly: bool) -> Packet {
        Packet {
            id: format!("{:x}", rand::random::<u64>()),
            owner_id: owner.clone(),
            timestamp: Utc::now(),
            source_ip: "198.51.100.23".to_string(),
            destination_ip: "10.0.0.1".to_string(),
            source_country: None,
            source_lat: None,
            source_lon: None,
            method: "POST".to_string(),
            protocol: "TCP".to_string(),
            dst_port: 8080,
            bytes: 20_000,
            entropy: 0.9,
            ai_scored: true,
            anomaly_score: Some(0.0),
            anomaly_threshold: Some(0.08),
            anomaly_mean: Some(0.1),
            anomaly_warmed_up: Some(true),
            anomaly_baseline_n: Some(40),
            is_anomaly,
            attack_vector: if is_anomaly { Some(AttackVector::Volumetric) } else { None },
            session_started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn falls_back_to_ring_without_primary() {
        let storage = Storage::new(None, MemoryRing::new(100), ThreatLog::in_memory());
        let owner = OwnerId::anon("a");
        storage.persist(packet(&owner, false));

        let result = storage.count_packets(&owner).await;
        assert_eq!(result.data, 1);
        assert!(!result.degraded);
    }

    #[tokio::test]
    async fn primary_failure_falls_back_and_flags_degraded() {
        let fake = Arc::new(FakePrimaryStore::default());
        fake.fail.store(true, std::sync::atomic::Ordering::Relaxed);
        let storage = Storage::new(Some(fake), MemoryRing::new(100), ThreatLog::in_memory());
        let owner = OwnerId::anon("a");
        storage.persist(packet(&owner, false));
        // give the fire-and-forget primary write a chance to fail
        tokio::task::yield_now().await;

        let result = storage.count_packets(&owner).await;
        assert_eq!(result.data, 1); // ring still has it
        assert!(result.degraded);
    }

    #[tokio::test]
    async fn threat_packets_are_queryable_by_anomaly_filter() {
        let storage = Storage::new(None, MemoryRing::new(100), ThreatLog::in_memory());
        let owner = OwnerId::anon("a");
        storage.persist(packet(&owner, false));
        storage.persist(packet(&owner, true));

        let since = Utc::now() - chrono::Duration::hours(1);
        let threats = storage.threats_since(&owner, since).await;
        assert_eq!(threats.data.len(), 1);
        assert!(threats.data[0].is_anomaly);
    }

    #[tokio::test]
    async fn threat_count_survives_ring_eviction_via_threat_log() {
        // MEM_RING_CAPACITY smaller than the number of THREAT packets
        // persisted; the ring alone would undercount, but the ThreatLog
        // still has every record within retention.
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("threats.jsonl");
        let ring = MemoryRing::new(2);
        let threat_log = ThreatLog::open(&path, 24, &ring).await.unwrap();
        let storage = Storage::new(None, ring, threat_log);

        let owner = OwnerId::anon("a");
        for i in 0..5 {
            let mut p = packet(&owner, true);
            p.timestamp += chrono::Duration::milliseconds(i); // guarantee distinct dedup keys
            storage.persist(p);
        }

        let since = Utc::now() - chrono::Duration::hours(1);
        let count = storage.count_threats(&owner, since).await;
        assert_eq!(count.data, 5);

        let threats = storage.threats_since(&owner, since).await;
        assert_eq!(threats.data.len(), 5);
    }

    #[tokio::test]
    async fn reset_all_clears_ring() {
        let storage = Storage::new(None, MemoryRing::new(100), ThreatLog::in_memory());
        let owner = OwnerId::anon("a");
        storage.persist(packet(&owner, false));
        storage.reset_all().await.unwrap();

        assert_eq!(storage.count_packets(&owner).await.data, 0);
    }
}
