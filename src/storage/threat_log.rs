//! `ThreatLog`. Append-only local file of THREAT events, one JSON
//! record per line, with periodic compaction and startup hydration into
//! `MemoryRing`.
//!
//! The writer side is a single task fed by an unbounded channel so
//! `append` never blocks the owning pipeline task. Flushes happen on a
//! fixed interval and on shutdown.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use super::ring::MemoryRing;
use crate::types::{OwnerId, ThreatRecord};

const FLUSH_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Error)]
pub enum ThreatLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

enum WriterMsg {
    Record(ThreatRecord),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Handle to the append-only threat log. Cheap to clone.
#[derive(Clone)]
pub struct ThreatLog {
    tx: mpsc::UnboundedSender<WriterMsg>,
    /// `None` for `in_memory()` — nothing on disk to serve reads from.
    path: Option<PathBuf>,
}

impl ThreatLog {
    /// Opens (creating if absent) the log at `path`, hydrates surviving
    /// records into `ring`, rewrites the file with just those survivors,
    /// then spawns the buffered writer task.
    pub async fn open(
        path: impl Into<PathBuf>,
        retention_hours: i64,
        ring: &MemoryRing,
    ) -> Result<Self, ThreatLogError> {
        let path = path.into();
        let survivors = hydrate(&path, retention_hours)?;

        // Oldest-first so the ring's newest-first invariant is preserved
        // once live traffic resumes pushing at the front.
        for record in survivors.iter().rev() {
            ring.hydrate_oldest_first(record_to_packet(record));
        }
        compact(&path, &survivors)?;

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(writer_loop(path.clone(), rx));

        Ok(Self { tx, path: Some(path) })
    }

    /// In-memory-only constructor, for callers that don't need a real file
    /// backing the log (tests, and the HTTP-level regression suite in
    /// `tests/`). `records_since` always returns empty since there is
    /// nothing on disk to scan.
    #[doc(hidden)]
    pub fn in_memory() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut rx = rx;
            while let Some(msg) = rx.recv().await {
                match msg {
                    WriterMsg::Flush(done) => {
                        let _ = done.send(());
                    }
                    WriterMsg::Shutdown(done) => {
                        let _ = done.send(());
                        break;
                    }
                    WriterMsg::Record(_) => {}
                }
            }
        });
        Self { tx, path: None }
    }

    /// Queues a THREAT record for the next flush. Never blocks.
    pub fn append(&self, record: ThreatRecord) {
        let _ = self.tx.send(WriterMsg::Record(record));
    }

    /// Flushes any buffered records and waits for the writer task to
    /// confirm, bounded by the caller's own shutdown-grace timeout.
    pub async fn flush_and_close(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    /// Scans the on-disk log for `owner`'s THREAT records at or after
    /// `since`, newest-first. Flushes any buffered-but-unwritten records
    /// first so a record appended moments ago is never missed. The serving
    /// read path for counts/aggregation when `PrimaryStore` is absent —
    /// `MemoryRing` alone is bounded by `MEM_RING_CAPACITY` and can evict a
    /// THREAT record that is still within `THREAT_RETENTION_HOURS`.
    pub async fn records_since(&self, owner: &OwnerId, since: DateTime<Utc>) -> Vec<ThreatRecord> {
        let Some(path) = &self.path else { return Vec::new() };

        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(WriterMsg::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }

        let Ok(raw) = std::fs::read_to_string(path) else { return Vec::new() };
        let mut records: Vec<ThreatRecord> = raw
            .lines()
            .filter_map(|line| serde_json::from_str::<ThreatRecord>(line).ok())
            .filter(|record| &record.owner_id == owner && record.timestamp >= since)
            .collect();
        records.reverse(); // on-disk order is oldest-first; match the ring's newest-first order
        records
    }
}

/// Reads the file forward, drops records older than `retention_hours`,
/// returns survivors newest-first (reverse of on-disk order, which is
/// oldest-first as an append-only file). Malformed lines are skipped.
fn hydrate(path: &Path, retention_hours: i64) -> Result<Vec<ThreatRecord>, ThreatLogError> {
    let Ok(raw) = std::fs::read_to_string(path) else { return Ok(Vec::new()) };

    let cutoff = Utc::now() - chrono::Duration::hours(retention_hours);
    let mut survivors: Vec<ThreatRecord> = raw
        .lines()
        .filter_map(|line| {
            if line.trim().is_empty() {
                return None;
            }
            match serde_json::from_str::<ThreatRecord>(line) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed threat log line");
                    None
                }
            }
        })
        .filter(|record| record.timestamp >= cutoff)
        .collect();

    survivors.reverse(); // newest-first
    Ok(survivors)
}

/// Rewrites the file with exactly the given records, oldest-first (their
/// natural append order), so a subsequent hydrate+compact pass is
/// idempotent modulo ordering of same-timestamp records.
fn compact(path: &Path, survivors_newest_first: &[ThreatRecord]) -> Result<(), ThreatLogError> {
    let mut out = String::new();
    for record in survivors_newest_first.iter().rev() {
        out.push_str(&serde_json::to_string(record).expect("ThreatRecord always serializes"));
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

async fn writer_loop(path: PathBuf, mut rx: mpsc::UnboundedReceiver<WriterMsg>) {
    let mut pending: Vec<String> = Vec::new();
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                match msg {
                    Some(WriterMsg::Record(record)) => {
                        match serde_json::to_string(&record) {
                            Ok(line) => pending.push(line),
                            Err(e) => tracing::warn!(error = %e, "failed to serialize threat record"),
                        }
                    }
                    Some(WriterMsg::Flush(done)) => {
                        flush(&path, &mut pending);
                        let _ = done.send(());
                    }
                    Some(WriterMsg::Shutdown(done)) => {
                        flush(&path, &mut pending);
                        let _ = done.send(());
                        break;
                    }
                    None => break,
                }
            }
            _ = interval.tick() => {
                flush(&path, &mut pending);
            }
        }
    }
}

fn flush(path: &Path, pending: &mut Vec<String>) {
    if pending.is_empty() {
        return;
    }
    let result = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut file| {
            for line in pending.iter() {
                writeln!(file, "{line}")?;
            }
            file.flush()
        });

    if let Err(e) = result {
        tracing::error!(error = %e, path = %path.display(), "failed to flush threat log");
        return; // keep pending for the next tick rather than dropping it
    }
    pending.clear();
}

/// Threat records only carry a subset of `Packet`'s fields; `owner_id` and timestamps
/// round-trip exactly, the remaining `Packet` fields are reconstructed
/// with their THREAT-implied values.
fn record_to_packet(record: &ThreatRecord) -> crate::types::Packet {
    crate::types::Packet {
        id: format!("threatlog:{}:{}", record.owner_id, record.timestamp.timestamp_nanos_opt().unwrap_or_default()),
        owner_id: record.owner_id.clone(),
        timestamp: record.timestamp,
        source_ip: record.source_ip.clone(),
        destination_ip: record.destination_ip.clone(),
        source_country: record.source_country.clone(),
        source_lat: None,
        source_lon: None,
        method: record.method.clone(),
        protocol: record.protocol.clone(),
        dst_port: 0,
        bytes: record.bytes,
        entropy: 0.0,
        ai_scored: record.anomaly_score.is_some(),
        anomaly_score: record.anomaly_score,
        anomaly_threshold: None,
        anomaly_mean: None,
        anomaly_warmed_up: None,
        anomaly_baseline_n: None,
        is_anomaly: record.is_anomaly,
        attack_vector: record.attack_vector,
        session_started_at: record.timestamp,
    }
}
