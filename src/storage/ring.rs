//! `MemoryRing`. Always-on, per-owner newest-first bounded buffer.
//!
//! Used directly for reads whenever `PrimaryStore` is absent or failing,
//! and as the hydration target for `ThreatLog` on startup.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use chrono::{DateTime, Utc};

use crate::types::{OwnerId, Packet};

/// Per-owner ring buffer, newest packet at the front.
struct Ring {
    packets: VecDeque<Packet>,
    capacity: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self { packets: VecDeque::with_capacity(capacity), capacity }
    }

    fn push_front(&mut self, packet: Packet) {
        if self.packets.len() >= self.capacity {
            self.packets.pop_back();
        }
        self.packets.push_front(packet);
    }

    /// Pushes as the oldest entry, for hydration ordering. Callers
    /// hydrate oldest-first so the ring ends up newest-first overall.
    fn push_back_bounded(&mut self, packet: Packet) {
        if self.packets.len() >= self.capacity {
            return;
        }
        self.packets.push_back(packet);
    }
}

/// Query filters shared by `MemoryRing::range` and `PrimaryStore::query_packets`.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub limit: usize,
    pub since: Option<DateTime<Utc>>,
    pub anomaly: Option<bool>,
    pub source_ip: Option<String>,
}

/// Always-on per-owner bounded buffer, capacity `MEM_RING_CAPACITY`.
pub struct MemoryRing {
    rings: RwLock<HashMap<OwnerId, Ring>>,
    capacity: usize,
}

impl MemoryRing {
    pub fn new(capacity: usize) -> Self {
        Self { rings: RwLock::new(HashMap::new()), capacity }
    }

    /// O(1) push; evicts the oldest entry when at capacity.
    pub fn push(&self, packet: Packet) {
        let mut rings = self.rings.write().expect("memory ring lock poisoned");
        rings
            .entry(packet.owner_id.clone())
            .or_insert_with(|| Ring::new(self.capacity))
            .push_front(packet);
    }

    /// Hydrates a packet during `ThreatLog` startup replay. Survivors are
    /// fed oldest-first so the ring's newest-first invariant holds once
    /// live traffic resumes pushing at the front.
    pub fn hydrate_oldest_first(&self, packet: Packet) {
        let mut rings = self.rings.write().expect("memory ring lock poisoned");
        rings
            .entry(packet.owner_id.clone())
            .or_insert_with(|| Ring::new(self.capacity))
            .push_back_bounded(packet);
    }

    /// O(k) filtered range scan, newest-first, already-applied `limit`.
    pub fn range(&self, owner: &OwnerId, filter: &HistoryFilter) -> Vec<Packet> {
        let rings = self.rings.read().expect("memory ring lock poisoned");
        let Some(ring) = rings.get(owner) else { return Vec::new() };

        ring.packets
            .iter()
            .filter(|p| filter.since.map_or(true, |since| p.timestamp >= since))
            .filter(|p| filter.anomaly.map_or(true, |a| p.is_anomaly == a))
            .filter(|p| filter.source_ip.as_deref().map_or(true, |ip| p.source_ip == ip))
            .take(filter.limit)
            .cloned()
            .collect()
    }

    pub fn count(&self, owner: &OwnerId) -> u64 {
        self.rings
            .read()
            .expect("memory ring lock poisoned")
            .get(owner)
            .map(|r| r.packets.len() as u64)
            .unwrap_or(0)
    }

    pub fn count_threats_since(&self, owner: &OwnerId, since: DateTime<Utc>) -> u64 {
        self.rings
            .read()
            .expect("memory ring lock poisoned")
            .get(owner)
            .map(|r| r.packets.iter().filter(|p| p.is_anomaly && p.timestamp >= since).count() as u64)
            .unwrap_or(0)
    }

    pub fn threats_since(&self, owner: &OwnerId, since: DateTime<Utc>) -> Vec<Packet> {
        self.rings
            .read()
            .expect("memory ring lock poisoned")
            .get(owner)
            .map(|r| r.packets.iter().filter(|p| p.is_anomaly && p.timestamp >= since).cloned().collect())
            .unwrap_or_default()
    }

    /// Earliest packet timestamp retained for this owner, if any. The ring
    /// only ever holds a bounded tail of history, so this is a lower bound
    /// on "account creation", not a durable one — `PrimaryStore`, when
    /// present, is authoritative for `from=account`.
    pub fn earliest_timestamp(&self, owner: &OwnerId) -> Option<DateTime<Utc>> {
        self.rings
            .read()
            .expect("memory ring lock poisoned")
            .get(owner)
            .and_then(|r| r.packets.back())
            .map(|p| p.timestamp)
    }

    /// Wipes every owner's ring. Used by `POST /api/admin/reset-mongo`.
    pub fn clear_all(&self) {
        self.rings.write().expect("memory ring lock poisoned").clear();
    }
}
