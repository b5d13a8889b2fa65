//! Enrichment & Classification Pipeline. The single source of truth
//! that turns a raw `Simulator` event into a classified, persisted,
//! broadcast `Packet`, and the per-owner lifecycle rules around it:
//! one simulator + one pipeline task per owner, started on first
//! subscriber, stopped `OWNER_IDLE_TIMEOUT` after the last leaves.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::ai_client::{AiClient, Features};
use crate::baseline::BaselineManager;
use crate::broadcaster::Broadcaster;
use crate::geolocator::Geolocator;
use crate::simulator::{self, RawEvent, SimulatorHandle};
use crate::storage::Storage;
use crate::types::{AttackVector, OwnerId, Packet, Session};

const VOLUMETRIC_BYTES_THRESHOLD: u64 = 10_000;
const NORMAL_PROTOCOL_PORT_PAIRS: &[(&str, u16)] = &[("TCP", 80), ("TCP", 443), ("UDP", 53), ("TCP", 22)];
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Everything one owner's pipeline task needs, shared read-only (or
/// internally synchronized) across every owner.
pub struct Services {
    pub geolocator: Arc<Geolocator>,
    pub ai_client: Arc<AiClient>,
    pub baseline: Arc<BaselineManager>,
    pub broadcaster: Arc<Broadcaster>,
    pub storage: Arc<Storage>,
    pub process_start_time: DateTime<Utc>,
    pub owner_idle_timeout: Duration,
}

struct OwnerHandle {
    simulator: SimulatorHandle,
    pipeline_cancel: CancellationToken,
    /// Non-`None` while an idle-teardown timer is pending; cancelling it
    /// is how a reconnect within `OWNER_IDLE_TIMEOUT` avoids churn.
    idle_teardown: Option<CancellationToken>,
}

/// Owns every active owner's `Simulator` + pipeline task. The Broadcaster
/// tells it when an owner's subscriber count reaches zero or goes above
/// zero; this registry starts/stops the owner-local machinery in response.
pub struct PipelineManager {
    services: Arc<Services>,
    owners: RwLock<HashMap<OwnerId, OwnerHandle>>,
    sessions: RwLock<HashMap<OwnerId, Session>>,
}

impl PipelineManager {
    pub fn new(services: Arc<Services>) -> Self {
        Self { services, owners: RwLock::new(HashMap::new()), sessions: RwLock::new(HashMap::new()) }
    }

    /// Called when a subscriber connects. Ensures `owner`'s simulator and
    /// pipeline task are running, creating its `Session` lazily, and
    /// cancels any pending idle-teardown timer.
    pub fn ensure_running(&self, owner: &OwnerId) {
        {
            let mut sessions = self.sessions.write().expect("session lock poisoned");
            sessions.entry(owner.clone()).or_insert_with(|| Session::new(self.services.process_start_time));
        }

        let mut owners = self.owners.write().expect("pipeline owners lock poisoned");
        if let Some(handle) = owners.get_mut(owner) {
            if let Some(timer) = handle.idle_teardown.take() {
                timer.cancel();
            }
            return;
        }

        let (tx, rx) = mpsc::channel::<RawEvent>(EVENT_CHANNEL_CAPACITY);
        let simulator = simulator::spawn(owner.clone(), tx);
        let pipeline_cancel = CancellationToken::new();

        tokio::spawn(owner_pipeline_loop(self.services.clone(), rx, pipeline_cancel.clone()));

        owners.insert(owner.clone(), OwnerHandle { simulator, pipeline_cancel, idle_teardown: None });
    }

    /// Called when an owner's subscriber count reaches zero. Schedules
    /// teardown after `OWNER_IDLE_TIMEOUT`, cancellable by a reconnect.
    pub fn schedule_idle_teardown(self: &Arc<Self>, owner: &OwnerId) {
        let timer = CancellationToken::new();
        {
            let mut owners = self.owners.write().expect("pipeline owners lock poisoned");
            let Some(handle) = owners.get_mut(owner) else { return };
            handle.idle_teardown = Some(timer.clone());
        }

        let manager = self.clone();
        let owner = owner.clone();
        let idle_timeout = self.services.owner_idle_timeout;
        tokio::spawn(async move {
            tokio::select! {
                _ = timer.cancelled() => {}
                _ = tokio::time::sleep(idle_timeout) => {
                    manager.teardown(&owner);
                }
            }
        });
    }

    fn teardown(&self, owner: &OwnerId) {
        let mut owners = self.owners.write().expect("pipeline owners lock poisoned");
        if let Some(handle) = owners.remove(owner) {
            handle.simulator.stop();
            handle.pipeline_cancel.cancel();
        }
        drop(owners);

        self.services.baseline.evict(owner);
        self.sessions.write().expect("session lock poisoned").remove(owner);
        tracing::info!(owner_id = %owner, "owner pipeline torn down after idle timeout");
    }

    /// `toggle_attack(owner, bool)` — authenticated action scoped to the
    /// caller's own owner, forwarded by the socket layer. A no-op if the
    /// owner has no running simulator (shouldn't happen: the caller must
    /// already be a subscriber to send this message).
    pub fn toggle_attack(&self, owner: &OwnerId, attack: bool) {
        let owners = self.owners.read().expect("pipeline owners lock poisoned");
        if let Some(handle) = owners.get(owner) {
            handle.simulator.set_mode(attack);
        }
        drop(owners);
        self.sessions.write().expect("session lock poisoned").entry(owner.clone()).and_modify(|s| s.attack_mode = attack);
    }

    pub fn session(&self, owner: &OwnerId) -> Option<Session> {
        self.sessions.read().expect("session lock poisoned").get(owner).cloned()
    }

    pub fn process_start_time(&self) -> DateTime<Utc> {
        self.services.process_start_time
    }
}

/// The single-writer-per-owner task: reads `RawEvent`s in arrival order
/// and runs every classification step sequentially for each.
async fn owner_pipeline_loop(services: Arc<Services>, mut rx: mpsc::Receiver<RawEvent>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let packet = classify_event(&services, event).await;
                        services.storage.persist(packet.clone());
                        services.broadcaster.publish(packet);
                    }
                    None => break,
                }
            }
        }
    }
}

/// Runs every classification step for a single raw event and returns the
/// classified `Packet`, ready for storage/broadcast. Split out from the
/// owning loop so it is independently testable without a running task.
pub async fn classify_event(services: &Services, event: RawEvent) -> Packet {
    let timestamp = Utc::now();
    let geo = services.geolocator.lookup(&event.source_ip);

    let features = Features {
        source_ip: event.source_ip.clone(),
        destination_ip: event.destination_ip.clone(),
        method: event.method.clone(),
        protocol: event.protocol.clone(),
        dst_port: event.dst_port,
        bytes: event.bytes,
        entropy: event.entropy,
    };
    let score_result = services.ai_client.score(&features).await;

    if let Some(calibrated) = score_result.calibrated_threshold {
        services.baseline.record_calibrated_threshold(&event.owner_id, calibrated);
    }

    let snapshot = services.baseline.snapshot(&event.owner_id);

    let is_anomaly = match score_result.score {
        Some(score) if score_result.scored => services.baseline.classify(&snapshot, score),
        _ => false, // AI did not score this packet: UNSCORED, never THREAT
    };

    if !is_anomaly && score_result.scored {
        if let Some(score) = score_result.score {
            services.baseline.admit_safe(&event.owner_id, score);
        }
    }

    let attack_vector = if is_anomaly {
        Some(classify_attack_vector(event.bytes, &event.protocol, event.dst_port))
    } else {
        None
    };

    Packet {
        id: uuid::Uuid::new_v4().to_string(),
        owner_id: event.owner_id,
        timestamp,
        source_ip: event.source_ip,
        destination_ip: event.destination_ip,
        source_country: geo.country,
        source_lat: geo.lat,
        source_lon: geo.lon,
        method: event.method,
        protocol: event.protocol,
        dst_port: event.dst_port,
        bytes: event.bytes,
        entropy: event.entropy,
        ai_scored: score_result.scored,
        anomaly_score: score_result.score,
        anomaly_threshold: Some(snapshot.threshold),
        anomaly_mean: Some(snapshot.mean),
        anomaly_warmed_up: Some(snapshot.warmed_up),
        anomaly_baseline_n: Some(snapshot.n),
        is_anomaly,
        attack_vector,
        session_started_at: services.process_start_time,
    }
}

/// Attack-vector classifier: a total order, `Volumetric` checked first,
/// then `Protocol`, else `Application`.
pub fn classify_attack_vector(bytes: u64, protocol: &str, dst_port: u16) -> AttackVector {
    if bytes > VOLUMETRIC_BYTES_THRESHOLD {
        return AttackVector::Volumetric;
    }
    let is_normal_pair = NORMAL_PROTOCOL_PORT_PAIRS.iter().any(|(p, port)| *p == protocol && *port == dst_port);
    if !is_normal_pair {
        return AttackVector::Protocol;
    }
    AttackVector::Application
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryRing, ThreatLog};
    use std::time::Duration as StdDuration;

    fn test_services(ai_url: &str) -> Services {
        Services {
            geolocator: Arc::new(Geolocator::empty()),
            ai_client: Arc::new(AiClient::new(ai_url.to_string(), StdDuration::from_millis(200))),
            baseline: Arc::new(BaselineManager::new(200, 30, 3.0)),
            broadcaster: Arc::new(Broadcaster::new(256)),
            storage: Arc::new(Storage::new(None, MemoryRing::new(500), ThreatLog::in_memory())),
            process_start_time: Utc::now(),
            owner_idle_timeout: StdDuration::from_millis(50),
        }
    }

    fn raw_event(owner: &OwnerId) -> RawEvent {
        RawEvent {
            owner_id: owner.clone(),
            source_ip: "1.2.3.4".to_string(),
            destination_ip: "10.0.0.1".to_string(),
            method: "GET".to_string(),
            protocol: "TCP".to_string(),
            dst_port: 443,
            bytes: 512,
            entropy: 0.4,
        }
    }

    #[test]
    fn attack_vector_volumetric_wins_first() {
        // Large bytes on a normal-looking pair is still Volumetric.
        assert_eq!(classify_attack_vector(20_000, "TCP", 443), AttackVector::Volumetric);
    }

    #[test]
    fn attack_vector_protocol_for_unlisted_pair() {
        assert_eq!(classify_attack_vector(500, "TCP", 8080), AttackVector::Protocol);
    }

    #[test]
    fn attack_vector_application_for_normal_pair_small_bytes() {
        assert_eq!(classify_attack_vector(500, "TCP", 443), AttackVector::Application);
    }

    #[tokio::test]
    async fn unreachable_ai_yields_unscored_safe_packet() {
        let services = test_services("http://127.0.0.1:1");
        let owner = OwnerId::anon("a");
        let packet = classify_event(&services, raw_event(&owner)).await;

        assert!(!packet.ai_scored);
        assert!(!packet.is_anomaly);
        assert!(packet.anomaly_score.is_none());
    }

    #[tokio::test]
    async fn geolocation_miss_still_proceeds() {
        let services = test_services("http://127.0.0.1:1");
        let owner = OwnerId::anon("a");
        let packet = classify_event(&services, raw_event(&owner)).await;
        assert!(packet.source_country.is_none());
    }

    #[tokio::test]
    async fn first_ever_packet_with_no_calibrated_threshold_is_safe() {
        let services = test_services("http://127.0.0.1:1");
        let owner = OwnerId::anon("fresh");
        let packet = classify_event(&services, raw_event(&owner)).await;
        assert!(!packet.is_anomaly);
    }
}
