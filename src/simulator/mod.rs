//! Simulator. One task per owner, synthesising `Packet` events at a
//! steady rate with two modes: `normal` (~1/s ±jitter) and `attack`
//! (≥5× rate, biased feature distribution).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::types::OwnerId;

/// A raw, unenriched event handed to the Pipeline. Everything downstream
/// of geolocation/AI-scoring is attached later.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub owner_id: OwnerId,
    pub source_ip: String,
    pub destination_ip: String,
    pub method: String,
    pub protocol: String,
    pub dst_port: u16,
    pub bytes: u64,
    pub entropy: f64,
}

const NORMAL_INTERVAL: Duration = Duration::from_millis(1000);
const ATTACK_SPEEDUP: u32 = 6;
const NORMAL_PROTOCOLS: &[(&str, u16)] = &[("TCP", 80), ("TCP", 443), ("UDP", 53), ("TCP", 22)];

/// Handle to a running per-owner simulator task.
pub struct SimulatorHandle {
    attack_mode: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl SimulatorHandle {
    /// `set_mode(attack)` — idempotent, takes effect on the simulator's
    /// next tick (well within the 500 ms contract since the tick interval
    /// itself is at most 1 s and is re-read every iteration).
    pub fn set_mode(&self, attack: bool) {
        self.attack_mode.store(attack, Ordering::Relaxed);
    }

    pub fn is_attack_mode(&self) -> bool {
        self.attack_mode.load(Ordering::Relaxed)
    }

    /// Stops the simulator task. Called by the Pipeline after
    /// `OWNER_IDLE_TIMEOUT` with no subscribers.
    pub fn stop(&self) {
        self.cancel.cancel();
    }
}

/// Spawns one simulator task for `owner`, emitting `RawEvent`s onto `tx`
/// until `stop()` is called or `tx` is dropped.
pub fn spawn(owner: OwnerId, tx: mpsc::Sender<RawEvent>) -> SimulatorHandle {
    let attack_mode = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();

    let handle = SimulatorHandle { attack_mode: attack_mode.clone(), cancel: cancel.clone() };

    tokio::spawn(async move {
        loop {
            let attack = attack_mode.load(Ordering::Relaxed);
            let event = if attack { attack_event(&owner) } else { normal_event(&owner) };

            tokio::select! {
                _ = cancel.cancelled() => break,
                send_result = tx.send(event) => {
                    if send_result.is_err() {
                        break;
                    }
                }
            }

            let base = if attack { NORMAL_INTERVAL / ATTACK_SPEEDUP } else { NORMAL_INTERVAL };
            let jitter_ms = rand::thread_rng().gen_range(0..200);
            let sleep = base + Duration::from_millis(jitter_ms);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    });

    handle
}

fn normal_event(owner: &OwnerId) -> RawEvent {
    let mut rng = rand::thread_rng();
    let (protocol, dst_port) = NORMAL_PROTOCOLS[rng.gen_range(0..NORMAL_PROTOCOLS.len())];

    RawEvent {
        owner_id: owner.clone(),
        source_ip: random_public_ip(&mut rng),
        destination_ip: "10.0.0.1".to_string(),
        method: "GET".to_string(),
        protocol: protocol.to_string(),
        dst_port,
        bytes: rng.gen_range(64..=1500),
        entropy: rng.gen_range(0.2..0.6),
    }
}

/// Biased toward larger bytes and a concentrated destination/port, so the
/// resulting AI scores land below normal baselines.
fn attack_event(owner: &OwnerId) -> RawEvent {
    let mut rng = rand::thread_rng();

    RawEvent {
        owner_id: owner.clone(),
        source_ip: "198.51.100.23".to_string(), // fixed simulated attacker IP
        destination_ip: "10.0.0.1".to_string(),
        method: "POST".to_string(),
        protocol: "TCP".to_string(),
        dst_port: 8080,
        bytes: rng.gen_range(8_000..60_000),
        entropy: rng.gen_range(0.7..1.0),
    }
}

fn random_public_ip(rng: &mut impl Rng) -> String {
    format!(
        "{}.{}.{}.{}",
        rng.gen_range(1..224),
        rng.gen_range(0..255),
        rng.gen_range(0..255),
        rng.gen_range(1..255)
    )
}
