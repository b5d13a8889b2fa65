//! `Packet` — the atomic classified record, and the auxiliary types attached
//! to it by the Enrichment & Classification Pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::owner::OwnerId;

/// Coarse category assigned to THREAT packets. Classifier rules live in
/// `crate::pipeline::classify_attack_vector`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttackVector {
    Volumetric,
    Protocol,
    Application,
}

/// The atomic record produced by the pipeline. Immutable once classified.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Packet {
    pub id: String,
    pub owner_id: OwnerId,
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub destination_ip: String,
    pub source_country: Option<String>,
    pub source_lat: Option<f64>,
    pub source_lon: Option<f64>,
    pub method: String,
    pub protocol: String,
    pub dst_port: u16,
    pub bytes: u64,
    pub entropy: f64,
    pub ai_scored: bool,
    pub anomaly_score: Option<f64>,
    pub anomaly_threshold: Option<f64>,
    pub anomaly_mean: Option<f64>,
    pub anomaly_warmed_up: Option<bool>,
    pub anomaly_baseline_n: Option<usize>,
    pub is_anomaly: bool,
    pub attack_vector: Option<AttackVector>,
    pub session_started_at: DateTime<Utc>,
}

/// The subset of `Packet` persisted in the append-only `ThreatLog`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreatRecord {
    pub owner_id: OwnerId,
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub source_country: Option<String>,
    pub destination_ip: String,
    pub protocol: String,
    pub method: String,
    pub bytes: u64,
    pub anomaly_score: Option<f64>,
    pub is_anomaly: bool,
    pub attack_vector: Option<AttackVector>,
}

impl From<&Packet> for ThreatRecord {
    fn from(p: &Packet) -> Self {
        Self {
            owner_id: p.owner_id.clone(),
            timestamp: p.timestamp,
            source_ip: p.source_ip.clone(),
            source_country: p.source_country.clone(),
            destination_ip: p.destination_ip.clone(),
            protocol: p.protocol.clone(),
            method: p.method.clone(),
            bytes: p.bytes,
            anomaly_score: p.anomaly_score,
            is_anomaly: true,
            attack_vector: p.attack_vector,
        }
    }
}

/// A live socket subscriber.
#[derive(Debug, Clone)]
pub struct Subscriber {
    pub conn_id: String,
    pub owner_id: OwnerId,
    pub subscribed_at: DateTime<Utc>,
}
