//! AI Client — converts a packet's feature vector into a scalar anomaly
//! score via the external scoring endpoint.
//!
//! Failure semantics: network errors, 5xx, timeouts, and malformed
//! bodies all collapse to `scored: false`. The pipeline never retries
//! inline — the next packet is the next attempt.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// The fixed feature vector sent to the scoring endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct Features {
    pub source_ip: String,
    pub destination_ip: String,
    pub method: String,
    pub protocol: String,
    pub dst_port: u16,
    pub bytes: u64,
    pub entropy: f64,
}

#[derive(Debug, Deserialize)]
struct ScoreResponseBody {
    score: Option<f64>,
    calibrated_threshold: Option<f64>,
}

/// Result of a single scoring call.
#[derive(Debug, Clone, Default)]
pub struct ScoreResult {
    pub scored: bool,
    pub score: Option<f64>,
    pub calibrated_threshold: Option<f64>,
}

pub struct AiClient {
    http: reqwest::Client,
    url: String,
    timeout: Duration,
    /// Flips true the first time a scoring call ever succeeds; never
    /// resets. Backs `/api/status.ai_ready`.
    ever_scored: AtomicBool,
}

impl AiClient {
    pub fn new(url: String, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            url,
            timeout,
            ever_scored: AtomicBool::new(false),
        }
    }

    /// Score a feature vector. Never returns an `Err` into the pipeline —
    /// every failure mode degrades to `ScoreResult::default()`.
    pub async fn score(&self, features: &Features) -> ScoreResult {
        let call = self.http.post(&self.url).json(features).send();

        let result = match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(resp)) if resp.status().is_success() => resp
                .json::<ScoreResponseBody>()
                .await
                .ok()
                .and_then(|body| {
                    body.score.map(|score| ScoreResult {
                        scored: true,
                        score: Some(score),
                        calibrated_threshold: body.calibrated_threshold,
                    })
                }),
            Ok(Ok(resp)) => {
                tracing::warn!(status = %resp.status(), "AI scoring endpoint returned non-success");
                None
            }
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "AI scoring request failed");
                None
            }
            Err(_) => {
                tracing::warn!(timeout_ms = self.timeout.as_millis(), "AI scoring request timed out");
                None
            }
        };

        match result {
            Some(r) => {
                self.ever_scored.store(true, Ordering::Relaxed);
                r
            }
            None => ScoreResult::default(),
        }
    }

    /// Whether the AI has ever produced a successful score since boot.
    pub fn ready(&self) -> bool {
        self.ever_scored.load(Ordering::Relaxed)
    }

    /// Forces a round-trip scoring attempt for `/health?load=1`. Returns
    /// whether it succeeded, without mutating `ready()` semantics beyond
    /// the normal scoring path.
    pub async fn probe(&self) -> bool {
        let features = Features {
            source_ip: "0.0.0.0".to_string(),
            destination_ip: "0.0.0.0".to_string(),
            method: "GET".to_string(),
            protocol: "TCP".to_string(),
            dst_port: 0,
            bytes: 0,
            entropy: 0.0,
        };
        self.score(&features).await.scored
    }
}
