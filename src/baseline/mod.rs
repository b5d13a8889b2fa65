//! Baseline Engine. A per-owner rolling window of recent SAFE AI
//! scores, driving the adaptive THREAT/SAFE decision boundary.
//!
//! Adapted from the accumulator/threshold-manager split used elsewhere in
//! this codebase for drilling baselines, but keyed by `OwnerId` rather than
//! equipment id, bounded by a FIFO window rather than an unbounded Welford
//! accumulator (only the last `W` SAFE scores count), and oriented the
//! other way: THREAT is *below* the mean, not above it.

use std::collections::{HashMap, VecDeque};
use std::sync::RwLock;

use crate::types::OwnerId;

pub const DEFAULT_FALLBACK_THRESHOLD: f64 = 0.0;

/// A point-in-time read of one owner's baseline state.
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineSnapshot {
    pub mean: f64,
    pub std: f64,
    pub n: usize,
    pub warmed_up: bool,
    pub threshold: f64,
}

/// Bounded FIFO window of SAFE scores with O(1) mean/std via running
/// sum and sum-of-squares, evicting the oldest sample when full.
struct BaselineWindow {
    scores: VecDeque<f64>,
    capacity: usize,
    sum: f64,
    sum_sq: f64,
    /// Most recent `calibrated_threshold` reported by the AI client; used
    /// as the pre-warmup threshold.
    last_calibrated_threshold: Option<f64>,
}

impl BaselineWindow {
    fn new(capacity: usize) -> Self {
        Self {
            scores: VecDeque::with_capacity(capacity),
            capacity,
            sum: 0.0,
            sum_sq: 0.0,
            last_calibrated_threshold: None,
        }
    }

    fn admit_safe(&mut self, score: f64) {
        if self.scores.len() == self.capacity {
            if let Some(evicted) = self.scores.pop_front() {
                self.sum -= evicted;
                self.sum_sq -= evicted * evicted;
            }
        }
        self.scores.push_back(score);
        self.sum += score;
        self.sum_sq += score * score;
    }

    fn mean(&self) -> f64 {
        if self.scores.is_empty() {
            0.0
        } else {
            self.sum / self.scores.len() as f64
        }
    }

    fn std(&self) -> f64 {
        let n = self.scores.len();
        if n == 0 {
            return 0.0;
        }
        let mean = self.mean();
        let variance = (self.sum_sq / n as f64 - mean * mean).max(0.0);
        variance.sqrt()
    }

    fn snapshot(&self, warmup_min: usize, k: f64) -> BaselineSnapshot {
        let n = self.scores.len();
        let warmed_up = n >= warmup_min;
        let mean = self.mean();
        let std = self.std();

        let threshold = if warmed_up {
            mean - k * std
        } else {
            self.last_calibrated_threshold
                .unwrap_or(DEFAULT_FALLBACK_THRESHOLD)
        };

        BaselineSnapshot { mean, std, n, warmed_up, threshold }
    }
}

/// Owns every owner's `BaselineWindow`. Each window is mutated only
/// by its owner's pipeline task, but the manager itself is `Send + Sync` so
/// it can sit behind a shared `Arc` without per-owner actors.
pub struct BaselineManager {
    windows: RwLock<HashMap<OwnerId, BaselineWindow>>,
    window_capacity: usize,
    warmup_min: usize,
    k: f64,
}

impl BaselineManager {
    pub fn new(window_capacity: usize, warmup_min: usize, k: f64) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            window_capacity,
            warmup_min,
            k,
        }
    }

    /// `admit_safe(owner, score)` — push into window, evict oldest if full.
    pub fn admit_safe(&self, owner: &OwnerId, score: f64) {
        let mut windows = self.windows.write().expect("baseline lock poisoned");
        windows
            .entry(owner.clone())
            .or_insert_with(|| BaselineWindow::new(self.window_capacity))
            .admit_safe(score);
    }

    /// Records the AI client's most recent calibrated threshold for an
    /// owner, used as the pre-warmup fallback.
    pub fn record_calibrated_threshold(&self, owner: &OwnerId, calibrated_threshold: f64) {
        let mut windows = self.windows.write().expect("baseline lock poisoned");
        windows
            .entry(owner.clone())
            .or_insert_with(|| BaselineWindow::new(self.window_capacity))
            .last_calibrated_threshold = Some(calibrated_threshold);
    }

    /// `snapshot(owner)` — a fresh owner with no samples yet is not warmed
    /// up and falls back to `DEFAULT_FALLBACK_THRESHOLD` (no calibrated
    /// threshold has been recorded), making its first packet SAFE by
    /// construction once paired with `classify`'s equality-is-SAFE rule
    /// only when `score >= 0`; real deployments always have a calibrated
    /// threshold from the AI client by the first scored packet.
    pub fn snapshot(&self, owner: &OwnerId) -> BaselineSnapshot {
        let windows = self.windows.read().expect("baseline lock poisoned");
        match windows.get(owner) {
            Some(w) => w.snapshot(self.warmup_min, self.k),
            None => BaselineSnapshot {
                mean: 0.0,
                std: 0.0,
                n: 0,
                warmed_up: false,
                threshold: DEFAULT_FALLBACK_THRESHOLD,
            },
        }
    }

    /// `classify(owner, score) → is_anomaly`. Equality is SAFE. Callers
    /// must have already checked `ai_scored`; an unscored packet is never
    /// passed here (`is_anomaly := false` when `scored=false`).
    pub fn classify(&self, snapshot: &BaselineSnapshot, score: f64) -> bool {
        score < snapshot.threshold
    }

    /// Drops an owner's baseline entirely. Called by the reaper after
    /// `OWNER_IDLE_TIMEOUT` with no subscribers.
    pub fn evict(&self, owner: &OwnerId) {
        self.windows.write().expect("baseline lock poisoned").remove(owner);
    }
}
