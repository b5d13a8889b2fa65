//! `Session(owner)` — the per-owner runtime context exposed so clients can
//! detect server restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub started_at: DateTime<Utc>,
    pub attack_mode: bool,
}

impl Session {
    /// Created lazily on first subscriber; `started_at` is the process'
    /// own start time, not the owner's first-contact time.
    pub fn new(process_start_time: DateTime<Utc>) -> Self {
        Self {
            started_at: process_start_time,
            attack_mode: false,
        }
    }
}
