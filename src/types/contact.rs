//! `ContactSubmission` — the admin inbox entity. Only the server assigns
//! `id`/`received_at`; only admins can list submissions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactSubmission {
    pub id: String,
    pub name: String,
    pub email: String,
    pub org: Option<String>,
    pub message: String,
    pub received_at: DateTime<Utc>,
}

/// Inbound shape for `POST /api/contact` — no `id`/`received_at` yet.
#[derive(Debug, Deserialize)]
pub struct ContactRequest {
    pub name: String,
    pub email: String,
    pub org: Option<String>,
    pub message: String,
}
