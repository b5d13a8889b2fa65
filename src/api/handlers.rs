//! HTTP handlers for the `/api/*` surface.

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use crate::aggregator::{self, Bucket};
use crate::errors::ApiError;
use crate::storage::HistoryFilter;
use crate::types::{ContactRequest, ContactSubmission};

use super::envelope::ok;
use super::AppState;

const MAX_PACKETS_LIMIT: i64 = 1000;

// ---------------------------------------------------------------------
// GET /api/session
// ---------------------------------------------------------------------

pub async fn session(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let resolved = state.identity.resolve(&headers).await;
    let mut response = ok(json!({ "kind": resolved.kind }));

    if resolved.kind == "anon" && !has_anon_cookie(&headers, state.identity.cookie_name()) {
        let raw_id = resolved.owner_id.as_str().trim_start_matches("anon:");
        let cookie = format!(
            "{}={}; Max-Age=315360000; Path=/; SameSite=Lax",
            state.identity.cookie_name(),
            raw_id,
        );
        if let Ok(value) = cookie.parse() {
            response.headers_mut().insert(axum::http::header::SET_COOKIE, value);
        }
    }

    response
}

fn has_anon_cookie(headers: &HeaderMap, cookie_name: &str) -> bool {
    headers
        .get(axum::http::header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(|raw| raw.split(';').any(|pair| pair.trim().starts_with(&format!("{cookie_name}="))))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------
// GET /api/status
// ---------------------------------------------------------------------

pub async fn status(State(state): State<AppState>) -> Response {
    ok(json!({
        "ai_ready": state.ai_client.ready(),
        "session": { "started_at": state.pipeline.process_start_time() },
    }))
}

// ---------------------------------------------------------------------
// GET /api/packets
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct PacketsQuery {
    pub limit: Option<i64>,
    pub since: Option<DateTime<Utc>>,
    pub anomaly: Option<bool>,
    pub ip: Option<String>,
}

pub async fn list_packets(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<PacketsQuery>,
) -> Result<Response, ApiError> {
    let owner = state.identity.resolve(&headers).await.owner_id;

    let limit = match query.limit {
        Some(l) if l < 0 => return Err(ApiError::BadRequest("limit must be non-negative".to_string())),
        Some(l) => l.min(MAX_PACKETS_LIMIT) as usize,
        None => MAX_PACKETS_LIMIT as usize,
    };

    let filter = HistoryFilter { limit, since: query.since, anomaly: query.anomaly, source_ip: query.ip };
    let result = state.storage.history(&owner, filter).await;

    Ok(ok(json!({ "packets": result.data, "degraded": result.degraded })))
}

// ---------------------------------------------------------------------
// GET /api/packets/count
// ---------------------------------------------------------------------

pub async fn packets_count(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let owner = state.identity.resolve(&headers).await.owner_id;
    let result = state.storage.count_packets(&owner).await;
    ok(json!({ "totalPackets": result.data }))
}

// ---------------------------------------------------------------------
// GET /api/threats/count
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ThreatsCountQuery {
    #[serde(rename = "sinceHours")]
    pub since_hours: Option<i64>,
}

pub async fn threats_count(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ThreatsCountQuery>,
) -> Result<Response, ApiError> {
    let owner = state.identity.resolve(&headers).await.owner_id;
    let since_hours = query.since_hours.unwrap_or(aggregator::DEFAULT_SINCE_HOURS);
    if since_hours < 0 {
        return Err(ApiError::BadRequest("sinceHours must be non-negative".to_string()));
    }

    let since = Utc::now() - chrono::Duration::hours(since_hours);
    let result = state.storage.count_threats(&owner, since).await;
    Ok(ok(json!({ "totalThreats": result.data })))
}

// ---------------------------------------------------------------------
// GET /api/threat-intel
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ThreatIntelQuery {
    #[serde(rename = "sinceHours")]
    pub since_hours: Option<i64>,
    pub limit: Option<usize>,
}

pub async fn threat_intel(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ThreatIntelQuery>,
) -> Result<Response, ApiError> {
    let owner = state.identity.resolve(&headers).await.owner_id;
    let since_hours = query.since_hours.unwrap_or(aggregator::DEFAULT_SINCE_HOURS);
    if since_hours < 0 {
        return Err(ApiError::BadRequest("sinceHours must be non-negative".to_string()));
    }
    let limit = query.limit.unwrap_or(aggregator::DEFAULT_TOP_N);

    let since = Utc::now() - chrono::Duration::hours(since_hours);
    let result = state.storage.threats_since(&owner, since).await;
    let report = aggregator::threat_intel(&result.data, limit);

    Ok(ok(json!({ "threatIntel": report, "degraded": result.degraded })))
}

// ---------------------------------------------------------------------
// GET /api/incidents/timeline
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub bucket: Option<String>,
}

pub async fn incidents_timeline(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<TimelineQuery>,
) -> Result<Response, ApiError> {
    let owner = state.identity.resolve(&headers).await.owner_id;

    let to = match &query.to {
        Some(raw) => parse_rfc3339(raw)?,
        None => Utc::now(),
    };

    let from = match query.from.as_deref() {
        Some("account") | None => state.storage.earliest_timestamp(&owner).await.unwrap_or(to),
        Some(raw) => parse_rfc3339(raw)?,
    };

    if from > to {
        return Err(ApiError::BadRequest("from must not be after to".to_string()));
    }

    let bucket = match query.bucket.as_deref() {
        Some("hour") => Bucket::Hour,
        Some("day") => Bucket::Day,
        Some("month") => Bucket::Month,
        Some("auto") | None => aggregator::resolve_auto_bucket(from, to),
        Some(other) => return Err(ApiError::BadRequest(format!("unknown bucket: {other}"))),
    };

    let result = state.storage.threats_since(&owner, from).await;
    let entries = aggregator::incident_timeline(&result.data, from, to, bucket);

    Ok(ok(json!({ "from": from, "to": to, "bucket": bucket, "timeline": entries })))
}

fn parse_rfc3339(raw: &str) -> Result<DateTime<Utc>, ApiError> {
    raw.parse::<DateTime<Utc>>().map_err(|_| ApiError::BadRequest(format!("invalid timestamp: {raw}")))
}

// ---------------------------------------------------------------------
// POST /api/contact, GET /api/contact (admin)
// ---------------------------------------------------------------------

pub async fn submit_contact(State(state): State<AppState>, Json(req): Json<ContactRequest>) -> Result<Response, ApiError> {
    if req.name.trim().is_empty() || req.email.trim().is_empty() || req.message.trim().is_empty() {
        return Err(ApiError::BadRequest("name, email, and message are required".to_string()));
    }

    let submission = ContactSubmission {
        id: uuid::Uuid::new_v4().to_string(),
        name: req.name,
        email: req.email,
        org: req.org,
        message: req.message,
        received_at: Utc::now(),
    };

    state.contacts.write().expect("contacts lock poisoned").push(submission);
    Ok(ok(json!({})))
}

#[derive(Debug, Deserialize)]
pub struct ContactListQuery {
    pub limit: Option<usize>,
}

pub async fn list_contacts(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ContactListQuery>,
) -> Result<Response, ApiError> {
    state.identity.require_admin(&headers).await.map_err(map_identity_error)?;

    let limit = query.limit.unwrap_or(100);
    let contacts = state.contacts.read().expect("contacts lock poisoned");
    let items: Vec<&ContactSubmission> = contacts.iter().rev().take(limit).collect();
    Ok(ok(json!({ "contacts": items })))
}

// ---------------------------------------------------------------------
// POST /api/admin/reset-mongo
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct ResetRequest {
    pub confirm: String,
}

pub async fn reset_mongo(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ResetRequest>,
) -> Result<Response, ApiError> {
    state.identity.require_admin(&headers).await.map_err(map_identity_error)?;

    if req.confirm != "RESET" {
        return Err(ApiError::BadRequest("confirm must equal \"RESET\"".to_string()));
    }

    state.storage.reset_all().await.map_err(|e| ApiError::Internal(anyhow::anyhow!(e.to_string())))?;
    Ok(ok(json!({})))
}

fn map_identity_error(e: crate::identity::IdentityError) -> ApiError {
    match e {
        crate::identity::IdentityError::Unauthorized => ApiError::AuthRequired,
        crate::identity::IdentityError::Forbidden => ApiError::Forbidden,
    }
}

// ---------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct HealthQuery {
    pub load: Option<u8>,
}

pub async fn health(State(state): State<AppState>, Query(query): Query<HealthQuery>) -> Result<Response, ApiError> {
    if query.load == Some(1) {
        let probed = state.ai_client.probe().await;
        if !probed {
            return Err(ApiError::NotReady("AI scoring endpoint unreachable".to_string()));
        }
    }

    Ok(ok(json!({})))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryRing, Storage, ThreatLog};
    use axum::http::StatusCode;
    use std::sync::RwLock;
    use std::time::Duration;

    fn test_state() -> AppState {
        let identity =
            Arc::new(crate::identity::Identity::new(None, "admin@example.com".to_string(), "tracel_anon_id".to_string()));
        let storage = Arc::new(Storage::new(None, MemoryRing::new(100), ThreatLog::in_memory()));
        let ai_client = Arc::new(crate::ai_client::AiClient::new("http://127.0.0.1:1".to_string(), Duration::from_millis(200)));
        let broadcaster = Arc::new(crate::broadcaster::Broadcaster::new(256));
        let baseline = Arc::new(crate::baseline::BaselineManager::new(200, 30, 3.0));
        let services = Arc::new(crate::pipeline::Services {
            geolocator: Arc::new(crate::geolocator::Geolocator::empty()),
            ai_client: ai_client.clone(),
            baseline,
            broadcaster: broadcaster.clone(),
            storage: storage.clone(),
            process_start_time: Utc::now(),
            owner_idle_timeout: Duration::from_secs(30),
        });
        let pipeline = Arc::new(crate::pipeline::PipelineManager::new(services));

        AppState {
            identity,
            storage,
            pipeline,
            broadcaster,
            ai_client,
            contacts: Arc::new(RwLock::new(Vec::new())),
        }
    }

    #[tokio::test]
    async fn status_reflects_ai_not_ready_before_any_success() {
        let state = test_state();
        let resp = status(State(state)).await;
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["ai_ready"], false);
    }

    #[tokio::test]
    async fn negative_limit_is_bad_request() {
        let state = test_state();
        let headers = HeaderMap::new();
        let query = PacketsQuery { limit: Some(-1), since: None, anomaly: None, ip: None };
        let result = list_packets(State(state), headers, Query(query)).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn limit_clamped_to_1000() {
        let state = test_state();
        let headers = HeaderMap::new();
        let query = PacketsQuery { limit: Some(5000), since: None, anomaly: None, ip: None };
        let resp = list_packets(State(state), headers, Query(query)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn since_hours_zero_yields_empty_aggregates() {
        let state = test_state();
        let headers = HeaderMap::new();
        let query = ThreatIntelQuery { since_hours: Some(0), limit: None };
        let resp = threat_intel(State(state), headers, Query(query)).await.unwrap();
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let v: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(v["threatIntel"]["total_threats"], 0);
    }

    #[tokio::test]
    async fn admin_endpoint_without_token_is_unauthorized() {
        let state = test_state();
        let headers = HeaderMap::new();
        let query = ContactListQuery { limit: None };
        let result = list_contacts(State(state), headers, Query(query)).await;
        assert!(matches!(result, Err(ApiError::AuthRequired)));
    }

    #[tokio::test]
    async fn reset_without_token_is_unauthorized() {
        let state = test_state();
        let result = reset_mongo(State(state), HeaderMap::new(), Json(ResetRequest { confirm: "RESET".to_string() })).await;
        assert!(matches!(result, Err(ApiError::AuthRequired)));
    }

    #[tokio::test]
    async fn account_from_with_no_packets_is_empty_not_error() {
        let state = test_state();
        let headers = HeaderMap::new();
        let query = TimelineQuery { from: Some("account".to_string()), to: None, bucket: Some("hour".to_string()) };
        let resp = incidents_timeline(State(state), headers, Query(query)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn contact_requires_non_empty_fields() {
        let state = test_state();
        let req = ContactRequest { name: "".to_string(), email: "a@b.com".to_string(), org: None, message: "hi".to_string() };
        let result = submit_contact(State(state), Json(req)).await;
        assert!(matches!(result, Err(ApiError::BadRequest(_))));
    }
}
