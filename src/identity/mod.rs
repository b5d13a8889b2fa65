//! Identity & Session. Resolves every inbound request and socket
//! connection to an `OwnerId`, issuing a stable anonymous identity when no
//! bearer token is present.

mod jwks;

pub use jwks::JwksCache;

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use rand::RngCore;
use thiserror::Error;

use crate::types::OwnerId;

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("authentication required")]
    Unauthorized,
    #[error("forbidden")]
    Forbidden,
}

/// Claims extracted from a verified bearer token.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct Claims {
    pub sub: String,
    pub email: Option<String>,
}

pub struct Identity {
    jwks: JwksCache,
    admin_email: String,
    anon_cookie_name: String,
}

/// Outcome of resolving a request's identity.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub owner_id: OwnerId,
    pub is_admin: bool,
    pub kind: &'static str,
}

impl Identity {
    pub fn new(jwks_url: Option<String>, admin_email: String, anon_cookie_name: String) -> Self {
        Self {
            jwks: JwksCache::new(jwks_url),
            admin_email: admin_email.to_lowercase(),
            anon_cookie_name,
        }
    }

    /// `resolve(headers, cookies)`. Verification failure falls back to
    /// anonymous rather than rejecting — admin-only endpoints enforce
    /// their own stricter rule via `require_admin`.
    pub async fn resolve(&self, headers: &HeaderMap) -> Resolved {
        if let Some(token) = bearer_token(headers) {
            match self.jwks.verify(&token).await {
                Ok(claims) => {
                    let is_admin = claims
                        .email
                        .as_deref()
                        .map(|e| e.to_lowercase() == self.admin_email && !self.admin_email.is_empty())
                        .unwrap_or(false);
                    return Resolved {
                        owner_id: OwnerId::user(&claims.sub),
                        is_admin,
                        kind: "user",
                    };
                }
                Err(e) => {
                    tracing::debug!(error = %e, "bearer token verification failed; falling back to anonymous");
                }
            }
        }

        let anon_id = anon_id_from(headers, &self.anon_cookie_name);
        Resolved { owner_id: OwnerId::anon(&anon_id), is_admin: false, kind: "anon" }
    }

    /// Admin endpoints must fail hard rather than degrade to anonymous.
    pub async fn require_admin(&self, headers: &HeaderMap) -> Result<Resolved, IdentityError> {
        let token = bearer_token(headers).ok_or(IdentityError::Unauthorized)?;
        let claims = self
            .jwks
            .verify(&token)
            .await
            .map_err(|_| IdentityError::Unauthorized)?;

        let is_admin = claims
            .email
            .as_deref()
            .map(|e| e.to_lowercase() == self.admin_email && !self.admin_email.is_empty())
            .unwrap_or(false);

        if !is_admin {
            return Err(IdentityError::Forbidden);
        }

        Ok(Resolved { owner_id: OwnerId::user(&claims.sub), is_admin: true, kind: "user" })
    }

    pub fn cookie_name(&self) -> &str {
        &self.anon_cookie_name
    }

    /// Spawns a background task that unconditionally refreshes the JWKs
    /// cache every `interval`, so a rotated signing key is picked up without
    /// waiting for a `verify` call against an unknown `kid`. A no-op spawn
    /// (the task exits immediately) when no JWKs endpoint is configured.
    pub fn spawn_background_refresh(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let identity = self.clone();
        tokio::spawn(async move {
            if !identity.jwks.is_configured() {
                return;
            }
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; the cache is already warm on first use
            loop {
                ticker.tick().await;
                if let Err(e) = identity.jwks.refresh_now().await {
                    tracing::warn!(error = %e, "periodic JWKs refresh failed; cache retains previous keys");
                }
            }
        })
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(axum::http::header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(|s| s.to_string())
}

fn anon_id_from(headers: &HeaderMap, cookie_name: &str) -> String {
    if let Some(cookie_header) = headers.get(axum::http::header::COOKIE).and_then(|v| v.to_str().ok()) {
        for pair in cookie_header.split(';') {
            let pair = pair.trim();
            if let Some(value) = pair.strip_prefix(&format!("{cookie_name}=")) {
                return value.to_string();
            }
        }
    }

    if let Some(header_id) = headers.get("x-tracel-anon-id").and_then(|v| v.to_str().ok()) {
        return header_id.to_string();
    }

    mint_anon_id()
}

/// Mints an opaque anonymous id with >= 128 bits of entropy.
pub fn mint_anon_id() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
