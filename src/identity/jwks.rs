//! JWKs cache — fetches and caches the identity provider's public keys,
//! refreshing on an unknown `kid`.

use std::collections::HashMap;
use std::sync::RwLock;

use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

use super::Claims;

#[derive(Debug, Error)]
pub enum JwksError {
    #[error("no JWKs endpoint configured")]
    NotConfigured,
    #[error("unknown key id")]
    UnknownKid,
    #[error("fetch failed: {0}")]
    Fetch(#[from] reqwest::Error),
    #[error("invalid token: {0}")]
    InvalidToken(#[from] jsonwebtoken::errors::Error),
}

#[derive(Debug, Deserialize, Clone)]
struct Jwk {
    kid: String,
    n: String,
    e: String,
}

#[derive(Debug, Deserialize)]
struct JwksDocument {
    keys: Vec<Jwk>,
}

pub struct JwksCache {
    url: Option<String>,
    http: reqwest::Client,
    keys: RwLock<HashMap<String, Jwk>>,
}

impl JwksCache {
    pub fn new(url: Option<String>) -> Self {
        Self { url, http: reqwest::Client::new(), keys: RwLock::new(HashMap::new()) }
    }

    pub fn is_configured(&self) -> bool {
        self.url.is_some()
    }

    /// Unconditional refresh, used by the background refresh task. A no-op
    /// when no JWKs endpoint is configured.
    pub async fn refresh_now(&self) -> Result<(), JwksError> {
        let Some(url) = self.url.as_ref() else { return Ok(()) };
        self.refresh(url).await
    }

    pub async fn verify(&self, token: &str) -> Result<Claims, JwksError> {
        let url = self.url.as_ref().ok_or(JwksError::NotConfigured)?;

        let header = decode_header(token)?;
        let kid = header.kid.ok_or(JwksError::UnknownKid)?;

        if !self.keys.read().expect("jwks lock poisoned").contains_key(&kid) {
            self.refresh(url).await?;
        }

        let jwk = self
            .keys
            .read()
            .expect("jwks lock poisoned")
            .get(&kid)
            .cloned()
            .ok_or(JwksError::UnknownKid)?;

        let decoding_key = DecodingKey::from_rsa_components(&jwk.n, &jwk.e)?;
        let mut validation = Validation::new(Algorithm::RS256);
        validation.validate_aud = false;

        let data = decode::<Claims>(token, &decoding_key, &validation)?;
        Ok(data.claims)
    }

    async fn refresh(&self, url: &str) -> Result<(), JwksError> {
        let doc: JwksDocument = self.http.get(url).send().await?.json().await?;
        let mut keys = self.keys.write().expect("jwks lock poisoned");
        keys.clear();
        for key in doc.keys {
            keys.insert(key.kid.clone(), key);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn no_endpoint_configured_rejects_everything() {
        let cache = JwksCache::new(None);
        let result = cache.verify("whatever").await;
        assert!(matches!(result, Err(JwksError::NotConfigured)));
    }

    #[tokio::test]
    async fn malformed_token_is_rejected() {
        let cache = JwksCache::new(Some("http://127.0.0.1:1/jwks.json".to_string()));
        let result = cache.verify("not-a-jwt").await;
        assert!(result.is_err());
    }
}
