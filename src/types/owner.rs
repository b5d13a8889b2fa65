//! `OwnerId` — the tenant scope every packet, subscription, and aggregate is
//! partitioned by.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Either `user:<sub>` (authenticated) or `anon:<id>` (anonymous).
///
/// Stable across reconnects for the lifetime of the cookie/token; every
/// stored record and every live subscription is keyed by exactly one of
/// these.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    pub fn user(sub: &str) -> Self {
        Self(format!("user:{sub}"))
    }

    pub fn anon(id: &str) -> Self {
        Self(format!("anon:{id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `user` or `anon`, matching the `kind` field of `/api/session`.
    pub fn kind(&self) -> &'static str {
        if self.0.starts_with("user:") {
            "user"
        } else {
            "anon"
        }
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for OwnerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
