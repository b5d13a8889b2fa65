//! Geolocator — pure, synchronous IP → `{country, lat, lon}` lookup.
//!
//! Backed by a read-only table loaded once at startup. A missing or
//! malformed dataset must not prevent the service from starting.

use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeoInfo {
    pub country: Option<String>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct GeoEntry {
    prefix: String,
    country: String,
    lat: f64,
    lon: f64,
}

/// Read-only CIDR-prefix-keyed lookup table, loaded once at startup.
pub struct Geolocator {
    // Keyed by the dotted-decimal /24 (or /64 for v6) prefix string, which
    // keeps the lookup O(1) without pulling in a CIDR-matching crate for a
    // synthetic dataset.
    table: HashMap<String, GeoInfo>,
}

impl Geolocator {
    /// Load the dataset from a JSON file of `[{prefix, country, lat, lon}]`.
    /// Any failure to read or parse degrades to an empty table with a
    /// warning — the service must still start.
    pub fn load(path: &str) -> Self {
        let table = std::fs::read_to_string(path)
            .ok()
            .and_then(|raw| serde_json::from_str::<Vec<GeoEntry>>(&raw).ok())
            .map(|entries| {
                entries
                    .into_iter()
                    .map(|e| {
                        (
                            e.prefix,
                            GeoInfo {
                                country: Some(e.country),
                                lat: Some(e.lat),
                                lon: Some(e.lon),
                            },
                        )
                    })
                    .collect()
            })
            .unwrap_or_else(|| {
                tracing::warn!(path, "geolocation dataset missing or malformed; continuing with empty table");
                HashMap::new()
            });

        Self { table }
    }

    pub fn empty() -> Self {
        Self { table: HashMap::new() }
    }

    /// Map an address to geo info, or all-null fields on miss.
    pub fn lookup(&self, ip: &str) -> GeoInfo {
        let Ok(addr) = ip.parse::<IpAddr>() else {
            return GeoInfo::default();
        };

        let prefix = match addr {
            IpAddr::V4(v4) => {
                let o = v4.octets();
                format!("{}.{}.{}", o[0], o[1], o[2])
            }
            IpAddr::V6(v6) => {
                let s = v6.segments();
                format!("{:x}:{:x}:{:x}:{:x}", s[0], s[1], s[2], s[3])
            }
        };

        self.table.get(&prefix).cloned().unwrap_or_default()
    }
}
