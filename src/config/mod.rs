//! Service configuration, loaded from environment variables.
//!
//! ## Loading
//!
//! Call `config::init(AppConfig::from_env()?)` once at startup, then
//! `config::get()` anywhere:
//!
//! ```ignore
//! config::init(AppConfig::from_env()?);
//! let k = config::get().baseline_k;
//! ```

use std::sync::OnceLock;
use std::time::Duration;

use thiserror::Error;

/// Global application configuration, initialized once at startup.
static APP_CONFIG: OnceLock<AppConfig> = OnceLock::new();

/// Initialize the global config.
///
/// Must be called exactly once before any calls to `get()`.
pub fn init(config: AppConfig) {
    if APP_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once — ignoring");
    }
}

/// Get a reference to the global config.
///
/// Panics if `init()` has not been called. This is by design — a missing
/// config is a fatal startup error, not a recoverable condition.
pub fn get() -> &'static AppConfig {
    APP_CONFIG
        .get()
        .expect("config::get() called before config::init() — this is a startup bug")
}

/// Check whether the config has been initialized. Useful for tests.
pub fn is_initialized() -> bool {
    APP_CONFIG.get().is_some()
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration:\n{}", .0.join("\n"))]
    Validation(Vec<String>),
}

/// Service configuration, sourced entirely from environment variables
/// per the external-interfaces contract.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub port: u16,
    pub primary_db_url: Option<String>,
    pub ai_url: String,
    pub ai_timeout: Duration,
    pub identity_jwks_url: Option<String>,
    pub admin_email: String,
    pub anon_cookie_name: String,
    pub threat_log_path: String,
    pub threat_retention_hours: i64,
    pub geoip_dataset_path: Option<String>,
    pub mem_ring_capacity: usize,
    pub baseline_window: usize,
    pub baseline_warmup_min: usize,
    pub baseline_k: f64,
    pub owner_idle_timeout: Duration,
    pub sub_backpressure_limit: usize,
    pub cors_allowed_origins: Vec<String>,
    pub shutdown_grace: Duration,
    pub jwks_cache_ttl: Duration,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_env<T: std::str::FromStr>(key: &str, default: T, errors: &mut Vec<String>) -> T {
    match std::env::var(key) {
        Err(_) => default,
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            errors.push(format!("{key}: expected a number, got {raw:?}"));
            default
        }),
    }
}

impl AppConfig {
    /// Build config from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut errors = Vec::new();

        let port = parse_env("PORT", 8080u16, &mut errors);
        let primary_db_url = std::env::var("PRIMARY_DB_URL").ok();
        let ai_url = env_or("AI_URL", "http://localhost:9000/score");
        let ai_timeout_ms = parse_env("AI_TIMEOUT_MS", 2000u64, &mut errors);
        let identity_jwks_url = std::env::var("IDENTITY_JWKS_URL").ok();
        let admin_email = env_or("ADMIN_EMAIL", "");
        let anon_cookie_name = env_or("ANON_COOKIE_NAME", "tracel_anon_id");
        let threat_log_path = env_or("THREAT_LOG_PATH", "threat_log.jsonl");
        let threat_retention_hours = parse_env("THREAT_RETENTION_HOURS", 24i64, &mut errors);
        let geoip_dataset_path = std::env::var("GEOIP_DATASET_PATH").ok();
        let mem_ring_capacity = parse_env("MEM_RING_CAPACITY", 500usize, &mut errors);
        let baseline_window = parse_env("BASELINE_WINDOW", 200usize, &mut errors);
        let baseline_warmup_min = parse_env("BASELINE_WARMUP_MIN", 30usize, &mut errors);
        let baseline_k = parse_env("BASELINE_K", 3.0f64, &mut errors);
        let owner_idle_timeout_ms = parse_env("OWNER_IDLE_TIMEOUT_MS", 30_000u64, &mut errors);
        let sub_backpressure_limit = parse_env("SUB_BACKPRESSURE_LIMIT", 256usize, &mut errors);
        let cors_allowed_origins = std::env::var("CORS_ALLOWED_ORIGINS")
            .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
            .unwrap_or_default();
        let shutdown_grace_ms = parse_env("SHUTDOWN_GRACE_MS", 5000u64, &mut errors);
        let jwks_cache_ttl_secs = parse_env("JWKS_CACHE_TTL_SECS", 3600u64, &mut errors);

        let config = Self {
            port,
            primary_db_url,
            ai_url,
            ai_timeout: Duration::from_millis(ai_timeout_ms),
            identity_jwks_url,
            admin_email,
            anon_cookie_name,
            threat_log_path,
            threat_retention_hours,
            geoip_dataset_path,
            mem_ring_capacity,
            baseline_window,
            baseline_warmup_min,
            baseline_k,
            owner_idle_timeout: Duration::from_millis(owner_idle_timeout_ms),
            sub_backpressure_limit,
            cors_allowed_origins,
            shutdown_grace: Duration::from_millis(shutdown_grace_ms),
            jwks_cache_ttl: Duration::from_secs(jwks_cache_ttl_secs),
        };

        config.validate(&mut errors);

        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn validate(&self, errors: &mut Vec<String>) {
        if self.baseline_warmup_min == 0 {
            errors.push("BASELINE_WARMUP_MIN must be at least 1".to_string());
        }
        if self.baseline_window < self.baseline_warmup_min {
            errors.push("BASELINE_WINDOW must be >= BASELINE_WARMUP_MIN".to_string());
        }
        if self.baseline_k <= 0.0 {
            errors.push("BASELINE_K must be positive".to_string());
        }
        if self.mem_ring_capacity == 0 {
            errors.push("MEM_RING_CAPACITY must be at least 1".to_string());
        }
        if self.sub_backpressure_limit == 0 {
            errors.push("SUB_BACKPRESSURE_LIMIT must be at least 1".to_string());
        }
        if self.threat_retention_hours < 0 {
            errors.push("THREAT_RETENTION_HOURS must be non-negative".to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Environment variables are process-global; serialize the tests that
    // touch them so they don't race each other.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn defaults_are_valid() {
        let _guard = ENV_LOCK.lock().unwrap();
        for key in [
            "PORT", "PRIMARY_DB_URL", "AI_URL", "AI_TIMEOUT_MS", "IDENTITY_JWKS_URL",
            "ADMIN_EMAIL", "ANON_COOKIE_NAME", "THREAT_LOG_PATH", "THREAT_RETENTION_HOURS",
            "GEOIP_DATASET_PATH",
            "MEM_RING_CAPACITY", "BASELINE_WINDOW", "BASELINE_WARMUP_MIN", "BASELINE_K",
            "OWNER_IDLE_TIMEOUT_MS", "SUB_BACKPRESSURE_LIMIT", "CORS_ALLOWED_ORIGINS",
            "SHUTDOWN_GRACE_MS", "JWKS_CACHE_TTL_SECS",
        ] {
            std::env::remove_var(key);
        }

        let cfg = AppConfig::from_env().expect("defaults should validate");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.baseline_window, 200);
        assert_eq!(cfg.baseline_warmup_min, 30);
        assert!((cfg.baseline_k - 3.0).abs() < f64::EPSILON);
        assert_eq!(cfg.mem_ring_capacity, 500);
    }

    #[test]
    fn rejects_window_smaller_than_warmup() {
        let _guard = ENV_LOCK.lock().unwrap();
        std::env::set_var("BASELINE_WINDOW", "10");
        std::env::set_var("BASELINE_WARMUP_MIN", "30");

        let result = AppConfig::from_env();
        std::env::remove_var("BASELINE_WINDOW");
        std::env::remove_var("BASELINE_WARMUP_MIN");

        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }
}
