//! sentrymesh — real-time network-traffic monitoring and anomaly detection.
//!
//! # Environment Variables
//!
//! See `config::AppConfig` for the full list (`PORT`, `AI_URL`,
//! `PRIMARY_DB_URL`, `IDENTITY_JWKS_URL`, ...). `RUST_LOG` controls the
//! tracing filter (default: info).

use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use sentrymesh::ai_client::AiClient;
use sentrymesh::api::{self, AppState};
use sentrymesh::baseline::BaselineManager;
use sentrymesh::broadcaster::Broadcaster;
use sentrymesh::config::{self, AppConfig};
use sentrymesh::geolocator::Geolocator;
use sentrymesh::identity::Identity;
use sentrymesh::pipeline::{PipelineManager, Services};
use sentrymesh::storage::{MemoryRing, Storage, ThreatLog};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cfg = AppConfig::from_env().context("invalid configuration")?;
    config::init(cfg.clone());

    info!("sentrymesh starting up");

    let geolocator = match &cfg.geoip_dataset_path {
        Some(path) => {
            info!(path = %path, "loading geolocation dataset");
            Arc::new(Geolocator::load(path))
        }
        None => {
            warn!("GEOIP_DATASET_PATH not set; geolocation disabled, source_country/lat/lon will be null");
            Arc::new(Geolocator::empty())
        }
    };

    let ai_client = Arc::new(AiClient::new(cfg.ai_url.clone(), cfg.ai_timeout));
    let identity = Arc::new(Identity::new(
        cfg.identity_jwks_url.clone(),
        cfg.admin_email.clone(),
        cfg.anon_cookie_name.clone(),
    ));
    identity.spawn_background_refresh(cfg.jwks_cache_ttl);
    let baseline = Arc::new(BaselineManager::new(cfg.baseline_window, cfg.baseline_warmup_min, cfg.baseline_k));
    let broadcaster = Arc::new(Broadcaster::new(cfg.sub_backpressure_limit));

    let primary = connect_primary_store(&cfg).await;
    let ring = MemoryRing::new(cfg.mem_ring_capacity);
    let threat_log = ThreatLog::open(cfg.threat_log_path.clone(), cfg.threat_retention_hours, &ring)
        .await
        .context("failed to open threat log")?;
    let storage = Arc::new(Storage::new(primary, ring, threat_log));

    let services = Arc::new(Services {
        geolocator,
        ai_client: ai_client.clone(),
        baseline,
        broadcaster: broadcaster.clone(),
        storage: storage.clone(),
        process_start_time: Utc::now(),
        owner_idle_timeout: cfg.owner_idle_timeout,
    });
    let pipeline = Arc::new(PipelineManager::new(services));

    let state = AppState {
        identity,
        storage: storage.clone(),
        pipeline,
        broadcaster,
        ai_client,
        contacts: Arc::new(RwLock::new(Vec::new())),
    };

    let app = api::create_app(state, &cfg.cors_allowed_origins);

    let addr = format!("0.0.0.0:{}", cfg.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind to {addr}"))?;
    info!(%addr, "HTTP + WebSocket server listening");

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received Ctrl+C, initiating graceful shutdown");
        shutdown_cancel.cancel();
    });

    let shutdown_grace = cfg.shutdown_grace;
    let result = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            cancel.cancelled().await;
        })
        .await;

    // Give in-flight owner pipelines/sockets a moment to drain before the
    // process exits, then flush the threat log's buffered writer.
    tokio::time::sleep(shutdown_grace.min(Duration::from_secs(5))).await;
    storage.shutdown().await;

    match result {
        Ok(()) => {
            info!("sentrymesh shutdown complete");
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "HTTP server error");
            Err(anyhow::anyhow!("HTTP server error: {e}"))
        }
    }
}

#[cfg(feature = "primary-store")]
async fn connect_primary_store(cfg: &AppConfig) -> Option<Arc<dyn sentrymesh::storage::PrimaryStore>> {
    let url = cfg.primary_db_url.as_ref()?;
    match sentrymesh::storage::PostgresStore::connect(url).await {
        Ok(store) => {
            info!("connected to primary store");
            Some(Arc::new(store))
        }
        Err(e) => {
            warn!(error = %e, "failed to connect to primary store; continuing with memory ring + threat log only");
            None
        }
    }
}

#[cfg(not(feature = "primary-store"))]
async fn connect_primary_store(cfg: &AppConfig) -> Option<Arc<dyn sentrymesh::storage::PrimaryStore>> {
    if cfg.primary_db_url.is_some() {
        warn!("PRIMARY_DB_URL is set but the primary-store feature is not compiled in; ignoring");
    }
    None
}
