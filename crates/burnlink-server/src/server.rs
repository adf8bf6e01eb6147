use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::DefaultBodyLimit,
    middleware,
    routing::{get, post, put},
    Router,
};
use directories::ProjectDirs;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::{
    blob::LocalBlobStore,
    clock::{Clock, SystemClock},
    engine::{Lifecycle, LifecycleConfig},
    gate::{require_human, require_origin, Gates, RecaptchaVerifier, DEFAULT_MIN_SCORE, RECAPTCHA_VERIFY_URL},
    handlers::{
        confirm_share, create_pin_share, create_share, download_share, get_blob, get_share, health,
        pin_session, pin_verify, put_blob, report_share, stats,
    },
    stats::{self as share_stats, StatsWriter},
    store::{model::MAX_FILE_SIZE_BYTES, KvStore, RedbStore},
    sweeper::{Sweeper, DEFAULT_PAGE_SIZE},
    AppState,
};

const DB_FILE: &str = "burnlink.db";

pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: Option<PathBuf>,
    /// Base URL clients use to reach this server; signed blob URLs are built on it.
    pub public_url: Option<String>,
    pub sweep_interval: Duration,
    pub sweep_page_size: usize,
    pub cors_origins: Option<String>,
    /// Expected `X-Origin-Verify` value ($BURNLINK_ORIGIN_SECRET).
    pub origin_secret: Option<String>,
    /// reCAPTCHA v3 secret ($BURNLINK_RECAPTCHA_SECRET). Unset disables bot checks.
    pub recaptcha_secret: Option<String>,
    pub recaptcha_min_score: f64,
    pub lifecycle: LifecycleConfig,
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl Default for ServerConfig {
    fn default() -> Self {
        let defaults = LifecycleConfig::default();
        Self {
            host: std::env::var("BURNLINK_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_parse("BURNLINK_PORT").unwrap_or(8080),
            data_dir: std::env::var("BURNLINK_DATA_DIR").ok().map(PathBuf::from),
            public_url: std::env::var("BURNLINK_PUBLIC_URL").ok(),
            sweep_interval: Duration::from_secs(3600),
            sweep_page_size: env_parse("BURNLINK_SWEEP_PAGE_SIZE").unwrap_or(DEFAULT_PAGE_SIZE),
            cors_origins: std::env::var("BURNLINK_CORS_ORIGINS").ok(),
            origin_secret: std::env::var("BURNLINK_ORIGIN_SECRET").ok(),
            recaptcha_secret: std::env::var("BURNLINK_RECAPTCHA_SECRET").ok(),
            recaptcha_min_score: env_parse("BURNLINK_RECAPTCHA_MIN_SCORE").unwrap_or(DEFAULT_MIN_SCORE),
            lifecycle: LifecycleConfig {
                reservation_timeout: env_parse("BURNLINK_RESERVATION_TIMEOUT")
                    .unwrap_or(defaults.reservation_timeout),
                session_timeout: env_parse("BURNLINK_SESSION_TIMEOUT")
                    .unwrap_or(defaults.session_timeout),
                pin_max_attempts: env_parse("BURNLINK_PIN_MAX_ATTEMPTS")
                    .unwrap_or(defaults.pin_max_attempts),
                lockout_duration: env_parse("BURNLINK_LOCKOUT_DURATION")
                    .unwrap_or(defaults.lockout_duration),
                stats_key: std::env::var("BURNLINK_STATS_KEY").unwrap_or(defaults.stats_key),
                pin_id_retries: defaults.pin_id_retries,
                report_threshold: env_parse("BURNLINK_REPORT_THRESHOLD")
                    .unwrap_or(defaults.report_threshold),
            },
        }
    }
}

/// Resolve the data directory (`burnlink.db`, `blob.key`, `blobs/`), creating it if needed.
/// An explicit directory wins; otherwise the platform data dir
/// (`~/.local/share/burnlink/`, etc.) is used.
pub fn resolve_data_dir(data_dir: Option<&PathBuf>) -> Result<PathBuf> {
    let path = match data_dir {
        Some(d) => d.clone(),
        None => ProjectDirs::from("", "", "burnlink")
            .context("could not determine platform data directory")?
            .data_dir()
            .to_owned(),
    };
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create data dir {}", path.display()))?;
    Ok(path)
}

/// Everything opened from a data directory.
pub struct Services {
    pub state: AppState,
    pub sweeper: Sweeper,
    pub stats_writer: StatsWriter,
}

/// Open the record store and blob directory under `data_dir` and wire the engine.
pub fn open_services(data_dir: &Path, public_url: &str, lifecycle: LifecycleConfig) -> Result<Services> {
    open_services_with(data_dir, public_url, lifecycle, DEFAULT_PAGE_SIZE)
}

pub fn open_services_with(
    data_dir: &Path,
    public_url: &str,
    lifecycle: LifecycleConfig,
    sweep_page_size: usize,
) -> Result<Services> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store: Arc<dyn KvStore> =
        Arc::new(RedbStore::open(&data_dir.join(DB_FILE)).context("open store")?);
    let blobs = Arc::new(LocalBlobStore::open(data_dir, public_url, clock.clone()).context("open blob store")?);

    let (aggregator, stats_writer) = share_stats::channel(store.clone(), lifecycle.stats_key.clone());
    let sweeper = Sweeper::new(
        store.clone(),
        blobs.clone(),
        clock.clone(),
        lifecycle.stats_key.clone(),
        sweep_page_size,
    );
    let engine = Arc::new(Lifecycle::new(store, blobs.clone(), clock, aggregator, lifecycle));

    Ok(Services {
        state: AppState { engine, blobs },
        sweeper,
        stats_writer,
    })
}

pub async fn run(cfg: ServerConfig) -> Result<()> {
    let data_dir = resolve_data_dir(cfg.data_dir.as_ref())?;
    info!(data_dir = %data_dir.display(), "using data directory");

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
        .parse()
        .context("invalid host/port")?;
    let public_url = cfg
        .public_url
        .clone()
        .unwrap_or_else(|| format!("http://localhost:{}", cfg.port));

    let services = open_services_with(&data_dir, &public_url, cfg.lifecycle, cfg.sweep_page_size)?;
    tokio::spawn(services.stats_writer.run());
    services.sweeper.spawn(cfg.sweep_interval);

    if cfg.origin_secret.is_none() {
        warn!("BURNLINK_ORIGIN_SECRET is not set; origin verification is disabled");
    }
    let recaptcha = match cfg.recaptcha_secret {
        Some(secret) => Some(RecaptchaVerifier::new(
            secret,
            RECAPTCHA_VERIFY_URL.into(),
            cfg.recaptcha_min_score,
        )?),
        None => {
            info!("BURNLINK_RECAPTCHA_SECRET is not set; bot verification is disabled");
            None
        }
    };
    let gates = Arc::new(Gates {
        origin_secret: cfg.origin_secret,
        recaptcha,
    });

    let app = build_router(services.state, gates, cfg.cors_origins.as_deref());

    info!(%addr, %public_url, "burnlink server listening");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("bind listener")?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server error")
}

/// The full route table. Every route except `/health` and `/blobs` passes the
/// origin gate; routes that create or consume shares also pass the bot gate.
pub fn build_router(state: AppState, gates: Arc<Gates>, cors_origins: Option<&str>) -> Router {
    let reads = Router::new()
        .route("/stats", get(stats))
        .route("/shares/{id}", get(get_share));

    let mutations = Router::new()
        .route("/shares", post(create_share))
        .route("/pin-shares", post(create_pin_share))
        .route("/shares/{id}/download", post(download_share))
        .route("/shares/{id}/confirm", post(confirm_share))
        .route("/shares/{id}/report", post(report_share))
        .route("/pin-shares/{id}/session", post(pin_session))
        .route("/pin-shares/{id}/verify", post(pin_verify))
        .layer(middleware::from_fn_with_state(gates.clone(), require_human));

    let api = Router::new()
        .merge(reads)
        .merge(mutations)
        .layer(middleware::from_fn_with_state(gates, require_origin));

    // Blob URLs carry their own signature.
    let blobs = Router::new()
        .route("/blobs/{*key}", put(put_blob).get(get_blob))
        .layer(DefaultBodyLimit::max(MAX_FILE_SIZE_BYTES as usize + 64 * 1024));

    Router::new()
        .route("/health", get(health))
        .merge(api)
        .merge(blobs)
        .with_state(state)
        .layer(build_cors(cors_origins))
        .layer(TraceLayer::new_for_http())
}

fn build_cors(origins: Option<&str>) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([
            http::Method::GET,
            http::Method::POST,
            http::Method::PUT,
            http::Method::OPTIONS,
        ])
        .allow_headers(Any);

    match origins {
        Some(o) => {
            let origins: Vec<_> = o.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            cors.allow_origin(origins)
        }
        None => cors.allow_origin(Any),
    }
}
