use crate::channels::ChannelStore;
use crate::error::{AppError, AppResult};
use crate::quota::QuotaStore;
use crate::settings::SettingsStore;
use crate::tokens::{TiktokenEstimator, TokenEstimator};
use axum::Router;
use axum::http::StatusCode;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use std::path::PathBuf;
use std::sync::{Arc, Once, OnceLock};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub http: reqwest::Client,
    pub metrics: PrometheusHandle,
    pub settings_store: SettingsStore,
    pub channel_store: ChannelStore,
    pub quota_store: QuotaStore,
    pub estimator: Arc<dyn TokenEstimator>,
}

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();
static METRICS_ERROR: OnceLock<AppError> = OnceLock::new();
static METRICS_INIT: Once = Once::new();
static ESTIMATOR: OnceLock<Arc<TiktokenEstimator>> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub metrics_path: String,
    pub database_dsn: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let listen = std::env::var("RELAYGATE_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "0.0.0.0:8080".to_string());
        let metrics_path = std::env::var("RELAYGATE_METRICS_PATH")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "/metrics".to_string());
        let database_dsn = resolve_database_dsn();
        Self {
            listen,
            metrics_path,
            database_dsn,
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(runtime: RuntimeConfig) -> AppResult<AppState> {
    let http = reqwest::Client::builder()
        .user_agent("relaygate/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    ensure_sqlite_file(&runtime.database_dsn)
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "database_init_failed", err))?;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(
            runtime
                .database_dsn
                .parse::<sqlx::sqlite::SqliteConnectOptions>()
                .map_err(|err| {
                    AppError::new(
                        StatusCode::BAD_REQUEST,
                        "database_dsn_parse_failed",
                        err.to_string(),
                    )
                })?
                .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
                .busy_timeout(std::time::Duration::from_secs(5)),
        )
        .await
        .map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "database_init_failed",
                err.to_string(),
            )
        })?;

    let settings_store = SettingsStore::new(pool.clone()).await.map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "settings_store_init_failed", err)
    })?;
    let channel_store = ChannelStore::new(pool.clone()).await.map_err(|err| {
        AppError::new(StatusCode::BAD_REQUEST, "channel_store_init_failed", err)
    })?;
    let quota_store = QuotaStore::new(pool)
        .await
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, "quota_store_init_failed", err))?;

    let metrics = init_metrics()?;
    let estimator = init_estimator()?;

    Ok(AppState {
        runtime: Arc::new(runtime),
        http,
        metrics,
        settings_store,
        channel_store,
        quota_store,
        estimator,
    })
}

fn init_metrics() -> AppResult<PrometheusHandle> {
    METRICS_INIT.call_once(|| {
        match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => {
                let _ = METRICS_HANDLE.set(handle);
            }
            Err(err) => {
                let _ = METRICS_ERROR.set(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "metrics_init_failed",
                    err.to_string(),
                ));
            }
        }
    });

    if let Some(err) = METRICS_ERROR.get() {
        return Err(err.clone());
    }
    METRICS_HANDLE.get().cloned().ok_or_else(|| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "metrics_init_failed",
            "metrics recorder not available",
        )
    })
}

/// The BPE tables are large; every state built in this process shares one
/// copy.
fn init_estimator() -> AppResult<Arc<dyn TokenEstimator>> {
    if let Some(estimator) = ESTIMATOR.get() {
        return Ok(estimator.clone());
    }
    let estimator = TiktokenEstimator::new().map_err(|err| {
        AppError::new(
            StatusCode::BAD_REQUEST,
            "token_estimator_init_failed",
            err.to_string(),
        )
    })?;
    Ok(ESTIMATOR.get_or_init(|| Arc::new(estimator)).clone())
}

fn resolve_database_dsn() -> String {
    std::env::var("RELAYGATE_DATABASE_DSN")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .or_else(|| {
            std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty())
        })
        .unwrap_or_else(|| "sqlite://./data/relaygate.db".to_string())
}

fn ensure_sqlite_file(dsn: &str) -> Result<(), String> {
    let dsn = dsn.trim();
    if !dsn.starts_with("sqlite://") {
        return Ok(());
    }
    if dsn.contains(":memory:") || dsn.contains("mode=memory") {
        return Ok(());
    }
    let path_part = dsn.trim_start_matches("sqlite://");
    let path_part = path_part.split('?').next().unwrap_or("");
    if path_part.is_empty() {
        return Ok(());
    }
    let path = PathBuf::from(path_part);
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)
                .map_err(|err| format!("sqlite_dir_create_failed: {err}"))?;
        }
    }
    if !path.exists() {
        std::fs::File::create(&path).map_err(|err| format!("sqlite_file_create_failed: {err}"))?;
    }
    Ok(())
}

pub fn build_app(state: AppState) -> Router {
    let metrics_path = state.runtime.metrics_path.clone();
    Router::<AppState>::new()
        .route(
            "/v1/chat/completions",
            post(crate::handlers::chat_completions),
        )
        .route("/v1/realtime", get(crate::handlers::realtime))
        .route(&metrics_path, get(crate::handlers::metrics))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
