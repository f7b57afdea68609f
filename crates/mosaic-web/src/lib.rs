//! Axum JSON surface for the repository catalog and the manual sync trigger.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Path as AxumPath, State},
    http::{header, HeaderMap, StatusCode, Uri},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use mosaic_core::PersistedRepositoryRow;
use mosaic_storage::RepositoryStore;
use mosaic_sync::{SyncConfig, SyncError, SyncOptions, SyncPipeline};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "mosaic-web";

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RepositoryStore>,
    pub pipeline: Option<Arc<SyncPipeline>>,
    pub options: SyncOptions,
    pub trigger_secret: Option<String>,
    pub view_source_url: String,
}

impl AppState {
    pub fn new(store: Arc<dyn RepositoryStore>, options: SyncOptions) -> Self {
        Self {
            store,
            pipeline: None,
            options,
            trigger_secret: None,
            view_source_url: String::new(),
        }
    }

    /// State for a running server: reads come from the pipeline's store.
    pub fn from_config(config: &SyncConfig, pipeline: Arc<SyncPipeline>) -> Self {
        Self {
            store: pipeline.store(),
            pipeline: Some(pipeline),
            options: config.options(),
            trigger_secret: config.trigger_secret.clone(),
            view_source_url: config.view_source_url.clone(),
        }
    }

    pub fn with_trigger(mut self, pipeline: Arc<SyncPipeline>, secret: impl Into<String>) -> Self {
        self.pipeline = Some(pipeline);
        self.trigger_secret = Some(secret.into());
        self
    }

    pub fn with_view_source_url(mut self, url: impl Into<String>) -> Self {
        self.view_source_url = url.into();
        self
    }

    fn trigger_enabled(&self) -> bool {
        self.pipeline.is_some() && self.trigger_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

/// Catalog row as served over HTTP; `config` is the decoded payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepositoryView {
    pub github_id: String,
    pub name_with_owner: String,
    pub name: String,
    pub url: String,
    pub description: Option<String>,
    pub config: Option<JsonValue>,
}

impl From<PersistedRepositoryRow> for RepositoryView {
    fn from(row: PersistedRepositoryRow) -> Self {
        let config = row.config_payload().map(|payload| payload.as_json().clone());
        Self {
            github_id: row.github_id,
            name_with_owner: row.name_with_owner,
            name: row.name,
            url: row.url,
            description: row.description,
            config,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ErrorBody {
    path: String,
    status: u16,
    message: String,
    timestamp: String,
}

pub fn app(state: AppState) -> Router {
    let mut router = Router::new()
        .route("/repositories", get(list_repositories_handler))
        .route("/repositories/{github_id}", get(repository_handler))
        .route("/repositories/{github_id}/config", get(repository_config_handler))
        .route("/ping", get(ping_handler))
        .route("/view-source", get(view_source_handler));
    if state.trigger_enabled() {
        router = router.route("/sync", post(trigger_handler));
    } else {
        info!("manual sync trigger disabled; no secret configured");
    }
    router.fallback(not_found_handler).with_state(Arc::new(state))
}

pub async fn serve_from_config(
    config: &SyncConfig,
    pipeline: Arc<SyncPipeline>,
) -> anyhow::Result<()> {
    let state = AppState::from_config(config, pipeline);
    let listener = TcpListener::bind(("0.0.0.0", config.web_port))
        .await
        .with_context(|| format!("binding web port {}", config.web_port))?;
    info!(port = config.web_port, "serving catalog");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("web server")?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for shutdown signal");
    }
}

async fn list_repositories_handler(State(state): State<Arc<AppState>>, uri: Uri) -> Response {
    match state.store.list().await {
        Ok(rows) => {
            Json(rows.into_iter().map(RepositoryView::from).collect::<Vec<_>>()).into_response()
        }
        Err(err) => error_response(&uri, StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn repository_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(github_id): AxumPath<String>,
    uri: Uri,
) -> Response {
    match state.store.get(&github_id).await {
        Ok(Some(row)) => Json(RepositoryView::from(row)).into_response(),
        Ok(None) => not_found(&uri, format!("repository {github_id} not found")),
        Err(err) => error_response(&uri, StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn repository_config_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(github_id): AxumPath<String>,
    uri: Uri,
) -> Response {
    match state.store.get(&github_id).await {
        Ok(Some(row)) => match row.config_payload() {
            Some(payload) => Json(payload.as_json().clone()).into_response(),
            None => not_found(&uri, format!("repository {github_id} has no config")),
        },
        Ok(None) => not_found(&uri, format!("repository {github_id} not found")),
        Err(err) => error_response(&uri, StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}

async fn ping_handler() -> Response {
    (StatusCode::IM_A_TEAPOT, "pong!").into_response()
}

async fn view_source_handler(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::MOVED_PERMANENTLY,
        [(header::LOCATION, state.view_source_url.clone())],
    )
        .into_response()
}

async fn trigger_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    uri: Uri,
) -> Response {
    let (Some(pipeline), Some(secret)) =
        (state.pipeline.as_ref(), state.trigger_secret.as_deref())
    else {
        return not_found(&uri, "not found");
    };

    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == secret);
    if !authorized {
        warn!("manual sync trigger rejected");
        return error_response(&uri, StatusCode::UNAUTHORIZED, "unauthorized");
    }

    info!(owner = %state.options.owner, "manual sync triggered");
    match pipeline.run_once(&state.options).await {
        Ok(summary) => Json(summary).into_response(),
        Err(SyncError::AlreadyRunning) => {
            error_response(&uri, StatusCode::CONFLICT, SyncError::AlreadyRunning.to_string())
        }
        Err(err) => {
            error!(error = %err, "manual sync failed");
            error_response(&uri, StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

async fn not_found_handler(uri: Uri) -> Response {
    not_found(&uri, "not found")
}

fn not_found(uri: &Uri, message: impl Into<String>) -> Response {
    error_response(uri, StatusCode::NOT_FOUND, message)
}

fn error_response(uri: &Uri, status: StatusCode, message: impl Into<String>) -> Response {
    let body = ErrorBody {
        path: uri.path().to_string(),
        status: status.as_u16(),
        message: message.into(),
        timestamp: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
    };
    (status, Json(body)).into_response()
}
