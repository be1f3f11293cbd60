//! axum HTTP surface for the catalog sync service.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Path, Request, State},
    http::{header, HeaderName, HeaderValue, Method, StatusCode},
    middleware::from_fn,
    middleware::from_fn_with_state,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use refsync_core::{IdempotencyRecord, NewCategoryGroup, StatusSnapshot};
use refsync_sync::{upsert_category_groups, upsert_tags, SyncConfig, SyncError, SyncServices};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, info_span, Span};

pub mod middleware;
pub mod payload;

use middleware::{json_error, CorrelationId, CORRELATION_ID_HEADER};
use payload::{into_items, CatalogItemPayload, CategoryGroupPayload, TagPayload};

pub const CRATE_NAME: &str = "refsync-web";

/// Extractor cap for every route. The idempotency gate buffers separately.
pub const MAX_REQUEST_BODY_BYTES: usize = 32 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub services: SyncServices,
    pub internal_token: String,
    pub allowed_origins: Vec<String>,
}

impl AppState {
    pub fn new(services: SyncServices, config: &SyncConfig) -> Self {
        Self {
            services,
            internal_token: config.internal_token.clone(),
            allowed_origins: config.allowed_origins.clone(),
        }
    }
}

pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT])
        .expose_headers([HeaderName::from_static(CORRELATION_ID_HEADER)]);
    if allowed_origins.iter().any(|o| o == "*") {
        return cors.allow_origin(Any);
    }
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| origin.parse().ok())
        .collect();
    cors.allow_origin(AllowOrigin::list(origins))
}

fn request_span(request: &Request) -> Span {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|c| c.0.as_str())
        .unwrap_or_default();
    info_span!(
        "http_request",
        method = %request.method(),
        path = %request.uri().path(),
        correlation_id,
    )
}

pub fn app(state: AppState) -> Router {
    let cors = cors_layer(&state.allowed_origins);
    let state = Arc::new(state);
    Router::new()
        .route("/api/status", get(status))
        .route("/internal/upsert/tags", post(upsert_tag_rows))
        .route("/internal/upsert/category-groups", post(upsert_group_rows))
        .route("/internal/upsert/items", post(upsert_items))
        .route("/internal/idempotency/status/{key}", get(idempotency_status))
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(from_fn_with_state(state.clone(), middleware::idempotency_gate))
        .layer(from_fn_with_state(state.clone(), middleware::internal_token))
        .layer(TraceLayer::new_for_http().make_span_with(request_span))
        .layer(from_fn(middleware::correlation_id))
        .layer(cors)
        .with_state(state)
}

pub async fn serve(bind_addr: &str, state: AppState, shutdown: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding {bind_addr}"))?;
    info!(addr = %bind_addr, "http server listening");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await
        .context("running http server")
}

async fn shutdown_signal(shutdown: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown requested");
            shutdown.cancel();
        }
        _ = shutdown.cancelled() => {}
    }
}

fn correlation(ext: &Option<Extension<CorrelationId>>) -> Option<&CorrelationId> {
    ext.as_ref().map(|Extension(id)| id)
}

async fn status(State(state): State<Arc<AppState>>) -> Json<StatusSnapshot> {
    match state.services.coordinator.get_status().await {
        Ok(snapshot) => Json(snapshot),
        Err(err) => {
            error!(error = %err, "status read failed; reporting initializing");
            Json(StatusSnapshot {
                initializing: true,
                last_sync_at: None,
            })
        }
    }
}

async fn upsert_tag_rows(
    State(state): State<Arc<AppState>>,
    correlation_id: Option<Extension<CorrelationId>>,
    Json(rows): Json<Vec<TagPayload>>,
) -> Response {
    let names: Vec<String> = rows.into_iter().map(|row| row.name).collect();
    match upsert_tags(state.services.tags.as_ref(), &names).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => {
            error!(error = %err, "tag upsert failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Tag upsert failed.",
                correlation(&correlation_id),
            )
        }
    }
}

async fn upsert_group_rows(
    State(state): State<Arc<AppState>>,
    correlation_id: Option<Extension<CorrelationId>>,
    Json(rows): Json<Vec<CategoryGroupPayload>>,
) -> Response {
    let groups: Vec<NewCategoryGroup> = rows.into_iter().map(Into::into).collect();
    match upsert_category_groups(state.services.category_groups.as_ref(), &groups).await {
        Ok(outcome) => Json(outcome).into_response(),
        Err(err) => {
            error!(error = %err, "category group upsert failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Category group upsert failed.",
                correlation(&correlation_id),
            )
        }
    }
}

async fn upsert_items(
    State(state): State<Arc<AppState>>,
    correlation_id: Option<Extension<CorrelationId>>,
    Json(payloads): Json<Vec<CatalogItemPayload>>,
) -> Response {
    let items = match into_items(payloads) {
        Ok(items) => items,
        Err(errors) => {
            info!(errors = errors.len(), "catalog batch rejected by validation");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "message": "Validation failed.", "errors": errors })),
            )
                .into_response();
        }
    };

    // Dropping this future on disconnect leaves the same partial progress a
    // cancelled token would.
    match state
        .services
        .engine
        .upsert_batch(&items, &CancellationToken::new())
        .await
    {
        Ok(result) => {
            let status = if result.has_failures() {
                StatusCode::MULTI_STATUS
            } else {
                StatusCode::OK
            };
            (status, Json(result)).into_response()
        }
        Err(err) => {
            error!(error = %err, "catalog batch aborted");
            let message = match err {
                SyncError::LookupsUnavailable(_) => "Lookup tables could not be loaded.",
                _ => "Catalog upsert failed.",
            };
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                message,
                correlation(&correlation_id),
            )
        }
    }
}

#[derive(Debug, Serialize)]
struct IdempotencyStatusBody {
    exists: bool,
    #[serde(flatten)]
    record: Option<IdempotencyRecord>,
}

async fn idempotency_status(
    State(state): State<Arc<AppState>>,
    correlation_id: Option<Extension<CorrelationId>>,
    Path(key): Path<String>,
) -> Response {
    match state.services.idempotency.status(&key).await {
        Ok(Some(record)) => Json(IdempotencyStatusBody {
            exists: true,
            record: Some(record),
        })
        .into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(IdempotencyStatusBody {
                exists: false,
                record: None,
            }),
        )
            .into_response(),
        Err(err) => {
            error!(%key, error = %err, "idempotency status read failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Idempotency store unavailable.",
                correlation(&correlation_id),
            )
        }
    }
}
