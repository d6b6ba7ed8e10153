use std::{any::Any, sync::Arc};

use axum::{
    Extension, Json, Router,
    extract::{Query, State, rejection::QueryRejection},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, error, info};

use crate::{
    config::AppConfig,
    error::{ApiError, INTERNAL_ERROR_MESSAGE},
    format::select_format,
    gate::{self, ClientAddress, OriginPolicy, RATE_LIMIT_WINDOW, RateLimiter},
    probe::probe,
    stream::stream,
    validate::{DownloadRequest, Rejection, validate},
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let rate_limiter = RateLimiter::new(config.rate_limit_max, RATE_LIMIT_WINDOW);
        Self {
            config: Arc::new(config),
            rate_limiter: Arc::new(rate_limiter),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DownloadQuery {
    url: Option<String>,
    quality: Option<String>,
}

pub fn build_router(state: AppState) -> Result<Router, ApiError> {
    let origins = OriginPolicy::from_config(&state.config)?;
    let rate_limit = middleware::from_fn_with_state(state.clone(), gate::rate_limit);

    Ok(Router::new()
        .route("/health", get(health).fallback(not_found))
        .route(
            "/api/download",
            get(download).fallback(not_found).route_layer(rate_limit),
        )
        .fallback(not_found)
        .with_state(state)
        .layer(middleware::from_fn_with_state(
            origins.clone(),
            gate::reject_disallowed_origin,
        ))
        .layer(origins.cors_layer())
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http()))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn download(
    State(state): State<AppState>,
    Extension(ClientAddress(client_address)): Extension<ClientAddress>,
    query: Result<Query<DownloadQuery>, QueryRejection>,
) -> Result<Response, ApiError> {
    let Query(query) = query.map_err(|rejection| {
        debug!("Rejected download query: {rejection}");
        ApiError::from(Rejection::MissingUrl)
    })?;

    let accepted = validate(query.url.as_deref(), query.quality.as_deref())?;
    let request = DownloadRequest::new(accepted, client_address);
    info!(
        request_id = %request.id,
        url = %request.url,
        quality = %request.quality,
        ip = %request.client_address,
        "Download requested"
    );

    let format_expression = select_format(request.quality.as_str());
    let metadata = probe(
        &state.config.extractor,
        &request.url,
        state.config.probe_timeout,
    )
    .await;
    debug!(
        request_id = %request.id,
        title = %metadata.title,
        uploader = %metadata.uploader,
        "Metadata resolved"
    );

    stream(
        &request,
        format_expression,
        &metadata,
        &state.config.extractor,
        state.config.max_stream_duration,
    )
    .await
}

async fn not_found() -> ApiError {
    ApiError::not_found("Endpoint not found")
}

fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = panic
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| panic.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Unhandled fault while serving request: {detail}");
    ApiError::internal(INTERNAL_ERROR_MESSAGE).into_response()
}
