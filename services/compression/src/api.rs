//! HTTP surface: upload and lookup routes plus the cross-cutting layers
//! (security headers, CORS, body limit, rate limiting, tracing).

use crate::config::{ApiConfig, Environment};
use crate::error::{AppError, ErrorResponse, REDACTED_MESSAGE};
use crate::models::ImageRecord;
use crate::orchestrator::{UploadPipeline, UploadRequest, UploadedFile};
use crate::rate_limit::{self, RateLimiter};
use anyhow::{Context, Result};
use axum::{
    extract::{
        multipart::{MultipartError, MultipartRejection},
        DefaultBodyLimit, Multipart, Path, State,
    },
    http::{header, HeaderValue, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

const IMAGE_FIELD: &str = "image";
const QUALITY_FIELD: &str = "quality";
const HSTS_VALUE: &str = "max-age=31536000; includeSubDomains";

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<UploadPipeline>,
    pub environment: Environment,
}

type ApiResult<T> = Result<T, (StatusCode, Json<ErrorResponse>)>;

impl AppState {
    pub fn new(pipeline: Arc<UploadPipeline>, environment: Environment) -> Self {
        Self {
            pipeline,
            environment,
        }
    }

    /// Map an error to its response, logging server-side failures
    fn reject(&self, err: AppError) -> (StatusCode, Json<ErrorResponse>) {
        let status = err.status();
        if status.is_server_error() {
            error!(error = %err, code = err.code(), "Request failed");
        } else {
            debug!(error = %err, code = err.code(), "Request rejected");
        }

        (
            status,
            Json(err.to_response(self.environment.is_production())),
        )
    }
}

/// Create the API router
pub fn create_router(
    state: AppState,
    config: &ApiConfig,
    limiter: Option<Arc<dyn RateLimiter>>,
) -> Router {
    let production = state.environment.is_production();

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let mut router = Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route("/api/images/upload", post(upload_image))
        .route("/api/images/:id", get(get_image))
        .layer(DefaultBodyLimit::max(config.body_limit_bytes));

    if let Some(limiter) = limiter {
        router = router.layer(middleware::from_fn_with_state(
            limiter,
            rate_limit::rate_limit,
        ));
    }

    router = router
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(SetResponseHeaderLayer::overriding(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            header::X_XSS_PROTECTION,
            HeaderValue::from_static("1; mode=block"),
        ));

    if production {
        router = router.layer(SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(HSTS_VALUE),
        ));
    }

    router.with_state(state)
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "compression-service"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    match state.pipeline.repository().ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => {
            let error = format!("{e:#}");
            warn!(error = %error, "Readiness check failed");

            let detail = if state.environment.is_production() {
                REDACTED_MESSAGE.to_string()
            } else {
                error
            };

            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(serde_json::json!({
                    "status": "not_ready",
                    "database": "disconnected",
                    "error": detail
                })),
            )
        }
    }
}

/// Accept a multipart upload and run it through the pipeline
#[instrument(skip(state, multipart))]
async fn upload_image(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> ApiResult<(StatusCode, Json<ImageRecord>)> {
    let request = match multipart {
        Ok(multipart) => read_upload(multipart)
            .await
            .map_err(|e| state.reject(e))?,
        Err(rejection) => {
            // Not a multipart body, so there is no file
            debug!(reason = %rejection.body_text(), "Upload without multipart body");
            UploadRequest::default()
        }
    };

    let record = state
        .pipeline
        .process(request)
        .await
        .map_err(|e| state.reject(e))?;

    Ok((StatusCode::CREATED, Json(record)))
}

/// Collect the `image` file part and `quality` text part
async fn read_upload(mut multipart: Multipart) -> Result<UploadRequest, AppError> {
    let mut request = UploadRequest::default();

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();

        match name.as_str() {
            IMAGE_FIELD if request.file.is_none() => {
                let content_type = field.content_type().map(str::to_string);
                let file_name = field.file_name().map(str::to_string);
                let data = field.bytes().await.map_err(multipart_error)?;

                request.file = Some(UploadedFile {
                    data,
                    content_type,
                    file_name,
                });
            }
            QUALITY_FIELD => {
                request.quality = Some(field.text().await.map_err(multipart_error)?);
            }
            _ => {
                debug!(field = %name, "Ignoring multipart field");
            }
        }
    }

    Ok(request)
}

fn multipart_error(err: MultipartError) -> AppError {
    AppError::client_input(format!("Invalid upload body: {}", err.body_text()))
}

/// Fetch a stored image record
#[instrument(skip(state))]
async fn get_image(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<ImageRecord>> {
    // Ids that cannot exist are reported the same way as missing ones
    let id = Uuid::parse_str(&id).map_err(|_| state.reject(AppError::not_found("Image not found")))?;

    let record = state
        .pipeline
        .repository()
        .get(id)
        .await
        .context("Failed to fetch image record")
        .map_err(|e| state.reject(e.into()))?;

    match record {
        Some(record) => Ok(Json(record)),
        None => Err(state.reject(AppError::not_found("Image not found"))),
    }
}

/// Start the API server and serve until `shutdown` resolves
pub async fn start_api_server<F>(
    state: AppState,
    config: &ApiConfig,
    limiter: Option<Arc<dyn RateLimiter>>,
    shutdown: F,
) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let environment = state.environment;
    let router = create_router(state, config, limiter);
    let addr = format!("{}:{}", config.host, config.port);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!(
        address = %addr,
        environment = environment.as_str(),
        "Starting compression API server"
    );

    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("API server error")?;

    info!("API server stopped accepting connections");

    Ok(())
}
