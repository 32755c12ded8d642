use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use relay_core::EventRouter;
use server_api::{claimed_identity, load_missions, owned_robots, robot_state, save_missions};
use shared::{
    domain::{ClaimedIdentity, RobotId},
    error::{ApiError, ErrorCode},
    protocol::{
        MissionsResponse, OwnedRobotsResponse, RobotState, SaveMissionsRequest,
        SaveMissionsResponse,
    },
};
use storage::Storage;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod app_state;
mod config;
mod ws;

use app_state::AppState;
use config::{load_settings, prepare_database_url, Settings};

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<ApiError>)>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    let database_url = prepare_database_url(&settings.database_url)?;
    let storage = Storage::with_acquire_timeout(&database_url, settings.cache_timeout())
        .await
        .map_err(|error| {
            error!(
                %database_url,
                %error,
                "failed to open SQLite database; verify parent directory exists and permissions are correct"
            );
            error
        })?;
    let router =
        EventRouter::new(Arc::new(storage.clone())).with_cache_timeout(settings.cache_timeout());

    let state = AppState::new(storage, router);
    let app = build_router(Arc::new(state), &settings);

    let addr: SocketAddr = settings.server_bind.parse()?;
    info!(%addr, "relay listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: Arc<AppState>, settings: &Settings) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/healthz", get(healthz))
        .route("/robots/mine", get(http_owned_robots))
        .route("/robots/:robot_id/state", get(http_robot_state))
        .route("/missions", post(http_save_missions))
        .route("/missions/:robot_id", get(http_load_missions))
        .route("/api/myrobots", get(http_owned_robots))
        .route("/api/robot_state/:robot_id", get(http_robot_state))
        .route("/api/save_missions", post(http_save_missions))
        .route("/api/get_missions/:robot_id", get(http_load_missions))
        .route("/ws", get(ws::ws_handler))
        .layer(DefaultBodyLimit::max(settings.max_body_bytes))
        .layer(cors_layer(settings))
        .with_state(state)
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    if settings.cors_origins.is_empty() {
        return CorsLayer::permissive();
    }
    let origins: Vec<HeaderValue> = settings
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(%origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

async fn root() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "message": "Robot relay is running" }))
}

async fn healthz(State(state): State<Arc<AppState>>) -> (StatusCode, &'static str) {
    match state.storage.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(error) => {
            warn!(%error, "health check failed");
            (StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}

async fn http_owned_robots(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<OwnedRobotsResponse> {
    let identity = identity_from_headers(&headers)?;
    owned_robots(&state.api, &identity)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_robot_state(
    State(state): State<Arc<AppState>>,
    Path(robot_id): Path<String>,
) -> ApiResult<RobotState> {
    robot_state(&state.api, &RobotId(robot_id))
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_save_missions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Result<Json<SaveMissionsRequest>, JsonRejection>,
) -> ApiResult<SaveMissionsResponse> {
    let identity = identity_from_headers(&headers)?;
    let Json(req) = body.map_err(|rejection| reject(ApiError::validation(rejection.body_text())))?;
    save_missions(&state.api, &identity, req)
        .await
        .map(Json)
        .map_err(reject)
}

async fn http_load_missions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(robot_id): Path<String>,
) -> ApiResult<MissionsResponse> {
    let identity = identity_from_headers(&headers)?;
    load_missions(&state.api, &identity, &RobotId(robot_id))
        .await
        .map(Json)
        .map_err(reject)
}

fn identity_from_headers(headers: &HeaderMap) -> Result<ClaimedIdentity, (StatusCode, Json<ApiError>)> {
    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    claimed_identity(authorization).map_err(|err| reject(err.into()))
}

fn reject(err: ApiError) -> (StatusCode, Json<ApiError>) {
    let status = match err.code {
        ErrorCode::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorCode::NotFound => StatusCode::NOT_FOUND,
        ErrorCode::Validation => StatusCode::BAD_REQUEST,
        ErrorCode::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(err))
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;

#[cfg(test)]
#[path = "tests/ws_tests.rs"]
mod ws_tests;
