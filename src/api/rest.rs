use crate::config::{ApiConfig, EventDefinition, StreamConfig};
use crate::db::models::EventRow;
use crate::db::EventStore;
use crate::error::Error;
use crate::pipeline::{PipelineController, PipelineStatus};
use anyhow::Result;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<PipelineController>,
    pub store: Arc<dyn EventStore>,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub status: u16,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        match err {
            Error::AlreadyRunning => ApiError {
                message: err.to_string(),
                status: StatusCode::CONFLICT.as_u16(),
            },
            Error::Config(_) => ApiError {
                message: err.to_string(),
                status: StatusCode::UNPROCESSABLE_ENTITY.as_u16(),
            },
            Error::Database(_) | Error::Store(_) => ApiError {
                message: err.to_string(),
                status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            },
            _ => ApiError {
                message: err.to_string(),
                status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let body = Json(self);
        (status, body).into_response()
    }
}

/// Body for POST /api/pipeline/start.
#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub rtsp_url: String,
    pub chunk_duration: u64,
    pub output_dir: PathBuf,
    pub model: String,
    pub base_url: String,
    pub context: String,
    pub events: Vec<EventDefinition>,
    #[serde(default)]
    pub frames_per_chunk: Option<usize>,
    #[serde(default)]
    pub max_frame_height: Option<u32>,
    #[serde(default)]
    pub api_key: Option<String>,
}

impl StartRequest {
    fn into_parts(self) -> (StreamConfig, Vec<EventDefinition>) {
        let config = StreamConfig {
            source_url: self.rtsp_url,
            chunk_duration_secs: self.chunk_duration,
            output_dir: self.output_dir,
            frames_per_chunk: self.frames_per_chunk.unwrap_or(9),
            max_frame_height: self.max_frame_height.unwrap_or(720),
            model: self.model,
            base_url: self.base_url,
            api_key: self.api_key,
            context: self.context,
        };
        (config, self.events)
    }
}

#[derive(Debug, Serialize)]
pub struct StartResponse {
    pub run_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    #[serde(default = "default_events_limit")]
    pub limit: i64,
}

fn default_events_limit() -> i64 {
    50
}

pub struct RestApi {
    config: ApiConfig,
    state: AppState,
}

impl RestApi {
    pub fn new(
        config: &ApiConfig,
        controller: Arc<PipelineController>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        Self {
            config: config.clone(),
            state: AppState { controller, store },
        }
    }

    pub async fn run(&self) -> Result<()> {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .allow_credentials(false)
            .max_age(Duration::from_secs(3600));

        let app = Router::new()
            .route("/api/pipeline/start", post(start_pipeline))
            .route("/api/pipeline/stop", post(stop_pipeline))
            .route("/api/pipeline/status", get(pipeline_status))
            .route("/api/events", get(recent_events))
            .with_state(self.state.clone())
            .layer(cors);

        let addr = self.config.address.clone() + ":" + &self.config.port.to_string();
        let addr: SocketAddr = addr.parse()?;

        info!("API server listening on {}", addr);

        let listener = TcpListener::bind(addr).await?;
        axum::Server::from_tcp(listener.into_std()?)?
            .serve(app.into_make_service())
            .await?;

        Ok(())
    }
}

async fn start_pipeline(
    State(state): State<AppState>,
    Json(request): Json<StartRequest>,
) -> ApiResult<Json<StartResponse>> {
    let (config, definitions) = request.into_parts();
    let run_id = state.controller.start(config, definitions).await?;
    Ok(Json(StartResponse { run_id }))
}

async fn stop_pipeline(State(state): State<AppState>) -> ApiResult<Json<PipelineStatus>> {
    state.controller.stop().await?;
    Ok(Json(state.controller.status()))
}

async fn pipeline_status(State(state): State<AppState>) -> Json<PipelineStatus> {
    Json(state.controller.status())
}

async fn recent_events(
    State(state): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> ApiResult<Json<Vec<EventRow>>> {
    let events = state.store.recent(query.limit.clamp(1, 1000)).await?;
    Ok(Json(events))
}
