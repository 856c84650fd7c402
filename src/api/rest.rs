use crate::config::ApiConfig;
use crate::db::models::{DeliveryRecord, DeliveryStatus, Incident, IncidentTransition, Severity};
use crate::error::Error;
use crate::incidents::{NewIncident, SourceRef};
use crate::ingest::mac::normalize_mac;
use crate::pipeline::{Health, Pipeline};
use crate::sessionizer::PairSessions;
use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use log::info;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

const DEFAULT_DEAD_LETTER_LIMIT: i64 = 100;

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub message: String,
    pub status: u16,
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let status = match err {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidTransition(_) | Error::StateConflict(_) => StatusCode::CONFLICT,
            Error::Validation(_) | Error::Parse(_) | Error::Config(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError {
            message: err.to_string(),
            status: status.as_u16(),
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        if let Some(err) = err.downcast_ref::<Error>() {
            return (*err).clone().into();
        }

        ApiError {
            message: err.to_string(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
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

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub tag: Option<String>,
    pub device: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateIncidentRequest {
    pub title: String,
    pub description: Option<String>,
    pub severity: Severity,
    #[serde(default)]
    pub media_refs: Vec<String>,
    pub actor: String,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub actor: String,
    pub note: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MediaRequest {
    pub reference: String,
    pub actor: String,
}

#[derive(Debug, Serialize)]
pub struct IncidentView {
    #[serde(flatten)]
    pub incident: Incident,
    pub transitions: Vec<IncidentTransition>,
}

pub struct RestApi {
    config: ApiConfig,
    pipeline: Arc<Pipeline>,
}

impl RestApi {
    pub fn new(config: &ApiConfig, pipeline: Arc<Pipeline>) -> Result<Self> {
        Ok(Self {
            config: config.clone(),
            pipeline,
        })
    }

    pub fn router(&self) -> Router {
        let state = AppState {
            pipeline: Arc::clone(&self.pipeline),
        };

        use std::time::Duration;
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
            .allow_credentials(false)
            .max_age(Duration::from_secs(3600));

        Router::new()
            .route("/health", get(health))
            .route("/api/sessions", get(list_sessions))
            .route("/api/deliveries/dead-letters", get(dead_letters))
            .route("/api/incidents", post(create_incident))
            .route("/api/incidents/:id", get(get_incident))
            .route("/api/incidents/:id/acknowledge", post(acknowledge_incident))
            .route("/api/incidents/:id/resolve", post(resolve_incident))
            .route("/api/incidents/:id/media", post(attach_media))
            .with_state(state)
            .layer(cors)
    }

    /// Serve until `cancel` fires
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let app = self.router();

        let addr = self.config.address.clone() + ":" + &self.config.port.to_string();
        let addr: SocketAddr = addr.parse()?;

        info!("API server listening on {}", addr);

        let listener = TcpListener::bind(addr).await?;

        axum::Server::from_tcp(listener.into_std()?)?
            .serve(app.into_make_service())
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        Ok(())
    }
}

async fn health(State(state): State<AppState>) -> Json<Health> {
    Json(state.pipeline.health().await)
}

fn canonical_mac(raw: Option<String>, field: &str) -> ApiResult<Option<String>> {
    match raw {
        None => Ok(None),
        Some(raw) => normalize_mac(&raw)
            .map(Some)
            .ok_or_else(|| Error::Validation(format!("invalid {} MAC: {}", field, raw)).into()),
    }
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(query): Query<SessionQuery>,
) -> ApiResult<Json<Vec<PairSessions>>> {
    let tag = canonical_mac(query.tag, "tag")?;
    let device = canonical_mac(query.device, "device")?;
    let sessions = state
        .pipeline
        .sessionizer()
        .snapshot(tag.as_deref(), device.as_deref(), Utc::now());
    Ok(Json(sessions))
}

async fn dead_letters(
    State(state): State<AppState>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Json<Vec<DeliveryRecord>>> {
    let limit = query.limit.unwrap_or(DEFAULT_DEAD_LETTER_LIMIT).clamp(1, 1000);
    let records = state
        .pipeline
        .store()
        .delivery_records(Some(DeliveryStatus::DeadLettered), limit)
        .await?;
    Ok(Json(records))
}

async fn create_incident(
    State(state): State<AppState>,
    Json(request): Json<CreateIncidentRequest>,
) -> ApiResult<(StatusCode, Json<Incident>)> {
    let outcome = state
        .pipeline
        .incidents()
        .create(
            NewIncident {
                title: request.title,
                description: request.description,
                severity: request.severity,
                source: SourceRef::Manual,
                media_refs: request.media_refs,
                actor: request.actor,
            },
            Utc::now(),
        )
        .await?;
    info!("Manual incident {} created", outcome.incident().id);
    Ok((StatusCode::CREATED, Json(outcome.incident().clone())))
}

async fn get_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<IncidentView>> {
    let incidents = state.pipeline.incidents();
    let incident = incidents.get(id).await?;
    let transitions = incidents.transitions(id).await?;
    Ok(Json(IncidentView {
        incident,
        transitions,
    }))
}

async fn acknowledge_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> ApiResult<Json<Incident>> {
    let incident = state
        .pipeline
        .incidents()
        .acknowledge(id, &request.actor, request.note)
        .await?;
    Ok(Json(incident))
}

async fn resolve_incident(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<TransitionRequest>,
) -> ApiResult<Json<Incident>> {
    let incident = state
        .pipeline
        .incidents()
        .resolve(id, &request.actor, request.note)
        .await?;
    Ok(Json(incident))
}

async fn attach_media(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(request): Json<MediaRequest>,
) -> ApiResult<Json<Incident>> {
    let incident = state
        .pipeline
        .incidents()
        .attach_media(id, &request.reference, &request.actor)
        .await?;
    Ok(Json(incident))
}
