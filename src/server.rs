//! Bounty Board HTTP server
//!
//! JSON API over the board, the session registry and the notification hub.
//! Identity comes from the gateway via [`Caller`]; proofs arrive as
//! multipart uploads; alerts stream to clients as server-sent events.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, Multipart, Path, Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post, put},
    Json, Router,
};
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::Caller;
use crate::blob::ProofUpload;
use crate::board::{Approval, BountyBoard, BountyView};
use crate::config::ServerConfig;
use crate::error::BountyError;
use crate::ledger::Settlement;
use crate::notifications::{HubMessage, NotificationHub};
use crate::session::{SessionId, SessionRegistry};
use crate::types::{
    ActivePeriod, Bounty, BountyFilter, BountyStatus, Confirmation, NewBounty, NotificationEvent,
    SessionMembership, User,
};

/// Multipart overhead allowed on top of the proof itself.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

pub struct AppState {
    pub board: Arc<BountyBoard>,
    pub sessions: Arc<SessionRegistry>,
    pub hub: NotificationHub,
    pub max_proof_bytes: usize,
    pub started_at: std::time::Instant,
}

type ApiResult<T> = Result<Json<T>, BountyError>;

impl IntoResponse for BountyError {
    fn into_response(self) -> Response {
        let status = match &self {
            BountyError::InvalidFormat(_) => StatusCode::BAD_REQUEST,
            BountyError::InvalidTransition(_) => StatusCode::CONFLICT,
            BountyError::NotFound { .. } => StatusCode::NOT_FOUND,
            BountyError::UpstreamFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            BountyError::PartialAward { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("Request failed: {}", self);
        }
        (
            status,
            Json(serde_json::json!({ "error": self.to_string(), "kind": self.kind() })),
        )
            .into_response()
    }
}

pub fn create_router(state: Arc<AppState>) -> Router {
    let body_limit = state.max_proof_bytes + FORM_OVERHEAD_BYTES;

    Router::new()
        .route("/health", get(health_handler))
        .route("/users/me", put(register_user_handler))
        .route("/users/:id", get(get_user_handler))
        .route("/bounties", get(list_bounties_handler).post(create_bounty_handler))
        .route("/bounties/:id", get(view_bounty_handler))
        .route(
            "/bounties/:id/confirmations",
            get(list_confirmations_handler).post(submit_confirmation_handler),
        )
        .route(
            "/bounties/:id/confirmations/:cid/approve",
            post(approve_handler),
        )
        .route(
            "/bounties/:id/confirmations/:cid/reject",
            post(reject_handler),
        )
        .route("/confirmations/:cid/settle", post(settle_handler))
        .route(
            "/session",
            get(get_session_handler)
                .put(set_session_handler)
                .delete(clear_session_handler),
        )
        .route("/notifications", get(pending_notifications_handler))
        .route("/notifications/stream", get(notification_stream_handler))
        .route("/notifications/:bounty_id", delete(dismiss_notification_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ============================================================================
// HEALTH
// ============================================================================

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub uptime_secs: u64,
    pub version: String,
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        healthy: true,
        uptime_secs: state.started_at.elapsed().as_secs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============================================================================
// USERS
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct RegisterUserRequest {
    pub username: String,
    #[serde(default)]
    pub role: Option<String>,
}

async fn register_user_handler(
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
    Json(request): Json<RegisterUserRequest>,
) -> ApiResult<User> {
    let mut user = User::new(user_id, request.username.trim());
    if let Some(role) = request.role.filter(|r| !r.trim().is_empty()) {
        user.role = role;
    }
    state.board.register_user(&user).await.map(Json)
}

async fn get_user_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<User> {
    state.board.load_user(id).await.map(Json)
}

// ============================================================================
// BOUNTIES
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub filter: BountyFilter,
}

async fn list_bounties_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Vec<Bounty>> {
    state.board.list_bounties(query.filter).await.map(Json)
}

async fn create_bounty_handler(
    State(state): State<Arc<AppState>>,
    Caller(reporter_id): Caller,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Bounty>), BountyError> {
    let form = ProofForm::read(multipart).await?;
    let new = form.new_bounty()?;
    let bounty = state
        .board
        .create_bounty(reporter_id, new, form.proof)
        .await?;
    Ok((StatusCode::CREATED, Json(bounty)))
}

async fn view_bounty_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<BountyView> {
    state.board.view_bounty(id).await.map(Json)
}

// ============================================================================
// CONFIRMATIONS
// ============================================================================

async fn list_confirmations_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> ApiResult<Vec<Confirmation>> {
    state.board.get_bounty(id).await?;
    state.board.list_confirmations(id).await.map(Json)
}

async fn submit_confirmation_handler(
    State(state): State<Arc<AppState>>,
    Caller(hunter_id): Caller,
    Path(id): Path<Uuid>,
    multipart: Multipart,
) -> Result<(StatusCode, Json<Confirmation>), BountyError> {
    let mut form = ProofForm::read(multipart).await?;
    let proof = form
        .proof
        .take()
        .ok_or_else(|| BountyError::InvalidFormat("a proof screenshot is required".to_string()))?;

    // Without an explicit session the hunter's current duty session is used.
    let session_id = match form.text("session_id") {
        Some(raw) => raw.to_string(),
        None => state
            .sessions
            .cached_active_session(hunter_id)
            .await?
            .map(|m| m.session_id.to_string())
            .ok_or_else(|| {
                BountyError::InvalidFormat("session_id is required when not on duty".to_string())
            })?,
    };

    let confirmation = state
        .board
        .submit_confirmation_by_id(id, hunter_id, &session_id, proof)
        .await?;
    Ok((StatusCode::CREATED, Json(confirmation)))
}

async fn approve_handler(
    State(state): State<Arc<AppState>>,
    Caller(reporter_id): Caller,
    Path((id, cid)): Path<(Uuid, Uuid)>,
) -> ApiResult<Approval> {
    state.board.approve_by_id(id, cid, reporter_id).await.map(Json)
}

#[derive(Debug, Serialize)]
pub struct RejectResponse {
    pub bounty_id: Uuid,
    pub confirmation_id: Uuid,
    pub status: BountyStatus,
}

async fn reject_handler(
    State(state): State<Arc<AppState>>,
    Caller(reporter_id): Caller,
    Path((id, cid)): Path<(Uuid, Uuid)>,
) -> ApiResult<RejectResponse> {
    let status = state.board.reject_by_id(id, cid, reporter_id).await?;
    Ok(Json(RejectResponse {
        bounty_id: id,
        confirmation_id: cid,
        status,
    }))
}

async fn settle_handler(
    State(state): State<Arc<AppState>>,
    Path(cid): Path<Uuid>,
) -> ApiResult<Settlement> {
    state.board.settle_awards(cid).await.map(Json)
}

// ============================================================================
// SESSION
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

async fn get_session_handler(
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
) -> ApiResult<Option<SessionMembership>> {
    state.sessions.get_active_session(user_id).await.map(Json)
}

async fn set_session_handler(
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
    Json(request): Json<SessionRequest>,
) -> ApiResult<SessionId> {
    state
        .sessions
        .set_active_session(user_id, &request.session_id)
        .await
        .map(Json)
}

async fn clear_session_handler(
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
    Query(request): Query<SessionRequest>,
) -> Result<StatusCode, BountyError> {
    if state
        .sessions
        .clear_active_session(user_id, &request.session_id)
        .await?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(BountyError::not_found("session", request.session_id))
    }
}

// ============================================================================
// NOTIFICATIONS
// ============================================================================

async fn pending_notifications_handler(
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
) -> Json<Vec<NotificationEvent>> {
    Json(state.hub.pending(user_id))
}

async fn dismiss_notification_handler(
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
    Path(bounty_id): Path<Uuid>,
) -> Result<StatusCode, BountyError> {
    if state.hub.dismiss(user_id, bounty_id) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(BountyError::not_found("notification", bounty_id))
    }
}

/// Alerts already showing, then live alerts and dismissals.
async fn notification_stream_handler(
    State(state): State<Arc<AppState>>,
    Caller(user_id): Caller,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let live = state.hub.subscribe(user_id);
    let backlog: Vec<HubMessage> = state
        .hub
        .pending(user_id)
        .into_iter()
        .map(HubMessage::Alert)
        .collect();
    info!("User {} connected to the alert stream", user_id);

    let live = stream::unfold(live, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(message) => return Some((message, rx)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!("Alert stream lagged, skipped {} messages", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });

    let events = stream::iter(backlog)
        .chain(live)
        .filter_map(|message| async move { sse_event(&message) })
        .map(Ok);

    Sse::new(events).keep_alive(KeepAlive::default())
}

fn sse_event(message: &HubMessage) -> Option<Event> {
    let name = match message {
        HubMessage::Alert(_) => "alert",
        HubMessage::Dismissed { .. } => "dismissed",
    };
    match Event::default().event(name).json_data(message) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!("Could not encode alert: {}", e);
            None
        }
    }
}

// ============================================================================
// MULTIPART
// ============================================================================

/// Text fields plus an optional `proof` file.
#[derive(Debug, Default)]
struct ProofForm {
    fields: HashMap<String, String>,
    proof: Option<ProofUpload>,
}

impl ProofForm {
    async fn read(mut multipart: Multipart) -> Result<Self, BountyError> {
        let mut form = Self::default();
        while let Some(field) = multipart.next_field().await.map_err(bad_form)? {
            let name = field.name().unwrap_or_default().to_string();
            if name == "proof" {
                let file_name = field.file_name().unwrap_or("proof").to_string();
                let content_type = field
                    .content_type()
                    .unwrap_or("application/octet-stream")
                    .to_string();
                let bytes = field.bytes().await.map_err(bad_form)?;
                form.proof = Some(ProofUpload {
                    file_name,
                    content_type,
                    bytes: bytes.to_vec(),
                });
            } else {
                let value = field.text().await.map_err(bad_form)?;
                form.fields.insert(name, value);
            }
        }
        Ok(form)
    }

    fn text(&self, name: &str) -> Option<&str> {
        self.fields
            .get(name)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    fn new_bounty(&self) -> Result<NewBounty, BountyError> {
        let time_left_when_killed = self
            .text("time_left_when_killed")
            .map(|v| {
                v.parse::<i32>().map_err(|_| {
                    BountyError::InvalidFormat(format!("time_left_when_killed '{}' is not a number", v))
                })
            })
            .transpose()?;
        let active_period = self
            .text("active_period")
            .map(str::parse::<ActivePeriod>)
            .transpose()?
            .unwrap_or_default();

        Ok(NewBounty {
            session_id: self.text("session_id").unwrap_or_default().to_string(),
            target_name: self.text("target_name").unwrap_or_default().to_string(),
            last_location: self.text("last_location").unwrap_or_default().to_string(),
            description: self.text("description").map(str::to_string),
            reward_offer: self.text("reward_offer").map(str::to_string),
            time_left_when_killed,
            active_period,
        })
    }
}

fn bad_form(err: axum::extract::multipart::MultipartError) -> BountyError {
    BountyError::InvalidFormat(format!("malformed upload: {}", err))
}

/// Run the server
pub async fn run_server(config: &ServerConfig, state: AppState) -> anyhow::Result<()> {
    let app = create_router(Arc::new(state));
    let addr = format!("{}:{}", config.host, config.port);

    info!("Starting Bounty Board server on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
