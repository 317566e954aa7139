use std::str::FromStr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{FromRequestParts, Path, State},
    http::{StatusCode, request::Parts},
    response::{IntoResponse, Response},
    routing::{delete, get, patch, post, put},
};
use serde::Deserialize;
use tokio::sync::broadcast;

use super::db::DbHandle;
use super::models::LabelColor;
use super::reconcile::{ActionResult, BoardSnapshot, reconcile_board};
use super::ws::{BoardEvent, broadcast_event};
use crate::errors::BoardError;

// ── Shared application state ──────────────────────────────────────────

pub struct AppState {
    pub db: DbHandle,
    pub events: broadcast::Sender<String>,
}

pub type SharedState = Arc<AppState>;

// ── Caller identity ───────────────────────────────────────────────────

/// Authenticated caller id, resolved by the upstream auth layer and passed
/// in the `x-user-id` header. This service never issues or validates
/// credentials itself.
pub struct Identity(pub String);

/// Like [`Identity`] but absence is not a rejection. Used by the layout
/// endpoint, whose contract reports authentication failure in the result
/// body instead of via status code.
pub struct MaybeIdentity(pub Option<String>);

fn identity_from_parts(parts: &Parts) -> Option<String> {
    parts
        .headers
        .get("x-user-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

impl<S> FromRequestParts<S> for Identity
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        identity_from_parts(parts)
            .map(Identity)
            .ok_or_else(|| ApiError::Unauthorized("User is not authenticated".into()))
    }
}

impl<S> FromRequestParts<S> for MaybeIdentity
where
    S: Send + Sync,
{
    type Rejection = std::convert::Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        Ok(MaybeIdentity(identity_from_parts(parts)))
    }
}

// ── Request payload types ─────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateBoardRequest {
    pub title: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateBoardRequest {
    pub title: Option<String>,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct BackgroundRequest {
    pub url: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateColumnRequest {
    pub title: String,
}

#[derive(Deserialize)]
pub struct RenameColumnRequest {
    pub title: String,
}

#[derive(Deserialize)]
pub struct CreateTaskRequest {
    pub title: String,
    pub description: Option<String>,
}

#[derive(Deserialize)]
pub struct UpdateTaskRequest {
    pub title: Option<String>,
    pub description: Option<String>,
    pub start_date: Option<String>,
    pub due_date: Option<String>,
}

#[derive(Deserialize)]
pub struct CreateLabelRequest {
    pub title: Option<String>,
    pub color: String,
}

#[derive(Deserialize)]
pub struct CommentRequest {
    pub content: String,
}

#[derive(Deserialize)]
pub struct CreateChecklistRequest {
    pub title: String,
}

#[derive(Deserialize)]
pub struct AddChecklistItemRequest {
    pub content: String,
}

#[derive(Deserialize)]
pub struct UpdateChecklistItemRequest {
    pub is_checked: bool,
}

// ── Error handling ────────────────────────────────────────────────────

pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unauthorized(String),
    Forbidden(String),
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unauthorized(msg) => (StatusCode::UNAUTHORIZED, msg),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error".to_string(),
            ),
        };
        (status, Json(serde_json::json!({"error": message}))).into_response()
    }
}

/// Map a persistence-layer error onto an HTTP response. Domain errors keep
/// their message; anything else is logged in full and reported generically.
fn map_db_err(e: anyhow::Error) -> ApiError {
    match e.downcast_ref::<BoardError>() {
        Some(
            BoardError::BoardNotFound { .. }
            | BoardError::ColumnNotFound { .. }
            | BoardError::TaskNotFound { .. }
            | BoardError::LabelNotFound { .. }
            | BoardError::ChecklistNotFound { .. },
        ) => ApiError::NotFound(e.to_string()),
        Some(BoardError::NotBoardOwner { .. }) => ApiError::Forbidden(e.to_string()),
        Some(BoardError::BadRequest(msg)) => ApiError::BadRequest(msg.clone()),
        _ => {
            tracing::error!("Database error: {e:#}");
            ApiError::Internal
        }
    }
}

// ── Router ────────────────────────────────────────────────────────────

pub fn api_router() -> Router<SharedState> {
    Router::new()
        .route("/api/boards", get(list_boards).post(create_board))
        .route(
            "/api/boards/{id}",
            get(get_board).patch(update_board).delete(delete_board),
        )
        .route("/api/boards/{id}/background", patch(set_board_background))
        .route("/api/boards/{id}/layout", put(update_board_layout))
        .route("/api/boards/{id}/favorite", post(toggle_favorite))
        .route("/api/boards/{id}/columns", post(create_column))
        .route(
            "/api/boards/{id}/labels",
            get(list_board_labels).post(create_label),
        )
        .route(
            "/api/columns/{id}",
            patch(rename_column).delete(delete_column),
        )
        .route("/api/columns/{id}/tasks", post(create_task))
        .route(
            "/api/tasks/{id}",
            get(get_task).patch(update_task).delete(delete_task),
        )
        .route(
            "/api/tasks/{id}/labels/{label_id}",
            put(attach_label).delete(detach_label),
        )
        .route("/api/tasks/{id}/comments", post(add_comment))
        .route("/api/tasks/{id}/checklists", post(create_checklist))
        .route("/api/checklists/{id}", delete(delete_checklist))
        .route("/api/checklists/{id}/items", post(add_checklist_item))
        .route(
            "/api/checklist-items/{id}",
            patch(update_checklist_item).delete(delete_checklist_item),
        )
        .route("/api/activities/{id}", delete(delete_activity))
        .route("/health", get(health_check))
}

// ── Handlers ──────────────────────────────────────────────────────────

async fn health_check() -> &'static str {
    "ok"
}

async fn list_boards(
    State(state): State<SharedState>,
    Identity(user_id): Identity,
) -> Result<impl IntoResponse, ApiError> {
    let summaries = state
        .db
        .call(move |db| db.list_board_summaries(&user_id))
        .await
        .map_err(map_db_err)?;
    Ok(Json(summaries))
}

async fn create_board(
    State(state): State<SharedState>,
    Identity(user_id): Identity,
    Json(req): Json<CreateBoardRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = req.title.trim().to_string();
    if title.is_empty() {
        return Err(ApiError::BadRequest("Board title is required".into()));
    }
    let description = req.description;
    let board = state
        .db
        .call(move |db| db.create_board(&user_id, &title, description.as_deref()))
        .await
        .map_err(map_db_err)?;
    broadcast_event(
        &state.events,
        &BoardEvent::BoardCreated {
            board: board.clone(),
        },
    );
    Ok((StatusCode::CREATED, Json(board)))
}

async fn get_board(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let details = state
        .db
        .call(move |db| db.get_board_details(&lookup))
        .await
        .map_err(map_db_err)?;
    match details {
        Some(details) => Ok(Json(details)),
        None => Err(ApiError::NotFound(format!("Board {} not found", id))),
    }
}

async fn update_board(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(id): Path<String>,
    Json(req): Json<UpdateBoardRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let board_id = id.clone();
    let board = state
        .db
        .call(move |db| db.update_board(&id, req.title.as_deref(), req.description.as_deref()))
        .await
        .map_err(map_db_err)?;
    broadcast_event(&state.events, &BoardEvent::BoardChanged { board_id });
    Ok(Json(board))
}

async fn set_board_background(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(id): Path<String>,
    Json(req): Json<BackgroundRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let board_id = id.clone();
    let url = req.url.filter(|u| !u.trim().is_empty());
    let board = state
        .db
        .call(move |db| db.set_board_background(&id, url.as_deref()))
        .await
        .map_err(map_db_err)?;
    broadcast_event(&state.events, &BoardEvent::BoardChanged { board_id });
    Ok(Json(board))
}

async fn delete_board(
    State(state): State<SharedState>,
    Identity(user_id): Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let board_id = id.clone();
    state
        .db
        .call(move |db| db.delete_board(&id, &user_id))
        .await
        .map_err(map_db_err)?;
    broadcast_event(&state.events, &BoardEvent::BoardDeleted { board_id });
    Ok(StatusCode::NO_CONTENT)
}

async fn toggle_favorite(
    State(state): State<SharedState>,
    Identity(user_id): Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let is_favorited = state
        .db
        .call(move |db| db.toggle_favorite(&user_id, &id))
        .await
        .map_err(map_db_err)?;
    Ok(Json(serde_json::json!({"is_favorited": is_favorited})))
}

/// Persist the client's drag-and-drop layout for a board.
///
/// Unlike the other endpoints this one always answers 200 with an
/// `ActionResult` body; authentication and persistence failures are
/// reported there.
async fn update_board_layout(
    State(state): State<SharedState>,
    MaybeIdentity(identity): MaybeIdentity,
    Path(id): Path<String>,
    Json(snapshot): Json<BoardSnapshot>,
) -> Json<ActionResult> {
    let result = reconcile_board(
        &state.db,
        &state.events,
        identity.as_deref(),
        &id,
        snapshot,
    )
    .await;
    Json(result)
}

async fn create_column(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(board_id): Path<String>,
    Json(req): Json<CreateColumnRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = req.title.trim().to_string();
    if title.is_empty() {
        return Err(ApiError::BadRequest("Column title is required".into()));
    }
    let changed_board = board_id.clone();
    let column = state
        .db
        .call(move |db| db.create_column(&board_id, &title))
        .await
        .map_err(map_db_err)?;
    broadcast_event(
        &state.events,
        &BoardEvent::BoardChanged {
            board_id: changed_board,
        },
    );
    Ok((StatusCode::CREATED, Json(column)))
}

async fn rename_column(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(id): Path<String>,
    Json(req): Json<RenameColumnRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let column = state
        .db
        .call(move |db| db.rename_column(&id, &req.title))
        .await
        .map_err(map_db_err)?;
    broadcast_event(
        &state.events,
        &BoardEvent::BoardChanged {
            board_id: column.board_id.clone(),
        },
    );
    Ok(Json(column))
}

async fn delete_column(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .db
        .call(move |db| db.delete_column(&id))
        .await
        .map_err(map_db_err)?;
    match deleted {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ApiError::NotFound("Column not found".into())),
    }
}

async fn create_task(
    State(state): State<SharedState>,
    Identity(user_id): Identity,
    Path(column_id): Path<String>,
    Json(req): Json<CreateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let title = req.title.trim().to_string();
    if title.is_empty() {
        return Err(ApiError::BadRequest("Task title is required".into()));
    }
    let description = req.description;
    let task = state
        .db
        .call(move |db| db.create_task(&user_id, &column_id, &title, description.as_deref()))
        .await
        .map_err(map_db_err)?;
    broadcast_event(&state.events, &BoardEvent::TaskCreated { task: task.clone() });
    Ok((StatusCode::CREATED, Json(task)))
}

async fn get_task(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let lookup = id.clone();
    let detail = state
        .db
        .call(move |db| db.get_task_detail(&lookup))
        .await
        .map_err(map_db_err)?;
    match detail {
        Some(detail) => Ok(Json(detail)),
        None => Err(ApiError::NotFound(format!("Task {} not found", id))),
    }
}

async fn update_task(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(id): Path<String>,
    Json(req): Json<UpdateTaskRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let task = state
        .db
        .call(move |db| {
            db.update_task(
                &id,
                req.title.as_deref(),
                req.description.as_deref(),
                req.start_date.as_deref(),
                req.due_date.as_deref(),
            )
        })
        .await
        .map_err(map_db_err)?;
    Ok(Json(task))
}

async fn delete_task(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .db
        .call(move |db| db.delete_task(&id))
        .await
        .map_err(map_db_err)?;
    match deleted {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ApiError::NotFound("Task not found".into())),
    }
}

async fn list_board_labels(
    State(state): State<SharedState>,
    Path(board_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let labels = state
        .db
        .call(move |db| db.list_labels(&board_id))
        .await
        .map_err(map_db_err)?;
    Ok(Json(labels))
}

async fn create_label(
    State(state): State<SharedState>,
    Identity(user_id): Identity,
    Path(board_id): Path<String>,
    Json(req): Json<CreateLabelRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let color = LabelColor::from_str(&req.color).map_err(ApiError::BadRequest)?;
    let title = req.title;
    let label = state
        .db
        .call(move |db| db.create_label(&board_id, &user_id, title.as_deref(), &color))
        .await
        .map_err(map_db_err)?;
    Ok((StatusCode::CREATED, Json(label)))
}

async fn delete_label(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .db
        .call(move |db| db.delete_label(&id))
        .await
        .map_err(map_db_err)?;
    match deleted {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ApiError::NotFound("Label not found".into())),
    }
}

async fn attach_label(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path((task_id, label_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .db
        .call(move |db| db.add_label_to_task(&task_id, &label_id))
        .await
        .map_err(map_db_err)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn detach_label(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path((task_id, label_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    let removed = state
        .db
        .call(move |db| db.remove_label_from_task(&task_id, &label_id))
        .await
        .map_err(map_db_err)?;
    match removed {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ApiError::NotFound("Label is not attached".into())),
    }
}

async fn add_comment(
    State(state): State<SharedState>,
    Identity(user_id): Identity,
    Path(task_id): Path<String>,
    Json(req): Json<CommentRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let content = req.content.trim().to_string();
    if content.is_empty() {
        return Err(ApiError::BadRequest("Comment content is required".into()));
    }
    let activity = state
        .db
        .call(move |db| db.add_comment(&user_id, &task_id, &content))
        .await
        .map_err(map_db_err)?;
    Ok((StatusCode::CREATED, Json(activity)))
}

async fn delete_activity(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .db
        .call(move |db| db.delete_activity(&id))
        .await
        .map_err(map_db_err)?;
    match deleted {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ApiError::NotFound("Activity not found".into())),
    }
}

async fn create_checklist(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(task_id): Path<String>,
    Json(req): Json<CreateChecklistRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let checklist = state
        .db
        .call(move |db| db.create_checklist(&task_id, &req.title))
        .await
        .map_err(map_db_err)?;
    Ok((StatusCode::CREATED, Json(checklist)))
}

async fn delete_checklist(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .db
        .call(move |db| db.delete_checklist(&id))
        .await
        .map_err(map_db_err)?;
    match deleted {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ApiError::NotFound("Checklist not found".into())),
    }
}

async fn add_checklist_item(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(checklist_id): Path<String>,
    Json(req): Json<AddChecklistItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state
        .db
        .call(move |db| db.add_checklist_item(&checklist_id, &req.content))
        .await
        .map_err(map_db_err)?;
    Ok((StatusCode::CREATED, Json(item)))
}

async fn update_checklist_item(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(id): Path<String>,
    Json(req): Json<UpdateChecklistItemRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let item = state
        .db
        .call(move |db| db.set_checklist_item_checked(&id, req.is_checked))
        .await
        .map_err(map_db_err)?;
    Ok(Json(item))
}

async fn delete_checklist_item(
    State(state): State<SharedState>,
    Identity(_user_id): Identity,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let deleted = state
        .db
        .call(move |db| db.delete_checklist_item(&id))
        .await
        .map_err(map_db_err)?;
    match deleted {
        true => Ok(StatusCode::NO_CONTENT),
        false => Err(ApiError::NotFound("Checklist item not found".into())),
    }
}

// ── Tests ─────────────────────────────────────────────────────────────
