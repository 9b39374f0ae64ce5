use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::get,
};

use crate::{
    dto::session::SessionSaved,
    error::AppError,
    services::session_service,
    state::{SharedState, session::GameState},
};

#[utoipa::path(
    get,
    path = "/games/{id}",
    tag = "sessions",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 200, description = "Stored session snapshot", body = GameState),
        (status = 404, description = "Unknown or expired session"),
        (status = 503, description = "Storage unavailable")
    )
)]
/// Return the stored snapshot of a session.
pub async fn get_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<Json<GameState>, AppError> {
    let snapshot = session_service::fetch_session(&state, &id).await?;
    Ok(Json(snapshot))
}

#[utoipa::path(
    put,
    path = "/games/{id}",
    tag = "sessions",
    params(("id" = String, Path, description = "Session identifier")),
    request_body = GameState,
    responses(
        (status = 200, description = "Snapshot stored, TTL refreshed", body = SessionSaved),
        (status = 400, description = "Snapshot id mismatch or invalid snapshot"),
        (status = 503, description = "Storage unavailable")
    )
)]
/// Overwrite the stored snapshot of a session.
pub async fn put_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(snapshot): Json<GameState>,
) -> Result<Json<SessionSaved>, AppError> {
    let saved = session_service::replace_session(&state, &id, snapshot).await?;
    Ok(Json(saved))
}

#[utoipa::path(
    delete,
    path = "/games/{id}",
    tag = "sessions",
    params(("id" = String, Path, description = "Session identifier")),
    responses(
        (status = 204, description = "Session removed"),
        (status = 404, description = "Unknown or expired session"),
        (status = 503, description = "Storage unavailable")
    )
)]
/// Remove the stored snapshot of a session.
pub async fn delete_session(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> Result<StatusCode, AppError> {
    session_service::remove_session(&state, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Configure the session persistence routes.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route(
        "/games/{id}",
        get(get_session).put(put_session).delete(delete_session),
    )
}
