use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::{error, instrument, warn};

use crate::error::UserError;
use crate::state::AppState;
use crate::users::dto::{
    ApiResponse, CreateUserRequest, ListQuery, SyncRequest, UpdateUserRequest, UserPage,
};
use crate::users::repo::{UserPatch, UserRole};
use crate::users::service::{self, CreateUserInput, SyncOutcome};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/users", get(list_users).post(create_user))
        .route(
            "/users/:id",
            get(get_user).put(update_user).delete(delete_user),
        )
        .route("/users/:id/sync", post(sync_user))
}

fn success<T: serde::Serialize>(status: StatusCode, body: ApiResponse<T>) -> Response {
    (status, Json(body)).into_response()
}

fn failure(status: StatusCode, error: impl Into<String>) -> Response {
    (
        status,
        Json(ApiResponse::<serde_json::Value>::fail(error)),
    )
        .into_response()
}

/// Maps service errors to the envelope. Unexpected store errors fall back to
/// the handler-supplied status and phrase so internals never leak.
fn service_failure(e: UserError, fallback_status: StatusCode, fallback_msg: &str) -> Response {
    match e {
        UserError::NotFound => failure(StatusCode::NOT_FOUND, "User not found"),
        UserError::DuplicateEmail | UserError::SyncFailed(_) | UserError::Password(_) => {
            failure(StatusCode::BAD_REQUEST, e.to_string())
        }
        UserError::Database(db_err) => {
            error!(error = %db_err, "{fallback_msg}");
            failure(fallback_status, fallback_msg)
        }
    }
}

fn parse_id(raw: &str) -> Result<i32, Response> {
    raw.parse::<i32>()
        .map_err(|_| failure(StatusCode::BAD_REQUEST, "Invalid user ID"))
}

fn parse_role(raw: &str) -> Result<UserRole, Response> {
    UserRole::parse(raw).ok_or_else(|| {
        failure(
            StatusCode::BAD_REQUEST,
            format!("Invalid role. Must be one of: {}", UserRole::VALID),
        )
    })
}

#[instrument(skip(state))]
async fn list_users(State(state): State<AppState>, Query(q): Query<ListQuery>) -> Response {
    match service::list_users(&state.db, q.limit(), q.offset()).await {
        Ok((users, total)) => success(StatusCode::OK, ApiResponse::ok(UserPage { users, total })),
        Err(e) => service_failure(e, StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch users"),
    }
}

#[instrument(skip(state))]
async fn get_user(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match service::get_user(&state.db, id).await {
        Ok(Some(user)) => success(StatusCode::OK, ApiResponse::ok(user)),
        Ok(None) => failure(StatusCode::NOT_FOUND, "User not found"),
        Err(e) => service_failure(e, StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch user"),
    }
}

#[instrument(skip(state, body))]
async fn create_user(
    State(state): State<AppState>,
    Json(body): Json<CreateUserRequest>,
) -> Response {
    let (email, username, password, name) = match (
        body.email.filter(|v| !v.is_empty()),
        body.username.filter(|v| !v.is_empty()),
        body.password.filter(|v| !v.is_empty()),
        body.name.filter(|v| !v.is_empty()),
    ) {
        (Some(e), Some(u), Some(p), Some(n)) => (e, u, p, n),
        _ => {
            return failure(
                StatusCode::BAD_REQUEST,
                "Missing required fields: email, username, password, name",
            )
        }
    };

    let email = email.trim().to_string();
    if !service::is_valid_email(&email) {
        warn!(%email, "rejected invalid email");
        return failure(StatusCode::BAD_REQUEST, "Invalid email address");
    }

    let role = match body.role.as_deref() {
        Some(raw) => match parse_role(raw) {
            Ok(role) => role,
            Err(resp) => return resp,
        },
        None => UserRole::Student,
    };

    let input = CreateUserInput {
        email,
        username,
        password,
        name,
        role,
        sync_to_moodle: body.sync_to_moodle,
    };

    match service::create_user(&state.db, state.moodle.as_ref(), input).await {
        Ok((user, outcome)) => {
            let message = match outcome {
                SyncOutcome::Synced => "User created and synced to Moodle successfully",
                SyncOutcome::Failed => "User created successfully, but Moodle sync failed",
                SyncOutcome::NotRequested => "User created successfully",
            };
            success(
                StatusCode::CREATED,
                ApiResponse::ok_with_message(user, message),
            )
        }
        Err(e) => service_failure(e, StatusCode::BAD_REQUEST, "Failed to create user"),
    }
}

#[instrument(skip(state, body))]
async fn update_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<UpdateUserRequest>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let role = match body.role.as_deref() {
        Some(raw) => match parse_role(raw) {
            Ok(role) => Some(role),
            Err(resp) => return resp,
        },
        None => None,
    };

    let patch = UserPatch {
        email: body.email,
        username: body.username,
        name: body.name,
        role,
        is_active: body.is_active,
    };

    match service::update_user(&state.db, state.moodle.as_ref(), id, patch).await {
        Ok(user) => success(
            StatusCode::OK,
            ApiResponse::ok_with_message(user, "User updated successfully"),
        ),
        Err(e) => service_failure(e, StatusCode::BAD_REQUEST, "Failed to update user"),
    }
}

#[instrument(skip(state))]
async fn delete_user(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match service::delete_user(&state.db, state.moodle.as_ref(), id).await {
        Ok(()) => success(
            StatusCode::OK,
            ApiResponse::<serde_json::Value>::message_only("User deleted successfully"),
        ),
        Err(e) => service_failure(e, StatusCode::BAD_REQUEST, "Failed to delete user"),
    }
}

#[instrument(skip(state, body))]
async fn sync_user(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<SyncRequest>>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    let password = body.and_then(|Json(b)| b.password);

    match service::sync_user_to_moodle(&state.db, state.moodle.as_ref(), id, password).await {
        Ok(user) => success(
            StatusCode::OK,
            ApiResponse::ok_with_message(user, "User synced to Moodle successfully"),
        ),
        Err(e) => service_failure(e, StatusCode::BAD_REQUEST, "Failed to sync user to Moodle"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_parsing_rejects_garbage() {
        assert!(parse_id("12").is_ok());
        assert!(parse_id("-3").is_ok());
        assert!(parse_id("abc").is_err());
        assert!(parse_id("1.5").is_err());
        assert!(parse_id("").is_err());
    }

    #[test]
    fn role_parsing_matches_valid_set() {
        assert!(parse_role("student").is_ok());
        assert!(parse_role("parent").is_ok());
        assert!(parse_role("teacher").is_err());
        assert!(parse_role("ADMIN").is_err());
    }
}
