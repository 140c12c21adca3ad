use axum::{extract::State, routing::get, Json, Router};
use tracing::instrument;

use crate::state::AppState;

pub mod client;

pub use client::{
    ConnectionStatus, MoodleClient, MoodleError, MoodleHttpClient, MoodleUserPatch, MoodleUserRef,
    NewMoodleUser,
};

pub fn router() -> Router<AppState> {
    Router::new().route("/moodle/status", get(status))
}

/// Health probe against the Moodle web-service endpoint. Always answers 200;
/// the body says whether the LMS is reachable and why not when it isn't.
#[instrument(skip(state))]
async fn status(State(state): State<AppState>) -> Json<ConnectionStatus> {
    Json(state.moodle.test_connection().await)
}
