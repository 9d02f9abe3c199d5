pub mod generation;
pub mod health;
pub mod streams;

use axum::Router;

use crate::state::AppState;

/// Build the `/api/v1` route tree.
///
/// ```text
/// /streams                          list
/// /streams/start                    start (POST)
/// /streams/stop                     stop (POST)
/// /streams/{id}                     get
///
/// /generation/tasks                 submit (POST)
/// /generation/tasks/{task_id}/wait  wait (POST)
/// ```
pub fn api_routes() -> Router<AppState> {
    Router::new()
        .nest("/streams", streams::router())
        .nest("/generation", generation::router())
}
