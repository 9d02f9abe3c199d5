use axum::routing::post;
use axum::Router;

use crate::handlers::generation;
use crate::state::AppState;

/// Routes mounted at `/generation`.
///
/// ```text
/// POST   /tasks                 submit a job
/// POST   /tasks/{task_id}/wait  block until the job is terminal
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/tasks", post(generation::submit_task))
        .route("/tasks/{task_id}/wait", post(generation::wait_task))
}
