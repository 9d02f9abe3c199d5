use axum::routing::{get, post};
use axum::Router;

use crate::handlers::streams;
use crate::state::AppState;

/// Routes mounted at `/streams`.
///
/// ```text
/// GET    /            list tracked sessions
/// POST   /start       start or reuse a session
/// POST   /stop        stop a session (idempotent)
/// GET    /{id}        one session
/// ```
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(streams::list_streams))
        .route("/start", post(streams::start_stream))
        .route("/stop", post(streams::stop_stream))
        .route("/{id}", get(streams::get_stream))
}
