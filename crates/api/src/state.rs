use std::sync::Arc;

use kiln_core::polling::PollConfig;
use kiln_provider::GenerationProvider;
use kiln_relay::StreamSupervisor;
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;

/// Shared application state available to all Axum handlers via `State<AppState>`.
///
/// Cheaply cloneable; everything heavy sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    /// Transcoding session supervisor.
    pub supervisor: Arc<StreamSupervisor>,
    /// Remote generation provider (REST client in production).
    pub provider: Arc<dyn GenerationProvider>,
    /// Default budget for generation wait requests.
    pub poll_config: PollConfig,
    /// Cancelled on server shutdown; handlers derive per-request children.
    pub shutdown: CancellationToken,
}
