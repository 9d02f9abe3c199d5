#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Method, Request, Response};
use axum::Router;
use http_body_util::BodyExt;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use kiln_api::config::{ProviderConfig, ServerConfig};
use kiln_api::router::build_app_router;
use kiln_api::state::AppState;
use kiln_core::polling::PollConfig;
use kiln_core::transcode::playlist_path;
use kiln_provider::{GenerationProvider, ProviderApiError, SubmitRequest, TaskStatusResponse};
use kiln_relay::driver::{ExitReport, ProcessDriver, SpawnedProcess, TranscodeCommand};
use kiln_relay::{RelayConfig, StreamSupervisor};

// ---------------------------------------------------------------------------
// Fake process driver
// ---------------------------------------------------------------------------

/// Process driver that never starts real processes. Spawned "transcoders"
/// write their playlist immediately unless `silent` is set.
#[derive(Default)]
pub struct FakeDriver {
    next_pid: AtomicU32,
    pub silent: std::sync::atomic::AtomicBool,
    pub fail_spawn: std::sync::atomic::AtomicBool,
    running: Mutex<HashMap<u32, oneshot::Sender<ExitReport>>>,
    spawned: Mutex<Vec<TranscodeCommand>>,
    killed: Mutex<Vec<u32>>,
}

impl FakeDriver {
    pub fn spawn_count(&self) -> usize {
        self.spawned.lock().unwrap().len()
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }
}

impl ProcessDriver for FakeDriver {
    fn spawn(&self, command: &TranscodeCommand) -> io::Result<SpawnedProcess> {
        if self.fail_spawn.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "No such file or directory"));
        }
        let pid = 2000 + self.next_pid.fetch_add(1, Ordering::SeqCst);
        if !self.silent.load(Ordering::SeqCst) {
            std::fs::write(playlist_path(&command.work_dir), "#EXTM3U\n")?;
        }
        let (tx, rx) = oneshot::channel();
        self.running.lock().unwrap().insert(pid, tx);
        self.spawned.lock().unwrap().push(command.clone());
        Ok(SpawnedProcess { pid, exit: rx })
    }

    fn kill(&self, pid: u32) -> io::Result<()> {
        match self.running.lock().unwrap().remove(&pid) {
            Some(tx) => {
                self.killed.lock().unwrap().push(pid);
                let _ = tx.send(ExitReport {
                    code: None,
                    signal: Some(9),
                    diagnostics: String::new(),
                });
                Ok(())
            }
            None => Err(io::Error::from_raw_os_error(3)),
        }
    }

    fn is_alive(&self, pid: u32) -> bool {
        self.running.lock().unwrap().contains_key(&pid)
    }
}

// ---------------------------------------------------------------------------
// Fake generation provider
// ---------------------------------------------------------------------------

/// Provider that replays scripted status responses in order.
#[derive(Default)]
pub struct FakeProvider {
    pub submit_result: Mutex<Option<Result<String, ProviderApiError>>>,
    statuses: Mutex<VecDeque<Result<TaskStatusResponse, ProviderApiError>>>,
    pub submitted: Mutex<Vec<SubmitRequest>>,
    pub status_calls: AtomicU32,
}

impl FakeProvider {
    pub fn script(&self, steps: Vec<Result<TaskStatusResponse, ProviderApiError>>) {
        *self.statuses.lock().unwrap() = steps.into();
    }
}

pub fn status(status: &str) -> Result<TaskStatusResponse, ProviderApiError> {
    Ok(TaskStatusResponse {
        status: status.to_string(),
        result: None,
        error: None,
    })
}

pub fn success(result: serde_json::Value) -> Result<TaskStatusResponse, ProviderApiError> {
    Ok(TaskStatusResponse {
        status: "success".to_string(),
        result: Some(result),
        error: None,
    })
}

pub fn http_error(code: u16) -> Result<TaskStatusResponse, ProviderApiError> {
    Err(ProviderApiError::ApiError {
        status: code,
        body: String::new(),
    })
}

#[async_trait]
impl GenerationProvider for FakeProvider {
    async fn submit(&self, request: &SubmitRequest, _api_key: &str) -> Result<String, ProviderApiError> {
        self.submitted.lock().unwrap().push(request.clone());
        self.submit_result
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Ok("task-1".to_string()))
    }

    async fn fetch_status(
        &self,
        _task_id: &str,
        _api_key: &str,
    ) -> Result<TaskStatusResponse, ProviderApiError> {
        self.status_calls.fetch_add(1, Ordering::SeqCst);
        self.statuses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| status("pending"))
    }
}

// ---------------------------------------------------------------------------
// Test application
// ---------------------------------------------------------------------------

/// Build a test `ServerConfig` rooted in `root` with fast timings.
pub fn test_config(root: &Path) -> ServerConfig {
    let mut relay = RelayConfig::new(root.join("streams"), root.join("markers"));
    relay.readiness_timeout = Duration::from_millis(300);
    relay.readiness_interval = Duration::from_millis(10);
    relay.cleanup_delay = Duration::ZERO;

    ServerConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        cors_origins: vec!["http://localhost:5173".to_string()],
        request_timeout_secs: 30,
        relay,
        provider: ProviderConfig {
            base_url: "http://provider.test".to_string(),
            api_key: "test-key".to_string(),
            request_timeout_secs: 5,
        },
        poll: PollConfig {
            interval: Duration::from_millis(5),
            max_attempts: 5,
            max_error_retries: 3,
            retry_server_errors: false,
        },
    }
}

/// Everything a test needs to drive the app and inspect its fakes.
pub struct TestApp {
    pub router: Router,
    pub driver: Arc<FakeDriver>,
    pub provider: Arc<FakeProvider>,
    pub supervisor: Arc<StreamSupervisor>,
    pub config: ServerConfig,
    _root: TempDir,
}

impl TestApp {
    pub fn app(&self) -> Router {
        self.router.clone()
    }
}

pub async fn build_test_app() -> TestApp {
    build_test_app_with(|_| {}).await
}

/// Build the full application router (same middleware stack as production)
/// over fakes, letting the caller adjust the config first.
pub async fn build_test_app_with(adjust: impl FnOnce(&mut ServerConfig)) -> TestApp {
    let root = tempfile::tempdir().unwrap();
    let mut config = test_config(root.path());
    adjust(&mut config);

    let driver = Arc::new(FakeDriver::default());
    let provider = Arc::new(FakeProvider::default());
    let shutdown = CancellationToken::new();
    let supervisor = StreamSupervisor::start(
        config.relay.clone(),
        Arc::clone(&driver) as Arc<dyn ProcessDriver>,
        shutdown.child_token(),
    )
    .await
    .unwrap();

    let state = AppState {
        config: Arc::new(config.clone()),
        supervisor: Arc::clone(&supervisor),
        provider: Arc::clone(&provider) as Arc<dyn GenerationProvider>,
        poll_config: config.poll,
        shutdown,
    };

    TestApp {
        router: build_app_router(state, &config),
        driver,
        provider,
        supervisor,
        config,
        _root: root,
    }
}

// ---------------------------------------------------------------------------
// Request helpers
// ---------------------------------------------------------------------------

pub async fn get(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_json(app: Router, uri: &str, body: serde_json::Value) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn post_empty(app: Router, uri: &str) -> Response<Body> {
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri)
        .body(Body::empty())
        .unwrap();
    app.oneshot(request).await.unwrap()
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

pub async fn body_text(response: Response<Body>) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8(bytes.to_vec()).unwrap()
}
