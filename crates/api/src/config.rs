use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use kiln_core::polling::PollConfig;
use kiln_core::transcode::HlsSettings;
use kiln_relay::RelayConfig;

/// Connection settings for the remote generation provider.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub base_url: String,
    /// Bearer key sent with every provider request. Empty disables the
    /// generation endpoints.
    pub api_key: String,
    pub request_timeout_secs: u64,
}

/// Server configuration loaded from environment variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bind address (default: `0.0.0.0`).
    pub host: String,
    /// Bind port (default: `3000`).
    pub port: u16,
    /// Allowed CORS origins, parsed from comma-separated `CORS_ORIGINS`.
    pub cors_origins: Vec<String>,
    /// HTTP request timeout in seconds. Must cover the poll budget since
    /// the wait endpoint blocks for its whole duration.
    pub request_timeout_secs: u64,
    pub relay: RelayConfig,
    pub provider: ProviderConfig,
    pub poll: PollConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default                  |
    /// |---------------------------------|--------------------------|
    /// | `HOST`                          | `0.0.0.0`                |
    /// | `PORT`                          | `3000`                   |
    /// | `CORS_ORIGINS`                  | `http://localhost:5173`  |
    /// | `REQUEST_TIMEOUT_SECS`          | `120`                    |
    /// | `STREAMS_ROOT`                  | `./data/streams`         |
    /// | `STREAMS_MARKER_DIR`            | `./data/markers`         |
    /// | `TRANSCODER_BIN`                | `ffmpeg`                 |
    /// | `STREAM_ALLOWED_SCHEMES`        | `rtsp,rtsps`             |
    /// | `HLS_SEGMENT_SECS`              | `2`                      |
    /// | `HLS_LIST_SIZE`                 | `6`                      |
    /// | `READINESS_TIMEOUT_SECS`        | `20`                     |
    /// | `READINESS_INTERVAL_MS`         | `200`                    |
    /// | `CLEANUP_DELAY_MS`              | `1000`                   |
    /// | `PROVIDER_BASE_URL`             | `http://localhost:8080`  |
    /// | `PROVIDER_API_KEY`              | empty                    |
    /// | `PROVIDER_REQUEST_TIMEOUT_SECS` | `30`                     |
    /// | `POLL_INTERVAL_MS`              | `3000`                   |
    /// | `POLL_MAX_ATTEMPTS`             | `30`                     |
    /// | `POLL_MAX_ERROR_RETRIES`        | `3`                      |
    /// | `POLL_RETRY_SERVER_ERRORS`      | `false`                  |
    ///
    /// Panics on unparsable or inconsistent values so misconfiguration
    /// fails at startup.
    pub fn from_env() -> Self {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env_or("PORT", "3000");

        let cors_origins = env_list("CORS_ORIGINS", "http://localhost:5173");
        let request_timeout_secs: u64 = env_or("REQUEST_TIMEOUT_SECS", "120");

        let mut relay = RelayConfig::new(
            PathBuf::from(env_string("STREAMS_ROOT", "./data/streams")),
            PathBuf::from(env_string("STREAMS_MARKER_DIR", "./data/markers")),
        );
        relay.transcoder_bin = env_string("TRANSCODER_BIN", "ffmpeg");
        relay.allowed_schemes = env_list("STREAM_ALLOWED_SCHEMES", "rtsp,rtsps");
        relay.hls = HlsSettings {
            segment_secs: env_or("HLS_SEGMENT_SECS", "2"),
            list_size: env_or("HLS_LIST_SIZE", "6"),
        };
        relay.readiness_timeout = Duration::from_secs(env_or("READINESS_TIMEOUT_SECS", "20"));
        relay.readiness_interval = Duration::from_millis(env_or("READINESS_INTERVAL_MS", "200"));
        relay.cleanup_delay = Duration::from_millis(env_or("CLEANUP_DELAY_MS", "1000"));
        relay
            .validate()
            .unwrap_or_else(|e| panic!("Invalid stream relay configuration: {e}"));

        let provider = ProviderConfig {
            base_url: env_string("PROVIDER_BASE_URL", "http://localhost:8080"),
            api_key: env_string("PROVIDER_API_KEY", ""),
            request_timeout_secs: env_or("PROVIDER_REQUEST_TIMEOUT_SECS", "30"),
        };

        let poll = PollConfig {
            interval: Duration::from_millis(env_or("POLL_INTERVAL_MS", "3000")),
            max_attempts: env_or("POLL_MAX_ATTEMPTS", "30"),
            max_error_retries: env_or("POLL_MAX_ERROR_RETRIES", "3"),
            retry_server_errors: env_or("POLL_RETRY_SERVER_ERRORS", "false"),
        };
        poll.validate()
            .unwrap_or_else(|e| panic!("Invalid poll configuration: {e}"));

        let request_timeout = Duration::from_secs(request_timeout_secs);
        if poll.budget() >= request_timeout {
            panic!(
                "Poll budget ({}s = POLL_INTERVAL_MS x POLL_MAX_ATTEMPTS) must be below \
                 REQUEST_TIMEOUT_SECS ({request_timeout_secs}s)",
                poll.budget().as_secs_f64(),
            );
        }
        if relay.readiness_timeout >= request_timeout {
            panic!(
                "READINESS_TIMEOUT_SECS ({}s) must be below REQUEST_TIMEOUT_SECS ({request_timeout_secs}s)",
                relay.readiness_timeout.as_secs(),
            );
        }

        Self {
            host,
            port,
            cors_origins,
            request_timeout_secs,
            relay,
            provider,
            poll,
        }
    }
}

impl ServerConfig {
    /// Budget of a single HTTP request before the timeout layer answers 408.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_or<T>(name: &str, default: &str) -> T
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let raw = env_string(name, default);
    raw.trim()
        .parse()
        .unwrap_or_else(|e| panic!("{name} has invalid value '{raw}': {e}"))
}

fn env_list(name: &str, default: &str) -> Vec<String> {
    env_string(name, default)
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}
