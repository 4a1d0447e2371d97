//! Client configuration

use std::path::PathBuf;

use crate::{ClientError, ClientResult};

/// File name of the durable mutation queue inside the work directory
pub const QUEUE_DB_FILE: &str = "festive-board-queue.redb";

/// Client configuration
///
/// # Environment variables
///
/// | Variable | Default | Meaning |
/// |----------|---------|---------|
/// | POCKETBASE_URL | (required) | Backend base URL |
/// | POCKETBASE_TOKEN | - | Auth token sent as `Authorization` |
/// | REQUEST_TIMEOUT_SECS | 30 | Per-request timeout |
/// | WORK_DIR | ./work_dir | Queue database and logs live here |
/// | LOG_LEVEL | info | Default tracing filter (RUST_LOG wins) |
/// | LOG_JSON | false | JSON console output |
/// | LOG_DIR | - | Enables daily rotating log files |
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Backend base URL (e.g., "http://127.0.0.1:8090")
    pub base_url: String,

    /// Auth token for the backend
    pub token: Option<String>,

    /// Request timeout in seconds
    pub timeout: u64,

    /// Working directory for persistent state
    pub work_dir: PathBuf,

    /// Log level (e.g., "info", "debug")
    pub log_level: String,

    /// JSON log output
    pub log_json: bool,

    /// Directory for rotating log files
    pub log_dir: Option<PathBuf>,
}

impl ClientConfig {
    /// Create a new client configuration
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            timeout: 30,
            work_dir: PathBuf::from("./work_dir"),
            log_level: "info".to_string(),
            log_json: false,
            log_dir: None,
        }
    }

    /// Load configuration from environment variables
    pub fn from_env() -> ClientResult<Self> {
        let base_url = std::env::var("POCKETBASE_URL").map_err(|_| {
            ClientError::Config(
                "POCKETBASE_URL is not defined. Set it to the backend base URL.".to_string(),
            )
        })?;

        let mut config = Self::new(base_url);
        config.token = std::env::var("POCKETBASE_TOKEN").ok();
        config.timeout = std::env::var("REQUEST_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        if let Ok(dir) = std::env::var("WORK_DIR") {
            config.work_dir = PathBuf::from(dir);
        }
        config.log_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".into());
        config.log_json = std::env::var("LOG_JSON")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(false);
        config.log_dir = std::env::var("LOG_DIR").ok().map(PathBuf::from);

        Ok(config)
    }

    /// Set the auth token
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Set the request timeout
    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout = seconds;
        self
    }

    /// Set the working directory
    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    /// Set logging options
    pub fn with_logging(mut self, level: impl Into<String>, json: bool) -> Self {
        self.log_level = level.into();
        self.log_json = json;
        self
    }

    /// Write logs to daily rotating files under `dir`
    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    /// Location of the durable mutation queue
    pub fn queue_path(&self) -> PathBuf {
        self.work_dir.join(QUEUE_DB_FILE)
    }

    /// Create an HTTP backend from this configuration
    pub fn build_backend(&self) -> ClientResult<crate::backend::PocketBaseClient> {
        crate::backend::PocketBaseClient::new(self)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self::new("http://127.0.0.1:8090")
    }
}
