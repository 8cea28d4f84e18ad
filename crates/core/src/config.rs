use std::{fs::File, io::BufReader, path::Path, time::Duration};

use anyhow::{Context, Result, bail, ensure};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    pub github: GitHubConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Route the webhook is served on.
    #[serde(default = "default_path")]
    pub path: String,
    /// Upper bound for answering one webhook delivery, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration { Duration::from_secs(self.request_timeout_secs) }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_path(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GitHubConfig {
    #[serde(default)]
    pub app_id: u64,
    #[serde(default)]
    pub private_key_path: String,
    #[serde(default)]
    pub webhook_secret: String,
    /// Upper bound for a single upstream API call, in seconds.
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,
    /// Upper bound for obtaining one registration token, lookups and retry
    /// included, in seconds.
    #[serde(default = "default_token_deadline_secs")]
    pub token_deadline_secs: u64,
}

impl GitHubConfig {
    pub fn api_timeout(&self) -> Duration { Duration::from_secs(self.api_timeout_secs) }

    pub fn token_deadline(&self) -> Duration { Duration::from_secs(self.token_deadline_secs) }
}

impl Default for GitHubConfig {
    fn default() -> Self {
        Self {
            app_id: 0,
            private_key_path: String::new(),
            webhook_secret: String::new(),
            api_timeout_secs: default_api_timeout_secs(),
            token_deadline_secs: default_token_deadline_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Runner image started for every queued job.
    #[serde(default = "default_image")]
    pub image: String,
    /// Container runtime CLI.
    #[serde(default = "default_runtime")]
    pub runtime: String,
    /// Extra arguments passed to `run` before the image reference.
    #[serde(default)]
    pub extra_args: Vec<String>,
    #[serde(default = "default_launch_timeout_secs")]
    pub launch_timeout_secs: u64,
    /// Drop a queued notification while the same job is already being provisioned.
    #[serde(default = "default_true")]
    pub dedup_in_flight: bool,
}

impl WorkerConfig {
    pub fn launch_timeout(&self) -> Duration { Duration::from_secs(self.launch_timeout_secs) }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            runtime: default_runtime(),
            extra_args: vec![],
            launch_timeout_secs: default_launch_timeout_secs(),
            dedup_in_flight: true,
        }
    }
}

fn default_host() -> String { "127.0.0.1".to_string() }

fn default_port() -> u16 { 3000 }

fn default_path() -> String { "/api/webhook".to_string() }

fn default_request_timeout_secs() -> u64 { 30 }

fn default_api_timeout_secs() -> u64 { 10 }

fn default_token_deadline_secs() -> u64 { 25 }

fn default_image() -> String { "simple-ubuntu-runner".to_string() }

fn default_runtime() -> String { "docker".to_string() }

fn default_launch_timeout_secs() -> u64 { 60 }

fn default_true() -> bool { true }

impl Config {
    /// Read the YAML config file, apply environment overrides and validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = BufReader::new(
            File::open(path)
                .with_context(|| format!("Failed to open config file {}", path.display()))?,
        );
        let mut config: Config = serde_yaml::from_reader(file)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override GitHub App settings from `APP_ID`, `WEBHOOK_SECRET` and `PRIVATE_KEY_PATH`.
    pub fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(app_id) = var("APP_ID") {
            self.github.app_id =
                app_id.trim().parse().with_context(|| format!("Invalid APP_ID {app_id:?}"))?;
        }
        if let Some(secret) = var("WEBHOOK_SECRET") {
            self.github.webhook_secret = secret;
        }
        if let Some(path) = var("PRIVATE_KEY_PATH") {
            self.github.private_key_path = path;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(self.github.app_id != 0, "github.app_id is not set");
        ensure!(!self.github.private_key_path.is_empty(), "github.private_key_path is not set");
        ensure!(!self.github.webhook_secret.is_empty(), "github.webhook_secret is not set");
        if !self.server.path.starts_with('/') {
            bail!("server.path must start with '/': {}", self.server.path);
        }
        ensure!(!self.worker.image.is_empty(), "worker.image is not set");
        // A delivery cut off by the request timeout is never logged, so the
        // token exchange has to give up first.
        ensure!(
            self.github.token_deadline_secs < self.server.request_timeout_secs,
            "github.token_deadline_secs ({}) must be below server.request_timeout_secs ({})",
            self.github.token_deadline_secs,
            self.server.request_timeout_secs
        );
        Ok(())
    }
}
