use std::time::Duration;

use thiserror::Error;

/// Why an inbound webhook signature was rejected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("X-Hub-Signature-256 missing")]
    Missing,
    #[error("X-Hub-Signature-256 sha256= prefix missing")]
    MissingPrefix,
    #[error("X-Hub-Signature-256 malformed")]
    Malformed,
    #[error("signature mismatch")]
    Mismatch,
}

/// Failure of a call to the GitHub API.
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("GitHub rejected the app credential: {0}")]
    Auth(String),
    #[error("GitHub rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("GitHub unavailable: {0}")]
    Unavailable(String),
    #[error("GitHub returned {status}: {message}")]
    Unexpected { status: u16, message: String },
}

impl UpstreamError {
    pub fn timeout(after: Duration) -> Self {
        Self::Unavailable(format!("request timed out after {after:?}"))
    }

    /// Only transport-level failures are worth one more attempt.
    pub fn is_transient(&self) -> bool { matches!(self, Self::Unavailable(_)) }
}

/// Failure to get a worker container accepted by the runtime.
#[derive(Error, Debug)]
pub enum LaunchError {
    #[error("failed to run {runtime}: {source}")]
    Spawn {
        runtime: String,
        #[source]
        source: std::io::Error,
    },
    #[error(
        "runtime did not confirm the launch within {:?}; the container may still have been created",
        .0
    )]
    Timeout(Duration),
    #[error("runtime exited with {status}: {stderr}")]
    Exited { status: String, stderr: String },
    #[error("launch task aborted: {0}")]
    Aborted(String),
}

/// Terminal failure of one provisioning attempt.
#[derive(Error, Debug)]
pub enum ProvisionError {
    #[error("failed to fetch registration token for {repository}")]
    Token {
        repository: String,
        #[source]
        source: UpstreamError,
    },
}

impl ProvisionError {
    pub fn upstream(&self) -> &UpstreamError {
        match self {
            Self::Token { source, .. } => source,
        }
    }
}
