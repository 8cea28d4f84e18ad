use std::fmt;

use serde::Deserialize;

/// Value of the `X-GitHub-Event` header.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    WorkflowJob,
    Ping,
    Other(String),
}

impl EventKind {
    pub fn from_header(value: &str) -> Self {
        match value {
            "workflow_job" => Self::WorkflowJob,
            "ping" => Self::Ping,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::WorkflowJob => "workflow_job",
            Self::Ping => "ping",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowJobAction {
    Queued,
    Waiting,
    InProgress,
    Completed,
    #[serde(other)]
    Unknown,
}

impl WorkflowJobAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Waiting => "waiting",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for WorkflowJobAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Key of the dispatch table: an event type together with its action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventTag {
    WorkflowJob(WorkflowJobAction),
    Ping,
}

impl fmt::Display for EventTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkflowJob(action) => write!(f, "workflow_job.{action}"),
            Self::Ping => f.write_str("ping"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventOwner {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventRepository {
    pub name: String,
    #[serde(default)]
    pub full_name: String,
    pub owner: EventOwner,
}

impl EventRepository {
    pub fn display_name(&self) -> String {
        if self.full_name.is_empty() {
            format!("{}/{}", self.owner.login, self.name)
        } else {
            self.full_name.clone()
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventInstallation {
    pub id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJob {
    pub id: u64,
    #[serde(default)]
    pub run_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub labels: Vec<String>,
}

/// Decoded `workflow_job` webhook payload.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowJobEvent {
    pub action: WorkflowJobAction,
    pub workflow_job: WorkflowJob,
    pub repository: EventRepository,
    #[serde(default)]
    pub installation: Option<EventInstallation>,
}

impl WorkflowJobEvent {
    pub fn target(&self) -> RepositoryTarget {
        RepositoryTarget {
            owner: self.repository.owner.login.clone(),
            repo: self.repository.name.clone(),
            installation_id: self.installation.as_ref().map(|i| i.id),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PingEvent {
    #[serde(default)]
    pub zen: String,
    #[serde(default)]
    pub hook_id: Option<u64>,
}

/// A verified webhook, decoded according to its event type.
#[derive(Debug, Clone)]
pub enum WebhookEvent {
    WorkflowJob(WorkflowJobEvent),
    Ping(PingEvent),
    /// Event types nothing is registered for. The body is not decoded.
    Other(EventKind),
}

impl WebhookEvent {
    pub fn parse(kind: &EventKind, body: &[u8]) -> serde_json::Result<Self> {
        Ok(match kind {
            EventKind::WorkflowJob => Self::WorkflowJob(serde_json::from_slice(body)?),
            EventKind::Ping => Self::Ping(serde_json::from_slice(body)?),
            EventKind::Other(_) => Self::Other(kind.clone()),
        })
    }

    pub fn tag(&self) -> Option<EventTag> {
        match self {
            Self::WorkflowJob(event) => Some(EventTag::WorkflowJob(event.action)),
            Self::Ping(_) => Some(EventTag::Ping),
            Self::Other(_) => None,
        }
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::WorkflowJob(_) => EventKind::WorkflowJob,
            Self::Ping(_) => EventKind::Ping,
            Self::Other(kind) => kind.clone(),
        }
    }

    pub fn repository(&self) -> Option<&EventRepository> {
        match self {
            Self::WorkflowJob(event) => Some(&event.repository),
            _ => None,
        }
    }
}

/// Repository a registration token is requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryTarget {
    pub owner: String,
    pub repo: String,
    /// Installation the webhook was delivered for, if the payload carried one.
    pub installation_id: Option<u64>,
}

impl fmt::Display for RepositoryTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

/// Single-use secret allowing one runner to register against a repository.
///
/// Formatting never reveals the secret.
#[derive(Clone, PartialEq, Eq, Deserialize)]
pub struct RegistrationToken {
    token: String,
    #[serde(default)]
    expires_at: Option<String>,
}

impl RegistrationToken {
    pub fn new(token: impl Into<String>) -> Self { Self { token: token.into(), expires_at: None } }

    pub fn expose(&self) -> &str { &self.token }

    pub fn expires_at(&self) -> Option<&str> { self.expires_at.as_deref() }
}

impl fmt::Debug for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistrationToken")
            .field("token", &"[redacted]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

impl fmt::Display for RegistrationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("[redacted]") }
}

/// Everything needed to start one runner container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerSpec {
    pub name: String,
    pub image: String,
    pub token: RegistrationToken,
}

impl WorkerSpec {
    pub fn for_job(job_id: u64, image: impl Into<String>, token: RegistrationToken) -> Self {
        Self { name: worker_name(job_id), image: image.into(), token }
    }

    /// Environment handed to the runner image.
    pub fn env(&self) -> [(&'static str, &str); 2] {
        [("RUNNER_NAME", self.name.as_str()), ("TOKEN", self.token.expose())]
    }
}

/// Runner names must be unique per job so containers never collide.
pub fn worker_name(job_id: u64) -> String { format!("Runner_{job_id}") }
