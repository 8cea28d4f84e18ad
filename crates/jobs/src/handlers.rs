use std::sync::Arc;

use anyhow::Result;
use autoscale_core::{
    error::ProvisionError,
    models::{WebhookEvent, WorkerSpec, WorkflowJobAction, WorkflowJobEvent},
};
use autoscale_github::CredentialProvider;
use futures_util::future::BoxFuture;

use crate::{
    EventHandler,
    inflight::InFlightJobs,
    launcher::{LaunchHandle, WorkerLauncher},
};

/// Terminal state of a provisioning attempt that did not fail.
#[must_use]
pub enum Provisioned {
    /// Not a queued job; nothing to do.
    Skipped(WorkflowJobAction),
    /// The same job is already being provisioned.
    Duplicate,
    /// Launch issued. The handle reports the runtime's answer.
    Launched(LaunchHandle),
}

/// Starts one runner for every queued `workflow_job`.
///
/// For a queued job this:
/// - claims the job id so a redelivered webhook cannot start a second worker
/// - exchanges the repository for a registration token (no retry on failure)
/// - derives the worker name and issues the launch without waiting for it
pub struct JobProvisioner<C, L> {
    credentials: Arc<C>,
    launcher: Arc<L>,
    image: String,
    in_flight: Option<Arc<InFlightJobs>>,
}

impl<C: CredentialProvider, L: WorkerLauncher> JobProvisioner<C, L> {
    pub fn new(credentials: Arc<C>, launcher: Arc<L>, image: impl Into<String>) -> Self {
        Self { credentials, launcher, image: image.into(), in_flight: None }
    }

    pub fn with_in_flight(mut self, in_flight: Arc<InFlightJobs>) -> Self {
        self.in_flight = Some(in_flight);
        self
    }

    pub async fn provision(&self, event: &WorkflowJobEvent) -> Result<Provisioned, ProvisionError> {
        let job_id = event.workflow_job.id;
        tracing::info!(
            "Received a job {} event for #{} on {}",
            event.action,
            job_id,
            event.repository.display_name()
        );
        if event.action != WorkflowJobAction::Queued {
            return Ok(Provisioned::Skipped(event.action));
        }

        // Held until the launch is issued or the token request fails.
        let _claim = match &self.in_flight {
            Some(in_flight) => match in_flight.try_claim(job_id) {
                Some(claim) => Some(claim),
                None => {
                    tracing::warn!("Job #{} is already being provisioned, ignoring", job_id);
                    return Ok(Provisioned::Duplicate);
                }
            },
            None => None,
        };

        let target = event.target();
        let token = self
            .credentials
            .registration_token(&target)
            .await
            .map_err(|source| ProvisionError::Token { repository: target.to_string(), source })?;

        let spec = WorkerSpec::for_job(job_id, &self.image, token);
        tracing::info!("Launching worker {} for job #{} on {}", spec.name, job_id, target);
        Ok(Provisioned::Launched(self.launcher.launch(spec)))
    }
}

impl<C: CredentialProvider, L: WorkerLauncher> EventHandler for JobProvisioner<C, L> {
    fn handle<'a>(&'a self, event: &'a WebhookEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let WebhookEvent::WorkflowJob(event) = event else {
                return Ok(());
            };
            // The launch outcome is reported by the launch task itself.
            let _ = self.provision(event).await?;
            Ok(())
        })
    }
}

/// Logs the ping GitHub sends when a webhook is created.
pub struct PingHandler;

impl EventHandler for PingHandler {
    fn handle<'a>(&'a self, event: &'a WebhookEvent) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if let WebhookEvent::Ping(ping) = event {
                tracing::info!(
                    "Webhook {} is live: {}",
                    ping.hook_id.map(|id| id.to_string()).as_deref().unwrap_or("[unknown]"),
                    ping.zen
                );
            }
            Ok(())
        })
    }
}
