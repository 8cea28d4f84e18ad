mod handlers;
pub mod inflight;
pub mod launcher;

use std::{any::Any, collections::HashMap, panic::AssertUnwindSafe, sync::Arc};

use anyhow::Result;
use autoscale_core::{
    config::WorkerConfig,
    models::{EventTag, WebhookEvent, WorkflowJobAction},
};
use autoscale_github::CredentialProvider;
use futures_util::{FutureExt, future::BoxFuture};
pub use handlers::{JobProvisioner, PingHandler, Provisioned};

use crate::{inflight::InFlightJobs, launcher::WorkerLauncher};

/// Handler for one or more event tags.
pub trait EventHandler: Send + Sync {
    fn handle<'a>(&'a self, event: &'a WebhookEvent) -> BoxFuture<'a, Result<()>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Nothing is registered for this event.
    Ignored,
    Handled,
    /// The handler returned an error. It has been logged.
    Failed,
    /// The handler panicked. It has been logged.
    Panicked,
}

/// Dispatch table from event tag to handler.
///
/// This is the single error sink for handlers: failures and panics are logged
/// here with the event's context and never reach the HTTP layer as errors.
#[derive(Default)]
pub struct EventRouter {
    routes: HashMap<EventTag, Arc<dyn EventHandler>>,
}

impl EventRouter {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, tag: EventTag, handler: Arc<dyn EventHandler>) -> &mut Self {
        if self.routes.insert(tag, handler).is_some() {
            tracing::warn!("Replaced handler for {}", tag);
        }
        self
    }

    pub fn is_registered(&self, tag: EventTag) -> bool { self.routes.contains_key(&tag) }

    pub async fn dispatch(&self, delivery: &str, event: &WebhookEvent) -> DispatchOutcome {
        let Some(handler) = event.tag().and_then(|tag| self.routes.get(&tag)) else {
            tracing::debug!("No handler for {} event (delivery {})", event.kind(), delivery);
            return DispatchOutcome::Ignored;
        };
        let source = event.repository().map(|r| r.display_name());
        let source = source.as_deref().unwrap_or("[unknown]");
        match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
            Ok(Ok(())) => DispatchOutcome::Handled,
            Ok(Err(e)) => {
                tracing::error!(
                    "Error processing {} event from {} (delivery {}): {:?}",
                    event.kind(),
                    source,
                    delivery,
                    e
                );
                DispatchOutcome::Failed
            }
            Err(panic) => {
                tracing::error!(
                    "Handler panicked processing {} event from {} (delivery {}): {}",
                    event.kind(),
                    source,
                    delivery,
                    panic_message(&*panic)
                );
                DispatchOutcome::Panicked
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "[non-string panic]"
    }
}

/// Build the dispatch table used by the service.
pub fn create_router<C, L>(
    credentials: Arc<C>,
    launcher: Arc<L>,
    config: &WorkerConfig,
) -> EventRouter
where
    C: CredentialProvider,
    L: WorkerLauncher,
{
    let mut provisioner = JobProvisioner::new(credentials, launcher, config.image.clone());
    if config.dedup_in_flight {
        provisioner = provisioner.with_in_flight(InFlightJobs::new());
    }
    let mut router = EventRouter::new();
    router
        .register(EventTag::WorkflowJob(WorkflowJobAction::Queued), Arc::new(provisioner))
        .register(EventTag::Ping, Arc::new(PingHandler));
    router
}
