use std::sync::Arc;

use autoscale_core::AppError;
use autoscale_github::webhook::GitHubEvent;
use autoscale_jobs::{DispatchOutcome, EventRouter};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};

/// Webhook ingress. Responds once the event has been dispatched; handler
/// failures are logged by the router and still acknowledged.
pub async fn webhook(
    State(router): State<Arc<EventRouter>>,
    GitHubEvent { delivery, event }: GitHubEvent,
) -> Result<Response, AppError> {
    // Log the event source
    if let Some(repository) = event.repository() {
        tracing::info!(
            "Received webhook event {} from repository {} (delivery {})",
            event.kind(),
            repository.display_name(),
            delivery
        );
    } else {
        tracing::info!("Received webhook event {} (delivery {})", event.kind(), delivery);
    }

    match router.dispatch(&delivery, &event).await {
        DispatchOutcome::Ignored => Ok((StatusCode::OK, "Event ignored").into_response()),
        DispatchOutcome::Handled | DispatchOutcome::Failed => {
            Ok((StatusCode::OK, "Event processed").into_response())
        }
        DispatchOutcome::Panicked => Err(AppError::Status(StatusCode::INTERNAL_SERVER_ERROR)),
    }
}
