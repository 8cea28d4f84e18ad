use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

mod common;
mod webhook;

pub fn build_router(webhook_path: &str) -> Router<AppState> {
    Router::new()
        .route("/health", get(common::get_health))
        .route(webhook_path, post(webhook::webhook))
}
