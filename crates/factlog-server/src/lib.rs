//! Factlog server library logic.

pub mod api;
pub mod background;
pub mod config;

use std::sync::Arc;

use axum::{routing::get, Extension, Router};
use factlog_store::FactStore;
use factlog_subscribe::SubscriptionCoordinator;

/// Application state shared across all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// The fact log and publish API.
    pub store: Arc<FactStore>,
    /// Subscription engine over `store`.
    pub coordinator: Arc<SubscriptionCoordinator>,
}

/// Builds the application router with all routes.
pub fn app(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(api::health))
        .route("/api/facts/serial", get(api::highest_serial_handler))
        .layer(Extension(state))
}
