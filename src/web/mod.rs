//! HTTP surface
//!
//! Serves the resource trees and accepts lifecycle webhooks. The router is
//! a thin shell: reads come straight from the cache, writes go through the
//! regulator and the job queue.

pub mod error;
pub mod handlers;

pub use error::ServiceError;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use kube::Client;
use tower_http::trace::TraceLayer;

use crate::cache::TreeCache;
use crate::dispatch::{Dispatcher, Regulator};
use crate::sse::SseClient;

/// Shared state handed to every handler.
pub struct AppState {
    pub client: Client,
    pub cache: TreeCache,
    pub regulator: Arc<Regulator>,
    pub dispatcher: Dispatcher,
    pub sse: SseClient,
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::home))
        .route("/list", get(handlers::list))
        .route("/compositions/:composition_id", get(handlers::get_composition))
        .route("/refresh/:composition_id", post(handlers::refresh))
        .route("/handle", post(handlers::handle_lifecycle_event))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}
