//! Status API.

pub mod api;
pub mod state;

use std::sync::Arc;

use axum::{routing::get, Router};

pub use state::WebState;

/// Monitoring routes, merged into the main router.
pub fn routes() -> Router<Arc<WebState>> {
    Router::new()
        .route("/api/status", get(api::get_status))
        .route("/api/streams", get(api::get_streams))
}
