//! Web API endpoints for monitoring.

use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, Json};
use serde_json::json;
use tvrelay_protocol::StatusSummary;

use crate::web::state::WebState;

/// Number of active playlists and viewers.
pub async fn get_status(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let registry = &web_state.registry;
    Json(StatusSummary {
        active_playlists: registry.active_playlists().await,
        active_viewers: registry.active_viewers().await,
    })
}

/// Every playlist session with its streams.
pub async fn get_streams(State(web_state): State<Arc<WebState>>) -> impl IntoResponse {
    let sessions = web_state.registry.snapshot().await;
    let stream_count: usize = sessions.iter().map(|s| s.streams.len()).sum();

    Json(json!({
        "success": true,
        "sessions": sessions,
        "stream_count": stream_count
    }))
}
