//! Web server shared state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::directory::ChannelResolver;
use crate::tuner::SessionRegistry;

/// State shared by all HTTP handlers.
pub struct WebState {
    /// Playlist sessions and their streams.
    pub registry: Arc<SessionRegistry>,
    /// Stream token lookup.
    pub resolver: Arc<dyn ChannelResolver>,
    /// Body repeated to viewers when no tuner is free.
    pub placeholder: Bytes,
    next_viewer_id: AtomicU64,
}

impl WebState {
    pub fn new(
        registry: Arc<SessionRegistry>,
        resolver: Arc<dyn ChannelResolver>,
        placeholder: Bytes,
    ) -> Self {
        Self {
            registry,
            resolver,
            placeholder,
            next_viewer_id: AtomicU64::new(1),
        }
    }

    /// Allocate an id for a new viewer connection.
    pub fn next_viewer_id(&self) -> u64 {
        self.next_viewer_id.fetch_add(1, Ordering::Relaxed)
    }
}
