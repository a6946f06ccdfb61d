//! Channel and provider lookups.
//!
//! The engine only needs two answers from the rest of the system: what a
//! stream token resolves to, and how a playlist's channels are buffered.
//! [`StaticDirectory`] answers both from the configuration file.

use std::collections::HashMap;

use tvrelay_protocol::{ChannelRequest, ProviderParams};

/// Resolves a stream request token to a channel.
pub trait ChannelResolver: Send + Sync {
    fn resolve(&self, token: &str) -> Option<ChannelRequest>;
}

/// Looks up per-playlist provider parameters.
pub trait ProviderDirectory: Send + Sync {
    fn provider(&self, playlist_id: &str) -> Option<ProviderParams>;
}

/// Fixed channel and playlist tables.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    playlists: HashMap<String, ProviderParams>,
    channels: HashMap<String, ChannelRequest>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_playlist(mut self, playlist_id: impl Into<String>, params: ProviderParams) -> Self {
        self.playlists.insert(playlist_id.into(), params);
        self
    }

    pub fn with_channel(mut self, token: impl Into<String>, request: ChannelRequest) -> Self {
        self.channels.insert(token.into(), request);
        self
    }

    pub fn playlist_count(&self) -> usize {
        self.playlists.len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }
}

impl ChannelResolver for StaticDirectory {
    fn resolve(&self, token: &str) -> Option<ChannelRequest> {
        self.channels.get(token).cloned()
    }
}

impl ProviderDirectory for StaticDirectory {
    fn provider(&self, playlist_id: &str) -> Option<ProviderParams> {
        self.playlists.get(playlist_id).cloned()
    }
}
