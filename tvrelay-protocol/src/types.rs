//! Channel, provider and status types exchanged between the engine and its
//! collaborators.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Maximum number of backup channels a request may carry.
pub const MAX_BACKUPS: usize = 3;

/// Number of finished segments kept per stream (and per viewer) before the
/// oldest one is evicted.
pub const SEGMENT_RING_LEN: usize = 20;

/// Default number of one-second ticks to wait for the first segment.
pub const DEFAULT_FIRST_BYTE_TIMEOUT_SECS: u64 = 20;

/// How a playlist's channels are delivered to viewers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BufferMode {
    /// No buffering: viewers are redirected to the upstream URL.
    #[default]
    None,
    /// Relay through an ffmpeg process.
    Ffmpeg,
    /// Relay through a VLC process.
    Vlc,
}

impl BufferMode {
    /// Returns true if streams in this mode need an external transcoder.
    pub fn uses_transcoder(self) -> bool {
        !matches!(self, BufferMode::None)
    }
}

impl fmt::Display for BufferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BufferMode::None => "none",
            BufferMode::Ffmpeg => "ffmpeg",
            BufferMode::Vlc => "vlc",
        };
        f.write_str(s)
    }
}

impl FromStr for BufferMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "-" | "none" | "" => Ok(BufferMode::None),
            "ffmpeg" => Ok(BufferMode::Ffmpeg),
            "vlc" => Ok(BufferMode::Vlc),
            other => Err(format!("Unknown buffer mode: {}", other)),
        }
    }
}

/// A backup channel: an alternate upstream on a (possibly different) playlist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupChannel {
    pub playlist_id: String,
    pub url: String,
}

/// Upstream target for one admission attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTarget {
    pub playlist_id: String,
    pub url: String,
}

impl From<&BackupChannel> for StreamTarget {
    fn from(backup: &BackupChannel) -> Self {
        Self {
            playlist_id: backup.playlist_id.clone(),
            url: backup.url.clone(),
        }
    }
}

/// A resolved channel request, as produced by the channel resolver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    pub playlist_id: String,
    pub url: String,
    pub channel_name: String,
    /// Up to [`MAX_BACKUPS`] backups, in failover order.
    pub backups: Vec<BackupChannel>,
}

impl ChannelRequest {
    /// Create a request without backups.
    pub fn new(
        playlist_id: impl Into<String>,
        url: impl Into<String>,
        channel_name: impl Into<String>,
    ) -> Self {
        Self {
            playlist_id: playlist_id.into(),
            url: url.into(),
            channel_name: channel_name.into(),
            backups: Vec::new(),
        }
    }

    /// Append a backup channel. Entries with an empty URL and entries past
    /// [`MAX_BACKUPS`] are ignored.
    pub fn with_backup(mut self, playlist_id: impl Into<String>, url: impl Into<String>) -> Self {
        let url = url.into();
        if !url.is_empty() && self.backups.len() < MAX_BACKUPS {
            self.backups.push(BackupChannel {
                playlist_id: playlist_id.into(),
                url,
            });
        }
        self
    }

    /// The primary upstream target.
    pub fn primary(&self) -> StreamTarget {
        StreamTarget {
            playlist_id: self.playlist_id.clone(),
            url: self.url.clone(),
        }
    }
}

/// HTTP proxy used by the transcoder for upstream requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyAddr {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for ProxyAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "http://{}:{}", self.host, self.port)
    }
}

/// Per-playlist provider parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderParams {
    /// Display name of the playlist (for logging).
    pub name: String,
    pub buffer_mode: BufferMode,
    /// Maximum concurrent upstream connections.
    pub tuner_limit: usize,
    pub proxy: Option<ProxyAddr>,
    /// Overrides the transcoder's default user agent.
    pub user_agent: Option<String>,
    /// Extra HTTP headers for upstream requests.
    pub headers: BTreeMap<String, String>,
}

impl ProviderParams {
    pub fn new(name: impl Into<String>, buffer_mode: BufferMode, tuner_limit: usize) -> Self {
        Self {
            name: name.into(),
            buffer_mode,
            tuner_limit,
            proxy: None,
            user_agent: None,
            headers: BTreeMap::new(),
        }
    }
}

/// Summary counters for the status panel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub active_playlists: usize,
    pub active_viewers: usize,
}

/// Status of one playlist session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub playlist_id: String,
    pub playlist_name: String,
    pub buffer_mode: BufferMode,
    pub tuner_limit: usize,
    pub streams: Vec<StreamStatus>,
}

/// Status of one relayed stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamStatus {
    pub slot: u32,
    pub channel_name: String,
    pub url: String,
    pub fingerprint: String,
    pub ready: bool,
    pub viewers: u32,
    pub segments_written: u64,
    pub bytes_buffered: u64,
    pub uptime_seconds: u64,
    pub error: Option<String>,
}
