//! Stream buffering: segment storage and transcoder supervision.
//!
//! This module provides:
//! - [`SegmentStore`]: memory or disk storage for rotating segments
//! - [`Supervisor`]: one transcoder process per stream, writing segments
//! - [`TranscoderCommand`]: ffmpeg/VLC command line construction
//! - [`sniff`]: content type detection for the first segment

pub mod args;
pub mod sniff;
pub mod store;
pub mod transcoder;

use std::path::PathBuf;
use std::time::Duration;

use tvrelay_protocol::DEFAULT_FIRST_BYTE_TIMEOUT_SECS;

pub use args::TranscoderConfig;
pub use store::{DiskStore, MemoryStore, SegmentStore};
pub use transcoder::{FeedLauncher, ProcessLauncher, Supervisor};

/// Buffer tuning parameters.
#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// Buffer size in KB. A segment is closed once it holds half of this.
    pub buffer_size_kb: usize,
    /// Root folder for session folders inside the segment store.
    pub temp_dir: PathBuf,
    /// One-second ticks to wait for the first complete segment.
    pub first_byte_timeout_secs: u64,
    /// Sleep between segment polls of a viewer.
    pub poll_interval_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            buffer_size_kb: 1024,
            temp_dir: std::env::temp_dir().join("tvrelay"),
            first_byte_timeout_secs: DEFAULT_FIRST_BYTE_TIMEOUT_SECS,
            poll_interval_ms: 100,
        }
    }
}

impl BufferConfig {
    /// Bytes after which a segment is closed.
    pub fn segment_threshold(&self) -> usize {
        (self.buffer_size_kb * 1024 / 2).max(1)
    }

    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_secs(self.first_byte_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_threshold() {
        let config = BufferConfig::default();
        assert_eq!(config.segment_threshold(), 512 * 1024);

        let tiny = BufferConfig {
            buffer_size_kb: 0,
            ..Default::default()
        };
        assert_eq!(tiny.segment_threshold(), 1);
    }
}
