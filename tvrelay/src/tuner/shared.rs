//! A relayed upstream stream shared by any number of viewers.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use log::debug;
use tokio::sync::watch;
use tvrelay_protocol::{BackupChannel, StreamError, StreamStatus};

use crate::tuner::key::Fingerprint;

/// Lifecycle state of a stream, observed by its supervisor and viewers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Transcoder started, first segment not complete yet.
    Starting,
    /// At least one segment is complete.
    Ready,
    /// A fatal error was recorded.
    Failed(StreamError),
    /// Torn down after the last viewer left.
    Closed,
}

/// Descriptive fields of a stream, fixed at creation.
#[derive(Debug, Clone)]
pub struct StreamInfo {
    pub slot: u32,
    pub playlist_id: String,
    pub playlist_name: String,
    pub channel_name: String,
    pub url: String,
    pub fingerprint: Fingerprint,
    pub folder: PathBuf,
    pub backups: Vec<BackupChannel>,
}

/// One active relay of a single upstream URL.
///
/// Holds the viewer-count record for the stream: the number of attached
/// viewers and the fatal error, if one was recorded.
pub struct SharedStream {
    pub info: StreamInfo,
    /// Attached viewers.
    viewers: AtomicU32,
    /// Ready/failed/closed state.
    state_tx: watch::Sender<StreamState>,
    /// Segment currently being written by the supervisor.
    current_segment: AtomicU64,
    segments_written: AtomicU64,
    bytes_buffered: AtomicU64,
    /// Set once when teardown starts.
    torn_down: AtomicBool,
    created_at: Instant,
}

impl SharedStream {
    /// Create a stream with no viewers.
    pub fn new(info: StreamInfo) -> Arc<Self> {
        let (state_tx, _) = watch::channel(StreamState::Starting);
        Arc::new(Self {
            info,
            viewers: AtomicU32::new(0),
            state_tx,
            current_segment: AtomicU64::new(0),
            segments_written: AtomicU64::new(0),
            bytes_buffered: AtomicU64::new(0),
            torn_down: AtomicBool::new(false),
            created_at: Instant::now(),
        })
    }

    /// Add a viewer. Returns the new count.
    pub fn add_viewer(&self) -> u32 {
        let count = self.viewers.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("[Stream] {} viewer attached, total: {}", self.info.channel_name, count);
        count
    }

    /// Remove a viewer. The count never goes below zero. Returns the new count.
    pub fn remove_viewer(&self) -> u32 {
        let prev = self
            .viewers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_sub(1)))
            .unwrap_or(0);
        let count = prev.saturating_sub(1);
        debug!("[Stream] {} viewer detached, remaining: {}", self.info.channel_name, count);
        count
    }

    pub fn viewer_count(&self) -> u32 {
        self.viewers.load(Ordering::SeqCst)
    }

    pub fn has_viewers(&self) -> bool {
        self.viewer_count() > 0
    }

    /// Subscribe to state changes.
    pub fn subscribe(&self) -> watch::Receiver<StreamState> {
        self.state_tx.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        matches!(*self.state_tx.borrow(), StreamState::Ready)
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.state_tx.borrow(), StreamState::Closed)
    }

    /// The recorded fatal error, if any.
    pub fn error(&self) -> Option<StreamError> {
        match &*self.state_tx.borrow() {
            StreamState::Failed(e) => Some(e.clone()),
            _ => None,
        }
    }

    /// Flip the ready flag. Returns true only for the first call.
    pub fn mark_ready(&self) -> bool {
        self.state_tx.send_if_modified(|state| {
            if *state == StreamState::Starting {
                *state = StreamState::Ready;
                true
            } else {
                false
            }
        })
    }

    /// Record a fatal error. Only the first error of a live stream is kept;
    /// returns true if this call recorded it.
    pub fn fail(&self, error: StreamError) -> bool {
        self.state_tx.send_if_modified(|state| match state {
            StreamState::Starting | StreamState::Ready => {
                *state = StreamState::Failed(error);
                true
            }
            _ => false,
        })
    }

    /// Mark the stream closed, waking the supervisor.
    pub fn close(&self) {
        self.state_tx.send_replace(StreamState::Closed);
    }

    /// Claim the teardown. Returns true for exactly one caller.
    pub fn begin_teardown(&self) -> bool {
        !self.torn_down.swap(true, Ordering::SeqCst)
    }

    pub fn current_segment(&self) -> u64 {
        self.current_segment.load(Ordering::SeqCst)
    }

    pub fn set_current_segment(&self, seq: u64) {
        self.current_segment.store(seq, Ordering::SeqCst);
    }

    pub fn record_segment(&self) {
        self.segments_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn segments_written(&self) -> u64 {
        self.segments_written.load(Ordering::Relaxed)
    }

    pub fn add_bytes(&self, n: usize) {
        self.bytes_buffered.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Status row for the web panel.
    pub fn status(&self) -> StreamStatus {
        StreamStatus {
            slot: self.info.slot,
            channel_name: self.info.channel_name.clone(),
            url: self.info.url.clone(),
            fingerprint: self.info.fingerprint.to_string(),
            ready: self.is_ready(),
            viewers: self.viewer_count(),
            segments_written: self.segments_written(),
            bytes_buffered: self.bytes_buffered.load(Ordering::Relaxed),
            uptime_seconds: self.created_at.elapsed().as_secs(),
            error: self.error().map(|e| e.to_string()),
        }
    }
}

impl Drop for SharedStream {
    fn drop(&mut self) {
        debug!("SharedStream dropped for {}", self.info.url);
    }
}

#[cfg(test)]
pub(crate) fn test_info(url: &str) -> StreamInfo {
    StreamInfo {
        slot: 0,
        playlist_id: "M1".to_string(),
        playlist_name: "Test".to_string(),
        channel_name: "Test channel".to_string(),
        url: url.to_string(),
        fingerprint: Fingerprint::of(url),
        folder: PathBuf::from("/tmp/tvrelay/M1").join(Fingerprint::of(url).as_str()),
        backups: Vec::new(),
    }
}
