//! Viewer session handling.
//!
//! A [`ViewerSession`] serves one HTTP viewer: it attaches to a shared stream,
//! copies completed segments into the response body, and walks the
//! channel's backups when the stream fails.

use std::collections::VecDeque;
use std::io;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, info, warn};
use tokio::sync::{mpsc, oneshot};
use tvrelay_protocol::{ChannelRequest, ServeError, StreamError, SEGMENT_RING_LEN};

use crate::buffer::sniff;
use crate::buffer::store::{list_segments, segment_name};
use crate::buffer::SegmentStore;
use crate::tuner::failover::FailoverPlan;
use crate::tuner::key::ViewerKey;
use crate::tuner::pool::{Attached, SessionRegistry, StreamHandle};
use crate::tuner::shared::{SharedStream, StreamState};

/// Response body chunks queued ahead of a slow viewer.
const BODY_QUEUE_LEN: usize = 8;

/// Interval between placeholder repeats.
const PLACEHOLDER_INTERVAL: Duration = Duration::from_secs(1);

/// How the response starts. Sent once, before any body bytes.
#[derive(Debug)]
pub enum ResponseHead {
    /// The playlist is not buffered; send the viewer to the source.
    Redirect(String),
    /// Live stream with the content type of its first segment.
    Live { content_type: &'static str },
    /// No tuner was free; the body repeats the placeholder.
    Placeholder,
    /// Nothing could be served.
    Failed(ServeError),
}

/// Receiving side of a viewer session.
pub struct ViewerResponse {
    pub head: oneshot::Receiver<ResponseHead>,
    pub body: mpsc::Receiver<Bytes>,
}

/// Placeholder used when no file is configured: MPEG-TS null packets.
pub fn default_placeholder() -> Bytes {
    let mut buf = BytesMut::with_capacity(188 * 7);
    for _ in 0..7 {
        buf.put_slice(&[0x47, 0x1F, 0xFF, 0x10]);
        buf.put_bytes(0xFF, 184);
    }
    buf.freeze()
}

/// One viewer connection.
pub struct ViewerSession {
    id: u64,
    viewer: ViewerKey,
    registry: Arc<SessionRegistry>,
    placeholder: Bytes,
    head_tx: Option<oneshot::Sender<ResponseHead>>,
    body_tx: mpsc::Sender<Bytes>,
    /// Segments sent from the current stream, oldest first.
    seen: VecDeque<u64>,
}

impl ViewerSession {
    pub fn new(
        id: u64,
        viewer: ViewerKey,
        registry: Arc<SessionRegistry>,
        placeholder: Bytes,
    ) -> (Self, ViewerResponse) {
        let (head_tx, head_rx) = oneshot::channel();
        let (body_tx, body_rx) = mpsc::channel(BODY_QUEUE_LEN);
        let session = Self {
            id,
            viewer,
            registry,
            placeholder,
            head_tx: Some(head_tx),
            body_tx,
            seen: VecDeque::with_capacity(SEGMENT_RING_LEN + 1),
        };
        (
            session,
            ViewerResponse {
                head: head_rx,
                body: body_rx,
            },
        )
    }

    /// Serve `request` until the viewer disconnects or every target failed.
    pub async fn run(mut self, request: ChannelRequest) {
        info!(
            "[Viewer {}] {} requested {} ({})",
            self.id, self.viewer, request.channel_name, request.playlist_id
        );

        let mut plan = FailoverPlan::new(&request);
        let mut limited = false;
        let mut last_error: Option<ServeError> = None;

        while let Some(target) = plan.current() {
            if self.body_tx.is_closed() {
                debug!("[Viewer {}] Disconnected before attach", self.id);
                return;
            }

            let attached = self
                .registry
                .attach(&target, &request.channel_name, plan.remaining_backups())
                .await;
            match attached {
                Ok(Attached::Direct { url }) => {
                    info!("[Viewer {}] Redirecting to {}", self.id, url);
                    self.send_head(ResponseHead::Redirect(url));
                    return;
                }
                Ok(Attached::Stream(handle)) => {
                    let outcome = self.serve(&handle).await;
                    handle.detach().await;
                    match outcome {
                        Ok(()) => {
                            info!("[Viewer {}] Disconnected from {}", self.id, request.channel_name);
                            return;
                        }
                        Err(e) => {
                            warn!("[Viewer {}] {} failed: {}", self.id, target.url, e);
                            last_error = Some(e.into());
                        }
                    }
                }
                Err(e) => {
                    warn!("[Viewer {}] {}", self.id, e);
                    limited |= e.is_tuner_limit();
                    last_error = Some(e.into());
                }
            }

            if let Some(next) = plan.advance() {
                info!(
                    "[Viewer {}] Failing over to {:?}: {} ({})",
                    self.id,
                    plan.stage(),
                    next.url,
                    next.playlist_id
                );
            }
        }

        if self.head_tx.is_none() {
            // Already streaming: ending the body is all that is left.
            info!("[Viewer {}] All sources for {} failed", self.id, request.channel_name);
            return;
        }

        if limited {
            warn!(
                "[Viewer {}] No tuner available for {}, sending placeholder",
                self.id, request.channel_name
            );
            if self.send_head(ResponseHead::Placeholder) {
                self.play_placeholder().await;
            }
        } else {
            let err = last_error.unwrap_or(ServeError::NoTunerAvailable);
            warn!("[Viewer {}] Giving up on {}: {}", self.id, request.channel_name, err);
            self.send_head(ResponseHead::Failed(err));
        }
    }

    /// Copy completed segments of one stream to the viewer.
    ///
    /// Returns `Ok` when the viewer went away and `Err` when the stream did.
    async fn serve(&mut self, handle: &StreamHandle) -> Result<(), StreamError> {
        let stream = handle.stream();
        let registry = Arc::clone(&self.registry);
        let store = registry.store();
        let folder = stream.info.folder.as_path();
        let poll_interval = registry.config().poll_interval();

        if !self.wait_ready(stream).await? {
            return Ok(());
        }

        self.seen.clear();
        let mut last_seen = 0u64;

        loop {
            if self.body_tx.is_closed() {
                return Ok(());
            }
            // A failed stream still gets one last pass for its closed segments.
            let failure = stream.error();
            if failure.is_none() && stream.is_closed() {
                return Err(StreamError::Gone);
            }

            let current = stream.current_segment();
            let segments = match list_segments(store, folder).await {
                Ok(list) => list,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    return Err(failure.or_else(|| stream.error()).unwrap_or(StreamError::Gone));
                }
                Err(e) => return Err(StreamError::ReadFailed(e.to_string())),
            };

            let from = last_seen;
            let mut sent = false;
            for seq in segments.into_iter().filter(|s| *s > from && *s < current) {
                let data = match store.read(&folder.join(segment_name(seq))).await {
                    Ok(data) => data,
                    // Evicted while we were behind.
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        last_seen = seq;
                        continue;
                    }
                    Err(e) => return Err(StreamError::ReadFailed(e.to_string())),
                };

                if let Some(head) = self.head_tx.take() {
                    let content_type = sniff::content_type(&data);
                    info!(
                        "[Viewer {}] Streaming {} as {}",
                        self.id, stream.info.channel_name, content_type
                    );
                    if head.send(ResponseHead::Live { content_type }).is_err() {
                        return Ok(());
                    }
                }
                if self.body_tx.send(data).await.is_err() {
                    return Ok(());
                }
                last_seen = seq;
                self.mark_seen(store, folder, seq).await;
                sent = true;
            }

            if let Some(e) = failure {
                return Err(e);
            }
            if !sent {
                tokio::select! {
                    _ = self.body_tx.closed() => return Ok(()),
                    _ = tokio::time::sleep(poll_interval) => {}
                }
            }
        }
    }

    /// Wait for the first segment. `Ok(false)` means the viewer left.
    async fn wait_ready(&self, stream: &SharedStream) -> Result<bool, StreamError> {
        let config = self.registry.config();
        let timeout_secs = config.first_byte_timeout_secs;
        let mut state_rx = stream.subscribe();
        let settled = async {
            state_rx
                .wait_for(|s| *s != StreamState::Starting)
                .await
                .map(|s| s.clone())
        };

        tokio::select! {
            _ = self.body_tx.closed() => Ok(false),
            res = tokio::time::timeout(config.first_byte_timeout(), settled) => match res {
                Err(_) => Err(StreamError::FirstByteTimeout(timeout_secs)),
                Ok(Err(_)) => Err(StreamError::Gone),
                Ok(Ok(StreamState::Ready)) => Ok(true),
                Ok(Ok(StreamState::Failed(e))) => Err(e),
                Ok(Ok(_)) => Err(StreamError::Gone),
            },
        }
    }

    /// Remember `seq` as sent. Segments beyond the last twenty are removed.
    async fn mark_seen(&mut self, store: &dyn SegmentStore, folder: &Path, seq: u64) {
        self.seen.push_back(seq);
        while self.seen.len() > SEGMENT_RING_LEN {
            let Some(old) = self.seen.pop_front() else {
                break;
            };
            match store.remove(&folder.join(segment_name(old))).await {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => debug!("[Viewer {}] Failed to evict segment {}: {}", self.id, old, e),
            }
        }
    }

    fn send_head(&mut self, head: ResponseHead) -> bool {
        match self.head_tx.take() {
            Some(tx) => tx.send(head).is_ok(),
            None => false,
        }
    }

    /// Repeat the placeholder until the viewer disconnects.
    async fn play_placeholder(&self) {
        let mut ticker = tokio::time::interval(PLACEHOLDER_INTERVAL);
        loop {
            tokio::select! {
                _ = self.body_tx.closed() => return,
                _ = ticker.tick() => {
                    if self.body_tx.send(self.placeholder.clone()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}
