//! Transcoder supervision.
//!
//! A [`Supervisor`] owns the transcoder of one stream: it starts the process
//! through a [`FeedLauncher`], cuts its stdout into numbered segments in the
//! [`SegmentStore`](super::SegmentStore), forwards stderr to the log and stops
//! the process when the stream loses its last viewer, times out or fails.

use std::collections::VecDeque;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tvrelay_protocol::{BufferMode, ProviderParams, StreamError, SEGMENT_RING_LEN};

use crate::buffer::args::{TranscoderCommand, TranscoderConfig};
use crate::buffer::store::segment_name;
use crate::tuner::pool::SessionRegistry;
use crate::tuner::shared::SharedStream;

/// Size of each read from the transcoder's stdout.
const READ_CHUNK_SIZE: usize = 64 * 1024;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Output of a running transcoder.
///
/// Owns the child process (if any) together with its stdout/stderr handles.
/// [`Feed::shutdown`] is the only way the process is stopped.
pub struct Feed {
    stdout: BoxedReader,
    stderr: Option<BoxedReader>,
    child: Option<Child>,
}

impl Feed {
    /// Wrap a spawned process. Its stdout must be piped.
    pub fn from_process(mut child: Child) -> Result<Self, StreamError> {
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| StreamError::StartupFailed("stdout not captured".to_string()))?;
        let stderr = child.stderr.take().map(|s| Box::new(s) as BoxedReader);
        Ok(Self {
            stdout: Box::new(stdout),
            stderr,
            child: Some(child),
        })
    }

    /// A feed backed by an arbitrary reader, with no process behind it.
    #[cfg(test)]
    pub fn from_reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self {
            stdout: Box::new(reader),
            stderr: None,
            child: None,
        }
    }

    #[cfg(test)]
    pub fn with_stderr(mut self, reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(reader));
        self
    }

    /// Process id, when backed by a process.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(|c| c.id())
    }

    /// Kill the process and wait for it to exit.
    pub async fn shutdown(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            // Already exited.
            debug!("[Transcoder] kill: {}", e);
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => debug!("[Transcoder] Process exited: {}", status),
            Ok(Err(e)) => warn!("[Transcoder] Failed to wait for process: {}", e),
            Err(_) => error!("[Transcoder] Process did not exit within 5s after kill"),
        }
    }
}

/// Starts the transcoder for a stream.
pub trait FeedLauncher: Send + Sync {
    fn launch(
        &self,
        url: &str,
        mode: BufferMode,
        params: &ProviderParams,
    ) -> Result<Feed, StreamError>;
}

/// Launches ffmpeg or VLC as a child process.
#[derive(Debug, Clone, Default)]
pub struct ProcessLauncher {
    config: TranscoderConfig,
}

impl ProcessLauncher {
    pub fn new(config: TranscoderConfig) -> Self {
        Self { config }
    }
}

impl FeedLauncher for ProcessLauncher {
    fn launch(
        &self,
        url: &str,
        mode: BufferMode,
        params: &ProviderParams,
    ) -> Result<Feed, StreamError> {
        let cmd = TranscoderCommand::build(&self.config, mode, url, params)?;
        debug!(
            "[Transcoder] {} {}",
            cmd.program.display(),
            cmd.args.join(" ")
        );

        let child = Command::new(&cmd.program)
            .args(&cmd.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                StreamError::StartupFailed(format!("{}: {}", cmd.program.display(), e))
            })?;

        let feed = Feed::from_process(child)?;
        info!(
            "[Transcoder] Started {} (pid {:?}) for {}",
            mode,
            feed.pid(),
            url
        );
        Ok(feed)
    }
}

/// Supervises the transcoder of one stream.
pub struct Supervisor {
    registry: Arc<SessionRegistry>,
    stream: Arc<SharedStream>,
    params: ProviderParams,
}

impl Supervisor {
    pub fn new(
        registry: Arc<SessionRegistry>,
        stream: Arc<SharedStream>,
        params: ProviderParams,
    ) -> Self {
        Self {
            registry,
            stream,
            params,
        }
    }

    /// Run until the feed ends, the stream loses its viewers, or a fatal
    /// error occurs. Fatal errors retire the stream.
    pub async fn run(self) {
        let info = &self.stream.info;
        info!(
            "[Transcoder] Buffering {} ({}) from {} [{}], {} backup(s)",
            info.channel_name,
            info.playlist_name,
            info.url,
            self.params.buffer_mode,
            info.backups.len()
        );

        match self.supervise().await {
            Ok(()) => {
                info!("[Transcoder] Stopped for {}", info.channel_name);
            }
            Err(e) => {
                error!(
                    "[Transcoder] {} ({}) failed: {}",
                    info.channel_name, info.playlist_name, e
                );
                self.registry.retire(&self.stream, e).await;
            }
        }
    }

    async fn supervise(&self) -> Result<(), StreamError> {
        let folder = &self.stream.info.folder;
        if self.should_stop() {
            return Ok(());
        }

        self.registry.prepare_folder(folder).await.map_err(|e| {
            StreamError::StartupFailed(format!("cannot create {}: {}", folder.display(), e))
        })?;

        let mut feed = self.registry.launcher().launch(
            &self.stream.info.url,
            self.params.buffer_mode,
            &self.params,
        )?;

        if let Some(stderr) = feed.stderr.take() {
            tokio::spawn(log_stderr(Arc::clone(&self.stream), stderr));
        }

        let result = self.pump(&mut feed).await;
        feed.shutdown().await;
        result
    }

    /// Copy transcoder output into rotating segments.
    async fn pump(&self, feed: &mut Feed) -> Result<(), StreamError> {
        let config = self.registry.config();
        let store = self.registry.store();
        let threshold = config.segment_threshold();
        let timeout_ticks = config.first_byte_timeout_secs;

        let mut seq: u64 = 1;
        let mut segment = self.open_segment(seq).await?;
        let mut filled = 0usize;
        let mut finished: VecDeque<u64> = VecDeque::with_capacity(SEGMENT_RING_LEN + 1);
        let mut buf = vec![0u8; READ_CHUNK_SIZE];

        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;
        let mut ticks: u64 = 0;
        let mut state_rx = self.stream.subscribe();

        loop {
            if self.should_stop() {
                info!(
                    "[Transcoder] No viewers left for {}, stopping",
                    self.stream.info.channel_name
                );
                return Ok(());
            }

            tokio::select! {
                read = feed.stdout.read(&mut buf) => {
                    let n = read.map_err(|e| StreamError::ReadFailed(e.to_string()))?;
                    if n == 0 {
                        if self.should_stop() {
                            return Ok(());
                        }
                        if filled > 0 {
                            // Let viewers read the tail before the stream is retired.
                            self.stream.record_segment();
                            self.stream.set_current_segment(seq + 1);
                            debug!(
                                "[Transcoder] Closed last segment {} of {} ({} bytes)",
                                seq, self.stream.info.channel_name, filled
                            );
                        }
                        return Err(StreamError::FeedEnded(format!(
                            "{} closed its output",
                            self.params.buffer_mode
                        )));
                    }
                    if filled == 0 && seq == 1 {
                        info!("[Transcoder] Receiving data for {}", self.stream.info.channel_name);
                    }

                    if let Err(e) = store.append(&segment, &buf[..n]).await {
                        if self.should_stop() {
                            return Ok(());
                        }
                        return Err(StreamError::WriteFailed(e.to_string()));
                    }
                    filled += n;
                    self.stream.add_bytes(n);

                    if filled >= threshold {
                        self.stream.record_segment();
                        if self.stream.mark_ready() {
                            info!(
                                "[Transcoder] First segment ready for {} ({} bytes)",
                                self.stream.info.channel_name, filled
                            );
                        }

                        finished.push_back(seq);
                        while finished.len() > SEGMENT_RING_LEN {
                            if let Some(old) = finished.pop_front() {
                                self.evict(old).await;
                            }
                        }

                        seq += 1;
                        filled = 0;
                        segment = match self.open_segment(seq).await {
                            Ok(path) => path,
                            Err(_) if self.should_stop() => return Ok(()),
                            Err(e) => return Err(e),
                        };
                    }
                }
                _ = ticker.tick() => {
                    ticks += 1;
                    if !self.stream.is_ready() && ticks >= timeout_ticks {
                        let received = store.stat(&segment).await.unwrap_or(0);
                        warn!(
                            "[Transcoder] No segment for {} after {}s ({} of {} bytes)",
                            self.stream.info.channel_name, ticks, received, threshold
                        );
                        return Err(StreamError::FirstByteTimeout(timeout_ticks));
                    }
                }
                _ = state_rx.changed() => {}
            }
        }
    }

    fn should_stop(&self) -> bool {
        self.stream.is_closed() || !self.stream.has_viewers()
    }

    async fn open_segment(&self, seq: u64) -> Result<PathBuf, StreamError> {
        let path = self.stream.info.folder.join(segment_name(seq));
        self.registry
            .store()
            .create(&path)
            .await
            .map_err(|e| StreamError::WriteFailed(format!("{}: {}", path.display(), e)))?;
        self.stream.set_current_segment(seq);
        debug!("[Transcoder] Writing {}", path.display());
        Ok(path)
    }

    async fn evict(&self, seq: u64) {
        let path = self.stream.info.folder.join(segment_name(seq));
        match self.registry.store().remove(&path).await {
            Ok(()) => debug!("[Transcoder] Evicted {}", path.display()),
            // Viewers evict seen segments too.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("[Transcoder] Failed to evict {}: {}", path.display(), e),
        }
    }
}

/// Forward transcoder stderr to the log: info while the first segment is
/// filling, debug afterwards.
async fn log_stderr(stream: Arc<SharedStream>, stderr: BoxedReader) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                if stream.is_ready() {
                    debug!("[Transcoder] {}: {}", stream.info.channel_name, line);
                } else {
                    info!("[Transcoder] {}: {}", stream.info.channel_name, line);
                }
            }
            Ok(None) => break,
            Err(e) => {
                debug!("[Transcoder] stderr closed: {}", e);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::store::list_segments;
    use crate::test_helpers::{eventually, test_registry, Script, ScriptedLauncher};
    use crate::tuner::key::Fingerprint;
    use crate::tuner::pool::Attached;
    use crate::tuner::shared::StreamInfo;
    use tvrelay_protocol::StreamTarget;

    fn target(url: &str) -> StreamTarget {
        StreamTarget {
            playlist_id: "M1".to_string(),
            url: url.to_string(),
        }
    }

    #[tokio::test]
    async fn test_segments_rotate_and_evict() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let registry = test_registry(Arc::clone(&launcher), 1);

        let Attached::Stream(handle) = registry
            .attach(&target("http://src/ch1"), "Ch 1", &[])
            .await
            .unwrap()
        else {
            panic!("expected a buffered stream");
        };
        let stream = Arc::clone(handle.stream());

        let produced = eventually(|| {
            let stream = Arc::clone(&stream);
            async move { stream.segments_written() > SEGMENT_RING_LEN as u64 + 5 }
        })
        .await;
        assert!(produced);
        assert!(stream.is_ready());

        let segments = list_segments(registry.store(), &stream.info.folder)
            .await
            .unwrap();
        assert!(segments.len() <= SEGMENT_RING_LEN + 1, "{} segments kept", segments.len());
        assert!(segments.windows(2).all(|w| w[0] < w[1]));
        assert!(!segments.contains(&1));

        handle.detach().await;
        assert!(eventually(|| {
            let launcher = Arc::clone(&launcher);
            async move { launcher.live_feeds() == 0 }
        })
        .await);
    }

    #[tokio::test]
    async fn test_feed_end_closes_partial_segment() {
        let launcher = Arc::new(ScriptedLauncher::new());
        launcher.script("http://src/short", Script::StreamThenEnd(3));
        let registry = test_registry(Arc::clone(&launcher), 1);

        let url = "http://src/short".to_string();
        let fingerprint = Fingerprint::of(&url);
        let stream = SharedStream::new(StreamInfo {
            slot: 0,
            playlist_id: "M1".to_string(),
            playlist_name: "Main".to_string(),
            channel_name: "Short".to_string(),
            folder: PathBuf::from("/tvrelay-test/M1").join(fingerprint.as_str()),
            url,
            fingerprint,
            backups: Vec::new(),
        });
        stream.add_viewer();
        let params = ProviderParams::new("Main", BufferMode::Ffmpeg, 1);
        let supervisor = Supervisor::new(Arc::clone(&registry), Arc::clone(&stream), params);

        let result = tokio::time::timeout(Duration::from_secs(5), supervisor.supervise())
            .await
            .unwrap();
        assert!(matches!(result, Err(StreamError::FeedEnded(_))));

        // Every byte of the feed sits in a segment viewers may read.
        let current = stream.current_segment();
        assert_eq!(stream.segments_written(), current - 1);
        let mut total = 0;
        for seq in list_segments(registry.store(), &stream.info.folder)
            .await
            .unwrap()
            .into_iter()
            .filter(|s| *s < current)
        {
            total += registry
                .store()
                .read(&stream.info.folder.join(segment_name(seq)))
                .await
                .unwrap()
                .len();
        }
        assert_eq!(total, 3 * 4 * 188);
    }

    #[tokio::test]
    async fn test_first_byte_timeout_retires_stream() {
        let launcher = Arc::new(ScriptedLauncher::new());
        launcher.script("http://src/silent", Script::Silent);
        let registry = test_registry(Arc::clone(&launcher), 1);

        let Attached::Stream(handle) = registry
            .attach(&target("http://src/silent"), "Silent", &[])
            .await
            .unwrap()
        else {
            panic!("expected a buffered stream");
        };
        let mut state = handle.stream().subscribe();

        let failed = tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| matches!(s, crate::tuner::shared::StreamState::Failed(_))),
        )
        .await
        .is_ok_and(|r| r.is_ok());
        assert!(failed);
        assert_eq!(handle.stream().error(), Some(StreamError::FirstByteTimeout(1)));

        // The slot is released even though the viewer is still attached.
        assert_eq!(registry.stream_count("M1").await, 0);
        handle.detach().await;
        assert_eq!(registry.active_playlists().await, 0);
    }

    #[tokio::test]
    async fn test_startup_failure_is_recorded() {
        let launcher = Arc::new(ScriptedLauncher::new());
        launcher.script("http://src/missing", Script::Refuse);
        let registry = test_registry(Arc::clone(&launcher), 1);

        let Attached::Stream(handle) = registry
            .attach(&target("http://src/missing"), "Missing", &[])
            .await
            .unwrap()
        else {
            panic!("expected a buffered stream");
        };

        let stream = Arc::clone(handle.stream());
        assert!(eventually(|| {
            let stream = Arc::clone(&stream);
            async move { stream.error().is_some() }
        })
        .await);
        assert!(matches!(stream.error(), Some(StreamError::StartupFailed(_))));
        handle.detach().await;
    }

    #[tokio::test]
    async fn test_process_launcher_reports_missing_binary() {
        let launcher = ProcessLauncher::new(TranscoderConfig {
            ffmpeg_path: PathBuf::from("/nonexistent/tvrelay-ffmpeg"),
            ..Default::default()
        });
        let params = ProviderParams::new("Test", BufferMode::Ffmpeg, 1);
        let err = launcher
            .launch("http://src/ch1", BufferMode::Ffmpeg, &params)
            .err()
            .unwrap();
        assert!(matches!(err, StreamError::StartupFailed(_)));
    }

    #[tokio::test]
    async fn test_feed_shutdown_kills_process() {
        let child = Command::new("sleep")
            .arg("30")
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let Ok(child) = child else {
            // No `sleep` binary on this host.
            return;
        };
        let mut feed = Feed::from_process(child).unwrap();
        assert!(feed.pid().is_some());

        tokio::time::timeout(Duration::from_secs(5), feed.shutdown())
            .await
            .unwrap();
        assert!(feed.pid().is_none());

        // EOF once the process is gone.
        let mut buf = [0u8; 16];
        assert_eq!(feed.stdout.read(&mut buf).await.unwrap(), 0);
    }
}
