//! Test fixtures: a scripted transcoder launcher and a small registry.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWriteExt, DuplexStream};
use tvrelay_protocol::{BufferMode, ProviderParams, StreamError};

use crate::buffer::transcoder::Feed;
use crate::buffer::{BufferConfig, FeedLauncher, MemoryStore, SegmentStore};
use crate::directory::StaticDirectory;
use crate::tuner::pool::SessionRegistry;

/// One TS packet: sync byte, then filler.
pub fn ts_packet() -> [u8; 188] {
    let mut packet = [0xFFu8; 188];
    packet[0] = 0x47;
    packet[1] = 0x1F;
    packet[2] = 0xFF;
    packet[3] = 0x10;
    packet
}

/// What a scripted feed does once launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Script {
    /// Write TS packets until the reader goes away.
    Stream,
    /// Write this many chunks of TS packets, then close the output.
    StreamThenEnd(usize),
    /// Close the output without writing anything.
    EndImmediately,
    /// Keep the output open but never write.
    Silent,
    /// Fail to launch.
    Refuse,
}

/// A [`FeedLauncher`] backed by in-memory pipes.
pub struct ScriptedLauncher {
    scripts: Mutex<HashMap<String, Script>>,
    launched: Mutex<Vec<String>>,
    live_feeds: Arc<AtomicUsize>,
    idle_writers: Mutex<Vec<DuplexStream>>,
}

impl ScriptedLauncher {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            launched: Mutex::new(Vec::new()),
            live_feeds: Arc::new(AtomicUsize::new(0)),
            idle_writers: Mutex::new(Vec::new()),
        }
    }

    /// Set the behaviour for `url`. Unscripted URLs stream.
    pub fn script(&self, url: &str, script: Script) {
        self.scripts.lock().unwrap().insert(url.to_string(), script);
    }

    /// URLs launched so far, in order.
    pub fn launched(&self) -> Vec<String> {
        self.launched.lock().unwrap().clone()
    }

    pub fn launch_count(&self, url: &str) -> usize {
        self.launched.lock().unwrap().iter().filter(|u| *u == url).count()
    }

    /// Streaming feeds whose reader is still open.
    pub fn live_feeds(&self) -> usize {
        self.live_feeds.load(Ordering::SeqCst)
    }
}

impl FeedLauncher for ScriptedLauncher {
    fn launch(
        &self,
        url: &str,
        _mode: BufferMode,
        _params: &ProviderParams,
    ) -> Result<Feed, StreamError> {
        self.launched.lock().unwrap().push(url.to_string());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(url)
            .copied()
            .unwrap_or(Script::Stream);

        match script {
            Script::Refuse => Err(StreamError::StartupFailed("scripted refusal".to_string())),
            Script::EndImmediately => {
                let (reader, writer) = tokio::io::duplex(1024);
                drop(writer);
                Ok(Feed::from_reader(reader))
            }
            Script::Silent => {
                let (reader, writer) = tokio::io::duplex(1024);
                self.idle_writers.lock().unwrap().push(writer);
                Ok(Feed::from_reader(reader))
            }
            Script::Stream | Script::StreamThenEnd(_) => {
                let limit = match script {
                    Script::StreamThenEnd(n) => n,
                    _ => usize::MAX,
                };
                let (reader, mut writer) = tokio::io::duplex(16 * 1024);
                let live = Arc::clone(&self.live_feeds);
                live.fetch_add(1, Ordering::SeqCst);
                let chunk = ts_packet().repeat(4);
                tokio::spawn(async move {
                    let mut written = 0;
                    while written < limit && writer.write_all(&chunk).await.is_ok() {
                        written += 1;
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                    drop(writer);
                    live.fetch_sub(1, Ordering::SeqCst);
                });
                let banner = std::io::Cursor::new(format!("scripted feed for {}\n", url).into_bytes());
                Ok(Feed::from_reader(reader).with_stderr(banner))
            }
        }
    }
}

pub fn test_buffer_config() -> BufferConfig {
    BufferConfig {
        buffer_size_kb: 2,
        temp_dir: PathBuf::from("/tvrelay-test"),
        first_byte_timeout_secs: 1,
        poll_interval_ms: 5,
    }
}

/// Playlists `M1` and `M2` are buffered with ffmpeg, `DIRECT` is not.
pub fn test_directory(tuner_limit: usize) -> StaticDirectory {
    StaticDirectory::new()
        .with_playlist(
            "M1",
            ProviderParams::new("Main", BufferMode::Ffmpeg, tuner_limit),
        )
        .with_playlist(
            "M2",
            ProviderParams::new("Backup", BufferMode::Ffmpeg, tuner_limit),
        )
        .with_playlist("DIRECT", ProviderParams::new("Direct", BufferMode::None, 1))
}

pub fn test_registry(launcher: Arc<ScriptedLauncher>, tuner_limit: usize) -> Arc<SessionRegistry> {
    test_registry_with_store(launcher, tuner_limit, Arc::new(MemoryStore::new()))
}

pub fn test_registry_with_store(
    launcher: Arc<ScriptedLauncher>,
    tuner_limit: usize,
    store: Arc<dyn SegmentStore>,
) -> Arc<SessionRegistry> {
    SessionRegistry::new(
        Arc::new(test_directory(tuner_limit)),
        store,
        launcher,
        test_buffer_config(),
    )
}

/// Poll `check` until it holds, for up to five seconds.
pub async fn eventually<F, Fut>(check: F) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
