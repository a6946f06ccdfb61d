//! Playlist sessions and shared stream admission.
//!
//! The [`SessionRegistry`] owns one [`PlaylistSession`] per playlist that has
//! buffered streams running. Every change to a session goes through the
//! registry's write lock, so admission, teardown and failure handling never
//! interleave. Segment folders are removed after that lock is released.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tvrelay_protocol::{
    AdmissionError, BackupChannel, ProviderParams, SessionStatus, StreamError, StreamTarget,
};

use crate::buffer::{BufferConfig, FeedLauncher, SegmentStore, Supervisor};
use crate::directory::ProviderDirectory;
use crate::tuner::key::{folder_name, Fingerprint};
use crate::tuner::shared::{SharedStream, StreamInfo};

/// Active buffered streams of one playlist.
pub struct PlaylistSession {
    pub playlist_id: String,
    pub folder: PathBuf,
    pub params: ProviderParams,
    /// Streams by tuner slot.
    streams: BTreeMap<u32, Arc<SharedStream>>,
}

impl PlaylistSession {
    fn new(playlist_id: String, folder: PathBuf, params: ProviderParams) -> Self {
        Self {
            playlist_id,
            folder,
            params,
            streams: BTreeMap::new(),
        }
    }

    #[cfg(test)]
    pub fn stream_count(&self) -> usize {
        self.streams.len()
    }

    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// The running stream for an upstream URL.
    pub fn find_url(&self, url: &str) -> Option<&Arc<SharedStream>> {
        self.streams.values().find(|s| s.info.url == url)
    }

    /// Lowest slot not in use, if the tuner limit allows another stream.
    fn free_slot(&self) -> Option<u32> {
        (0..self.params.tuner_limit as u32).find(|slot| !self.streams.contains_key(slot))
    }

    /// Remove `stream` if it still occupies its slot. Returns true if removed.
    pub fn remove_stream(&mut self, stream: &Arc<SharedStream>) -> bool {
        match self.streams.get(&stream.info.slot) {
            Some(current) if Arc::ptr_eq(current, stream) => {
                self.streams.remove(&stream.info.slot);
                true
            }
            _ => false,
        }
    }

    fn viewer_count(&self) -> usize {
        self.streams.values().map(|s| s.viewer_count() as usize).sum()
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            playlist_id: self.playlist_id.clone(),
            playlist_name: self.params.name.clone(),
            buffer_mode: self.params.buffer_mode,
            tuner_limit: self.params.tuner_limit,
            streams: self.streams.values().map(|s| s.status()).collect(),
        }
    }
}

/// Result of attaching a viewer to a channel target.
pub enum Attached {
    /// The playlist is not buffered; the viewer goes straight to the source.
    Direct { url: String },
    /// The viewer is attached to a buffered stream.
    Stream(StreamHandle),
}

/// Registry of playlist sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, PlaylistSession>>,
    /// Serializes clearing and removal of segment folders.
    folders: Mutex<()>,
    directory: Arc<dyn ProviderDirectory>,
    store: Arc<dyn SegmentStore>,
    launcher: Arc<dyn FeedLauncher>,
    config: BufferConfig,
}

impl SessionRegistry {
    pub fn new(
        directory: Arc<dyn ProviderDirectory>,
        store: Arc<dyn SegmentStore>,
        launcher: Arc<dyn FeedLauncher>,
        config: BufferConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            folders: Mutex::new(()),
            directory,
            store,
            launcher,
            config,
        })
    }

    pub fn store(&self) -> &dyn SegmentStore {
        self.store.as_ref()
    }

    pub fn launcher(&self) -> &dyn FeedLauncher {
        self.launcher.as_ref()
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }

    /// Attach a viewer to `target`.
    ///
    /// Reuses the running stream for the same URL, otherwise takes a free
    /// tuner slot and starts a supervisor for it.
    pub async fn attach(
        self: &Arc<Self>,
        target: &StreamTarget,
        channel_name: &str,
        backups: &[BackupChannel],
    ) -> Result<Attached, AdmissionError> {
        let mut sessions = self.sessions.write().await;

        let session = match sessions.entry(target.playlist_id.clone()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let params = self
                    .directory
                    .provider(&target.playlist_id)
                    .ok_or_else(|| AdmissionError::UnknownPlaylist(target.playlist_id.clone()))?;
                if !params.buffer_mode.uses_transcoder() {
                    return Ok(Attached::Direct {
                        url: target.url.clone(),
                    });
                }
                info!(
                    "[Registry] Opening session for {} ({}), mode={}, tuners={}",
                    params.name, target.playlist_id, params.buffer_mode, params.tuner_limit
                );
                let folder = self.config.temp_dir.join(folder_name(&target.playlist_id));
                entry.insert(PlaylistSession::new(
                    target.playlist_id.clone(),
                    folder,
                    params,
                ))
            }
        };

        if let Some(stream) = session.find_url(&target.url) {
            let stream = Arc::clone(stream);
            let viewers = stream.add_viewer();
            info!(
                "[Registry] Sharing {} on {} tuner {}, viewers={}",
                stream.info.channel_name, session.params.name, stream.info.slot, viewers
            );
            return Ok(Attached::Stream(StreamHandle::new(Arc::clone(self), stream)));
        }

        let Some(slot) = session.free_slot() else {
            let err = AdmissionError::TunerLimitReached {
                playlist_id: target.playlist_id.clone(),
                limit: session.params.tuner_limit,
            };
            warn!(
                "[Registry] {} refused for {}: {}",
                channel_name, session.params.name, err
            );
            if session.is_empty() {
                sessions.remove(&target.playlist_id);
            }
            return Err(err);
        };

        let fingerprint = Fingerprint::of(&target.url);
        let info = StreamInfo {
            slot,
            playlist_id: target.playlist_id.clone(),
            playlist_name: session.params.name.clone(),
            channel_name: channel_name.to_string(),
            url: target.url.clone(),
            folder: session.folder.join(fingerprint.as_str()),
            fingerprint,
            backups: backups.to_vec(),
        };
        let stream = SharedStream::new(info);
        stream.add_viewer();
        session.streams.insert(slot, Arc::clone(&stream));
        let params = session.params.clone();
        info!(
            "[Registry] New stream {} on {} tuner {}/{}",
            channel_name,
            params.name,
            slot + 1,
            params.tuner_limit
        );
        drop(sessions);

        tokio::spawn(Supervisor::new(Arc::clone(self), Arc::clone(&stream), params).run());
        Ok(Attached::Stream(StreamHandle::new(Arc::clone(self), stream)))
    }

    /// Read-modify-write a playlist session under the registry lock.
    ///
    /// Sessions left without streams are dropped. Returns `None` if the
    /// playlist has no session.
    pub async fn update<R>(
        &self,
        playlist_id: &str,
        f: impl FnOnce(&mut PlaylistSession) -> R,
    ) -> Option<R> {
        let mut sessions = self.sessions.write().await;
        update_locked(&mut sessions, playlist_id, f)
    }

    /// Record a fatal error and take the stream out of its session.
    ///
    /// Attached viewers observe the error through the stream state and fail
    /// over on their own.
    pub async fn retire(&self, stream: &Arc<SharedStream>, error: StreamError) {
        let folders = self.folders.lock().await;
        // The failure becomes visible together with the freed slot.
        let removed = self
            .update(&stream.info.playlist_id, |s| {
                stream.fail(error.clone());
                s.remove_stream(stream)
            })
            .await;
        if removed.is_none() {
            stream.fail(error);
        }
        if removed != Some(true) {
            return;
        }

        self.remove_folder(folders, &stream.info.folder).await;
        info!(
            "[Registry] Retired {} from {}",
            stream.info.channel_name, stream.info.playlist_name
        );
    }

    /// Drop one viewer from `stream`; the last viewer tears it down.
    async fn release(&self, stream: &Arc<SharedStream>) {
        let folders = self.folders.lock().await;
        let mut sessions = self.sessions.write().await;
        let remaining = stream.remove_viewer();
        if remaining > 0 || !stream.begin_teardown() {
            return;
        }

        let removed = update_locked(&mut sessions, &stream.info.playlist_id, |s| {
            s.remove_stream(stream)
        })
        .unwrap_or(false);
        stream.close();
        drop(sessions);
        if removed {
            self.remove_folder(folders, &stream.info.folder).await;
        }

        info!(
            "[Registry] Last viewer left {} on {}, stream closed",
            stream.info.channel_name, stream.info.playlist_name
        );
    }

    /// Remove a folder whose stream has left the session map.
    ///
    /// Callers take the folder guard before the registry lock and keep it
    /// until the folder is gone, so a new stream for the same URL cannot
    /// prepare the folder in between. Lock order is always folders, then
    /// sessions.
    async fn remove_folder(&self, _folders: MutexGuard<'_, ()>, folder: &Path) {
        match self.store.remove_all(folder).await {
            Ok(()) => debug!("[Registry] Removed {}", folder.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("[Registry] Failed to remove {}: {}", folder.display(), e),
        }
    }

    /// Clear and recreate the segment folder of a starting stream.
    pub async fn prepare_folder(&self, folder: &Path) -> io::Result<()> {
        let _folders = self.folders.lock().await;
        if let Err(e) = self.store.remove_all(folder).await {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("[Registry] Failed to clear {}: {}", folder.display(), e);
            }
        }
        self.store.create_dir_all(folder).await
    }

    /// Number of playlists with at least one stream.
    pub async fn active_playlists(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Viewers attached across all streams.
    pub async fn active_viewers(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .map(PlaylistSession::viewer_count)
            .sum()
    }

    #[cfg(test)]
    pub async fn stream_count(&self, playlist_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .get(playlist_id)
            .map_or(0, PlaylistSession::stream_count)
    }

    /// Status of every session, ordered by playlist id.
    pub async fn snapshot(&self) -> Vec<SessionStatus> {
        let sessions = self.sessions.read().await;
        let mut list: Vec<SessionStatus> = sessions.values().map(PlaylistSession::status).collect();
        list.sort_by(|a, b| a.playlist_id.cmp(&b.playlist_id));
        list
    }
}

fn update_locked<R>(
    sessions: &mut HashMap<String, PlaylistSession>,
    playlist_id: &str,
    f: impl FnOnce(&mut PlaylistSession) -> R,
) -> Option<R> {
    let session = sessions.get_mut(playlist_id)?;
    let result = f(session);
    if session.is_empty() {
        sessions.remove(playlist_id);
        info!("[Registry] Session for {} closed", playlist_id);
    }
    Some(result)
}

/// A viewer's attachment to a shared stream.
///
/// Detach explicitly with [`StreamHandle::detach`]. A handle that is just
/// dropped detaches in a background task.
pub struct StreamHandle {
    registry: Arc<SessionRegistry>,
    stream: Arc<SharedStream>,
    detached: bool,
}

impl StreamHandle {
    fn new(registry: Arc<SessionRegistry>, stream: Arc<SharedStream>) -> Self {
        Self {
            registry,
            stream,
            detached: false,
        }
    }

    pub fn stream(&self) -> &Arc<SharedStream> {
        &self.stream
    }

    pub async fn detach(mut self) {
        self.detached = true;
        self.registry.release(&self.stream).await;
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        if self.detached {
            return;
        }
        let registry = Arc::clone(&self.registry);
        let stream = Arc::clone(&self.stream);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    registry.release(&stream).await;
                });
            }
            Err(_) => warn!(
                "[Registry] Viewer of {} dropped outside the runtime",
                self.stream.info.channel_name
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::store::list_segments;
    use crate::test_helpers::{eventually, test_registry, Script, ScriptedLauncher};
    use crate::tuner::shared::StreamState;
    use std::time::Duration;

    fn target(playlist: &str, url: &str) -> StreamTarget {
        StreamTarget {
            playlist_id: playlist.to_string(),
            url: url.to_string(),
        }
    }

    async fn attach_stream(
        registry: &Arc<SessionRegistry>,
        playlist: &str,
        url: &str,
    ) -> StreamHandle {
        match registry.attach(&target(playlist, url), "Ch", &[]).await {
            Ok(Attached::Stream(handle)) => handle,
            Ok(Attached::Direct { .. }) => panic!("expected a buffered stream"),
            Err(e) => panic!("attach failed: {}", e),
        }
    }

    #[tokio::test]
    async fn test_viewers_share_one_supervisor() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let registry = test_registry(Arc::clone(&launcher), 2);

        let first = attach_stream(&registry, "M1", "http://src/ch1").await;
        let second = attach_stream(&registry, "M1", "http://src/ch1").await;
        let third = attach_stream(&registry, "M1", "http://src/ch1").await;

        assert!(Arc::ptr_eq(first.stream(), second.stream()));
        assert!(Arc::ptr_eq(first.stream(), third.stream()));
        assert_eq!(first.stream().viewer_count(), 3);
        assert_eq!(registry.stream_count("M1").await, 1);
        assert_eq!(registry.active_viewers().await, 3);

        let mut state = first.stream().subscribe();
        tokio::time::timeout(Duration::from_secs(5), state.wait_for(|s| *s == StreamState::Ready))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(launcher.launched(), vec!["http://src/ch1".to_string()]);

        let stream = Arc::clone(first.stream());
        first.detach().await;
        second.detach().await;
        assert!(!stream.is_closed());
        assert_eq!(registry.active_playlists().await, 1);

        third.detach().await;
        assert!(stream.is_closed());
        assert_eq!(registry.active_playlists().await, 0);
        assert_eq!(registry.active_viewers().await, 0);
        assert!(list_segments(registry.store(), &stream.info.folder)
            .await
            .is_err());

        assert!(eventually(|| {
            let launcher = Arc::clone(&launcher);
            async move { launcher.live_feeds() == 0 }
        })
        .await);
    }

    #[tokio::test]
    async fn test_tuner_limit_refuses_new_urls() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let registry = test_registry(Arc::clone(&launcher), 1);

        let held = attach_stream(&registry, "M1", "http://src/ch1").await;
        let refused = registry
            .attach(&target("M1", "http://src/ch2"), "Ch 2", &[])
            .await;
        match refused {
            Err(AdmissionError::TunerLimitReached { playlist_id, limit }) => {
                assert_eq!(playlist_id, "M1");
                assert_eq!(limit, 1);
            }
            _ => panic!("expected tuner limit"),
        }

        // Same URL still shares the busy tuner.
        let shared = attach_stream(&registry, "M1", "http://src/ch1").await;
        assert_eq!(held.stream().viewer_count(), 2);

        shared.detach().await;
        held.detach().await;
        let freed = attach_stream(&registry, "M1", "http://src/ch2").await;
        assert_eq!(freed.stream().info.slot, 0);
        freed.detach().await;
    }

    #[tokio::test]
    async fn test_zero_tuner_limit_leaves_no_session() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let registry = test_registry(Arc::clone(&launcher), 0);

        let refused = registry
            .attach(&target("M1", "http://src/ch1"), "Ch 1", &[])
            .await;
        assert!(matches!(refused, Err(e) if e.is_tuner_limit()));
        assert_eq!(registry.active_playlists().await, 0);
        assert!(launcher.launched().is_empty());
    }

    #[tokio::test]
    async fn test_unbuffered_and_unknown_playlists() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let registry = test_registry(Arc::clone(&launcher), 1);

        match registry
            .attach(&target("DIRECT", "http://src/ch9"), "Ch 9", &[])
            .await
        {
            Ok(Attached::Direct { url }) => assert_eq!(url, "http://src/ch9"),
            _ => panic!("expected direct"),
        }
        assert!(matches!(
            registry.attach(&target("NOPE", "http://src/x"), "X", &[]).await,
            Err(AdmissionError::UnknownPlaylist(_))
        ));
        assert_eq!(registry.active_playlists().await, 0);
    }

    #[tokio::test]
    async fn test_update_and_snapshot() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let registry = test_registry(Arc::clone(&launcher), 2);

        let a = attach_stream(&registry, "M1", "http://src/ch1").await;
        let b = attach_stream(&registry, "M1", "http://src/ch2").await;
        assert_eq!(b.stream().info.slot, 1);

        let count = registry.update("M1", |s| s.stream_count()).await;
        assert_eq!(count, Some(2));
        assert_eq!(registry.update("M9", |s| s.stream_count()).await, None);

        let snapshot = registry.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].playlist_id, "M1");
        assert_eq!(snapshot[0].streams.len(), 2);
        assert_eq!(snapshot[0].streams[0].url, "http://src/ch1");

        // Removing the last stream through update drops the session.
        let removed = registry
            .update("M1", |s| {
                s.remove_stream(a.stream()) && s.remove_stream(b.stream())
            })
            .await;
        assert_eq!(removed, Some(true));
        assert_eq!(registry.active_playlists().await, 0);

        a.detach().await;
        b.detach().await;
    }

    #[tokio::test]
    async fn test_failed_stream_frees_slot() {
        let launcher = Arc::new(ScriptedLauncher::new());
        launcher.script("http://src/dead", Script::EndImmediately);
        let registry = test_registry(Arc::clone(&launcher), 1);

        let handle = attach_stream(&registry, "M1", "http://src/dead").await;
        let stream = Arc::clone(handle.stream());
        assert!(eventually(|| {
            let stream = Arc::clone(&stream);
            async move { stream.error().is_some() }
        })
        .await);
        assert!(matches!(stream.error(), Some(StreamError::FeedEnded(_))));
        assert_eq!(registry.stream_count("M1").await, 0);

        // A new request for the same URL starts a fresh stream.
        let retry = attach_stream(&registry, "M1", "http://src/dead").await;
        assert!(!Arc::ptr_eq(retry.stream(), &stream));
        assert!(eventually(|| {
            let launcher = Arc::clone(&launcher);
            async move { launcher.launched().len() == 2 }
        })
        .await);
        assert_eq!(launcher.launch_count("http://src/dead"), 2);

        handle.detach().await;
        retry.detach().await;
    }

    #[tokio::test]
    async fn test_dropped_handle_detaches() {
        let launcher = Arc::new(ScriptedLauncher::new());
        let registry = test_registry(Arc::clone(&launcher), 1);

        let handle = attach_stream(&registry, "M1", "http://src/ch1").await;
        let stream = Arc::clone(handle.stream());
        drop(handle);

        assert!(eventually(|| {
            let registry = Arc::clone(&registry);
            async move { registry.active_playlists().await == 0 }
        })
        .await);
        assert!(stream.is_closed());
        assert_eq!(stream.viewer_count(), 0);
    }
}
