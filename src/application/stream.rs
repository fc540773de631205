//! Stream coordinator for live uploads.
//!
//! Each resumable upload gets a [`Stream`]: a fan-out pipe feeding the
//! encoder processes, a directory uploader shipping their output, and,
//! when the backend supports it, a multipart upload preserving the
//! original bytes. The [`StreamStore`] is the registry the upload front
//! end talks to; every access re-arms a per-upload inactivity guard.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

use crate::application::executor::{self, EncoderCommand};
use crate::application::multipart::MultipartUpload;
use crate::application::uploader::{DirectoryUploader, UploaderConfig};
use crate::config::Config;
use crate::domain::command::{thumbnail_command, video_command, EncoderOptions, STDIN_INPUT};
use crate::domain::hls::{self, write_master_playlist};
use crate::domain::pipe::PipeWriter;
use crate::domain::profile::fast_profiles;
use crate::domain::upload::FileInfo;
use crate::error::{Error, Result};
use crate::ports::storage::StoragePort;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Open,
    Finished,
    Terminated,
}

/// Registry of live streams, keyed by upload id.
pub struct StreamStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    cfg: Arc<Config>,
    streams: DashMap<Uuid, Arc<Stream>>,
    guards: DashMap<Uuid, JoinHandle<()>>,
    active: AtomicU64,
}

impl StreamStore {
    pub fn new(cfg: Arc<Config>) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                cfg,
                streams: DashMap::new(),
                guards: DashMap::new(),
                active: AtomicU64::new(0),
            }),
        }
    }

    /// Creates the stream for a new upload and spins up its collaborators:
    /// pipe, encoder commands, output uploader and multipart preservation.
    pub async fn new_upload(&self, info: FileInfo) -> Result<Arc<Stream>> {
        let cfg = &self.inner.cfg;
        let id = info.id;
        let id_str = id.to_string();

        let media = info.media_info()?;
        let profiles = fast_profiles(&media);

        let writer = PipeWriter::new();

        let mut storage: Option<Arc<dyn StoragePort>> = None;
        let mut multipart = None;
        let mut uploader = None;
        if let Some(endpoint) = &cfg.endpoint_url {
            let workspace = info.workspace().unwrap_or_default().to_string();
            let token = info.token().unwrap_or_default().to_string();
            let client = crate::adapters::storage_for_endpoint(
                endpoint,
                &workspace,
                &token,
                &cfg.region,
                cfg.insecure,
            )
            .await?;

            if let Some(mp) = client.multipart() {
                multipart = Some(tokio::sync::Mutex::new(
                    MultipartUpload::start(mp, &id_str).await?,
                ));
            }

            let mut uploader_cfg = UploaderConfig::new(cfg.output_dir.join(&id_str));
            uploader_cfg.source = Some(id_str.clone());
            uploader = Some(Arc::new(DirectoryUploader::new(uploader_cfg, client.clone())));
            storage = Some(client);
        }

        let options = EncoderOptions {
            log_level: cfg.log_level.clone(),
            threads: cfg.max_thread_count,
            input: STDIN_INPUT.to_string(),
        };
        let mut commands = vec![EncoderCommand::new(
            &cfg.encoder_path,
            thumbnail_command(STDIN_INPUT, &cfg.output_dir, &id_str),
        )
        .with_stdin(writer.subscribe())];

        let video = video_command(&options, &profiles, &cfg.output_dir, &id_str);
        if !video.is_empty() {
            commands.push(
                EncoderCommand::new(&cfg.encoder_path, video).with_stdin(writer.subscribe()),
            );
        }

        write_master_playlist(&cfg.output_dir, &id_str, &profiles).await?;

        if let Some(uploader) = &uploader {
            uploader.start().await?;
        }
        let verbose = cfg.log_level == "debug";
        let encoders = tokio::spawn(executor::run_all(commands, verbose));

        let active = self.inner.active.fetch_add(1, Ordering::SeqCst) + 1;
        if active > cfg.max_parallel_transcoding_count {
            // Soft limit: flagged, not enforced.
            warn!(
                active,
                limit = cfg.max_parallel_transcoding_count,
                "parallel transcode limit exceeded"
            );
        }

        let stream = Arc::new(Stream {
            id,
            info: std::sync::Mutex::new(info),
            state: std::sync::Mutex::new(StreamState::Open),
            writer: tokio::sync::Mutex::new(writer),
            encoders: tokio::sync::Mutex::new(Some(encoders)),
            uploader,
            multipart,
            storage,
            store: Arc::downgrade(&self.inner),
        });

        self.inner.streams.insert(id, stream.clone());
        self.touch(id);
        info!(upload = %id, profiles = profiles.len(), "stream created");
        Ok(stream)
    }

    /// Looks up a live stream and re-arms its inactivity guard.
    pub fn get_upload(&self, id: Uuid) -> Result<Arc<Stream>> {
        let stream = self
            .inner
            .streams
            .get(&id)
            .map(|s| s.clone())
            .ok_or(Error::UploadNotFound(id))?;
        self.touch(id);
        Ok(stream)
    }

    pub fn active_count(&self) -> u64 {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Replaces the inactivity guard for `id`; on expiry the stream is
    /// forcibly terminated and dropped from the registry.
    fn touch(&self, id: Uuid) {
        let weak = Arc::downgrade(&self.inner);
        let timeout = self.inner.cfg.timeout;

        let guard = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else { return };
            // Drop the map guard before terminating; terminate removes the
            // entry itself.
            let stream = inner.streams.get(&id).map(|s| s.clone());
            if let Some(stream) = stream {
                warn!(upload = %id, "inactivity timeout, terminating");
                if let Err(e) = stream.terminate().await {
                    warn!(upload = %id, error = %e, "timeout termination failed");
                }
            }
        });

        if let Some(previous) = self.inner.guards.insert(id, guard) {
            previous.abort();
        }
    }
}

impl StoreInner {
    fn deregister(&self, id: Uuid) {
        if self.streams.remove(&id).is_some() {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
        if let Some((_, guard)) = self.guards.remove(&id) {
            guard.abort();
        }
    }
}

/// One live upload and its collaborators.
pub struct Stream {
    id: Uuid,
    info: std::sync::Mutex<FileInfo>,
    state: std::sync::Mutex<StreamState>,
    writer: tokio::sync::Mutex<PipeWriter>,
    encoders: tokio::sync::Mutex<Option<JoinHandle<Result<()>>>>,
    uploader: Option<Arc<DirectoryUploader>>,
    multipart: Option<tokio::sync::Mutex<MultipartUpload>>,
    storage: Option<Arc<dyn StoragePort>>,
    store: Weak<StoreInner>,
}

impl Stream {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn get_info(&self) -> FileInfo {
        self.info.lock().unwrap().clone()
    }

    /// Declares the upload's total size once the client knows it.
    pub fn declare_length(&self, length: u64) {
        let mut info = self.info.lock().unwrap();
        info.size = Some(length);
        info.size_is_deferred = false;
    }

    /// Reads `src` to its end, feeds the bytes to the encoders through the
    /// pipe and to the multipart preservation upload, and advances the
    /// upload offset. Returns the number of bytes accepted.
    pub async fn write_chunk(&self, src: &mut (dyn AsyncRead + Unpin + Send)) -> Result<u64> {
        self.ensure_open()?;

        let mut data = Vec::new();
        src.read_to_end(&mut data).await?;

        let written = self.writer.lock().await.write(&data);
        if written < data.len() {
            return Err(Error::PipeClosed);
        }

        self.info.lock().unwrap().offset += written as u64;

        if let Some(multipart) = &self.multipart {
            multipart.lock().await.write(&data).await?;
        }

        Ok(written as u64)
    }

    /// Completes the upload: end-of-stream to the encoders, wait for them,
    /// finalize the uploader and the multipart upload, then link the HLS
    /// package from the source object's metadata.
    pub async fn finish(&self) -> Result<()> {
        {
            let state = self.state.lock().unwrap();
            match *state {
                StreamState::Open => {}
                StreamState::Finished => return Ok(()),
                StreamState::Terminated => return Err(Error::UploadClosed("terminated")),
            }
        }

        self.writer.lock().await.close();

        let encoders = self.encoders.lock().await.take();
        if let Some(handle) = encoders {
            let result = handle
                .await
                .map_err(|e| Error::Encoder(format!("encoder task failed: {e}")))?;
            if let Err(e) = result {
                warn!(upload = %self.id, error = %e, "encoder failed, rolling back");
                self.abort_collaborators().await;
                self.set_state(StreamState::Terminated);
                self.deregister();
                return Err(e);
            }
        }

        if let Some(uploader) = &self.uploader {
            uploader.stop().await;
        }
        if let Some(multipart) = &self.multipart {
            multipart.lock().await.complete().await?;
        }

        if let Some(meta) = self.storage.as_ref().and_then(|s| s.meta()) {
            let id = self.id.to_string();
            let patch = serde_json::json!({
                "hls": {
                    "source": hls::master_playlist_name(&id),
                    "thumbnail": hls::thumbnail_name(&id),
                }
            });
            meta.patch_meta(&id, &patch).await?;
        }

        self.set_state(StreamState::Finished);
        self.deregister();
        info!(upload = %self.id, "stream finished");
        Ok(())
    }

    /// Aborts the upload and rolls its artifacts back. Idempotent; calling
    /// it after a successful finish is a no-op.
    pub async fn terminate(&self) -> Result<()> {
        {
            let mut state = self.state.lock().unwrap();
            match *state {
                StreamState::Open => *state = StreamState::Terminated,
                StreamState::Finished | StreamState::Terminated => return Ok(()),
            }
        }

        self.writer.lock().await.close();

        if let Some(handle) = self.encoders.lock().await.take() {
            // Children are killed on drop of the aborted task.
            handle.abort();
            let _ = handle.await;
        }

        self.abort_collaborators().await;
        self.deregister();
        info!(upload = %self.id, "stream terminated");
        Ok(())
    }

    /// Subscribes a new independent reader to the upload's byte stream.
    /// It observes every byte written after this call.
    pub async fn get_reader(&self) -> Result<crate::domain::pipe::PipeReader> {
        self.ensure_open()?;
        Ok(self.writer.lock().await.subscribe())
    }

    /// Resuming a failed upload by concatenation is not supported.
    pub fn concat_uploads(&self, _partial_ids: &[Uuid]) -> Result<()> {
        Err(Error::Unsupported("concat uploads"))
    }

    async fn abort_collaborators(&self) {
        if let Some(uploader) = &self.uploader {
            uploader.cancel().await;
        }
        if let Some(multipart) = &self.multipart {
            if let Err(e) = multipart.lock().await.terminate().await {
                warn!(upload = %self.id, error = %e, "multipart cancel failed");
            }
        }
    }

    fn ensure_open(&self) -> Result<()> {
        match *self.state.lock().unwrap() {
            StreamState::Open => Ok(()),
            StreamState::Finished => Err(Error::UploadClosed("finished")),
            StreamState::Terminated => Err(Error::UploadClosed("terminated")),
        }
    }

    fn set_state(&self, state: StreamState) {
        *self.state.lock().unwrap() = state;
    }

    fn deregister(&self) {
        if let Some(store) = self.store.upgrade() {
            store.deregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;

    fn test_config(dir: &std::path::Path, timeout: Duration) -> Arc<Config> {
        let mut cfg = Config::for_tests();
        cfg.output_dir = dir.to_path_buf();
        cfg.timeout = timeout;
        // Stand-in encoder: exits immediately, ignoring its arguments.
        cfg.encoder_path = "true".to_string();
        Arc::new(cfg)
    }

    fn upload_info() -> FileInfo {
        let metadata: HashMap<String, String> = [
            ("width", "1920"),
            ("height", "1080"),
            ("contentType", r#"video/mp4; codecs="avc1.64001f""#),
        ]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        FileInfo::new(None, metadata)
    }

    #[tokio::test]
    async fn upload_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::new(test_config(dir.path(), Duration::from_secs(60)));

        let stream = store.new_upload(upload_info()).await.unwrap();
        let id = stream.id();
        assert_eq!(store.active_count(), 1);

        // The master playlist is in place before any bytes arrive.
        let master = dir
            .path()
            .join(id.to_string())
            .join(format!("{id}_master.m3u8"));
        assert!(master.exists());

        let mut tap = stream.get_reader().await.unwrap();

        let mut chunk: &[u8] = b"not really mp4";
        let written = stream.write_chunk(&mut chunk).await.unwrap();
        assert_eq!(written, 14);
        assert_eq!(stream.get_info().offset, 14);

        let found = store.get_upload(id).unwrap();
        assert_eq!(found.id(), id);

        stream.finish().await.unwrap();
        assert_eq!(store.active_count(), 0);
        assert!(matches!(store.get_upload(id), Err(Error::UploadNotFound(_))));

        // A reader taken before the writes replays the full stream.
        assert_eq!(tap.read_to_end().await.unwrap(), b"not really mp4");

        // Writing after finish is rejected.
        let mut more: &[u8] = b"x";
        assert!(stream.write_chunk(&mut more).await.is_err());
    }

    #[tokio::test]
    async fn invalid_metadata_fails_upload_creation() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::new(test_config(dir.path(), Duration::from_secs(60)));

        let mut info = upload_info();
        info.metadata.insert("width".into(), "wide".into());
        assert!(matches!(
            store.new_upload(info).await,
            Err(Error::InvalidMetadata(_))
        ));
        assert_eq!(store.active_count(), 0);
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::new(test_config(dir.path(), Duration::from_secs(60)));

        let stream = store.new_upload(upload_info()).await.unwrap();
        stream.terminate().await.unwrap();
        stream.terminate().await.unwrap();
        assert_eq!(store.active_count(), 0);

        let mut chunk: &[u8] = b"x";
        assert!(matches!(
            stream.write_chunk(&mut chunk).await,
            Err(Error::UploadClosed(_))
        ));
    }

    #[tokio::test]
    async fn inactive_stream_expires() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::new(test_config(dir.path(), Duration::from_millis(50)));

        let stream = store.new_upload(upload_info()).await.unwrap();
        let id = stream.id();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(matches!(store.get_upload(id), Err(Error::UploadNotFound(_))));
        assert_eq!(store.active_count(), 0);
    }

    #[tokio::test]
    async fn declare_length_clears_deferral() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::new(test_config(dir.path(), Duration::from_secs(60)));

        let stream = store.new_upload(upload_info()).await.unwrap();
        assert!(stream.get_info().size_is_deferred);

        stream.declare_length(42);
        let info = stream.get_info();
        assert_eq!(info.size, Some(42));
        assert!(!info.size_is_deferred);

        stream.terminate().await.unwrap();
    }

    #[tokio::test]
    async fn concat_is_not_supported() {
        let dir = tempfile::tempdir().unwrap();
        let store = StreamStore::new(test_config(dir.path(), Duration::from_secs(60)));
        let stream = store.new_upload(upload_info()).await.unwrap();

        assert!(matches!(
            stream.concat_uploads(&[Uuid::new_v4()]),
            Err(Error::Unsupported(_))
        ));
        stream.terminate().await.unwrap();
    }
}
