//! Directory uploader: watches one output directory and streams finalized
//! files to remote storage with bounded parallelism.
//!
//! The encoder writes segments as `.tmp` files and renames them when done,
//! so the watcher cares about close-write and moved-to events only. Events
//! are sharded to workers by path hash, which keeps all events for one
//! file on one worker and so preserves same-path ordering.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashSet;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::ports::storage::{object_key, PutOptions, StoragePort};

#[derive(Debug, Clone)]
pub struct UploaderConfig {
    /// Directory to watch. Watched non-recursively.
    pub dir: PathBuf,
    pub worker_count: usize,
    /// Capacity of the event and worker queues.
    pub buffer_size: usize,
    pub retry_count: u32,
    pub retry_delay: Duration,
    /// Budget for a single storage attempt.
    pub timeout: Duration,
    /// When set, every uploaded file's remote parent is set to this key.
    pub source: Option<String>,
    /// Local copy of the downloaded source; never uploaded.
    pub source_file: Option<PathBuf>,
}

impl UploaderConfig {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            worker_count: 4,
            buffer_size: 64,
            retry_count: 3,
            retry_delay: Duration::from_secs(1),
            timeout: Duration::from_secs(30),
            source: None,
            source_file: None,
        }
    }
}

struct Running {
    // Held to keep the watch alive; dropped first on shutdown.
    watcher: RecommendedWatcher,
    event_tx: mpsc::Sender<PathBuf>,
    worker_txs: Vec<mpsc::Sender<PathBuf>>,
    fan: JoinHandle<()>,
    workers: Vec<JoinHandle<()>>,
}

pub struct DirectoryUploader {
    cfg: Arc<UploaderConfig>,
    storage: Arc<dyn StoragePort>,
    /// Remote keys successfully uploaded by this instance.
    sent: Arc<DashSet<String>>,
    running: Mutex<Option<Running>>,
}

impl DirectoryUploader {
    pub fn new(cfg: UploaderConfig, storage: Arc<dyn StoragePort>) -> Self {
        Self {
            cfg: Arc::new(cfg),
            storage,
            sent: Arc::new(DashSet::new()),
            running: Mutex::new(None),
        }
    }

    /// Starts workers and the filesystem watch, then enqueues files already
    /// present in the directory. No-op when already started.
    pub async fn start(&self) -> Result<()> {
        if self.running.lock().unwrap().is_some() {
            return Ok(());
        }

        let capacity = self.cfg.buffer_size.max(1);
        let (event_tx, event_rx) = mpsc::channel::<PathBuf>(capacity);

        let mut worker_txs = Vec::with_capacity(self.cfg.worker_count);
        let mut workers = Vec::with_capacity(self.cfg.worker_count);
        for _ in 0..self.cfg.worker_count.max(1) {
            let (tx, rx) = mpsc::channel::<PathBuf>(capacity);
            worker_txs.push(tx);
            workers.push(tokio::spawn(worker_loop(
                rx,
                self.cfg.clone(),
                self.storage.clone(),
                self.sent.clone(),
            )));
        }

        let fan = tokio::spawn(fan_out(event_rx, worker_txs.clone()));

        let watcher_tx = event_tx.clone();
        let mut watcher = notify::recommended_watcher(move |event: notify::Result<Event>| {
            match event {
                Ok(event) if is_finalization(&event.kind) => {
                    for path in event.paths {
                        // The notify callback runs on its own thread.
                        let _ = watcher_tx.blocking_send(path);
                    }
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "watch error"),
            }
        })?;
        watcher.watch(&self.cfg.dir, RecursiveMode::NonRecursive)?;

        info!(dir = %self.cfg.dir.display(), workers = self.cfg.worker_count, "uploader started");

        // Files finalized before the watch was in place.
        scan_existing(&self.cfg.dir, &event_tx).await;

        *self.running.lock().unwrap() = Some(Running {
            watcher,
            event_tx,
            worker_txs,
            fan,
            workers,
        });
        Ok(())
    }

    /// Stops watching, picks up files that raced the shutdown with one
    /// final scan, and waits for all in-flight uploads. No rollback.
    /// No-op when not running.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().unwrap().take() else {
            return;
        };

        drop(running.watcher);
        scan_existing(&self.cfg.dir, &running.event_tx).await;
        Self::drain(running.event_tx, running.worker_txs, running.fan, running.workers).await;

        info!(dir = %self.cfg.dir.display(), sent = self.sent.len(), "uploader stopped");
    }

    /// Aborts: waits for in-flight work like [`stop`] (without the final
    /// scan), then deletes every remote file this instance uploaded.
    pub async fn cancel(&self) {
        let Some(running) = self.running.lock().unwrap().take() else {
            return;
        };

        drop(running.watcher);
        Self::drain(running.event_tx, running.worker_txs, running.fan, running.workers).await;

        let keys: Vec<String> = self.sent.iter().map(|k| k.clone()).collect();
        info!(dir = %self.cfg.dir.display(), count = keys.len(), "rolling back uploads");

        let deletes = keys.into_iter().map(|key| {
            let cfg = self.cfg.clone();
            let storage = self.storage.clone();
            async move {
                let result = with_retries(&cfg, || storage.delete_file(&key)).await;
                if let Err(e) = result {
                    warn!(key = %key, error = %e, "rollback delete failed");
                }
            }
        });
        futures::future::join_all(deletes).await;

        self.sent.clear();
    }

    pub fn sent_count(&self) -> usize {
        self.sent.len()
    }

    async fn drain(
        event_tx: mpsc::Sender<PathBuf>,
        worker_txs: Vec<mpsc::Sender<PathBuf>>,
        fan: JoinHandle<()>,
        workers: Vec<JoinHandle<()>>,
    ) {
        drop(event_tx);
        let _ = fan.await;
        drop(worker_txs);
        for worker in workers {
            let _ = worker.await;
        }
    }
}

fn is_finalization(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Access(AccessKind::Close(AccessMode::Write))
            | EventKind::Modify(ModifyKind::Name(RenameMode::To))
    )
}

fn shard(path: &Path, count: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    path.hash(&mut hasher);
    (hasher.finish() as u32 as usize) % count
}

async fn scan_existing(dir: &Path, event_tx: &mpsc::Sender<PathBuf>) {
    let root = dir.to_path_buf();
    let files = tokio::task::spawn_blocking(move || {
        walkdir::WalkDir::new(&root)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .map(|e| e.into_path())
            .collect::<Vec<_>>()
    })
    .await;

    match files {
        Ok(files) => {
            for path in files {
                let _ = event_tx.send(path).await;
            }
        }
        Err(e) => warn!(dir = %dir.display(), error = %e, "scan failed"),
    }
}

/// Routes each event to a fixed worker so per-file ordering holds.
async fn fan_out(mut event_rx: mpsc::Receiver<PathBuf>, worker_txs: Vec<mpsc::Sender<PathBuf>>) {
    while let Some(path) = event_rx.recv().await {
        let index = shard(&path, worker_txs.len());
        if worker_txs[index].send(path).await.is_err() {
            return;
        }
    }
}

async fn worker_loop(
    mut rx: mpsc::Receiver<PathBuf>,
    cfg: Arc<UploaderConfig>,
    storage: Arc<dyn StoragePort>,
    sent: Arc<DashSet<String>>,
) {
    while let Some(path) = rx.recv().await {
        handle_file(&path, &cfg, &storage, &sent).await;
    }
}

async fn handle_file(
    path: &Path,
    cfg: &UploaderConfig,
    storage: &Arc<dyn StoragePort>,
    sent: &DashSet<String>,
) {
    if path == cfg.dir {
        return;
    }
    if cfg.source_file.as_deref() == Some(path) {
        return;
    }

    let key = object_key(path);
    if key.ends_with(".tmp") {
        return;
    }

    // Segments are renamed into place; give the file a moment to land.
    let mut ready = false;
    for _ in 0..10 {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.len() > 0 => {
                ready = true;
                break;
            }
            _ => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    if !ready {
        debug!(file = %path.display(), "skipped: missing or empty");
        return;
    }

    // Playlists are rewritten by the encoder as segments appear: they are
    // re-uploaded on every event and never deleted locally.
    let keep = key.ends_with(".m3u8");
    if sent.contains(&key) && !keep {
        return;
    }

    let opts = PutOptions { no_cache: keep };
    let result = with_retries(cfg, || storage.put_file(path, &opts)).await;

    match result {
        Ok(()) => {
            sent.insert(key.clone());
            if let Some(source) = &cfg.source {
                if let Err(e) = storage.set_parent(&key, source).await {
                    warn!(key = %key, error = %e, "set parent failed");
                }
            }
            if !keep {
                if let Err(e) = tokio::fs::remove_file(path).await {
                    warn!(file = %path.display(), error = %e, "local delete failed");
                }
            }
            debug!(key = %key, "uploaded");
        }
        Err(e) => {
            warn!(file = %path.display(), error = %e, "upload given up");
        }
    }
}

async fn with_retries<F, Fut>(cfg: &UploaderConfig, mut op: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let attempts = cfg.retry_count.max(1);
    let mut last = Error::Timeout;

    for attempt in 1..=attempts {
        match tokio::time::timeout(cfg.timeout, op()).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(e)) => last = e,
            Err(_) => last = Error::Timeout,
        }
        if attempt < attempts {
            tokio::time::sleep(cfg.retry_delay).await;
        }
    }
    Err(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::ports::storage::BlobInfo;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Default)]
    struct FakeStorage {
        puts: Mutex<Vec<String>>,
        deletes: Mutex<Vec<String>>,
        parents: Mutex<Vec<(String, String)>>,
        fail_first_puts: AtomicU32,
    }

    #[async_trait]
    impl StoragePort for FakeStorage {
        async fn put_file(&self, path: &Path, _opts: &PutOptions) -> Result<()> {
            if self.fail_first_puts.load(Ordering::SeqCst) > 0 {
                self.fail_first_puts.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Storage("injected".into()));
            }
            self.puts.lock().unwrap().push(object_key(path));
            Ok(())
        }

        async fn get_file(&self, _name: &str, _dest: &Path) -> Result<()> {
            unimplemented!()
        }

        async fn delete_file(&self, name: &str) -> Result<()> {
            self.deletes.lock().unwrap().push(name.to_string());
            Ok(())
        }

        async fn stat_file(&self, _name: &str) -> Result<BlobInfo> {
            unimplemented!()
        }

        async fn set_parent(&self, name: &str, parent: &str) -> Result<()> {
            self.parents
                .lock()
                .unwrap()
                .push((name.to_string(), parent.to_string()));
            Ok(())
        }
    }

    fn fast_config(dir: PathBuf) -> UploaderConfig {
        let mut cfg = UploaderConfig::new(dir);
        cfg.retry_delay = Duration::from_millis(10);
        cfg.timeout = Duration::from_secs(5);
        cfg
    }

    #[tokio::test]
    async fn uploads_existing_files_and_applies_keep_rule() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("v_000_720p.ts"), b"segment").unwrap();
        std::fs::write(dir.path().join("v_720p.m3u8"), b"playlist").unwrap();
        std::fs::write(dir.path().join("v_001_720p.ts.tmp"), b"partial").unwrap();

        let storage = Arc::new(FakeStorage::default());
        let uploader = DirectoryUploader::new(fast_config(dir.path().to_path_buf()), storage.clone());

        uploader.start().await.unwrap();
        uploader.stop().await;

        let puts = storage.puts.lock().unwrap().clone();
        assert!(puts.contains(&"v_000_720p.ts".to_string()));
        // Initial scan and final scan both re-upload the kept playlist.
        assert_eq!(puts.iter().filter(|k| *k == "v_720p.m3u8").count(), 2);
        assert!(!puts.iter().any(|k| k.ends_with(".tmp")));

        // Segments are deleted after upload, playlists are kept.
        assert!(!dir.path().join("v_000_720p.ts").exists());
        assert!(dir.path().join("v_720p.m3u8").exists());
        assert_eq!(uploader.sent_count(), 2);
    }

    #[tokio::test]
    async fn source_file_is_skipped_and_parent_is_linked() {
        let dir = tempfile::tempdir().unwrap();
        let source_file = dir.path().join("source.mp4");
        std::fs::write(&source_file, b"source").unwrap();
        std::fs::write(dir.path().join("v.jpg"), b"thumb").unwrap();

        let mut cfg = fast_config(dir.path().to_path_buf());
        cfg.source = Some("source.mp4".to_string());
        cfg.source_file = Some(source_file.clone());

        let storage = Arc::new(FakeStorage::default());
        let uploader = DirectoryUploader::new(cfg, storage.clone());
        uploader.start().await.unwrap();
        uploader.stop().await;

        let puts = storage.puts.lock().unwrap().clone();
        assert_eq!(puts, vec!["v.jpg".to_string()]);
        assert_eq!(
            storage.parents.lock().unwrap().clone(),
            vec![("v.jpg".to_string(), "source.mp4".to_string())]
        );
        assert!(source_file.exists());
    }

    #[tokio::test]
    async fn watcher_picks_up_files_created_while_running() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FakeStorage::default());
        let uploader = DirectoryUploader::new(fast_config(dir.path().to_path_buf()), storage.clone());
        uploader.start().await.unwrap();

        std::fs::write(dir.path().join("late_000_360p.ts"), b"segment").unwrap();
        // The final scan during stop picks the file up even if the watch
        // event raced the shutdown.
        tokio::time::sleep(Duration::from_millis(200)).await;
        uploader.stop().await;

        let puts = storage.puts.lock().unwrap().clone();
        assert_eq!(puts.iter().filter(|k| *k == "late_000_360p.ts").count(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("v.jpg"), b"thumb").unwrap();

        let storage = Arc::new(FakeStorage {
            fail_first_puts: AtomicU32::new(2),
            ..Default::default()
        });
        let uploader = DirectoryUploader::new(fast_config(dir.path().to_path_buf()), storage.clone());
        uploader.start().await.unwrap();
        uploader.stop().await;

        assert_eq!(storage.puts.lock().unwrap().clone(), vec!["v.jpg".to_string()]);
    }

    #[tokio::test]
    async fn cancel_rolls_back_uploaded_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("v_000_720p.ts"), b"segment").unwrap();
        std::fs::write(dir.path().join("v_720p.m3u8"), b"playlist").unwrap();

        let storage = Arc::new(FakeStorage::default());
        let uploader = DirectoryUploader::new(fast_config(dir.path().to_path_buf()), storage.clone());
        uploader.start().await.unwrap();
        // Let the initial scan's uploads finish before aborting.
        tokio::time::sleep(Duration::from_millis(300)).await;
        uploader.cancel().await;

        let deletes = storage.deletes.lock().unwrap().clone();
        assert!(deletes.contains(&"v_000_720p.ts".to_string()));
        assert!(deletes.contains(&"v_720p.m3u8".to_string()));
        assert_eq!(uploader.sent_count(), 0);
    }

    #[tokio::test]
    async fn stop_twice_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(FakeStorage::default());
        let uploader = DirectoryUploader::new(fast_config(dir.path().to_path_buf()), storage);
        uploader.start().await.unwrap();
        uploader.stop().await;
        uploader.stop().await;
        uploader.cancel().await;
    }
}
