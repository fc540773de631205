//! Offline job scheduler: consumes transcode requests from the queue,
//! produces HLS packages and publishes results.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::application::executor::{self, EncoderCommand};
use crate::application::probe::probe_file;
use crate::application::uploader::{DirectoryUploader, UploaderConfig};
use crate::config::Config;
use crate::domain::command::{thumbnail_command, video_command, EncoderOptions};
use crate::domain::hls::{self, write_master_playlist};
use crate::domain::limiter::CapacityLimiter;
use crate::domain::profile::{default_profiles, VideoProfile};
use crate::domain::task::{is_supported_source_type, Task, TaskResult, TranscodeResult};
use crate::error::{Error, Result};
use crate::ports::queue::{Delivery, RequestSource, ResultSink};
use crate::ports::storage::object_key;
use crate::token;

const COMMIT_ATTEMPTS: u32 = 3;
const COMMIT_BACKOFF: Duration = Duration::from_millis(100);

pub struct Scheduler {
    cfg: Arc<Config>,
    limiter: Arc<CapacityLimiter>,
}

impl Scheduler {
    pub fn new(cfg: Arc<Config>) -> Self {
        let limiter = Arc::new(CapacityLimiter::new(cfg.max_parallel_scaling_count));
        Self { cfg, limiter }
    }

    /// Spawns `worker_count` consumers on the request topic. They run until
    /// `shutdown` is cancelled.
    pub fn start_workers(
        &self,
        source: Arc<dyn RequestSource>,
        sink: Option<Arc<dyn ResultSink>>,
        worker_count: usize,
        shutdown: CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        (0..worker_count.max(1))
            .map(|worker_id| {
                let cfg = self.cfg.clone();
                let limiter = self.limiter.clone();
                let source = source.clone();
                let sink = sink.clone();
                let shutdown = shutdown.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, cfg, limiter, source, sink, shutdown).await;
                })
            })
            .collect()
    }
}

async fn worker_loop(
    worker_id: usize,
    cfg: Arc<Config>,
    limiter: Arc<CapacityLimiter>,
    source: Arc<dyn RequestSource>,
    sink: Option<Arc<dyn ResultSink>>,
    shutdown: CancellationToken,
) {
    info!(worker = worker_id, "queue worker started");

    loop {
        let delivery = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = source.recv() => received,
        };

        match delivery {
            Ok(delivery) => {
                handle_delivery(&cfg, &limiter, sink.as_deref(), &delivery).await;
                commit_with_retries(source.as_ref(), &delivery).await;
            }
            Err(e) => {
                error!(worker = worker_id, error = %e, "queue receive failed");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
    }

    info!(worker = worker_id, "queue worker stopped");
}

/// Runs one request through the pipeline. Failures are terminal for the
/// message: they are logged and the message is committed anyway, since
/// redelivery would hit the same permanent condition.
async fn handle_delivery(
    cfg: &Config,
    limiter: &CapacityLimiter,
    sink: Option<&dyn ResultSink>,
    delivery: &Delivery,
) {
    let request = &delivery.request;

    if let Some(content_type) = &request.content_type {
        if !is_supported_source_type(content_type) {
            warn!(blob = %request.blob_id, content_type = %content_type, "unsupported content type dropped");
            return;
        }
    }

    let task = Task::new(request.blob_id.clone(), request.workspace_uuid.clone());
    match process_task(cfg, limiter, &task).await {
        Ok(result) => {
            info!(task = %task.id, blob = %task.source, "transcode finished");
            if let Some(sink) = sink {
                let message = TranscodeResult {
                    blob_id: task.source.clone(),
                    workspace_uuid: task.workspace.clone(),
                    playlist: result.playlist,
                    thumbnail: result.thumbnail,
                };
                if let Err(e) = sink.publish(&message).await {
                    error!(task = %task.id, error = %e, "result publish failed");
                }
            }
        }
        Err(e) => {
            error!(task = %task.id, blob = %task.source, error = %e, "transcode failed");
        }
    }
}

/// The per-task pipeline: stat, download, probe, transcode, upload, patch.
pub async fn process_task(cfg: &Config, limiter: &CapacityLimiter, task: &Task) -> Result<TaskResult> {
    let endpoint = cfg
        .endpoint_url
        .as_deref()
        .ok_or_else(|| Error::Config("no storage endpoint configured".into()))?;

    let token = token::new_token(
        &cfg.server_secret,
        &task.workspace,
        &cfg.token_issuer,
        &cfg.token_audience,
    )?;

    let id = task.id.to_string();
    let work_base = cfg.output_dir.join("t");
    let work_dir = work_base.join(&id);
    tokio::fs::create_dir_all(&work_dir).await?;

    let result = run_pipeline(cfg, limiter, task, endpoint, &token, &work_base, &work_dir).await;

    if let Err(e) = tokio::fs::remove_dir_all(&work_dir).await {
        warn!(task = %task.id, error = %e, "workdir cleanup failed");
    }

    result
}

async fn run_pipeline(
    cfg: &Config,
    limiter: &CapacityLimiter,
    task: &Task,
    endpoint: &str,
    token: &str,
    work_base: &PathBuf,
    work_dir: &PathBuf,
) -> Result<TaskResult> {
    let id = task.id.to_string();

    let storage = crate::adapters::storage_for_endpoint(
        endpoint,
        &task.workspace,
        token,
        &cfg.region,
        cfg.insecure,
    )
    .await?;

    let stat = storage.stat_file(&task.source).await?;
    if !is_supported_source_type(&stat.content_type) {
        return Err(Error::UnsupportedContentType(stat.content_type));
    }

    let source_file = work_dir.join(object_key(std::path::Path::new(&task.source)));
    storage.get_file(&task.source, &source_file).await?;

    let media = probe_file(&source_file).await?;
    debug!(task = %task.id, codec = ?media.codec, width = media.width, height = media.height, "source probed");

    let (profiles, scaling_cost) = claim_scaling_capacity(default_profiles(&media), limiter);

    let mut uploader_cfg = UploaderConfig::new(work_dir.clone());
    uploader_cfg.source = Some(task.source.clone());
    uploader_cfg.source_file = Some(source_file.clone());
    let uploader = DirectoryUploader::new(uploader_cfg, storage.clone());
    uploader.start().await?;

    write_master_playlist(work_base, &id, &profiles).await?;

    let options = EncoderOptions {
        log_level: cfg.log_level.clone(),
        threads: cfg.max_thread_count,
        input: source_file.to_string_lossy().into_owned(),
    };
    let mut commands = vec![EncoderCommand::new(
        &cfg.encoder_path,
        thumbnail_command(&options.input, work_base, &id),
    )];
    let video = video_command(&options, &profiles, work_base, &id);
    if !video.is_empty() {
        commands.push(EncoderCommand::new(&cfg.encoder_path, video));
    }

    let verbose = cfg.log_level == "debug";
    let encode_result = executor::run_all(commands, verbose).await;
    limiter.return_capacity(scaling_cost);

    if let Err(e) = encode_result {
        uploader.cancel().await;
        return Err(e);
    }

    uploader.stop().await;

    let result = TaskResult {
        playlist: hls::master_playlist_name(&id),
        thumbnail: hls::thumbnail_name(&id),
        width: media.width,
        height: media.height,
    };

    if let Some(meta) = storage.meta() {
        let patch = serde_json::json!({
            "hls": {
                "source": result.playlist,
                "thumbnail": result.thumbnail,
            },
            "width": result.width,
            "height": result.height,
        });
        meta.patch_meta(&task.source, &patch).await?;
    }

    Ok(result)
}

/// Bounds the scaling work a task may claim. When the limiter cannot cover
/// the scaled renditions, they are dropped and only the `orig` rendition is
/// produced; capacity comes back when the encoder exits.
fn claim_scaling_capacity(
    profiles: Vec<VideoProfile>,
    limiter: &CapacityLimiter,
) -> (Vec<VideoProfile>, u64) {
    let cost = profiles.iter().filter(|p| p.scale).count() as u64;
    if cost == 0 || limiter.try_consume(cost) {
        return (profiles, cost);
    }

    warn!(cost, available = limiter.available(), "scaling capacity exhausted, orig only");
    (profiles.into_iter().filter(|p| !p.scale).collect(), 0)
}

async fn commit_with_retries(source: &dyn RequestSource, delivery: &Delivery) {
    for attempt in 1..=COMMIT_ATTEMPTS {
        match source.commit(delivery).await {
            Ok(()) => return,
            Err(e) if attempt < COMMIT_ATTEMPTS => {
                warn!(attempt, error = %e, "commit failed, retrying");
                tokio::time::sleep(COMMIT_BACKOFF * attempt).await;
            }
            Err(e) => {
                error!(error = %e, "commit given up; message will be redelivered");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::task::TranscodeRequest;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    struct FakeSource {
        deliveries: Mutex<VecDeque<Delivery>>,
        commits: Mutex<Vec<i64>>,
        commit_failures: AtomicU32,
    }

    impl FakeSource {
        fn new(requests: Vec<TranscodeRequest>) -> Self {
            let deliveries = requests
                .into_iter()
                .enumerate()
                .map(|(i, request)| Delivery {
                    request,
                    partition: 0,
                    offset: i as i64,
                })
                .collect();
            Self {
                deliveries: Mutex::new(deliveries),
                commits: Mutex::new(Vec::new()),
                commit_failures: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl RequestSource for FakeSource {
        async fn recv(&self) -> crate::error::Result<Delivery> {
            let next = self.deliveries.lock().unwrap().pop_front();
            match next {
                Some(delivery) => Ok(delivery),
                None => {
                    // Park forever, like an idle broker.
                    futures::future::pending().await
                }
            }
        }

        async fn commit(&self, delivery: &Delivery) -> crate::error::Result<()> {
            if self.commit_failures.load(Ordering::SeqCst) > 0 {
                self.commit_failures.fetch_sub(1, Ordering::SeqCst);
                return Err(Error::Queue("commit refused".into()));
            }
            self.commits.lock().unwrap().push(delivery.offset);
            Ok(())
        }
    }

    struct FakeSink {
        published: Mutex<Vec<TranscodeResult>>,
    }

    #[async_trait]
    impl ResultSink for FakeSink {
        async fn publish(&self, result: &TranscodeResult) -> crate::error::Result<()> {
            self.published.lock().unwrap().push(result.clone());
            Ok(())
        }
    }

    fn request(content_type: Option<&str>) -> TranscodeRequest {
        TranscodeRequest {
            blob_id: "blob-1".to_string(),
            workspace_uuid: "ws-1".to_string(),
            content_type: content_type.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn unsupported_content_type_is_dropped_and_committed() {
        let cfg = Arc::new(Config::for_tests());
        let limiter = CapacityLimiter::new(10);
        let sink = FakeSink {
            published: Mutex::new(Vec::new()),
        };

        let delivery = Delivery {
            request: request(Some("video/mp2t")),
            partition: 0,
            offset: 7,
        };
        handle_delivery(&cfg, &limiter, Some(&sink), &delivery).await;

        assert!(sink.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_task_publishes_nothing() {
        // No endpoint configured: process_task fails before any transcode.
        let cfg = Arc::new(Config::for_tests());
        let limiter = CapacityLimiter::new(10);
        let sink = FakeSink {
            published: Mutex::new(Vec::new()),
        };

        let delivery = Delivery {
            request: request(Some("video/mp4")),
            partition: 0,
            offset: 0,
        };
        handle_delivery(&cfg, &limiter, Some(&sink), &delivery).await;

        assert!(sink.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn workers_commit_processed_messages() {
        let cfg = Arc::new(Config::for_tests());
        let scheduler = Scheduler::new(cfg);
        let source = Arc::new(FakeSource::new(vec![
            request(Some("video/mp2t")),
            request(Some("image/png")),
        ]));
        let shutdown = CancellationToken::new();

        let workers = scheduler.start_workers(source.clone(), None, 2, shutdown.clone());

        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        for worker in workers {
            let _ = worker.await;
        }

        let mut commits = source.commits.lock().unwrap().clone();
        commits.sort_unstable();
        assert_eq!(commits, vec![0, 1]);
    }

    #[tokio::test]
    async fn commit_retries_transient_failures() {
        let source = FakeSource::new(vec![]);
        source.commit_failures.store(2, Ordering::SeqCst);

        let delivery = Delivery {
            request: request(None),
            partition: 0,
            offset: 5,
        };
        commit_with_retries(&source, &delivery).await;

        assert_eq!(source.commits.lock().unwrap().clone(), vec![5]);
    }

    #[test]
    fn scaling_capacity_fallback_drops_scaled_renditions() {
        let limiter = CapacityLimiter::new(1);
        let media = crate::domain::profile::MediaInfo {
            codec: Some("h264".into()),
            width: 1920,
            height: 1080,
        };

        let (profiles, cost) = claim_scaling_capacity(default_profiles(&media), &limiter);
        // orig + 720p + 480p needs 2 units of scaling capacity; only 1 left.
        assert_eq!(cost, 0);
        assert_eq!(profiles.len(), 1);
        assert_eq!(profiles[0].name, "orig-copy");
        assert_eq!(limiter.available(), 1);
    }

    #[test]
    fn scaling_capacity_is_claimed_when_available() {
        let limiter = CapacityLimiter::new(10);
        let media = crate::domain::profile::MediaInfo {
            codec: Some("h264".into()),
            width: 1920,
            height: 1080,
        };

        let (profiles, cost) = claim_scaling_capacity(default_profiles(&media), &limiter);
        assert_eq!(cost, 2);
        assert_eq!(profiles.len(), 3);
        assert_eq!(limiter.available(), 8);
    }
}
