use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use streamforge::adapters::kafka::{KafkaRequestSource, KafkaResultSink, QueueConfig};
use streamforge::application::scheduler::Scheduler;
use streamforge::config::Config;
use streamforge::error::Result;

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(Config::from_env());

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cfg.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    tokio::fs::create_dir_all(&cfg.output_dir).await?;

    let Some(queue_config) = &cfg.queue_config else {
        warn!("QUEUE_CONFIG not set, nothing to do");
        return Ok(());
    };

    let queue = QueueConfig::parse(queue_config, "streamforge", &cfg.region)?;
    let source = Arc::new(KafkaRequestSource::new(&queue)?);
    let sink = Arc::new(KafkaResultSink::new(&queue)?);

    let shutdown = CancellationToken::new();
    let scheduler = Scheduler::new(cfg.clone());
    let workers = scheduler.start_workers(
        source,
        Some(sink),
        cfg.max_parallel_transcoding_count as usize,
        shutdown.clone(),
    );
    info!(workers = workers.len(), "scheduler running");

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }

    Ok(())
}
