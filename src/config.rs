//! Service configuration, loaded from the environment.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct Config {
    /// Address the upload front end binds to.
    pub serve_url: String,
    /// Remote storage endpoint, scheme-selected (`datalake://` or `s3://`).
    /// When unset, streams run without storage (local output only).
    pub endpoint_url: Option<String>,
    /// HS256 secret for platform tokens.
    pub server_secret: String,
    pub insecure: bool,
    pub output_dir: PathBuf,
    /// Per-stream inactivity timeout.
    pub timeout: Duration,
    /// Threads handed to each encoder process.
    pub max_thread_count: u32,
    /// Capacity of the scaling-work limiter.
    pub max_parallel_scaling_count: u64,
    /// Soft cap on concurrently active transcodes.
    pub max_parallel_transcoding_count: u64,
    pub log_level: String,
    /// `broker1,broker2;postfix`, unset to disable the queue worker.
    pub queue_config: Option<String>,
    pub region: String,
    pub token_issuer: String,
    pub token_audience: String,
    /// Encoder binary to invoke.
    pub encoder_path: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();

        Self {
            serve_url: env::var("SERVE_URL").unwrap_or_else(|_| String::from("0.0.0.0:4030")),
            endpoint_url: env::var("ENDPOINT_URL").ok().filter(|v| !v.is_empty()),
            server_secret: env::var("SERVER_SECRET").unwrap_or_else(|_| String::from("secret")),
            insecure: env_flag("INSECURE"),
            output_dir: PathBuf::from(
                env::var("OUTPUT_DIR").unwrap_or_else(|_| String::from("./output")),
            ),
            timeout: Duration::from_secs(env_number("TIMEOUT", 600)),
            max_thread_count: env_number("MAX_THREAD_COUNT", default_thread_count()),
            max_parallel_scaling_count: env_number("MAX_PARALLEL_SCALING_COUNT", 10),
            max_parallel_transcoding_count: env_number("MAX_PARALLEL_TRANSCODING_COUNT", 10),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| String::from("info")),
            queue_config: env::var("QUEUE_CONFIG").ok().filter(|v| !v.is_empty()),
            region: env::var("REGION").unwrap_or_else(|_| String::from("us-east-1")),
            token_issuer: env::var("TOKEN_ISSUER").unwrap_or_else(|_| String::from("stream")),
            token_audience: env::var("TOKEN_AUDIENCE").unwrap_or_else(|_| String::from("datalake")),
            encoder_path: env::var("FFMPEG_PATH").unwrap_or_else(|_| String::from("ffmpeg")),
        }
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            serve_url: String::from("127.0.0.1:0"),
            endpoint_url: None,
            server_secret: String::from("secret"),
            insecure: true,
            output_dir: PathBuf::from("./output"),
            timeout: Duration::from_secs(60),
            max_thread_count: 2,
            max_parallel_scaling_count: 10,
            max_parallel_transcoding_count: 10,
            log_level: String::from("error"),
            queue_config: None,
            region: String::from("us-east-1"),
            token_issuer: String::from("stream"),
            token_audience: String::from("datalake"),
            encoder_path: String::from("ffmpeg"),
        }
    }
}

fn default_thread_count() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4)
}

fn env_flag(key: &str) -> bool {
    env::var(key)
        .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
        .unwrap_or(false)
}

fn env_number<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
