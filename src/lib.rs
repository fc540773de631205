//! streamforge - adaptive HLS transcoding service
//!
//! Hexagonal architecture:
//! - domain/: pure logic (fan-out pipe, profiles, playlists, encoder
//!   commands, limiter)
//! - ports/: trait definitions (storage, queue)
//! - adapters/: concrete backends (datalake, S3, Kafka)
//! - application/: services (executor, uploader, multipart, stream
//!   coordinator, scheduler)
//! - config: environment configuration
//!
//! Two ingest paths share one pipeline: live chunked uploads are fed
//! through a fan-out pipe straight into the encoders, while queued jobs
//! download their source from remote storage first. Both end with an HLS
//! package uploaded under a stable identifier.

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod ports;
pub mod token;

pub use config::Config;
pub use error::{Error, Result};

// Re-exports for convenience
pub use application::scheduler::Scheduler;
pub use application::stream::{Stream, StreamStore};
pub use domain::pipe::{PipeReader, PipeWriter};
pub use domain::upload::FileInfo;
