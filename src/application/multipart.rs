//! Buffered multipart upload: accumulates an incoming byte stream and
//! flushes parts of at least 5 MiB to a multipart-capable store.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::ports::storage::{MultipartPart, MultipartStorage};

/// Everything but the final part must be at least this large.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// Budget for remote cleanup when terminating, so an abort still cleans up
/// even when the surrounding operation was already cancelled.
const TERMINATE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct MultipartUpload {
    storage: Arc<dyn MultipartStorage>,
    object_name: String,
    upload_id: String,
    buffer: BytesMut,
    next_part_number: i32,
    parts: Vec<MultipartPart>,
    terminated: bool,
    completed: bool,
    bytes_written: u64,
    bytes_uploaded: u64,
}

impl MultipartUpload {
    /// Opens a multipart upload for `object_name`.
    pub async fn start(storage: Arc<dyn MultipartStorage>, object_name: &str) -> Result<Self> {
        let upload_id = storage.start(object_name).await?;
        debug!(object = %object_name, upload_id = %upload_id, "multipart upload started");

        Ok(Self {
            storage,
            object_name: object_name.to_string(),
            upload_id,
            buffer: BytesMut::new(),
            next_part_number: 1,
            parts: Vec::new(),
            terminated: false,
            completed: false,
            bytes_written: 0,
            bytes_uploaded: 0,
        })
    }

    /// Accepts bytes, flushing a part whenever the buffer reaches the part
    /// size. Rejected once the upload is terminated or completed.
    pub async fn write(&mut self, data: &[u8]) -> Result<()> {
        self.check_open()?;

        self.buffer.extend_from_slice(data);
        self.bytes_written += data.len() as u64;

        while self.buffer.len() >= MIN_PART_SIZE {
            self.flush_part().await?;
        }
        Ok(())
    }

    /// Flushes any remaining bytes as the (possibly short) final part and
    /// finalizes the upload. Fails when nothing was ever written.
    pub async fn complete(&mut self) -> Result<()> {
        self.check_open()?;

        if !self.buffer.is_empty() {
            self.flush_part().await?;
        }
        if self.parts.is_empty() {
            return Err(Error::Multipart("complete with no parts"));
        }

        self.storage
            .complete(&self.object_name, &self.upload_id, &self.parts)
            .await?;
        self.completed = true;

        debug!(
            object = %self.object_name,
            parts = self.parts.len(),
            bytes = self.bytes_uploaded,
            "multipart upload completed"
        );
        Ok(())
    }

    /// Aborts the upload remotely. Idempotent; runs under its own timeout
    /// so cleanup is attempted even mid-abort.
    pub async fn terminate(&mut self) -> Result<()> {
        if self.terminated {
            return Ok(());
        }
        if self.completed {
            return Err(Error::Multipart("terminate after complete"));
        }
        self.terminated = true;
        self.buffer.clear();

        let cancel = self.storage.cancel(&self.object_name, &self.upload_id);
        match tokio::time::timeout(TERMINATE_TIMEOUT, cancel).await {
            Ok(result) => result,
            Err(_) => {
                warn!(object = %self.object_name, "multipart cancel timed out");
                Err(Error::Timeout)
            }
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded
    }

    pub fn parts(&self) -> &[MultipartPart] {
        &self.parts
    }

    fn check_open(&self) -> Result<()> {
        if self.terminated {
            return Err(Error::Multipart("upload terminated"));
        }
        if self.completed {
            return Err(Error::Multipart("upload completed"));
        }
        Ok(())
    }

    async fn flush_part(&mut self) -> Result<()> {
        let data = self.buffer.split().freeze();
        let size = data.len();

        let part = self
            .storage
            .part(&self.object_name, &self.upload_id, self.next_part_number, data)
            .await?;

        self.next_part_number += 1;
        self.bytes_uploaded += size as u64;
        self.parts.push(part);
        Ok(())
    }
}
