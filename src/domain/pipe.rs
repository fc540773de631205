//! Fan-out byte pipe: a single writer feeding any number of independent
//! readers over a shared chain of chunks.
//!
//! The writer appends chunks to a singly linked list and never waits for
//! readers. Each reader walks the chain at its own pace, so memory growth is
//! bounded by the slowest reader's lag: chunks behind every reader are freed
//! as the last `Arc` to them is dropped.

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

struct Chunk {
    data: Bytes,
    /// Published exactly once by the writer, then immutable.
    next: Mutex<Option<Arc<Chunk>>>,
    /// Fired after `next` is populated.
    ready: Notify,
}

impl Chunk {
    fn new(data: Bytes) -> Arc<Chunk> {
        Arc::new(Chunk {
            data,
            next: Mutex::new(None),
            ready: Notify::new(),
        })
    }
}

/// Writing half of the pipe. Dropping the writer closes the pipe.
pub struct PipeWriter {
    tail: Arc<Chunk>,
    done: CancellationToken,
}

impl Default for PipeWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl PipeWriter {
    pub fn new() -> Self {
        Self {
            tail: Chunk::new(Bytes::new()),
            done: CancellationToken::new(),
        }
    }

    /// Appends `data` to the stream and wakes readers waiting at the old
    /// tail. Returns the number of bytes accepted, which is `data.len()`
    /// unless the pipe is closed.
    pub fn write(&mut self, data: &[u8]) -> usize {
        if data.is_empty() || self.done.is_cancelled() {
            return 0;
        }

        let chunk = Chunk::new(Bytes::copy_from_slice(data));
        *self.tail.next.lock().unwrap() = Some(chunk.clone());
        let prev = std::mem::replace(&mut self.tail, chunk);
        prev.ready.notify_waiters();
        data.len()
    }

    /// Creates an independent reader that will observe every byte written
    /// after this call. Readers do not affect each other or the writer.
    pub fn subscribe(&self) -> PipeReader {
        PipeReader {
            chunk: self.tail.clone(),
            offset: self.tail.data.len(),
            done: self.done.clone(),
            closed: CancellationToken::new(),
        }
    }

    /// Closes the pipe. Readers that drain the chain observe end-of-stream.
    /// Idempotent.
    pub fn close(&self) {
        self.done.cancel();
    }
}

impl Drop for PipeWriter {
    fn drop(&mut self) {
        self.done.cancel();
    }
}

/// Reading half. Created via [`PipeWriter::subscribe`]; any number may
/// coexist, each with its own position.
pub struct PipeReader {
    chunk: Arc<Chunk>,
    offset: usize,
    done: CancellationToken,
    closed: CancellationToken,
}

impl PipeReader {
    /// Returns the unread remainder of the current chunk, or the next chunk
    /// once one is published. `Ok(None)` signals end-of-stream. Waits when
    /// the chain is drained and the writer is still open.
    pub async fn next_chunk(&mut self) -> Result<Option<Bytes>> {
        loop {
            if self.closed.is_cancelled() {
                return Err(Error::PipeClosed);
            }

            if self.offset < self.chunk.data.len() {
                let rest = self.chunk.data.slice(self.offset..);
                self.offset = self.chunk.data.len();
                return Ok(Some(rest));
            }

            // Arm the wakeup before re-checking `next` so a publish that
            // lands between the check and the await is not missed. The
            // chunk handle is cloned so advancing does not invalidate it.
            let current = self.chunk.clone();
            let ready = current.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if self.advance() {
                continue;
            }

            if self.done.is_cancelled() {
                // The writer may have published a chunk right before close.
                if self.advance() {
                    continue;
                }
                return Ok(None);
            }

            tokio::select! {
                _ = &mut ready => {}
                _ = self.done.cancelled() => {}
                _ = self.closed.cancelled() => {}
            }
        }
    }

    /// Reads up to `buf.len()` bytes. `Ok(0)` signals end-of-stream; reading
    /// from a closed reader fails with [`Error::PipeClosed`].
    pub async fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }

        loop {
            if self.closed.is_cancelled() {
                return Err(Error::PipeClosed);
            }

            if self.offset < self.chunk.data.len() {
                let n = (self.chunk.data.len() - self.offset).min(buf.len());
                buf[..n].copy_from_slice(&self.chunk.data[self.offset..self.offset + n]);
                self.offset += n;
                return Ok(n);
            }

            let current = self.chunk.clone();
            let ready = current.ready.notified();
            tokio::pin!(ready);
            ready.as_mut().enable();

            if self.advance() {
                continue;
            }

            if self.done.is_cancelled() {
                if self.advance() {
                    continue;
                }
                return Ok(0);
            }

            tokio::select! {
                _ = &mut ready => {}
                _ = self.done.cancelled() => {}
                _ = self.closed.cancelled() => {}
            }
        }
    }

    /// Collects the remaining stream into one buffer. Test and tooling aid.
    pub async fn read_to_end(&mut self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        while let Some(chunk) = self.next_chunk().await? {
            out.extend_from_slice(&chunk);
        }
        Ok(out)
    }

    /// Closes this reader only; subsequent reads fail with
    /// [`Error::PipeClosed`]. Other readers and the writer are unaffected.
    /// Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    fn advance(&mut self) -> bool {
        let next = self.chunk.next.lock().unwrap().clone();
        match next {
            Some(next) => {
                self.chunk = next;
                self.offset = 0;
                true
            }
            None => false,
        }
    }
}
