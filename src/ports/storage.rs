//! Remote blob storage capability consumed by the pipeline.
//!
//! The base trait covers what every backend supports. Optional
//! capabilities (metadata patching, multipart upload) are discovered at
//! runtime via the `meta()` / `multipart()` accessors, which hand out
//! shareable trait objects when the backend implements them.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

#[derive(Debug, Clone, Default)]
pub struct PutOptions {
    /// Hint that the object must not be served from caches; used for
    /// playlists that are rewritten while the encoder runs.
    pub no_cache: bool,
}

/// `HEAD`-style stat record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobInfo {
    pub size: u64,
    pub content_type: String,
    pub etag: String,
}

/// One uploaded part of a multipart upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultipartPart {
    /// 1-based, gap-free, monotonically increasing.
    pub part_number: i32,
    pub etag: String,
}

#[async_trait]
pub trait StoragePort: Send + Sync {
    /// Uploads the local file at `path`; the remote key is its basename.
    async fn put_file(&self, path: &Path, opts: &PutOptions) -> Result<()>;

    /// Downloads a blob to `dest`, creating or overwriting it.
    async fn get_file(&self, name: &str, dest: &Path) -> Result<()>;

    async fn delete_file(&self, name: &str) -> Result<()>;

    async fn stat_file(&self, name: &str) -> Result<BlobInfo>;

    /// Records a parent back-reference so derived files are grouped under
    /// their source object.
    async fn set_parent(&self, name: &str, parent: &str) -> Result<()>;

    /// Metadata capability, when the backend has one.
    fn meta(&self) -> Option<Arc<dyn MetaProvider>> {
        None
    }

    /// Multipart capability, when the backend has one.
    fn multipart(&self) -> Option<Arc<dyn MultipartStorage>> {
        None
    }
}

#[async_trait]
pub trait MetaProvider: Send + Sync {
    /// Merges `metadata` into the object's metadata server-side.
    async fn patch_meta(&self, name: &str, metadata: &serde_json::Value) -> Result<()>;

    async fn get_meta(&self, name: &str) -> Result<serde_json::Value>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MultipartStorage: Send + Sync {
    /// Opens a multipart upload and returns its upload id.
    async fn start(&self, object: &str) -> Result<String>;

    async fn part(
        &self,
        object: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<MultipartPart>;

    /// Finalizes the upload from the ordered parts list.
    async fn complete(&self, object: &str, upload_id: &str, parts: &[MultipartPart])
        -> Result<()>;

    async fn cancel(&self, object: &str, upload_id: &str) -> Result<()>;
}

/// Content type by extension, matching what players expect from the store.
pub fn content_type_for(name: &str) -> &'static str {
    if name.ends_with(".ts") {
        "video/mp2t"
    } else if name.ends_with(".m3u8") {
        "video/x-mpegurl"
    } else {
        "application/octet-stream"
    }
}

/// Remote key for a local path: its basename.
pub fn object_key(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string_lossy().into_owned())
}
