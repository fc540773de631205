//! S3-compatible storage backend, including native multipart upload.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::ports::storage::{
    content_type_for, object_key, BlobInfo, MultipartPart, MultipartStorage, PutOptions,
    StoragePort,
};

/// Client for one bucket (the workspace) of an S3-compatible store.
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// Connects to `host` (taken from an `s3://host` endpoint). The bucket
    /// is the workspace. `insecure` selects plain http.
    pub async fn connect(host: &str, workspace: &str, region: &str, insecure: bool) -> Self {
        let scheme = if insecure { "http" } else { "https" };
        let shared = aws_config::defaults(BehaviorVersion::latest())
            .endpoint_url(format!("{scheme}://{host}"))
            .region(aws_config::Region::new(region.to_string()))
            .load()
            .await;
        let config = aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(true)
            .build();

        Self {
            client: Client::from_conf(config),
            bucket: workspace.to_string(),
        }
    }

    fn storage_err(op: &str, err: impl std::fmt::Display) -> Error {
        Error::Storage(format!("s3 {op}: {err}"))
    }
}

#[async_trait]
impl StoragePort for S3Storage {
    async fn put_file(&self, path: &Path, opts: &PutOptions) -> Result<()> {
        let key = object_key(path);
        debug!(bucket = %self.bucket, key = %key, "put");

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| Self::storage_err("read body", e))?;

        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .content_type(content_type_for(&key))
            .body(body);
        if opts.no_cache {
            request = request.cache_control("no-cache");
        }

        request
            .send()
            .await
            .map_err(|e| Self::storage_err("put", e))?;
        Ok(())
    }

    async fn get_file(&self, name: &str, dest: &Path) -> Result<()> {
        let key = object_key(Path::new(name));
        debug!(bucket = %self.bucket, key = %key, destination = %dest.display(), "get");

        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Self::storage_err("get", e))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| Self::storage_err("get body", e))?;
        tokio::fs::write(dest, body.into_bytes()).await?;
        Ok(())
    }

    async fn delete_file(&self, name: &str) -> Result<()> {
        let key = object_key(Path::new(name));
        debug!(bucket = %self.bucket, key = %key, "delete");

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Self::storage_err("delete", e))?;
        Ok(())
    }

    async fn stat_file(&self, name: &str) -> Result<BlobInfo> {
        let key = object_key(Path::new(name));

        let response = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Self::storage_err("head", e))?;

        Ok(BlobInfo {
            size: response.content_length().unwrap_or(0).max(0) as u64,
            content_type: response.content_type().unwrap_or_default().to_string(),
            etag: response.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn set_parent(&self, name: &str, parent: &str) -> Result<()> {
        // Parent grouping is a datalake concept with no S3 counterpart.
        trace!(bucket = %self.bucket, name, parent, "set_parent ignored");
        Ok(())
    }

    fn multipart(&self) -> Option<Arc<dyn MultipartStorage>> {
        Some(Arc::new(self.clone()))
    }
}

#[async_trait]
impl MultipartStorage for S3Storage {
    async fn start(&self, object: &str) -> Result<String> {
        let response = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(object)
            .send()
            .await
            .map_err(|e| Self::storage_err("create multipart", e))?;

        response
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| Self::storage_err("create multipart", "missing upload id"))
    }

    async fn part(
        &self,
        object: &str,
        upload_id: &str,
        part_number: i32,
        data: Bytes,
    ) -> Result<MultipartPart> {
        debug!(bucket = %self.bucket, object, part_number, size = data.len(), "upload part");

        let response = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(object)
            .upload_id(upload_id)
            .part_number(part_number)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| Self::storage_err("upload part", e))?;

        Ok(MultipartPart {
            part_number,
            etag: response.e_tag().unwrap_or_default().to_string(),
        })
    }

    async fn complete(
        &self,
        object: &str,
        upload_id: &str,
        parts: &[MultipartPart],
    ) -> Result<()> {
        let completed = CompletedMultipartUpload::builder()
            .set_parts(Some(
                parts
                    .iter()
                    .map(|p| {
                        CompletedPart::builder()
                            .part_number(p.part_number)
                            .e_tag(&p.etag)
                            .build()
                    })
                    .collect(),
            ))
            .build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(object)
            .upload_id(upload_id)
            .multipart_upload(completed)
            .send()
            .await
            .map_err(|e| Self::storage_err("complete multipart", e))?;
        Ok(())
    }

    async fn cancel(&self, object: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(object)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| Self::storage_err("abort multipart", e))?;
        Ok(())
    }
}
