//! Datalake storage backend: an HTTP API speaking multipart form uploads
//! and JSON metadata, authenticated with a bearer token.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::{Client, Response};
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

use crate::error::{Error, Result};
use crate::ports::storage::{
    content_type_for, object_key, BlobInfo, MetaProvider, PutOptions, StoragePort,
};

#[derive(Debug, Deserialize)]
struct UploadResult {
    key: String,
    #[serde(default)]
    error: Option<String>,
}

/// Client for one workspace of the datalake.
#[derive(Clone)]
pub struct DatalakeStorage {
    base_url: String,
    workspace: String,
    token: String,
    client: Client,
}

impl DatalakeStorage {
    pub fn new(base_url: &str, workspace: &str, token: &str, insecure: bool) -> Result<Self> {
        let client = Client::builder()
            .pool_idle_timeout(Duration::from_secs(5))
            .danger_accept_invalid_certs(insecure)
            .build()?;

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            workspace: workspace.to_string(),
            token: token.to_string(),
            client,
        })
    }

    fn blob_url(&self, key: &str) -> String {
        format!("{}/blob/{}/{}", self.base_url, self.workspace, key)
    }

    fn meta_url(&self, key: &str) -> String {
        format!("{}/meta/{}/{}", self.base_url, self.workspace, key)
    }

    async fn ok_response(&self, response: Response, what: &str) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        error!(
            workspace = %self.workspace,
            status = %status,
            response = %body,
            "{what} failed"
        );
        Err(Error::Storage(format!("{what}: unexpected status code {status}")))
    }
}

#[async_trait]
impl StoragePort for DatalakeStorage {
    async fn put_file(&self, path: &Path, opts: &PutOptions) -> Result<()> {
        let key = object_key(path);
        debug!(workspace = %self.workspace, file = %path.display(), "upload start");

        let data = tokio::fs::read(path).await?;
        let part = reqwest::multipart::Part::bytes(data)
            .file_name(key.clone())
            .mime_str(content_type_for(&key))
            .map_err(|e| Error::Storage(format!("form file: {e}")))?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let mut request = self
            .client
            .post(format!("{}/upload/form-data/{}", self.base_url, self.workspace))
            .bearer_auth(&self.token)
            .multipart(form);
        if opts.no_cache {
            request = request.header(reqwest::header::CACHE_CONTROL, "no-cache");
        }

        let response = self.ok_response(request.send().await?, "upload").await?;

        // The endpoint accepts several files per request and reports
        // failures per entry rather than via the status code.
        let results: Vec<UploadResult> = response.json().await?;
        for result in results {
            if let Some(error) = result.error.filter(|e| !e.is_empty()) {
                return Err(Error::Storage(format!("upload error: {} {error}", result.key)));
            }
        }

        debug!(workspace = %self.workspace, key = %key, "uploaded");
        Ok(())
    }

    async fn get_file(&self, name: &str, dest: &Path) -> Result<()> {
        let key = object_key(Path::new(name));
        debug!(workspace = %self.workspace, key = %key, destination = %dest.display(), "download start");

        let response = self
            .client
            .get(self.blob_url(&key))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = self.ok_response(response, "download").await?;

        let mut file = tokio::fs::File::create(dest).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;

        let size = tokio::fs::metadata(dest).await?.len();
        info!(workspace = %self.workspace, key = %key, size, "file downloaded");
        Ok(())
    }

    async fn delete_file(&self, name: &str) -> Result<()> {
        let key = object_key(Path::new(name));
        debug!(workspace = %self.workspace, key = %key, "delete start");

        let response = self
            .client
            .delete(self.blob_url(&key))
            .bearer_auth(&self.token)
            .send()
            .await?;
        self.ok_response(response, "delete").await?;

        debug!(workspace = %self.workspace, key = %key, "deleted");
        Ok(())
    }

    async fn stat_file(&self, name: &str) -> Result<BlobInfo> {
        let key = object_key(Path::new(name));

        let response = self
            .client
            .head(self.blob_url(&key))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = self.ok_response(response, "stat").await?;

        let headers = response.headers();
        let header = |name: reqwest::header::HeaderName| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };

        Ok(BlobInfo {
            size: header(reqwest::header::CONTENT_LENGTH).parse().unwrap_or(0),
            content_type: header(reqwest::header::CONTENT_TYPE),
            etag: header(reqwest::header::ETAG),
        })
    }

    async fn set_parent(&self, name: &str, parent: &str) -> Result<()> {
        let key = object_key(Path::new(name));
        let parent_key = object_key(Path::new(parent));
        debug!(workspace = %self.workspace, key = %key, parent = %parent_key, "set parent");

        let response = self
            .client
            .patch(format!("{}/parent", self.blob_url(&key)))
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "parent": parent_key }))
            .send()
            .await?;
        self.ok_response(response, "set parent").await?;
        Ok(())
    }

    fn meta(&self) -> Option<Arc<dyn MetaProvider>> {
        Some(Arc::new(self.clone()))
    }
}

#[async_trait]
impl MetaProvider for DatalakeStorage {
    async fn patch_meta(&self, name: &str, metadata: &serde_json::Value) -> Result<()> {
        let key = object_key(Path::new(name));
        debug!(workspace = %self.workspace, key = %key, "patch meta");

        let response = self
            .client
            .patch(self.meta_url(&key))
            .bearer_auth(&self.token)
            .json(metadata)
            .send()
            .await?;
        self.ok_response(response, "patch meta").await?;
        Ok(())
    }

    async fn get_meta(&self, name: &str) -> Result<serde_json::Value> {
        let key = object_key(Path::new(name));

        let response = self
            .client
            .get(self.meta_url(&key))
            .bearer_auth(&self.token)
            .send()
            .await?;
        let response = self.ok_response(response, "get meta").await?;
        Ok(response.json().await?)
    }
}
