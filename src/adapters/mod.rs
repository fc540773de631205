//! Adapter layer - concrete backends behind the ports.

pub mod datalake;
pub mod kafka;
pub mod s3;

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::ports::storage::StoragePort;

/// Builds a storage client for `endpoint`, selecting the backend by URL
/// scheme: `datalake://host` or `s3://host`.
pub async fn storage_for_endpoint(
    endpoint: &str,
    workspace: &str,
    token: &str,
    region: &str,
    insecure: bool,
) -> Result<Arc<dyn StoragePort>> {
    let (scheme, host) = endpoint
        .split_once("://")
        .ok_or_else(|| Error::Config(format!("endpoint without scheme: {endpoint:?}")))?;

    match scheme {
        "datalake" => {
            let base_url = format!(
                "{}://{}",
                if insecure { "http" } else { "https" },
                host
            );
            Ok(Arc::new(datalake::DatalakeStorage::new(
                &base_url, workspace, token, insecure,
            )?))
        }
        "s3" => Ok(Arc::new(
            s3::S3Storage::connect(host, workspace, region, insecure).await,
        )),
        other => Err(Error::Config(format!("unsupported storage scheme: {other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_scheme_is_rejected() {
        let result = storage_for_endpoint("ftp://host", "ws", "t", "r", false).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn missing_scheme_is_rejected() {
        let result = storage_for_endpoint("localhost:9000", "ws", "t", "r", false).await;
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
