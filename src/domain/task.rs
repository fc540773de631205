//! Offline transcoding tasks and the queue message shapes.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The only package format the service produces.
pub const FORMAT_HLS: &str = "hls";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Planned,
    Running,
    Done,
    Failed,
}

/// One queued transcode job referencing a blob already in remote storage.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: Uuid,
    pub status: TaskStatus,
    /// Key of the source blob in the remote store.
    pub source: String,
    pub format: String,
    pub workspace: String,
    pub metadata: HashMap<String, String>,
}

impl Task {
    pub fn new(source: String, workspace: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            status: TaskStatus::Planned,
            source,
            format: FORMAT_HLS.to_string(),
            workspace,
            metadata: HashMap::new(),
        }
    }
}

/// What a finished task produced, in the output namespace of the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub playlist: String,
    pub thumbnail: String,
    pub width: u32,
    pub height: u32,
}

/// Request message consumed from the transcode request topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeRequest {
    #[serde(rename = "BlobID")]
    pub blob_id: String,
    #[serde(rename = "WorkspaceUUID")]
    pub workspace_uuid: String,
    #[serde(rename = "ContentType", default)]
    pub content_type: Option<String>,
}

/// Result message published to the transcode result topic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeResult {
    #[serde(rename = "BlobID")]
    pub blob_id: String,
    #[serde(rename = "WorkspaceUUID")]
    pub workspace_uuid: String,
    #[serde(rename = "Playlist")]
    pub playlist: String,
    #[serde(rename = "Thumbnail")]
    pub thumbnail: String,
}

/// Content types the offline pipeline accepts.
pub const SUPPORTED_SOURCE_TYPES: [&str; 3] = ["video/mp4", "video/webm", "video/quicktime"];

/// Types explicitly rejected: already-packaged HLS artifacts.
pub const REJECTED_SOURCE_TYPES: [&str; 2] = ["video/mp2t", "video/x-mpegurl"];

pub fn is_supported_source_type(content_type: &str) -> bool {
    let base = content_type.split(';').next().unwrap_or(content_type).trim();
    if REJECTED_SOURCE_TYPES.contains(&base) {
        return false;
    }
    SUPPORTED_SOURCE_TYPES.contains(&base)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_type_gate() {
        assert!(is_supported_source_type("video/mp4"));
        assert!(is_supported_source_type("video/quicktime"));
        assert!(is_supported_source_type("video/webm; codecs=vp9"));
        assert!(!is_supported_source_type("video/mp2t"));
        assert!(!is_supported_source_type("video/x-mpegurl"));
        assert!(!is_supported_source_type("image/png"));
    }

    #[test]
    fn request_message_shape() {
        let json = r#"{"BlobID":"blob-1","WorkspaceUUID":"ws-1","ContentType":"video/mp4"}"#;
        let request: TranscodeRequest = serde_json::from_str(json).unwrap();
        assert_eq!(request.blob_id, "blob-1");
        assert_eq!(request.workspace_uuid, "ws-1");
        assert_eq!(request.content_type.as_deref(), Some("video/mp4"));

        // ContentType is optional on the wire.
        let bare: TranscodeRequest =
            serde_json::from_str(r#"{"BlobID":"b","WorkspaceUUID":"w"}"#).unwrap();
        assert!(bare.content_type.is_none());
    }
}
