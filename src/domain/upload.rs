//! Per-upload state for the live path and the metadata conventions the
//! upload front end sends along.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use uuid::Uuid;

use crate::domain::profile::MediaInfo;
use crate::error::{Error, Result};

pub const META_WIDTH: &str = "width";
pub const META_HEIGHT: &str = "height";
pub const META_CONTENT_TYPE: &str = "contentType";
pub const META_WORKSPACE: &str = "workspace";
pub const META_TOKEN: &str = "token";

/// Stable identity and progress of one resumable upload.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub id: Uuid,
    /// Bytes accepted so far.
    pub offset: u64,
    /// Total size; `None` until declared when the client defers it.
    pub size: Option<u64>,
    pub size_is_deferred: bool,
    pub metadata: HashMap<String, String>,
}

impl FileInfo {
    pub fn new(id: Option<Uuid>, metadata: HashMap<String, String>) -> Self {
        Self {
            id: id.unwrap_or_else(Uuid::new_v4),
            offset: 0,
            size: None,
            size_is_deferred: true,
            metadata,
        }
    }

    pub fn workspace(&self) -> Option<&str> {
        self.metadata.get(META_WORKSPACE).map(String::as_str)
    }

    pub fn token(&self) -> Option<&str> {
        self.metadata.get(META_TOKEN).map(String::as_str)
    }

    /// Extracts what profile selection needs from the metadata. Width and
    /// height are mandatory; the codec is mined out of the `contentType`
    /// value when present.
    pub fn media_info(&self) -> Result<MediaInfo> {
        let width = self.parse_dimension(META_WIDTH)?;
        let height = self.parse_dimension(META_HEIGHT)?;
        let codec = self
            .metadata
            .get(META_CONTENT_TYPE)
            .and_then(|ct| parse_codec(ct));

        Ok(MediaInfo {
            codec,
            width,
            height,
        })
    }

    /// MIME type without parameters, e.g. `video/mp4`.
    pub fn mime_type(&self) -> Option<&str> {
        self.metadata
            .get(META_CONTENT_TYPE)
            .map(|ct| ct.split(';').next().unwrap_or(ct).trim())
    }

    fn parse_dimension(&self, key: &str) -> Result<u32> {
        self.metadata
            .get(key)
            .ok_or_else(|| Error::InvalidMetadata(format!("missing {key}")))?
            .parse()
            .map_err(|_| {
                Error::InvalidMetadata(format!("unparseable {key}: {:?}", self.metadata.get(key)))
            })
    }
}

/// Pulls the codec tag out of a content type such as
/// `video/mp4; codecs="avc1.64001f, mp4a.40.2"`.
pub fn parse_codec(content_type: &str) -> Option<String> {
    static CODEC_RE: OnceLock<Regex> = OnceLock::new();
    let re = CODEC_RE.get_or_init(|| Regex::new(r#"codecs["\s=]+([^",\s]+)"#).unwrap());
    re.captures(content_type)
        .map(|caps| caps[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn media_info_parses_dimensions_and_codec() {
        let info = FileInfo::new(
            None,
            meta(&[
                ("width", "1920"),
                ("height", "1080"),
                ("contentType", r#"video/mp4; codecs="avc1.64001f, mp4a.40.2""#),
            ]),
        );

        let media = info.media_info().unwrap();
        assert_eq!(media.width, 1920);
        assert_eq!(media.height, 1080);
        assert_eq!(media.codec.as_deref(), Some("avc1.64001f"));
        assert_eq!(info.mime_type(), Some("video/mp4"));
    }

    #[test]
    fn media_info_rejects_unparseable_dimensions() {
        let info = FileInfo::new(None, meta(&[("width", "wide"), ("height", "1080")]));
        assert!(matches!(info.media_info(), Err(Error::InvalidMetadata(_))));

        let info = FileInfo::new(None, meta(&[("height", "1080")]));
        assert!(matches!(info.media_info(), Err(Error::InvalidMetadata(_))));
    }

    #[test]
    fn codec_regex_accepts_unquoted_forms() {
        assert_eq!(
            parse_codec(r#"video/webm; codecs=vp9"#).as_deref(),
            Some("vp9")
        );
        assert_eq!(
            parse_codec(r#"video/mp4; codecs="hvc1.1.6.L93.B0""#).as_deref(),
            Some("hvc1.1.6.L93.B0")
        );
        assert_eq!(parse_codec("video/mp4"), None);
    }
}
