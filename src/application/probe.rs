//! Out-of-band media probe for downloaded sources.

use std::path::Path;

use serde::Deserialize;
use tracing::warn;

use crate::domain::profile::MediaInfo;
use crate::error::{Error, Result};

pub const PROBE_PROGRAM: &str = "ffprobe";

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
}

/// Probes `path` for the first video stream's codec and dimensions. A
/// missing audio stream is tolerated; a missing video stream is fatal.
pub async fn probe_file(path: &Path) -> Result<MediaInfo> {
    let output = tokio::process::Command::new(PROBE_PROGRAM)
        .args(["-v", "error", "-print_format", "json", "-show_streams"])
        .arg(path)
        .output()
        .await
        .map_err(|e| Error::Probe(format!("spawn {PROBE_PROGRAM}: {e}")))?;

    if !output.status.success() {
        return Err(Error::Probe(format!(
            "{PROBE_PROGRAM} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    parse_probe_output(&output.stdout, path)
}

fn parse_probe_output(stdout: &[u8], path: &Path) -> Result<MediaInfo> {
    let parsed: ProbeOutput = serde_json::from_slice(stdout)?;

    let video = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| Error::Probe(format!("no video stream in {}", path.display())))?;

    if !parsed
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"))
    {
        warn!(file = %path.display(), "no audio stream, continuing");
    }

    Ok(MediaInfo {
        codec: video.codec_name.clone(),
        width: video.width.unwrap_or(0),
        height: video.height.unwrap_or(0),
    })
}
