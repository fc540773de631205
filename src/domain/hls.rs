//! HLS playlist assembly and the output naming contract.
//!
//! The names produced here are shared contracts: the encoder command
//! builder writes segments and per-profile playlists under the same names
//! the master playlist references.

use std::path::{Path, PathBuf};

use tokio::fs;

use crate::domain::profile::VideoProfile;
use crate::error::{Error, Result};

/// `<id>_master.m3u8`
pub fn master_playlist_name(id: &str) -> String {
    format!("{id}_master.m3u8")
}

/// `<id>_<profile>.m3u8`
pub fn profile_playlist_name(id: &str, profile: &str) -> String {
    format!("{id}_{profile}.m3u8")
}

/// `<id>_%03d_<profile>.ts` — the `%03d` is expanded by the encoder.
pub fn segment_pattern(id: &str, profile: &str) -> String {
    format!("{id}_%03d_{profile}.ts")
}

/// `<id>.jpg`
pub fn thumbnail_name(id: &str) -> String {
    format!("{id}.jpg")
}

/// Renders the master playlist referencing one media playlist per profile.
pub fn master_playlist(id: &str, profiles: &[VideoProfile]) -> String {
    let mut out = String::from("#EXTM3U\n");
    for profile in profiles {
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n{}\n",
            profile.bandwidth,
            profile.width,
            profile.height,
            profile_playlist_name(id, profile.name),
        ));
    }
    out
}

/// Writes `<output_dir>/<id>/<id>_master.m3u8`, creating the directory if
/// missing and overwriting any previous master.
pub async fn write_master_playlist(
    output_dir: &Path,
    id: &str,
    profiles: &[VideoProfile],
) -> Result<PathBuf> {
    let dir = output_dir.join(id);
    fs::create_dir_all(&dir).await?;

    let path = dir.join(master_playlist_name(id));
    fs::write(&path, master_playlist(id, profiles)).await?;
    Ok(path)
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaSegment {
    pub duration: f64,
    pub uri: String,
}

/// A per-profile media playlist. The encoder produces these during
/// transcoding; this representation exists for inspection and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct MediaPlaylist {
    pub version: u8,
    pub target_duration: u64,
    pub media_sequence: u64,
    pub segments: Vec<MediaSegment>,
    pub end_list: bool,
}

impl MediaPlaylist {
    pub fn new(target_duration: u64) -> Self {
        Self {
            version: 3,
            target_duration,
            media_sequence: 0,
            segments: Vec::new(),
            end_list: true,
        }
    }

    pub fn add_segment(&mut self, duration: f64, uri: String) {
        self.segments.push(MediaSegment { duration, uri });
    }

    pub fn to_m3u8(&self) -> String {
        let mut out = String::from("#EXTM3U\n");
        out.push_str(&format!("#EXT-X-VERSION:{}\n", self.version));
        out.push_str(&format!("#EXT-X-TARGETDURATION:{}\n", self.target_duration));
        out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", self.media_sequence));

        for segment in &self.segments {
            out.push_str(&format!("#EXTINF:{:.6},\n{}\n", segment.duration, segment.uri));
        }

        if self.end_list {
            out.push_str("#EXT-X-ENDLIST\n");
        }
        out
    }

    pub fn from_m3u8(input: &str) -> Result<Self> {
        let mut lines = input.lines().map(str::trim).filter(|l| !l.is_empty());

        if lines.next() != Some("#EXTM3U") {
            return Err(Error::InvalidMetadata("missing #EXTM3U header".into()));
        }

        let mut playlist = MediaPlaylist {
            version: 3,
            target_duration: 0,
            media_sequence: 0,
            segments: Vec::new(),
            end_list: false,
        };

        let mut pending: Option<f64> = None;
        for line in lines {
            if let Some(rest) = line.strip_prefix("#EXT-X-VERSION:") {
                playlist.version = rest
                    .parse()
                    .map_err(|_| Error::InvalidMetadata(format!("bad version: {rest}")))?;
            } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
                playlist.target_duration = rest
                    .parse()
                    .map_err(|_| Error::InvalidMetadata(format!("bad target duration: {rest}")))?;
            } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
                playlist.media_sequence = rest
                    .parse()
                    .map_err(|_| Error::InvalidMetadata(format!("bad media sequence: {rest}")))?;
            } else if let Some(rest) = line.strip_prefix("#EXTINF:") {
                let duration = rest.trim_end_matches(',');
                pending = Some(
                    duration
                        .parse()
                        .map_err(|_| Error::InvalidMetadata(format!("bad duration: {rest}")))?,
                );
            } else if line == "#EXT-X-ENDLIST" {
                playlist.end_list = true;
            } else if !line.starts_with('#') {
                let duration = pending.take().ok_or_else(|| {
                    Error::InvalidMetadata(format!("segment uri without #EXTINF: {line}"))
                })?;
                playlist.segments.push(MediaSegment {
                    duration,
                    uri: line.to_string(),
                });
            }
        }

        Ok(playlist)
    }

    pub async fn write_to(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_m3u8()).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::profile::LADDER;

    #[tokio::test]
    async fn master_playlist_lists_every_profile() {
        let dir = tempfile::tempdir().unwrap();
        let profiles: Vec<_> = LADDER[..5].to_vec();

        let path = write_master_playlist(dir.path(), "test123", &profiles)
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("test123").join("test123_master.m3u8"));

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("#EXTM3U\n"));
        assert_eq!(content.matches("#EXT-X-STREAM-INF:BANDWIDTH=").count(), 5);
        for profile in &profiles {
            assert!(content.contains(&format!(
                "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\ntest123_{}.m3u8\n",
                profile.bandwidth, profile.width, profile.height, profile.name
            )));
        }
    }

    #[tokio::test]
    async fn master_playlist_overwrite_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let first = write_master_playlist(dir.path(), "v", &LADDER[..2].to_vec())
            .await
            .unwrap();
        let second = write_master_playlist(dir.path(), "v", &LADDER[..2].to_vec())
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn media_playlist_round_trips() {
        let mut playlist = MediaPlaylist::new(5);
        playlist.media_sequence = 2;
        playlist.add_segment(5.0, "v_000_720p.ts".into());
        playlist.add_segment(4.5, "v_001_720p.ts".into());
        playlist.add_segment(1.25, "v_002_720p.ts".into());

        let parsed = MediaPlaylist::from_m3u8(&playlist.to_m3u8()).unwrap();
        assert_eq!(parsed, playlist);
    }

    #[test]
    fn media_playlist_without_end_list_round_trips() {
        let mut playlist = MediaPlaylist::new(5);
        playlist.end_list = false;
        playlist.add_segment(5.0, "a.ts".into());

        let parsed = MediaPlaylist::from_m3u8(&playlist.to_m3u8()).unwrap();
        assert_eq!(parsed, playlist);
    }

    #[test]
    fn from_m3u8_rejects_garbage() {
        assert!(MediaPlaylist::from_m3u8("not a playlist").is_err());
        assert!(MediaPlaylist::from_m3u8("#EXTM3U\nsegment.ts\n").is_err());
    }

    #[test]
    fn naming_contract() {
        assert_eq!(master_playlist_name("abc"), "abc_master.m3u8");
        assert_eq!(profile_playlist_name("abc", "720p"), "abc_720p.m3u8");
        assert_eq!(segment_pattern("abc", "720p"), "abc_%03d_720p.ts");
        assert_eq!(thumbnail_name("abc"), "abc.jpg");
    }
}
