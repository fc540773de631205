//! Encoding profile catalog and resolution mapping.
//!
//! The catalog is closed: seven scaling ladder rungs plus the two `orig`
//! shapes (codec pass-through and full re-encode). Profile selection picks
//! an `orig` rendition and up to two ladder rungs below the source
//! resolution for adaptive switching.

pub const VIDEO_CODEC_H264: &str = "libx264";
pub const AUDIO_CODEC_AAC: &str = "aac";
pub const CODEC_COPY: &str = "copy";

pub const PRESET: &str = "veryfast";
pub const GOP_SIZE: u32 = 60;

/// One output rendition: resolution, target bandwidth and codec settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoProfile {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub bandwidth: u64,
    pub scale: bool,
    pub video_codec: &'static str,
    pub audio_codec: &'static str,
    pub crf: u8,
}

const fn ladder(name: &'static str, width: u32, height: u32, bandwidth: u64, crf: u8) -> VideoProfile {
    VideoProfile {
        name,
        width,
        height,
        bandwidth,
        scale: true,
        video_codec: VIDEO_CODEC_H264,
        audio_codec: AUDIO_CODEC_AAC,
        crf,
    }
}

/// Scaling ladder, lowest rung first.
pub const LADDER: [VideoProfile; 7] = [
    ladder("360p", 640, 360, 500_000, 28),
    ladder("480p", 854, 480, 2_000_000, 27),
    ladder("720p", 1280, 720, 5_000_000, 25),
    ladder("1080p", 1920, 1080, 8_000_000, 23),
    ladder("1440p", 2560, 1440, 12_000_000, 23),
    ladder("2160p", 3840, 2160, 25_000_000, 22),
    ladder("4320p", 7680, 4320, 50_000_000, 22),
];

/// Pixel-count thresholds deciding the level label. The first entry whose
/// threshold exceeds the source pixel count wins; anything larger is 4320p.
const LEVEL_THRESHOLDS: [(usize, u64); 6] = [
    (0, 230_400),
    (1, 921_600),
    (2, 2_073_600),
    (3, 3_686_400),
    (4, 8_294_400),
    (5, 33_177_600),
];

/// What profile selection needs to know about a source.
#[derive(Debug, Clone, Default)]
pub struct MediaInfo {
    pub codec: Option<String>,
    pub width: u32,
    pub height: u32,
}

impl MediaInfo {
    /// Whether the source video codec can be carried in an HLS package
    /// without re-encoding.
    pub fn hls_compatible(&self) -> bool {
        match &self.codec {
            Some(codec) => {
                let codec = codec.to_ascii_lowercase();
                codec.starts_with("h264")
                    || codec.starts_with("h265")
                    || codec.starts_with("hevc")
                    || codec.starts_with("avc1")
                    || codec.starts_with("hvc1")
                    || codec.starts_with("hev1")
            }
            None => false,
        }
    }
}

fn level_index(width: u32, height: u32) -> usize {
    let pixels = u64::from(width) * u64::from(height);
    for (index, threshold) in LEVEL_THRESHOLDS {
        if threshold > pixels {
            return index;
        }
    }
    LADDER.len() - 1
}

/// Ladder label for a source resolution.
pub fn level(width: u32, height: u32) -> &'static str {
    LADDER[level_index(width, height)].name
}

/// Secondary rungs below the source resolution, picked for adaptive
/// switching: start one rung below the source level, clamped to 1080p, and
/// take up to two rungs walking down. The lowest rung is never emitted; it
/// is reserved as the compatibility fallback.
pub fn sub_levels(width: u32, height: u32) -> Vec<VideoProfile> {
    let start = level_index(width, height).saturating_sub(1).min(3);

    let mut profiles = Vec::with_capacity(2);
    let mut index = start;
    while index > 0 && profiles.len() < 2 {
        profiles.push(LADDER[index].clone());
        index -= 1;
    }
    profiles
}

/// The rendition preserving the source resolution: `orig-copy` passes the
/// source through when its codec is HLS-compatible, `orig-transcode`
/// re-encodes otherwise. Bandwidth is borrowed from the nearest ladder
/// rung since the source bitrate is not known up front.
pub fn orig_profile(meta: &MediaInfo) -> VideoProfile {
    let nearest = &LADDER[level_index(meta.width, meta.height)];
    let copy = meta.hls_compatible();
    VideoProfile {
        name: if copy { "orig-copy" } else { "orig-transcode" },
        width: meta.width,
        height: meta.height,
        bandwidth: nearest.bandwidth,
        scale: false,
        video_codec: if copy { CODEC_COPY } else { VIDEO_CODEC_H264 },
        audio_codec: if copy { CODEC_COPY } else { AUDIO_CODEC_AAC },
        crf: nearest.crf,
    }
}

/// Cheapest profile set that always yields something playable, used for
/// live uploads where latency matters: pass the source through untouched
/// when its codec is HLS-compatible, otherwise one low transcode.
pub fn fast_profiles(meta: &MediaInfo) -> Vec<VideoProfile> {
    if meta.hls_compatible() {
        vec![orig_profile(meta)]
    } else {
        vec![LADDER[0].clone()]
    }
}

/// Full multi-rendition set for queued jobs: the `orig` shape plus up to
/// two rungs below the source resolution.
pub fn default_profiles(meta: &MediaInfo) -> Vec<VideoProfile> {
    let mut profiles = vec![orig_profile(meta)];
    profiles.extend(sub_levels(meta.width, meta.height));
    profiles
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(profiles: &[VideoProfile]) -> Vec<&'static str> {
        profiles.iter().map(|p| p.name).collect()
    }

    #[test]
    fn level_maps_resolutions_to_labels() {
        assert_eq!(level(3840, 2160), "2160p");
        assert_eq!(level(1280, 720), "720p");
        assert_eq!(level(1920, 1080), "1080p");
        assert_eq!(level(320, 240), "360p");
        assert_eq!(level(9000, 4000), "4320p");
    }

    #[test]
    fn sub_levels_walk_down_from_source() {
        assert_eq!(names(&sub_levels(1920, 1080)), vec!["720p", "480p"]);
        assert_eq!(names(&sub_levels(640, 480)), Vec::<&str>::new());
        assert_eq!(names(&sub_levels(1280, 720)), vec!["480p"]);
        // Huge sources clamp to the 1080p rung before walking down.
        assert_eq!(names(&sub_levels(9000, 4000)), vec!["1080p", "720p"]);
    }

    #[test]
    fn fast_profiles_pass_compatible_codecs_through() {
        let meta = MediaInfo {
            codec: Some("h264".into()),
            width: 1920,
            height: 1080,
        };
        let profiles = fast_profiles(&meta);
        assert_eq!(names(&profiles), vec!["orig-copy"]);
        assert_eq!(profiles[0].video_codec, CODEC_COPY);
        assert!(!profiles[0].scale);
    }

    #[test]
    fn fast_profiles_fall_back_to_one_cheap_transcode() {
        let meta = MediaInfo {
            codec: Some("vp9".into()),
            width: 1920,
            height: 1080,
        };
        assert_eq!(names(&fast_profiles(&meta)), vec!["360p"]);
    }

    #[test]
    fn default_profiles_add_sub_levels() {
        let meta = MediaInfo {
            codec: Some("avc1.64001f".into()),
            width: 1920,
            height: 1080,
        };
        let profiles = default_profiles(&meta);
        assert_eq!(names(&profiles), vec!["orig-copy", "720p", "480p"]);
        assert_eq!(profiles[0].video_codec, CODEC_COPY);
    }

    #[test]
    fn incompatible_orig_is_reencoded() {
        let meta = MediaInfo {
            codec: Some("vp8".into()),
            width: 1280,
            height: 720,
        };
        let profiles = default_profiles(&meta);
        assert_eq!(profiles[0].video_codec, VIDEO_CODEC_H264);
        assert_eq!(profiles[0].audio_codec, AUDIO_CODEC_AAC);
        assert_eq!(names(&profiles), vec!["orig-transcode", "480p"]);
    }
}
