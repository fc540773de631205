//! Encoder argument vectors.
//!
//! Translates `(profiles, input, output dir, id)` into `ffmpeg` invocations.
//! Output names must line up with [`crate::domain::hls`]: the master
//! playlist references exactly the per-profile playlists built here.

use std::path::Path;

use crate::domain::hls;
use crate::domain::profile::{VideoProfile, CODEC_COPY, GOP_SIZE, PRESET};

/// Standard input marker understood by the encoder.
pub const STDIN_INPUT: &str = "pipe:0";

pub const HLS_SEGMENT_DURATION: u32 = 5;

/// Options shared by every encoder invocation for one upload.
#[derive(Debug, Clone)]
pub struct EncoderOptions {
    /// Encoder log level (`-v`), e.g. `error` or `debug`.
    pub log_level: String,
    pub threads: u32,
    /// `pipe:0`, a local path, or an http(s) URL.
    pub input: String,
}

fn preamble(opts: &EncoderOptions) -> Vec<String> {
    let mut args = vec![
        "-y".to_string(),
        "-v".to_string(),
        opts.log_level.clone(),
        "-err_detect".to_string(),
        "ignore_err".to_string(),
        "-fflags".to_string(),
        "+discardcorrupt".to_string(),
        "-threads".to_string(),
        opts.threads.to_string(),
    ];

    // Reconnect flags are input options and must precede -i.
    if opts.input.starts_with("http://") || opts.input.starts_with("https://") {
        for flag in ["-reconnect", "1", "-reconnect_streamed", "1", "-reconnect_delay_max", "2"] {
            args.push(flag.to_string());
        }
    }

    args.push("-i".to_string());
    args.push(opts.input.clone());
    args
}

/// Builds the transcode invocation producing one HLS rendition per profile.
/// An empty profile list yields an empty vector; the caller must skip it.
pub fn video_command(
    opts: &EncoderOptions,
    profiles: &[VideoProfile],
    output_dir: &Path,
    id: &str,
) -> Vec<String> {
    if profiles.is_empty() {
        return Vec::new();
    }

    let out = output_dir.join(id);
    let mut args = preamble(opts);

    for profile in profiles {
        args.extend(
            [
                "-map",
                "0:v:0",
                "-map",
                "0:a?",
                "-c:a",
                profile.audio_codec,
                "-c:v",
                profile.video_codec,
                "-preset",
                PRESET,
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push("-crf".to_string());
        args.push(profile.crf.to_string());
        args.push("-g".to_string());
        args.push(GOP_SIZE.to_string());

        if profile.video_codec != CODEC_COPY && profile.scale {
            args.push("-vf".to_string());
            args.push(format!("scale=-2:{}", profile.height));
        }

        args.extend(
            [
                "-f",
                "hls",
                "-hls_time",
                "5",
                "-hls_flags",
                "split_by_time+temp_file",
                "-hls_list_size",
                "0",
                "-hls_segment_filename",
            ]
            .iter()
            .map(|s| s.to_string()),
        );
        args.push(
            out.join(hls::segment_pattern(id, profile.name))
                .to_string_lossy()
                .into_owned(),
        );
        args.push(
            out.join(hls::profile_playlist_name(id, profile.name))
                .to_string_lossy()
                .into_owned(),
        );
    }

    args
}

/// Builds the single-frame thumbnail invocation.
pub fn thumbnail_command(input: &str, output_dir: &Path, id: &str) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string(),
        "-vframes".to_string(),
        "1".to_string(),
        "-update".to_string(),
        "1".to_string(),
        output_dir
            .join(id)
            .join(hls::thumbnail_name(id))
            .to_string_lossy()
            .into_owned(),
    ]
}
