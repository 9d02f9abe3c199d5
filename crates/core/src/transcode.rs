//! Transcoder command template for live HLS relaying.
//!
//! The relay always runs the same ffmpeg invocation: read one live source,
//! write a rolling HLS playlist plus numbered segments into the session's
//! working directory, and delete segments that fall out of the playlist
//! window so disk usage stays bounded.

use std::path::{Path, PathBuf};

/// File name of the playlist written into every session directory. Its
/// appearance marks the session as ready.
pub const PLAYLIST_FILENAME: &str = "index.m3u8";

/// ffmpeg pattern for numbered media segments.
pub const SEGMENT_PATTERN: &str = "segment_%05d.ts";

/// Default HLS segment duration in seconds.
pub const DEFAULT_SEGMENT_SECS: u32 = 2;

/// Default number of segments kept in the playlist window.
pub const DEFAULT_LIST_SIZE: u32 = 6;

/// Tunables for the HLS muxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HlsSettings {
    pub segment_secs: u32,
    pub list_size: u32,
}

impl Default for HlsSettings {
    fn default() -> Self {
        Self {
            segment_secs: DEFAULT_SEGMENT_SECS,
            list_size: DEFAULT_LIST_SIZE,
        }
    }
}

/// Path of the playlist inside a session directory.
pub fn playlist_path(work_dir: &Path) -> PathBuf {
    work_dir.join(PLAYLIST_FILENAME)
}

/// Build the full transcoder argument list (without the program name).
pub fn build_hls_args(source_url: &str, work_dir: &Path, settings: &HlsSettings) -> Vec<String> {
    let mut args: Vec<String> = ["-hide_banner", "-loglevel", "warning", "-nostdin"]
        .iter()
        .map(|s| s.to_string())
        .collect();

    // RTSP over UDP drops packets behind NAT; force interleaved TCP.
    let lower = source_url.to_ascii_lowercase();
    if lower.starts_with("rtsp://") || lower.starts_with("rtsps://") {
        args.extend(["-rtsp_transport".to_string(), "tcp".to_string()]);
    }

    args.extend(["-i".to_string(), source_url.to_string()]);

    args.extend(
        [
            "-c:v",
            "libx264",
            "-preset",
            "veryfast",
            "-tune",
            "zerolatency",
            "-c:a",
            "aac",
            "-f",
            "hls",
        ]
        .iter()
        .map(|s| s.to_string()),
    );

    args.extend([
        "-hls_time".to_string(),
        settings.segment_secs.to_string(),
        "-hls_list_size".to_string(),
        settings.list_size.to_string(),
        "-hls_flags".to_string(),
        "delete_segments".to_string(),
        "-hls_segment_filename".to_string(),
        work_dir.join(SEGMENT_PATTERN).to_string_lossy().to_string(),
        playlist_path(work_dir).to_string_lossy().to_string(),
    ]);

    args
}
