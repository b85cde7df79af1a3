//! HLS playlist generation and validation
//!
//! Variant playlists come straight out of FFmpeg; this module builds the
//! master playlist and performs the structural checks run before any
//! artifact is uploaded or published.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Output packaging for variant streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingFormat {
    /// HLS with MPEG-TS segments: `{quality}.m3u8` + `{quality}_NNNN.ts`
    HlsTs,
    /// CMAF fMP4: `{quality}/stream.m3u8` + `init.mp4` + `seg_NNNN.m4s`
    Cmaf,
}

impl StreamingFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hls_ts" => Some(StreamingFormat::HlsTs),
            "cmaf" => Some(StreamingFormat::Cmaf),
            _ => None,
        }
    }

    /// Variant playlist path relative to the video directory.
    pub fn variant_playlist(&self, quality: &str) -> String {
        match self {
            StreamingFormat::HlsTs => format!("{quality}.m3u8"),
            StreamingFormat::Cmaf => format!("{quality}/stream.m3u8"),
        }
    }

    /// FFmpeg segment filename pattern relative to the video directory.
    pub fn segment_pattern(&self, quality: &str) -> String {
        match self {
            StreamingFormat::HlsTs => format!("{quality}_%04d.ts"),
            StreamingFormat::Cmaf => format!("{quality}/seg_%04d.m4s"),
        }
    }

    /// First segment produced for a quality, used for dimension probing.
    pub fn first_segment(&self, quality: &str) -> String {
        match self {
            StreamingFormat::HlsTs => format!("{quality}_0000.ts"),
            StreamingFormat::Cmaf => format!("{quality}/seg_0000.m4s"),
        }
    }
}

/// One successfully produced variant, as it appears in the master playlist.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterVariant {
    pub name: String,
    pub width: i32,
    pub height: i32,
    /// Bits per second, used for the BANDWIDTH attribute and ordering.
    pub bandwidth_bps: i64,
    /// Playlist path relative to the master playlist.
    pub playlist: String,
}

/// Build the master playlist. Variants are emitted in strictly
/// non-increasing BANDWIDTH order regardless of input order.
pub fn build_master_playlist(variants: &[MasterVariant]) -> String {
    let mut ordered: Vec<&MasterVariant> = variants.iter().collect();
    ordered.sort_by(|a, b| b.bandwidth_bps.cmp(&a.bandwidth_bps));

    let mut out = String::from("#EXTM3U\n#EXT-X-VERSION:3\n\n");
    for variant in ordered {
        out.push_str(&format!(
            "#EXT-X-STREAM-INF:BANDWIDTH={},RESOLUTION={}x{}\n{}\n",
            variant.bandwidth_bps, variant.width, variant.height, variant.playlist
        ));
    }
    out
}

#[derive(Debug, Error)]
pub enum PlaylistError {
    #[error("playlist not found: {0}")]
    Missing(String),
    #[error("failed to read playlist: {0}")]
    Io(#[from] std::io::Error),
    #[error("missing #EXTM3U header")]
    MissingHeader,
    #[error("playlist has no segments")]
    NoSegments,
    #[error("playlist is not terminated with #EXT-X-ENDLIST")]
    NotTerminated,
    #[error("referenced segment missing: {0}")]
    SegmentMissing(String),
    #[error("master playlist has no stream variants")]
    NoVariants,
}

/// Validate a variant playlist on disk.
///
/// `structure_only` skips the check that every referenced segment file
/// exists next to the playlist (used when segments were already uploaded
/// and removed locally).
pub fn validate_variant_playlist(path: &Path, structure_only: bool) -> Result<(), PlaylistError> {
    if !path.is_file() {
        return Err(PlaylistError::Missing(path.display().to_string()));
    }
    let content = fs::read_to_string(path)?;
    if !content.starts_with("#EXTM3U") {
        return Err(PlaylistError::MissingHeader);
    }
    if !content.contains("#EXTINF") {
        return Err(PlaylistError::NoSegments);
    }
    if !content.contains("#EXT-X-ENDLIST") {
        return Err(PlaylistError::NotTerminated);
    }

    if !structure_only {
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if !base.join(line).is_file() {
                return Err(PlaylistError::SegmentMissing(line.to_string()));
            }
        }
    }

    Ok(())
}

/// Validate master playlist content (header + at least one variant).
pub fn validate_master_playlist(content: &str) -> Result<(), PlaylistError> {
    if !content.starts_with("#EXTM3U") {
        return Err(PlaylistError::MissingHeader);
    }
    if !content.contains("#EXT-X-STREAM-INF") {
        return Err(PlaylistError::NoVariants);
    }
    Ok(())
}

/// Extract the BANDWIDTH values of a master playlist in order of appearance.
pub fn master_bandwidths(content: &str) -> Vec<i64> {
    content
        .lines()
        .filter_map(|line| {
            line.strip_prefix("#EXT-X-STREAM-INF:")?
                .split(',')
                .find_map(|attr| attr.strip_prefix("BANDWIDTH="))
                .and_then(|v| v.parse().ok())
        })
        .collect()
}
