//! Quality presets and selection
//!
//! The preset ladder follows the usual streaming tiers; a source is never
//! upscaled, and `original` is always produced as a remux pseudo-quality.

use serde::{Deserialize, Serialize};

/// Name of the remux pseudo-quality.
pub const ORIGINAL_QUALITY: &str = "original";

/// A transcoding quality preset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityPreset {
    pub name: &'static str,
    pub height: i32,
    pub bitrate_kbps: i32,
    pub audio_bitrate_kbps: i32,
}

impl QualityPreset {
    /// Video bitrate as an FFmpeg rate argument, e.g. "5000k".
    pub fn bitrate_arg(&self) -> String {
        format!("{}k", self.bitrate_kbps)
    }

    /// Audio bitrate as an FFmpeg rate argument, e.g. "128k".
    pub fn audio_bitrate_arg(&self) -> String {
        format!("{}k", self.audio_bitrate_kbps)
    }

    /// Bandwidth attribute value for the master playlist, in bits per second.
    pub fn bandwidth_bps(&self) -> i64 {
        self.bitrate_kbps as i64 * 1000
    }
}

/// Preset ladder, highest first.
pub const QUALITY_PRESETS: &[QualityPreset] = &[
    QualityPreset {
        name: "2160p",
        height: 2160,
        bitrate_kbps: 15000,
        audio_bitrate_kbps: 192,
    },
    QualityPreset {
        name: "1440p",
        height: 1440,
        bitrate_kbps: 8000,
        audio_bitrate_kbps: 192,
    },
    QualityPreset {
        name: "1080p",
        height: 1080,
        bitrate_kbps: 5000,
        audio_bitrate_kbps: 128,
    },
    QualityPreset {
        name: "720p",
        height: 720,
        bitrate_kbps: 2500,
        audio_bitrate_kbps: 128,
    },
    QualityPreset {
        name: "480p",
        height: 480,
        bitrate_kbps: 1000,
        audio_bitrate_kbps: 96,
    },
    QualityPreset {
        name: "360p",
        height: 360,
        bitrate_kbps: 600,
        audio_bitrate_kbps: 96,
    },
];

/// Every quality name that may appear on disk or in `video_qualities`,
/// including the remux pseudo-quality.
pub fn canonical_quality_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = QUALITY_PRESETS.iter().map(|q| q.name).collect();
    names.push(ORIGINAL_QUALITY);
    names
}

/// Look up a preset by name.
pub fn preset_by_name(name: &str) -> Option<&'static QualityPreset> {
    QUALITY_PRESETS.iter().find(|q| q.name == name)
}

/// Presets applicable to a source: every preset whose height does not exceed
/// the source height. Falls back to the lowest preset for tiny sources so
/// that at least one derived quality always exists.
pub fn applicable_qualities(source_height: i32) -> Vec<&'static QualityPreset> {
    let applicable: Vec<&'static QualityPreset> = QUALITY_PRESETS
        .iter()
        .filter(|q| q.height <= source_height)
        .collect();

    if applicable.is_empty() {
        vec![QUALITY_PRESETS.last().unwrap()]
    } else {
        applicable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_sorted_highest_first() {
        for pair in QUALITY_PRESETS.windows(2) {
            assert!(pair[0].height > pair[1].height);
            assert!(pair[0].bitrate_kbps > pair[1].bitrate_kbps);
        }
    }

    #[test]
    fn test_applicable_qualities_1080p_source() {
        let names: Vec<&str> = applicable_qualities(1080).iter().map(|q| q.name).collect();
        assert_eq!(names, vec!["1080p", "720p", "480p", "360p"]);
    }

    #[test]
    fn test_applicable_qualities_never_upscales() {
        let names: Vec<&str> = applicable_qualities(720).iter().map(|q| q.name).collect();
        assert!(!names.contains(&"1080p"));
        assert!(!names.contains(&"2160p"));
    }

    #[test]
    fn test_tiny_source_falls_back_to_lowest_preset() {
        let qualities = applicable_qualities(144);
        assert_eq!(qualities.len(), 1);
        assert_eq!(qualities[0].name, "360p");
    }

    #[test]
    fn test_canonical_names_include_original() {
        let names = canonical_quality_names();
        assert!(names.contains(&"original"));
        assert_eq!(names.len(), QUALITY_PRESETS.len() + 1);
    }

    #[test]
    fn test_bitrate_args() {
        let preset = preset_by_name("1080p").unwrap();
        assert_eq!(preset.bitrate_arg(), "5000k");
        assert_eq!(preset.audio_bitrate_arg(), "128k");
        assert_eq!(preset.bandwidth_bps(), 5_000_000);
    }
}
