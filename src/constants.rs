// SPDX-License-Identifier: GPL-3.0-only

//! Application-wide constants

use serde::{Deserialize, Serialize};

/// Video encoder bitrate presets used by render settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BitratePreset {
    /// Smaller files, reduced quality
    Low,
    /// Balanced quality and file size (default)
    #[default]
    Medium,
    /// Larger files, better quality
    High,
}

impl BitratePreset {
    /// All preset variants, lowest first
    pub const ALL: [BitratePreset; 3] = [
        BitratePreset::Low,
        BitratePreset::Medium,
        BitratePreset::High,
    ];

    /// Display name for the preset
    pub fn display_name(&self) -> &'static str {
        match self {
            BitratePreset::Low => "Low",
            BitratePreset::Medium => "Medium",
            BitratePreset::High => "High",
        }
    }

    /// Target bitrate in kbps for a rendered frame width
    ///
    /// - SD: Low=1, Medium=2, High=4 Mbps
    /// - HD (720p): Low=2.5, Medium=5, High=10 Mbps
    /// - Full HD: Low=4, Medium=8, High=16 Mbps
    /// - 4K: Low=15, Medium=30, High=50 Mbps
    pub fn bitrate_kbps(&self, width: u32) -> u32 {
        match (get_resolution_tier(width), self) {
            (ResolutionTier::SD, BitratePreset::Low) => 1_000,
            (ResolutionTier::SD, BitratePreset::Medium) => 2_000,
            (ResolutionTier::SD, BitratePreset::High) => 4_000,
            (ResolutionTier::HD, BitratePreset::Low) => 2_500,
            (ResolutionTier::HD, BitratePreset::Medium) => 5_000,
            (ResolutionTier::HD, BitratePreset::High) => 10_000,
            (ResolutionTier::FullHD, BitratePreset::Low) => 4_000,
            (ResolutionTier::FullHD, BitratePreset::Medium) => 8_000,
            (ResolutionTier::FullHD, BitratePreset::High) => 16_000,
            (ResolutionTier::FourK, BitratePreset::Low) => 15_000,
            (ResolutionTier::FourK, BitratePreset::Medium) => 30_000,
            (ResolutionTier::FourK, BitratePreset::High) => 50_000,
        }
    }
}

/// Resolution tiers for bitrate selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionTier {
    SD,
    HD,
    FullHD,
    FourK,
}

/// Resolution tier for an output width
pub fn get_resolution_tier(width: u32) -> ResolutionTier {
    match width {
        w if w >= 3840 => ResolutionTier::FourK,
        w if w >= 1920 => ResolutionTier::FullHD,
        w if w >= 1280 => ResolutionTier::HD,
        _ => ResolutionTier::SD,
    }
}

/// Format a bitrate for display (e.g. "8 Mbps" or "2.5 Mbps")
pub fn format_bitrate(kbps: u32) -> String {
    let mbps = kbps as f64 / 1000.0;
    if mbps == mbps.floor() {
        format!("{} Mbps", mbps as u32)
    } else {
        format!("{:.1} Mbps", mbps)
    }
}

/// Timing constants
pub mod timing {
    /// Default position listener polling interval
    pub const POSITION_POLL_INTERVAL_MS: u64 = 300;

    /// How long an asynchronous transition to Paused/Playing may stay pending
    /// before the graph is considered stalled
    pub const STATE_WATCHDOG_SECS: u64 = 5;

    /// Timeout for blocking state queries before position/duration queries
    pub const STATE_QUERY_TIMEOUT_MS: u64 = 50;

    /// Engine bus poll interval for the bus watch thread
    pub const BUS_POLL_INTERVAL_MS: u64 = 100;
}

/// Error recovery constants
pub mod recovery {
    /// Consecutive recovery attempts before the pipeline reports itself dead
    pub const MAX_ATTEMPTS: u32 = 3;
}

/// Graph fragment constants
pub mod pipeline {
    /// Default amount of media a queue buffers in front of a sink bin
    pub const QUEUE_BUFFER_SECONDS: f64 = 1.0;

    /// Queue element factory name
    pub const QUEUE_ELEMENT: &str = "queue";

    /// Tee element factory name
    pub const TEE_ELEMENT: &str = "tee";

    /// Request pad template on tees
    pub const TEE_SRC_TEMPLATE: &str = "src_%u";

    /// Nanoseconds per second, used for clock conversions
    pub const NSECS_PER_SEC: u64 = 1_000_000_000;
}

/// Render encoder preferences, in order of preference
pub mod encoders {
    /// Video encoders tried when render settings do not name one
    pub const VIDEO_FALLBACKS: &[&str] = &["x264enc", "openh264enc", "vp8enc", "theoraenc"];

    /// Audio encoders tried when render settings do not name one
    pub const AUDIO_FALLBACKS: &[&str] = &["avenc_aac", "opusenc", "vorbisenc", "lamemp3enc"];

    /// Default container muxer
    pub const DEFAULT_MUXER: &str = "matroskamux";
}

/// Build information
pub mod app_info {
    /// Application version with git commit (e.g. "0.1.0-abc1234")
    pub fn version() -> &'static str {
        env!("GIT_VERSION")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_tiers() {
        assert_eq!(get_resolution_tier(640), ResolutionTier::SD);
        assert_eq!(get_resolution_tier(1280), ResolutionTier::HD);
        assert_eq!(get_resolution_tier(1920), ResolutionTier::FullHD);
        assert_eq!(get_resolution_tier(4096), ResolutionTier::FourK);
    }

    #[test]
    fn test_format_bitrate() {
        assert_eq!(format_bitrate(8_000), "8 Mbps");
        assert_eq!(format_bitrate(2_500), "2.5 Mbps");
    }

    #[test]
    fn test_queue_buffer_positive() {
        assert!(pipeline::QUEUE_BUFFER_SECONDS > 0.0);
        assert!(recovery::MAX_ATTEMPTS > 0);
    }
}
