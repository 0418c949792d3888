// SPDX-License-Identifier: GPL-3.0-only

//! Elementary stream descriptors
//!
//! A [`StreamDescriptor`] describes the shape of one audio, video or text
//! stream as discovered by the prober. Attributes are optional: `None` means
//! "not known yet / negotiable", so two descriptors are compatible when every
//! attribute known on both sides agrees.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Rational value for frame rates and aspect ratios
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Fraction {
    pub num: i32,
    pub den: i32,
}

impl Fraction {
    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn as_f64(&self) -> f64 {
        if self.den == 0 {
            0.0
        } else {
            self.num as f64 / self.den as f64
        }
    }
}

impl fmt::Display for Fraction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VideoAttributes {
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub framerate: Option<Fraction>,
    pub pixel_aspect_ratio: Option<Fraction>,
    pub display_aspect_ratio: Option<Fraction>,
    /// Still image rather than a moving picture
    pub is_image: bool,
}

impl VideoAttributes {
    /// Raw video of a known size and rate
    pub fn sized(width: u32, height: u32, framerate: Fraction) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            framerate: Some(framerate),
            pixel_aspect_ratio: Some(Fraction::new(1, 1)),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AudioAttributes {
    pub channels: Option<u32>,
    pub rate: Option<u32>,
    /// Sample container width in bits
    pub width: Option<u32>,
    /// Significant bits per sample
    pub depth: Option<u32>,
}

impl AudioAttributes {
    pub fn new(channels: u32, rate: u32) -> Self {
        Self {
            channels: Some(channels),
            rate: Some(rate),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TextAttributes {
    /// Subtitle format, e.g. "utf8" or "pango-markup"
    pub format: Option<String>,
}

/// Media kind with its kind-specific attributes
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    Video(VideoAttributes),
    Audio(AudioAttributes),
    Text(TextAttributes),
}

/// Kind discriminant without attributes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaType {
    Video,
    Audio,
    Text,
}

impl MediaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Video => "video",
            MediaType::Audio => "audio",
            MediaType::Text => "text",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one elementary stream
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamDescriptor {
    kind: StreamKind,
    raw: bool,
    pad_name: Option<String>,
}

impl StreamDescriptor {
    pub fn new(kind: StreamKind) -> Self {
        Self {
            kind,
            raw: true,
            pad_name: None,
        }
    }

    pub fn video(attributes: VideoAttributes) -> Self {
        Self::new(StreamKind::Video(attributes))
    }

    pub fn audio(attributes: AudioAttributes) -> Self {
        Self::new(StreamKind::Audio(attributes))
    }

    pub fn text(attributes: TextAttributes) -> Self {
        Self::new(StreamKind::Text(attributes))
    }

    /// Raw video with every attribute negotiable
    pub fn any_video() -> Self {
        Self::video(VideoAttributes::default())
    }

    /// Raw audio with every attribute negotiable
    pub fn any_audio() -> Self {
        Self::audio(AudioAttributes::default())
    }

    /// Same stream, still encoded (not decoded to raw samples)
    pub fn encoded(mut self) -> Self {
        self.raw = false;
        self
    }

    /// Same stream, bound to a named pad
    pub fn with_pad_name(mut self, name: impl Into<String>) -> Self {
        self.pad_name = Some(name.into());
        self
    }

    pub fn kind(&self) -> &StreamKind {
        &self.kind
    }

    pub fn media_type(&self) -> MediaType {
        match self.kind {
            StreamKind::Video(_) => MediaType::Video,
            StreamKind::Audio(_) => MediaType::Audio,
            StreamKind::Text(_) => MediaType::Text,
        }
    }

    pub fn is_raw(&self) -> bool {
        self.raw
    }

    pub fn pad_name(&self) -> Option<&str> {
        self.pad_name.as_deref()
    }

    /// Whether every attribute needed for playback is concretely known
    pub fn is_fixed(&self) -> bool {
        match &self.kind {
            StreamKind::Video(v) => {
                v.width.is_some()
                    && v.height.is_some()
                    && v.pixel_aspect_ratio.is_some()
                    && (v.is_image || v.framerate.is_some())
            }
            StreamKind::Audio(a) => a.channels.is_some() && a.rate.is_some(),
            StreamKind::Text(t) => t.format.is_some(),
        }
    }

    /// Whether the capability sets of both descriptors intersect
    pub fn is_compatible(&self, other: &StreamDescriptor) -> bool {
        if self.raw != other.raw {
            return false;
        }
        match (&self.kind, &other.kind) {
            (StreamKind::Video(a), StreamKind::Video(b)) => {
                a.is_image == b.is_image
                    && overlaps(&a.width, &b.width)
                    && overlaps(&a.height, &b.height)
                    && overlaps(&a.framerate, &b.framerate)
                    && overlaps(&a.pixel_aspect_ratio, &b.pixel_aspect_ratio)
                    && overlaps(&a.display_aspect_ratio, &b.display_aspect_ratio)
            }
            (StreamKind::Audio(a), StreamKind::Audio(b)) => {
                overlaps(&a.channels, &b.channels)
                    && overlaps(&a.rate, &b.rate)
                    && overlaps(&a.width, &b.width)
                    && overlaps(&a.depth, &b.depth)
            }
            (StreamKind::Text(a), StreamKind::Text(b)) => overlaps(&a.format, &b.format),
            _ => false,
        }
    }

    /// Compatible, and bound to the same pad when both name one
    pub fn is_compatible_with_name(&self, other: &StreamDescriptor) -> bool {
        let names_match = match (&self.pad_name, &other.pad_name) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        names_match && self.is_compatible(other)
    }
}

fn overlaps<T: PartialEq>(a: &Option<T>, b: &Option<T>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a == b,
        _ => true,
    }
}

impl fmt::Display for StreamDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}",
            self.media_type(),
            if self.raw { "raw" } else { "encoded" }
        )?;
        match &self.kind {
            StreamKind::Video(v) => {
                if let (Some(w), Some(h)) = (v.width, v.height) {
                    write!(f, " {}x{}", w, h)?;
                }
                if let Some(rate) = v.framerate {
                    write!(f, "@{}", rate)?;
                }
                if v.is_image {
                    write!(f, " image")?;
                }
            }
            StreamKind::Audio(a) => {
                if let Some(channels) = a.channels {
                    write!(f, " {}ch", channels)?;
                }
                if let Some(rate) = a.rate {
                    write!(f, " {}Hz", rate)?;
                }
            }
            StreamKind::Text(t) => {
                if let Some(format) = &t.format {
                    write!(f, " {}", format)?;
                }
            }
        }
        if let Some(name) = &self.pad_name {
            write!(f, " [{}]", name)?;
        }
        Ok(())
    }
}

/// Human label for an optional stream request
pub(crate) fn describe(stream: Option<&StreamDescriptor>) -> String {
    stream.map_or_else(|| "any stream".to_string(), |s| s.to_string())
}
