// SPDX-License-Identifier: GPL-3.0-only

//! Object factories
//!
//! A factory is the logical, reusable description of something that can be
//! turned into a graph fragment, along with the streams it produces or
//! consumes. Factories hold no graph state; the resource table in
//! [`crate::resources`] tracks what has been built from them.
//!
//! ```text
//!   Source ──outputs──►  (tee)  ──►  (queue)  ──inputs──► Sink
//!   Composite (timeline): one bin, one output per track
//! ```

use crate::constants::{BitratePreset, encoders};
use crate::stream::StreamDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_FACTORY_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique factory identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactoryId(u64);

impl FactoryId {
    fn next() -> Self {
        Self(NEXT_FACTORY_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FactoryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "factory#{}", self.0)
    }
}

/// Where a source factory gets its media from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SourceKind {
    /// Decoded from a URI
    Uri(String),
    /// Synthetic test pattern (e.g. "smpte", "black", "sine")
    TestPattern(String),
}

/// One track of a composite timeline source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimelineTrack {
    pub stream: StreamDescriptor,
    /// Media feeding this track; `None` renders the track's default filler
    pub uri: Option<String>,
}

/// Opaque export settings passed through to render bin construction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderSettings {
    pub muxer: String,
    /// Preferred video encoder; the first available fallback is used when `None`
    pub video_encoder: Option<String>,
    pub audio_encoder: Option<String>,
    pub bitrate: BitratePreset,
    /// Output frame size, applied as a source filter while rendering
    pub output_width: Option<u32>,
    pub output_height: Option<u32>,
    pub muxer_properties: BTreeMap<String, String>,
    pub video_encoder_properties: BTreeMap<String, String>,
    pub audio_encoder_properties: BTreeMap<String, String>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            muxer: encoders::DEFAULT_MUXER.to_string(),
            video_encoder: None,
            audio_encoder: None,
            bitrate: BitratePreset::default(),
            output_width: None,
            output_height: None,
            muxer_properties: BTreeMap::new(),
            video_encoder_properties: BTreeMap::new(),
            audio_encoder_properties: BTreeMap::new(),
        }
    }
}

/// What a sink factory does with its input
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SinkKind {
    VideoDisplay,
    AudioOutput,
    /// Encode and mux into a file
    Encoder {
        output: PathBuf,
        settings: RenderSettings,
    },
    /// Discard everything
    Null,
}

/// Role of a factory in the graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FactoryRole {
    Source {
        kind: SourceKind,
        outputs: Vec<StreamDescriptor>,
    },
    Sink {
        kind: SinkKind,
        inputs: Vec<StreamDescriptor>,
    },
    /// Timeline source: a single bin exposing one output per track
    Composite { tracks: Vec<TimelineTrack> },
}

#[derive(Debug)]
pub struct ObjectFactory {
    id: FactoryId,
    name: String,
    duration: Option<u64>,
    role: FactoryRole,
}

impl ObjectFactory {
    pub fn new(name: impl Into<String>, role: FactoryRole) -> Self {
        Self {
            id: FactoryId::next(),
            name: name.into(),
            duration: None,
            role,
        }
    }

    /// Source decoding `uri`, with the streams the prober found
    pub fn uri_source(uri: impl Into<String>, outputs: Vec<StreamDescriptor>) -> Self {
        let uri = uri.into();
        Self::new(
            uri.clone(),
            FactoryRole::Source {
                kind: SourceKind::Uri(uri),
                outputs,
            },
        )
    }

    pub fn test_source(pattern: impl Into<String>, outputs: Vec<StreamDescriptor>) -> Self {
        let pattern = pattern.into();
        Self::new(
            format!("test:{}", pattern),
            FactoryRole::Source {
                kind: SourceKind::TestPattern(pattern),
                outputs,
            },
        )
    }

    pub fn timeline(name: impl Into<String>, tracks: Vec<TimelineTrack>) -> Self {
        Self::new(name, FactoryRole::Composite { tracks })
    }

    pub fn video_sink() -> Self {
        Self::new(
            "video-display",
            FactoryRole::Sink {
                kind: SinkKind::VideoDisplay,
                inputs: vec![StreamDescriptor::any_video()],
            },
        )
    }

    pub fn audio_sink() -> Self {
        Self::new(
            "audio-output",
            FactoryRole::Sink {
                kind: SinkKind::AudioOutput,
                inputs: vec![StreamDescriptor::any_audio()],
            },
        )
    }

    /// File sink encoding every input stream into one container
    pub fn encoder_sink(
        output: impl Into<PathBuf>,
        settings: RenderSettings,
        inputs: Vec<StreamDescriptor>,
    ) -> Self {
        let output = output.into();
        Self::new(
            output.display().to_string(),
            FactoryRole::Sink {
                kind: SinkKind::Encoder { output, settings },
                inputs,
            },
        )
    }

    pub fn null_sink(inputs: Vec<StreamDescriptor>) -> Self {
        Self::new(
            "null",
            FactoryRole::Sink {
                kind: SinkKind::Null,
                inputs,
            },
        )
    }

    /// Known media duration in nanoseconds
    pub fn with_duration(mut self, duration: u64) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn id(&self) -> FactoryId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn duration(&self) -> Option<u64> {
        self.duration
    }

    pub fn role(&self) -> &FactoryRole {
        &self.role
    }

    /// Sources and composite timelines can feed tees
    pub fn is_source(&self) -> bool {
        matches!(
            self.role,
            FactoryRole::Source { .. } | FactoryRole::Composite { .. }
        )
    }

    pub fn is_sink(&self) -> bool {
        matches!(self.role, FactoryRole::Sink { .. })
    }

    pub fn is_composite(&self) -> bool {
        matches!(self.role, FactoryRole::Composite { .. })
    }

    /// Whether all streams of this factory live in one shared bin
    ///
    /// True for timelines and for sinks with several inputs (a render
    /// encoder muxes its audio and video into the same file).
    pub fn bundles_streams(&self) -> bool {
        match &self.role {
            FactoryRole::Composite { .. } => true,
            FactoryRole::Sink { inputs, .. } => inputs.len() > 1,
            FactoryRole::Source { .. } => false,
        }
    }

    pub fn output_streams(&self) -> Vec<&StreamDescriptor> {
        match &self.role {
            FactoryRole::Source { outputs, .. } => outputs.iter().collect(),
            FactoryRole::Composite { tracks } => tracks.iter().map(|t| &t.stream).collect(),
            FactoryRole::Sink { .. } => Vec::new(),
        }
    }

    pub fn input_streams(&self) -> &[StreamDescriptor] {
        match &self.role {
            FactoryRole::Sink { inputs, .. } => inputs,
            _ => &[],
        }
    }

    /// Streams this factory exposes in its role (outputs for sources, inputs for sinks)
    pub fn streams(&self) -> Vec<&StreamDescriptor> {
        if self.is_sink() {
            self.input_streams().iter().collect()
        } else {
            self.output_streams()
        }
    }

    /// Declared output stream matching `stream`, preferring an identical one
    pub fn find_output(&self, stream: &StreamDescriptor) -> Option<&StreamDescriptor> {
        find_matching(self.output_streams(), stream)
    }

    /// Declared input stream matching `stream`, preferring an identical one
    pub fn find_input(&self, stream: &StreamDescriptor) -> Option<&StreamDescriptor> {
        find_matching(self.input_streams().iter().collect(), stream)
    }
}

fn find_matching<'a>(
    candidates: Vec<&'a StreamDescriptor>,
    stream: &StreamDescriptor,
) -> Option<&'a StreamDescriptor> {
    candidates
        .iter()
        .find(|c| **c == stream)
        .or_else(|| candidates.iter().find(|c| c.is_compatible_with_name(stream)))
        .copied()
}

impl fmt::Display for ObjectFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{AudioAttributes, Fraction, VideoAttributes};

    fn video() -> StreamDescriptor {
        StreamDescriptor::video(VideoAttributes::sized(1280, 720, Fraction::new(30, 1)))
    }

    fn audio() -> StreamDescriptor {
        StreamDescriptor::audio(AudioAttributes::new(2, 44_100))
    }

    #[test]
    fn test_ids_are_unique() {
        let a = ObjectFactory::video_sink();
        let b = ObjectFactory::video_sink();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_roles() {
        let source = ObjectFactory::uri_source("file:///clip.mp4", vec![video(), audio()]);
        assert!(source.is_source());
        assert!(!source.is_sink());
        assert_eq!(source.output_streams().len(), 2);
        assert!(source.input_streams().is_empty());

        let sink = ObjectFactory::audio_sink();
        assert!(sink.is_sink());
        assert!(sink.output_streams().is_empty());

        let timeline = ObjectFactory::timeline(
            "timeline",
            vec![TimelineTrack {
                stream: video(),
                uri: None,
            }],
        );
        assert!(timeline.is_source());
        assert!(timeline.is_composite());
        assert!(timeline.bundles_streams());
    }

    #[test]
    fn test_multi_input_sinks_bundle_streams() {
        let render = ObjectFactory::encoder_sink(
            "/tmp/out.mkv",
            RenderSettings::default(),
            vec![StreamDescriptor::any_video(), StreamDescriptor::any_audio()],
        );
        assert!(render.bundles_streams());
        assert!(!ObjectFactory::video_sink().bundles_streams());
    }

    #[test]
    fn test_find_output_prefers_identical() {
        let source = ObjectFactory::uri_source("file:///clip.mp4", vec![video(), audio()]);
        assert_eq!(source.find_output(&audio()), Some(&audio()));
        assert_eq!(
            source.find_output(&StreamDescriptor::any_video()),
            Some(&video())
        );
        assert!(source.find_output(&StreamDescriptor::any_video().encoded()).is_none());
    }
}
