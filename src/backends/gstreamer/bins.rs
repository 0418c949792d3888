// SPDX-License-Identifier: GPL-3.0-only

//! Bin construction for each factory role
//!
//! Every factory becomes one `gst::Bin` exposing ghost pads:
//!
//! ```text
//!   uri source:   uridecodebin ─► convert ─► scale ─► capsfilter ─► [src ghost]   (per decoded pad)
//!   test source:  videotestsrc ─► capsfilter ─► videoscale ─► capsfilter ─► [src_N ghost]
//!   timeline:     one uri or filler branch per track ─► [trackN_* ghost]
//!   display sink: [sink ghost] ─► videoconvert ─► videoscale ─► autovideosink
//!   encoder sink: [sink_N ghost] ─► convert ─► encoder ─┐
//!                                                       ├─► muxer ─► filesink
//!                 [sink_M ghost] ─► convert ─► encoder ─┘
//! ```
//!
//! Decoded pads that do not match a wanted stream are drained into a
//! fakesink so the decoder never stalls on a not-linked flow.

use super::caps;
use crate::backends::registry::ElementFactoryCache;
use crate::constants::{BitratePreset, encoders};
use crate::errors::{EngineError, EngineResult};
use crate::factory::{FactoryRole, ObjectFactory, RenderSettings, SinkKind, SourceKind};
use crate::stream::{MediaType, StreamDescriptor, StreamKind};
use gstreamer as gst;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// `videotestsrc` pattern nicks accepted for test sources
const VIDEO_PATTERNS: &[&str] = &[
    "smpte", "snow", "black", "white", "red", "green", "blue", "checkers-1", "checkers-2",
    "checkers-4", "checkers-8", "circular", "blink", "smpte75", "zone-plate", "gamut", "ball",
    "smpte100", "bar", "pinwheel", "spokes", "gradient", "colors",
];

/// `audiotestsrc` wave nicks accepted for test sources
const AUDIO_WAVES: &[&str] = &[
    "sine", "square", "saw", "triangle", "silence", "white-noise", "pink-noise", "ticks",
];

/// Output restriction applied to every capsfilter a source bin owns,
/// including the ones created later for dynamic pads
#[derive(Debug, Default)]
pub(super) struct OutputFilter {
    caps: Option<gst::Caps>,
    elements: Vec<gst::Element>,
}

impl OutputFilter {
    pub fn set(&mut self, caps: Option<gst::Caps>) {
        self.caps = caps;
        let current = self.current();
        for element in &self.elements {
            element.set_property("caps", &current);
        }
    }

    fn current(&self) -> gst::Caps {
        self.caps.clone().unwrap_or_else(gst::Caps::new_any)
    }

    fn register(&mut self, capsfilter: &gst::Element) {
        capsfilter.set_property("caps", &self.current());
        self.elements.push(capsfilter.clone());
    }
}

pub(super) type SharedFilter = Arc<Mutex<OutputFilter>>;

/// A built factory bin plus the elements the engine adjusts later
pub(super) struct BuiltBin {
    pub bin: gst::Bin,
    /// Sinks whose `sync` property follows the action's sync flag
    pub sinks: Vec<gst::Element>,
    pub filter: SharedFilter,
}

pub(super) fn engine_error(e: impl std::fmt::Display) -> EngineError {
    EngineError::Other(e.to_string())
}

/// Create an element with a unique name
pub(super) fn make(factory: &str) -> EngineResult<gst::Element> {
    gst::ElementFactory::make(factory)
        .name(format!("{}-{}", factory, Uuid::new_v4().simple()))
        .build()
        .map_err(|_| EngineError::MissingElement(factory.to_string()))
}

fn make_bin(kind: &str) -> gst::Bin {
    gst::Bin::with_name(&format!("{}-{}", kind, Uuid::new_v4().simple()))
}

fn add_chain(bin: &gst::Bin, chain: &[&gst::Element]) -> EngineResult<()> {
    bin.add_many(chain.iter().copied()).map_err(engine_error)?;
    if chain.len() > 1 {
        gst::Element::link_many(chain.iter().copied())
            .map_err(|e| EngineError::LinkFailed(e.to_string()))?;
    }
    Ok(())
}

fn ghost(bin: &gst::Bin, target: &gst::Pad, name: &str) -> EngineResult<()> {
    let ghost = gst::GhostPad::builder_with_target(target)
        .map_err(engine_error)?
        .name(name)
        .build();
    ghost.set_active(true).map_err(engine_error)?;
    bin.add_pad(&ghost).map_err(engine_error)
}

fn static_pad(element: &gst::Element, name: &str) -> EngineResult<gst::Pad> {
    element
        .static_pad(name)
        .ok_or_else(|| EngineError::LinkFailed(format!("{} has no {} pad", element.name(), name)))
}

fn pad_name(stream: &StreamDescriptor, prefix: &str, index: usize) -> String {
    stream
        .pad_name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}_{}", prefix, index))
}

/// Build the bin for `factory`, restricted to `stream` when given
pub(super) fn build(
    factory: &ObjectFactory,
    stream: Option<&StreamDescriptor>,
    cache: &ElementFactoryCache,
) -> EngineResult<BuiltBin> {
    let restrict = |declared: &[StreamDescriptor]| -> Vec<StreamDescriptor> {
        match stream {
            Some(requested) => vec![
                declared
                    .iter()
                    .find(|s| *s == requested || s.is_compatible_with_name(requested))
                    .cloned()
                    .unwrap_or_else(|| requested.clone()),
            ],
            None => declared.to_vec(),
        }
    };

    let built = match factory.role() {
        FactoryRole::Source {
            kind: SourceKind::Uri(uri),
            outputs,
        } => uri_source(uri, restrict(outputs))?,
        FactoryRole::Source {
            kind: SourceKind::TestPattern(pattern),
            outputs,
        } => test_source(pattern, &restrict(outputs))?,
        FactoryRole::Composite { tracks } => {
            let bin = make_bin("timeline");
            let filter = SharedFilter::default();
            for (index, track) in tracks.iter().enumerate() {
                let prefix = format!("track{}_", index);
                match &track.uri {
                    Some(uri) => {
                        add_decoder(&bin, uri, vec![track.stream.clone()], &filter, prefix)?
                    }
                    None => add_filler(&bin, &track.stream, &filter, &format!("{}src", prefix))?,
                }
            }
            BuiltBin {
                bin,
                sinks: Vec::new(),
                filter,
            }
        }
        FactoryRole::Sink { kind, inputs } => sink(kind, &restrict(inputs), cache)?,
    };

    debug!(factory = factory.name(), bin = %built.bin.name(), "Built GStreamer bin");
    Ok(built)
}

// ===== Sources =====

fn uri_source(uri: &str, wanted: Vec<StreamDescriptor>) -> EngineResult<BuiltBin> {
    let bin = make_bin("source");
    let filter = SharedFilter::default();
    add_decoder(&bin, uri, wanted, &filter, String::new())?;
    Ok(BuiltBin {
        bin,
        sinks: Vec::new(),
        filter,
    })
}

/// Decoder whose matching pads appear as ghost pads named `prefix` + decoder pad name
fn add_decoder(
    bin: &gst::Bin,
    uri: &str,
    wanted: Vec<StreamDescriptor>,
    filter: &SharedFilter,
    prefix: String,
) -> EngineResult<()> {
    let decoder = make("uridecodebin")?;
    decoder.set_property("uri", uri);
    bin.add(&decoder).map_err(engine_error)?;

    let branches: Arc<Mutex<HashMap<String, Vec<gst::Element>>>> = Arc::default();

    let weak = bin.downgrade();
    let added_filter = filter.clone();
    let added_branches = branches.clone();
    let added_prefix = prefix.clone();
    decoder.connect_pad_added(move |_, pad| {
        let Some(bin) = weak.upgrade() else {
            return;
        };
        let name = format!("{}{}", added_prefix, pad.name());
        match expose_decoded_pad(&bin, pad, &wanted, &added_filter, &name) {
            Ok(elements) => {
                added_branches.lock().insert(name, elements);
            }
            Err(e) => warn!(pad = %name, ?e, "Failed to expose decoded pad"),
        }
    });

    let weak = bin.downgrade();
    decoder.connect_pad_removed(move |_, pad| {
        let Some(bin) = weak.upgrade() else {
            return;
        };
        let name = format!("{}{}", prefix, pad.name());
        if let Some(ghost) = bin.static_pad(&name) {
            let _ = bin.remove_pad(&ghost);
        }
        for element in branches.lock().remove(&name).unwrap_or_default() {
            let _ = element.set_state(gst::State::Null);
            let _ = bin.remove(&element);
        }
        debug!(pad = %name, "Decoded pad removed");
    });

    info!(uri, "Decoder added");
    Ok(())
}

fn expose_decoded_pad(
    bin: &gst::Bin,
    pad: &gst::Pad,
    wanted: &[StreamDescriptor],
    filter: &SharedFilter,
    name: &str,
) -> EngineResult<Vec<gst::Element>> {
    let stream = caps::pad_stream(pad);
    let matched = stream
        .as_ref()
        .is_some_and(|s| wanted.iter().any(|w| w.is_compatible(s)));

    if !matched {
        debug!(pad = %pad.name(), ?stream, "Draining unwanted decoded pad");
        let drain = make("fakesink")?;
        drain.set_property("sync", false);
        bin.add(&drain).map_err(engine_error)?;
        pad.link(&static_pad(&drain, "sink")?)
            .map_err(|e| EngineError::LinkFailed(format!("{:?}", e)))?;
        drain.sync_state_with_parent().map_err(engine_error)?;
        return Ok(vec![drain]);
    }

    let chain = match stream.as_ref().map(StreamDescriptor::media_type) {
        Some(MediaType::Video) => {
            let capsfilter = make("capsfilter")?;
            filter.lock().register(&capsfilter);
            vec![make("videoconvert")?, make("videoscale")?, capsfilter]
        }
        Some(MediaType::Audio) => vec![make("audioconvert")?, make("audioresample")?],
        _ => vec![make("identity")?],
    };
    let refs: Vec<&gst::Element> = chain.iter().collect();
    add_chain(bin, &refs)?;
    pad.link(&static_pad(&chain[0], "sink")?)
        .map_err(|e| EngineError::LinkFailed(format!("{:?}", e)))?;
    for element in &chain {
        element.sync_state_with_parent().map_err(engine_error)?;
    }
    if let Some(last) = chain.last() {
        ghost(bin, &static_pad(last, "src")?, name)?;
    }
    Ok(chain)
}

fn test_source(pattern: &str, outputs: &[StreamDescriptor]) -> EngineResult<BuiltBin> {
    let bin = make_bin("testsrc");
    let filter = SharedFilter::default();
    for (index, stream) in outputs.iter().enumerate() {
        let name = pad_name(stream, "src", index);
        add_test_branch(&bin, stream, pattern, &filter, &name)?;
    }
    Ok(BuiltBin {
        bin,
        sinks: Vec::new(),
        filter,
    })
}

/// Silent/black filler for an empty timeline track
fn add_filler(
    bin: &gst::Bin,
    stream: &StreamDescriptor,
    filter: &SharedFilter,
    name: &str,
) -> EngineResult<()> {
    let pattern = match stream.media_type() {
        MediaType::Audio => "silence",
        _ => "black",
    };
    add_test_branch(bin, stream, pattern, filter, name)
}

fn add_test_branch(
    bin: &gst::Bin,
    stream: &StreamDescriptor,
    pattern: &str,
    filter: &SharedFilter,
    name: &str,
) -> EngineResult<()> {
    let declared = make("capsfilter")?;
    declared.set_property("caps", caps::to_caps(stream));

    let chain = match stream.kind() {
        StreamKind::Video(_) => {
            let src = make("videotestsrc")?;
            if VIDEO_PATTERNS.contains(&pattern) {
                src.set_property_from_str("pattern", pattern);
            }
            let output = make("capsfilter")?;
            filter.lock().register(&output);
            vec![src, declared, make("videoscale")?, output]
        }
        StreamKind::Audio(_) => {
            let src = make("audiotestsrc")?;
            if AUDIO_WAVES.contains(&pattern) {
                src.set_property_from_str("wave", pattern);
            }
            vec![src, declared]
        }
        StreamKind::Text(_) => {
            return Err(EngineError::Other(
                "test sources cannot produce text streams".to_string(),
            ));
        }
    };
    let refs: Vec<&gst::Element> = chain.iter().collect();
    add_chain(bin, &refs)?;
    if let Some(last) = chain.last() {
        ghost(bin, &static_pad(last, "src")?, name)?;
    }
    Ok(())
}

// ===== Sinks =====

fn sink(
    kind: &SinkKind,
    inputs: &[StreamDescriptor],
    cache: &ElementFactoryCache,
) -> EngineResult<BuiltBin> {
    let bin = make_bin("sink");
    let mut sinks = Vec::new();

    match kind {
        SinkKind::VideoDisplay => {
            let output = make("autovideosink")?;
            let chain = [make("videoconvert")?, make("videoscale")?, output.clone()];
            add_chain(&bin, &chain.iter().collect::<Vec<_>>())?;
            ghost(&bin, &static_pad(&chain[0], "sink")?, "sink")?;
            sinks.push(output);
        }
        SinkKind::AudioOutput => {
            let output = make("autoaudiosink")?;
            let chain = [make("audioconvert")?, make("audioresample")?, output.clone()];
            add_chain(&bin, &chain.iter().collect::<Vec<_>>())?;
            ghost(&bin, &static_pad(&chain[0], "sink")?, "sink")?;
            sinks.push(output);
        }
        SinkKind::Null => {
            for (index, stream) in inputs.iter().enumerate() {
                let drain = make("fakesink")?;
                bin.add(&drain).map_err(engine_error)?;
                ghost(&bin, &static_pad(&drain, "sink")?, &pad_name(stream, "sink", index))?;
                sinks.push(drain);
            }
        }
        SinkKind::Encoder { output, settings } => {
            let filesink = encoder_sink(&bin, output, settings, inputs, cache)?;
            sinks.push(filesink);
        }
    }

    Ok(BuiltBin {
        bin,
        sinks,
        filter: SharedFilter::default(),
    })
}

/// One encoding branch per input, all muxed into `output`; returns the filesink
fn encoder_sink(
    bin: &gst::Bin,
    output: &Path,
    settings: &RenderSettings,
    inputs: &[StreamDescriptor],
    cache: &ElementFactoryCache,
) -> EngineResult<gst::Element> {
    let muxer = make(&settings.muxer)?;
    apply_properties(&muxer, &settings.muxer_properties);
    if muxer.has_property("streamable") {
        muxer.set_property("streamable", false);
    }
    let filesink = make("filesink")?;
    let location = output.to_string_lossy().to_string();
    filesink.set_property("location", location.as_str());
    add_chain(bin, &[&muxer, &filesink])?;

    for (index, stream) in inputs.iter().enumerate() {
        let (convert, encoder_name) = match stream.media_type() {
            MediaType::Video => (
                vec![make("videoconvert")?, make("videoscale")?],
                cache.select(settings.video_encoder.as_deref(), encoders::VIDEO_FALLBACKS),
            ),
            MediaType::Audio => (
                vec![make("audioconvert")?, make("audioresample")?],
                cache.select(settings.audio_encoder.as_deref(), encoders::AUDIO_FALLBACKS),
            ),
            MediaType::Text => {
                warn!(%stream, "Text streams are not rendered");
                continue;
            }
        };
        let encoder_name = encoder_name.ok_or_else(|| {
            EngineError::MissingElement(format!("{} encoder", stream.media_type()))
        })?;
        let encoder = make(&encoder_name)?;

        if stream.media_type() == MediaType::Video {
            let width = match stream.kind() {
                StreamKind::Video(v) => v.width,
                _ => None,
            };
            let width = width.unwrap_or(1920);
            configure_video_encoder(&encoder, &encoder_name, settings.bitrate, width);
            apply_properties(&encoder, &settings.video_encoder_properties);
        } else {
            apply_properties(&encoder, &settings.audio_encoder_properties);
        }

        let mut chain: Vec<&gst::Element> = convert.iter().collect();
        chain.push(&encoder);
        add_chain(bin, &chain)?;
        encoder
            .link(&muxer)
            .map_err(|e| EngineError::LinkFailed(e.to_string()))?;
        ghost(bin, &static_pad(&convert[0], "sink")?, &pad_name(stream, "sink", index))?;
        info!(encoder = %encoder_name, %stream, "Encoding branch added");
    }

    info!(muxer = %settings.muxer, output = %output.display(), "Encoder sink built");
    Ok(filesink)
}

fn configure_video_encoder(
    encoder: &gst::Element,
    encoder_name: &str,
    preset: BitratePreset,
    width: u32,
) {
    let bitrate = preset.bitrate_kbps(width);
    match encoder_name {
        "x264enc" => {
            encoder.set_property_from_str("speed-preset", "medium");
            encoder.set_property("bitrate", bitrate);
        }
        "openh264enc" => {
            encoder.set_property_from_str("rate-control", "bitrate");
            encoder.set_property("bitrate", bitrate * 1000);
        }
        "vp8enc" => encoder.set_property("target-bitrate", (bitrate * 1000) as i32),
        "theoraenc" => encoder.set_property("bitrate", bitrate as i32),
        _ => {
            debug!(encoder = encoder_name, "Using encoder defaults");
            return;
        }
    }
    debug!(encoder = encoder_name, bitrate_kbps = bitrate, "Configured video encoder");
}

fn apply_properties(element: &gst::Element, properties: &BTreeMap<String, String>) {
    for (name, value) in properties {
        if element.find_property(name).is_none() {
            warn!(element = %element.name(), property = %name, "Unknown property ignored");
            continue;
        }
        element.set_property_from_str(name, value);
    }
}
