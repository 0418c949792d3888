// SPDX-License-Identifier: GPL-3.0-only

//! Conversions between GStreamer caps/states and stream descriptors

use crate::engine::{PadDirection, PipelineState};
use crate::stream::{
    AudioAttributes, Fraction, StreamDescriptor, StreamKind, TextAttributes, VideoAttributes,
};
use gstreamer as gst;
use gstreamer::prelude::*;

pub fn to_gst_state(state: PipelineState) -> gst::State {
    match state {
        PipelineState::Null => gst::State::Null,
        PipelineState::Ready => gst::State::Ready,
        PipelineState::Paused => gst::State::Paused,
        PipelineState::Playing => gst::State::Playing,
    }
}

/// `None` for `VoidPending`
pub fn from_gst_state(state: gst::State) -> Option<PipelineState> {
    match state {
        gst::State::Null => Some(PipelineState::Null),
        gst::State::Ready => Some(PipelineState::Ready),
        gst::State::Paused => Some(PipelineState::Paused),
        gst::State::Playing => Some(PipelineState::Playing),
        _ => None,
    }
}

pub fn from_gst_direction(direction: gst::PadDirection) -> Option<PadDirection> {
    match direction {
        gst::PadDirection::Src => Some(PadDirection::Src),
        gst::PadDirection::Sink => Some(PadDirection::Sink),
        _ => None,
    }
}

/// Caps restricting output to `stream`; unknown attributes stay unconstrained
pub fn to_caps(stream: &StreamDescriptor) -> gst::Caps {
    match stream.kind() {
        StreamKind::Video(v) => {
            let mut builder = gst::Caps::builder("video/x-raw");
            if let Some(width) = v.width {
                builder = builder.field("width", width as i32);
            }
            if let Some(height) = v.height {
                builder = builder.field("height", height as i32);
            }
            if let Some(rate) = v.framerate {
                builder = builder.field("framerate", gst::Fraction::new(rate.num, rate.den));
            }
            if let Some(par) = v.pixel_aspect_ratio {
                builder =
                    builder.field("pixel-aspect-ratio", gst::Fraction::new(par.num, par.den));
            }
            builder.build()
        }
        StreamKind::Audio(a) => {
            let mut builder = gst::Caps::builder("audio/x-raw");
            if let Some(channels) = a.channels {
                builder = builder.field("channels", channels as i32);
            }
            if let Some(rate) = a.rate {
                builder = builder.field("rate", rate as i32);
            }
            builder.build()
        }
        StreamKind::Text(t) => {
            let mut builder = gst::Caps::builder("text/x-raw");
            if let Some(format) = &t.format {
                builder = builder.field("format", format.as_str());
            }
            builder.build()
        }
    }
}

/// Descriptor for the first structure of `caps`; `None` for ANY/EMPTY or unknown media
pub fn to_descriptor(caps: &gst::CapsRef) -> Option<StreamDescriptor> {
    if caps.is_any() || caps.is_empty() {
        return None;
    }
    let s = caps.structure(0)?;
    let name = s.name().as_str();
    let fraction = |field: &str| {
        s.get::<gst::Fraction>(field)
            .ok()
            .map(|f| Fraction::new(f.numer(), f.denom()))
    };
    let uint = |field: &str| s.get::<i32>(field).ok().map(|v| v as u32);

    let descriptor = if name.starts_with("video/") || name.starts_with("image/") {
        StreamDescriptor::video(VideoAttributes {
            width: uint("width"),
            height: uint("height"),
            framerate: fraction("framerate"),
            pixel_aspect_ratio: fraction("pixel-aspect-ratio"),
            display_aspect_ratio: None,
            is_image: name.starts_with("image/"),
        })
    } else if name.starts_with("audio/") {
        StreamDescriptor::audio(AudioAttributes {
            channels: uint("channels"),
            rate: uint("rate"),
            width: uint("width"),
            depth: uint("depth"),
        })
    } else if name.starts_with("text/") || name.starts_with("subtitle/") {
        StreamDescriptor::text(TextAttributes {
            format: s.get::<String>("format").ok(),
        })
    } else {
        return None;
    };

    let raw = name.ends_with("/x-raw");
    Some(if raw { descriptor } else { descriptor.encoded() })
}

/// Negotiated caps of `pad`, falling back to what its template allows
pub fn pad_stream(pad: &gst::Pad) -> Option<StreamDescriptor> {
    let caps = pad.current_caps().unwrap_or_else(|| pad.query_caps(None));
    to_descriptor(&caps).map(|stream| stream.with_pad_name(pad.name().as_str()))
}
