// SPDX-License-Identifier: GPL-3.0-only

//! Link policies
//!
//! A policy decides which links an action realizes when none were set
//! explicitly, and whether it takes responsibility for a stream that only
//! showed up at runtime.

use super::Link;
use crate::factory::ObjectFactory;
use crate::stream::StreamDescriptor;
use std::sync::Arc;

/// Purpose of an action, as seen by orchestration code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    /// Only realizes links set explicitly
    Generic,
    /// Live preview; its sinks follow the real-time clock unless told otherwise
    View,
    /// Render to file
    Render,
}

/// Hooks customizing how an action links producers to consumers
pub trait ActionPolicy: Send {
    fn kind(&self) -> ActionKind;

    /// Links to realize when the action has no explicit ones
    fn auto_links(
        &self,
        _producers: &[Arc<ObjectFactory>],
        _consumers: &[Arc<ObjectFactory>],
    ) -> Vec<Link> {
        Vec::new()
    }

    /// Link to build for a stream `producer` exposed at runtime, if any
    ///
    /// `linked` holds the links currently realized by the action.
    fn link_for_new_stream(
        &self,
        _producer: &Arc<ObjectFactory>,
        _stream: &StreamDescriptor,
        _consumers: &[Arc<ObjectFactory>],
        _linked: &[Link],
    ) -> Option<Link> {
        None
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct GenericPolicy;

impl ActionPolicy for GenericPolicy {
    fn kind(&self) -> ActionKind {
        ActionKind::Generic
    }
}

/// Links every producer stream to the first free compatible consumer input
#[derive(Debug, Default, Clone, Copy)]
pub struct ViewPolicy;

impl ActionPolicy for ViewPolicy {
    fn kind(&self) -> ActionKind {
        ActionKind::View
    }

    fn auto_links(
        &self,
        producers: &[Arc<ObjectFactory>],
        consumers: &[Arc<ObjectFactory>],
    ) -> Vec<Link> {
        match_streams(producers, consumers)
    }

    fn link_for_new_stream(
        &self,
        producer: &Arc<ObjectFactory>,
        stream: &StreamDescriptor,
        consumers: &[Arc<ObjectFactory>],
        linked: &[Link],
    ) -> Option<Link> {
        free_consumer_for(producer, stream, consumers, linked)
    }
}

/// Same linking as [`ViewPolicy`]; sinks are encoders writing a file
#[derive(Debug, Default, Clone, Copy)]
pub struct RenderPolicy;

impl ActionPolicy for RenderPolicy {
    fn kind(&self) -> ActionKind {
        ActionKind::Render
    }

    fn auto_links(
        &self,
        producers: &[Arc<ObjectFactory>],
        consumers: &[Arc<ObjectFactory>],
    ) -> Vec<Link> {
        match_streams(producers, consumers)
    }

    fn link_for_new_stream(
        &self,
        producer: &Arc<ObjectFactory>,
        stream: &StreamDescriptor,
        consumers: &[Arc<ObjectFactory>],
        linked: &[Link],
    ) -> Option<Link> {
        free_consumer_for(producer, stream, consumers, linked)
    }
}

/// Stream argument for a resource lookup: factories with a single stream use
/// the catch-all row so every action shares it
fn lookup_stream(factory: &ObjectFactory, stream: &StreamDescriptor) -> Option<StreamDescriptor> {
    (factory.streams().len() > 1).then(|| stream.clone())
}

fn match_streams(producers: &[Arc<ObjectFactory>], consumers: &[Arc<ObjectFactory>]) -> Vec<Link> {
    let mut links: Vec<Link> = Vec::new();
    for producer in producers {
        for output in producer.output_streams() {
            if let Some(link) = free_consumer_for(producer, output, consumers, &links) {
                links.push(link);
            }
        }
    }
    links
}

fn free_consumer_for(
    producer: &Arc<ObjectFactory>,
    stream: &StreamDescriptor,
    consumers: &[Arc<ObjectFactory>],
    linked: &[Link],
) -> Option<Link> {
    for consumer in consumers {
        for input in consumer.input_streams() {
            let wanted = lookup_stream(consumer, input);
            let taken = linked.iter().any(|l| {
                l.consumer.id() == consumer.id() && l.consumer_stream.as_ref() == wanted.as_ref()
            });
            if !taken && input.is_compatible(stream) {
                return Some(Link {
                    producer: producer.clone(),
                    consumer: consumer.clone(),
                    producer_stream: lookup_stream(producer, stream),
                    consumer_stream: wanted,
                });
            }
        }
    }
    None
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
    fn test_generic_policy_links_nothing() {
        let producers = vec![Arc::new(ObjectFactory::uri_source("file:///a", vec![video()]))];
        let consumers = vec![Arc::new(ObjectFactory::video_sink())];
        assert!(GenericPolicy.auto_links(&producers, &consumers).is_empty());
    }

    #[test]
    fn test_view_policy_pairs_streams_by_kind() {
        let source = Arc::new(ObjectFactory::uri_source("file:///a", vec![video(), audio()]));
        let producers = vec![source.clone()];
        let consumers = vec![
            Arc::new(ObjectFactory::audio_sink()),
            Arc::new(ObjectFactory::video_sink()),
        ];

        let links = ViewPolicy.auto_links(&producers, &consumers);
        assert_eq!(links.len(), 2);
        assert_eq!(links[0].consumer.id(), consumers[1].id());
        assert_eq!(links[0].producer_stream, Some(video()));
        // Single-input sinks use the catch-all row
        assert_eq!(links[0].consumer_stream, None);
        assert_eq!(links[1].consumer.id(), consumers[0].id());
    }

    #[test]
    fn test_render_policy_fills_each_encoder_input_once() {
        let encoder = Arc::new(ObjectFactory::encoder_sink(
            "/tmp/out.mkv",
            Default::default(),
            vec![StreamDescriptor::any_video(), StreamDescriptor::any_audio()],
        ));
        let first = Arc::new(ObjectFactory::uri_source("file:///a", vec![video()]));
        let second = Arc::new(ObjectFactory::uri_source("file:///b", vec![video()]));

        let links = RenderPolicy.auto_links(&[first, second], &[encoder]);
        assert_eq!(links.len(), 1, "Only one video input to fill");
        assert_eq!(links[0].consumer_stream, Some(StreamDescriptor::any_video()));
    }

    #[test]
    fn test_new_stream_skips_taken_inputs() {
        let source = Arc::new(ObjectFactory::uri_source("file:///a", vec![]));
        let sink = Arc::new(ObjectFactory::video_sink());
        let consumers = vec![sink];

        let link = ViewPolicy
            .link_for_new_stream(&source, &video(), &consumers, &[])
            .unwrap();
        assert!(
            ViewPolicy
                .link_for_new_stream(&source, &video(), &consumers, &[link])
                .is_none()
        );
        assert!(
            ViewPolicy
                .link_for_new_stream(&source, &audio(), &consumers, &[])
                .is_none()
        );
    }
}
