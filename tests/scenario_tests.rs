// SPDX-License-Identifier: MPL-2.0

//! End-to-end resource graph scenarios on the in-memory engine

use montage::backends::memory::MemoryEngine;
use montage::engine::{GraphEngine, PadDirection};
use montage::resources::StreamUsage;
use montage::stream::{AudioAttributes, Fraction, VideoAttributes};
use montage::{
    Action, ActionState, Config, ObjectFactory, Pipeline, PipelineError, PipelineEvent,
    PipelineState, RecoveryState, RenderSettings, StreamDescriptor,
};
use std::sync::Arc;

fn video() -> StreamDescriptor {
    StreamDescriptor::video(VideoAttributes::sized(1920, 1080, Fraction::new(25, 1)))
}

fn audio() -> StreamDescriptor {
    StreamDescriptor::audio(AudioAttributes::new(2, 48_000))
}

fn setup() -> (Arc<MemoryEngine>, Pipeline) {
    let engine = Arc::new(MemoryEngine::new());
    let pipeline = Pipeline::new(engine.clone(), Config::default());
    (engine, pipeline)
}

fn usage(pipeline: &Pipeline, factory: &ObjectFactory) -> Option<StreamUsage> {
    pipeline.resources().lock().usage(factory.id(), None)
}

/// Register both ends, link them and activate
fn link_and_activate(
    pipeline: &mut Pipeline,
    source: &Arc<ObjectFactory>,
    sink: &Arc<ObjectFactory>,
) -> montage::ActionId {
    pipeline.add_factory(source.clone()).unwrap();
    pipeline.add_factory(sink.clone()).unwrap();
    let mut action = Action::generic();
    action.set_link(source, sink, None, None).unwrap();
    let id = pipeline.add_action(action).unwrap();
    assert!(pipeline.activate_action(id).unwrap());
    id
}

#[test]
fn test_shared_source_lifecycle() {
    let (engine, mut pipeline) = setup();
    let source = Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]));
    let encoder = Arc::new(ObjectFactory::encoder_sink(
        "/tmp/out.ogg",
        RenderSettings::default(),
        vec![StreamDescriptor::any_video()],
    ));

    // One producer, one consumer
    let first = link_and_activate(&mut pipeline, &source, &encoder);
    assert_eq!(pipeline.action(first).unwrap().state(), ActionState::Active);
    assert_eq!(
        usage(&pipeline, &source),
        Some(StreamUsage {
            bin: 1,
            tee: 1,
            queue: 0
        })
    );
    assert_eq!(
        usage(&pipeline, &encoder),
        Some(StreamUsage {
            bin: 1,
            tee: 0,
            queue: 1
        })
    );
    assert_eq!(engine.bin_count(), 2);
    assert_eq!(engine.tee_count(), 1);
    assert_eq!(engine.queue_count(), 1);

    // A preview of the same source shares its bin and tee
    let display = Arc::new(ObjectFactory::video_sink());
    let second = link_and_activate(&mut pipeline, &source, &display);
    assert_eq!(
        usage(&pipeline, &source),
        Some(StreamUsage {
            bin: 1,
            tee: 2,
            queue: 0
        })
    );
    assert_eq!(engine.bins_for(source.id()).len(), 1, "No duplicate decoding bin");
    assert_eq!(engine.tee_count(), 1);
    assert_eq!(engine.queue_count(), 2);

    // Dropping the first consumer leaves the preview running
    assert!(pipeline.deactivate_action(first).unwrap());
    assert_eq!(
        usage(&pipeline, &source),
        Some(StreamUsage {
            bin: 1,
            tee: 1,
            queue: 0
        })
    );
    assert_eq!(usage(&pipeline, &encoder), None);
    assert_eq!(engine.bins_for(source.id()).len(), 1);
    assert_eq!(engine.queue_count(), 1);

    // Last user gone: everything is torn down
    assert!(pipeline.deactivate_action(second).unwrap());
    assert_eq!(usage(&pipeline, &source), None);
    assert!(!pipeline.resources().lock().has_entries(source.id()));
    assert_eq!(pipeline.resources().lock().factory_entry_count(), 0);
    assert_eq!(engine.bin_count(), 0);
    assert_eq!(engine.tee_count(), 0);
    assert_eq!(engine.queue_count(), 0);
    assert_eq!(engine.link_count(), 0);
}

#[test]
fn test_removing_active_action_is_refused() {
    let (engine, mut pipeline) = setup();
    let source = Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]));
    let display = Arc::new(ObjectFactory::video_sink());
    let id = link_and_activate(&mut pipeline, &source, &display);

    pipeline.play().unwrap();
    pipeline.dispatch_pending();
    assert_eq!(pipeline.state(), PipelineState::Playing);
    let calls = engine.state_change_calls();

    let err = pipeline.remove_action(id).unwrap_err();
    assert!(matches!(err, PipelineError::ActiveAction(_)));
    assert!(err.is_contract_error());
    assert!(pipeline.action(id).unwrap().is_active());
    assert_eq!(engine.state_change_calls(), calls);
    assert_eq!(pipeline.state(), PipelineState::Playing);

    // Removing the factory is refused as well
    assert!(matches!(
        pipeline.remove_factory(source.id()),
        Err(PipelineError::ActiveAction(_))
    ));
}

#[test]
fn test_fatal_error_recovery_then_death() {
    let (engine, mut pipeline) = setup();
    let source = Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]));
    let display = Arc::new(ObjectFactory::video_sink());
    link_and_activate(&mut pipeline, &source, &display);
    pipeline.play().unwrap();
    pipeline.dispatch_pending();
    engine.set_position(7_000_000);

    // Graph goes to Null, preroll is left pending
    engine.set_async_state_changes(true);
    engine.post_error("decoder crashed");
    let events = pipeline.dispatch_pending();
    assert!(events.contains(&PipelineEvent::StateChanged(PipelineState::Null)));
    assert!(!events.iter().any(|e| matches!(e, PipelineEvent::Error { .. })));
    assert_eq!(pipeline.recovery_state(), RecoveryState::StartedRecovering);
    assert_eq!(engine.current_state(), PipelineState::Null);

    // Preroll completes, the pipeline seeks back and settles
    engine.set_async_state_changes(false);
    assert!(engine.complete_pending_state());
    pipeline.dispatch_pending();
    assert_eq!(pipeline.recovery_state(), RecoveryState::NotRecovering);
    assert_eq!(engine.seeks(), vec![7_000_000]);
    assert_eq!(engine.query_position(), Some(7_000_000));

    // Four failures in a row exhaust the attempts
    for _ in 0..4 {
        engine.post_error("decoder crashed again");
    }
    let events = pipeline.dispatch_pending();
    assert_eq!(
        events.iter().filter(|e| **e == PipelineEvent::Died).count(),
        1
    );

    // No further automatic retry
    let calls = engine.state_change_calls();
    engine.post_error("still broken");
    let events = pipeline.dispatch_pending();
    assert_eq!(engine.state_change_calls(), calls);
    assert!(!events.contains(&PipelineEvent::Died));
    assert!(events.iter().any(|e| matches!(e, PipelineEvent::Error { .. })));
}

#[test]
fn test_render_errors_are_not_recovered() {
    let (engine, mut pipeline) = setup();
    let source = Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]));
    let encoder = Arc::new(ObjectFactory::encoder_sink(
        "/tmp/out.mkv",
        RenderSettings::default(),
        vec![StreamDescriptor::any_video()],
    ));
    pipeline.add_factory(source.clone()).unwrap();
    pipeline.add_factory(encoder.clone()).unwrap();
    let mut action = Action::render();
    action.set_link(&source, &encoder, None, None).unwrap();
    let id = pipeline.add_action(action).unwrap();
    pipeline.activate_action(id).unwrap();
    pipeline.play().unwrap();
    pipeline.dispatch_pending();

    let calls = engine.state_change_calls();
    engine.post_error("disk full");
    let events = pipeline.dispatch_pending();
    assert_eq!(
        events,
        vec![PipelineEvent::Error {
            message: "disk full".to_string(),
            detail: None
        }]
    );
    assert_eq!(engine.state_change_calls(), calls);
    assert_eq!(pipeline.recovery_state(), RecoveryState::NotRecovering);
}

#[test]
fn test_late_stream_links_when_it_appears() {
    let (engine, mut pipeline) = setup();
    engine.set_dynamic_pads(true);
    let source = Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]));
    let display = Arc::new(ObjectFactory::video_sink());
    let id = link_and_activate(&mut pipeline, &source, &display);

    // Nothing to tee from yet; the bin waits for its pad
    let action = pipeline.action(id).unwrap();
    assert_eq!(action.pending_link_count(), 1);
    assert_eq!(action.active_link_count(), 0);
    assert_eq!(engine.tee_count(), 0);
    assert_eq!(usage(&pipeline, &source).unwrap().bin, 1);

    pipeline.pause().unwrap();
    let events = pipeline.dispatch_pending();
    assert!(!events.iter().any(|e| matches!(e, PipelineEvent::UnhandledStream { .. })));
    let action = pipeline.action(id).unwrap();
    assert_eq!(action.pending_link_count(), 0);
    assert_eq!(action.active_link_count(), 1);
    assert_eq!(
        usage(&pipeline, &source),
        Some(StreamUsage {
            bin: 1,
            tee: 1,
            queue: 0
        })
    );
    assert_eq!(engine.queue_count(), 1);

    // The stream goes away: the link waits for it again
    let bin = engine.bins_for(source.id())[0];
    let pad = engine.pads(bin, PadDirection::Src)[0].id;
    engine.remove_pad(pad).unwrap();
    pipeline.dispatch_pending();
    let action = pipeline.action(id).unwrap();
    assert!(action.is_active());
    assert_eq!(action.pending_link_count(), 1);
    assert_eq!(action.active_link_count(), 0);
    assert_eq!(engine.tee_count(), 0);
    assert_eq!(engine.queue_count(), 0);
    assert_eq!(engine.bins_for(source.id()).len(), 1);

    pipeline.deactivate_action(id).unwrap();
    assert_eq!(engine.bin_count(), 0);
    assert_eq!(pipeline.resources().lock().factory_entry_count(), 0);
}

#[test]
fn test_per_stream_links_need_explicit_streams() {
    let (engine, mut pipeline) = setup();
    let source = Arc::new(ObjectFactory::uri_source(
        "file:///clip.mkv",
        vec![video(), audio()],
    ));
    let display = Arc::new(ObjectFactory::video_sink());
    let speakers = Arc::new(ObjectFactory::audio_sink());
    pipeline.add_factory(source.clone()).unwrap();
    pipeline.add_factory(display.clone()).unwrap();
    pipeline.add_factory(speakers.clone()).unwrap();

    let mut action = Action::generic();
    action
        .set_link(&source, &display, Some(video()), None)
        .unwrap();
    action
        .set_link(&source, &speakers, Some(audio()), None)
        .unwrap();
    let id = pipeline.add_action(action).unwrap();
    pipeline.activate_action(id).unwrap();

    let table = pipeline.resources().lock();
    assert_eq!(table.usage(source.id(), Some(&video())).unwrap().tee, 1);
    assert_eq!(table.usage(source.id(), Some(&audio())).unwrap().tee, 1);
    drop(table);
    assert_eq!(engine.bins_for(source.id()).len(), 2);
    assert_eq!(engine.tee_count(), 2);
    assert_eq!(engine.queue_count(), 2);
}

#[test]
fn test_failed_activation_rolls_back() {
    let (engine, mut pipeline) = setup();
    let source = Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]));
    let display = Arc::new(ObjectFactory::video_sink());
    pipeline.add_factory(source.clone()).unwrap();
    pipeline.add_factory(display.clone()).unwrap();

    // Source bins cannot be built while playing
    pipeline.play().unwrap();
    pipeline.dispatch_pending();
    let mut action = Action::generic();
    action.set_link(&source, &display, None, None).unwrap();
    let id = pipeline.add_action(action).unwrap();
    assert!(matches!(
        pipeline.activate_action(id),
        Err(PipelineError::InvalidState { .. })
    ));
    assert!(!pipeline.action(id).unwrap().is_active());
    assert_eq!(pipeline.resources().lock().factory_entry_count(), 0);
    assert_eq!(engine.bin_count(), 0);
}

#[test]
fn test_unregistered_factory_blocks_activation() {
    let (_engine, mut pipeline) = setup();
    let source = Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]));
    let display = Arc::new(ObjectFactory::video_sink());
    pipeline.add_factory(source.clone()).unwrap();

    let mut action = Action::generic();
    action.set_link(&source, &display, None, None).unwrap();
    let id = pipeline.add_action(action).unwrap();
    assert!(matches!(
        pipeline.activate_action(id),
        Err(PipelineError::UnregisteredFactory(_))
    ));
}

#[test]
fn test_activation_is_idempotent() {
    let (engine, mut pipeline) = setup();
    let source = Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]));
    let display = Arc::new(ObjectFactory::video_sink());
    let id = link_and_activate(&mut pipeline, &source, &display);

    for _ in 0..3 {
        assert!(!pipeline.activate_action(id).unwrap());
    }
    assert_eq!(usage(&pipeline, &source).unwrap().tee, 1);
    assert_eq!(engine.queue_count(), 1);

    assert!(pipeline.deactivate_action(id).unwrap());
    assert!(!pipeline.deactivate_action(id).unwrap());
    let action = pipeline.remove_action(id).unwrap();
    assert_eq!(action.pipeline(), None);
    assert!(matches!(
        pipeline.remove_action(id),
        Err(PipelineError::ActionNotFound(_))
    ));
}

#[test]
fn test_repeated_activation_cycles_leave_nothing_behind() {
    let (engine, mut pipeline) = setup();
    let source = Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]));
    let display = Arc::new(ObjectFactory::video_sink());
    let encoder = Arc::new(ObjectFactory::encoder_sink(
        "/tmp/out.mkv",
        RenderSettings::default(),
        vec![StreamDescriptor::any_video()],
    ));
    let preview = link_and_activate(&mut pipeline, &source, &display);
    let render = link_and_activate(&mut pipeline, &source, &encoder);

    for round in 0..5 {
        let (first, second) = if round % 2 == 0 {
            (preview, render)
        } else {
            (render, preview)
        };
        pipeline.deactivate_action(first).unwrap();
        pipeline.deactivate_action(second).unwrap();
        assert_eq!(engine.bin_count(), 0, "round {}", round);
        assert_eq!(pipeline.resources().lock().stream_entry_count(), 0);

        pipeline.activate_action(second).unwrap();
        pipeline.activate_action(first).unwrap();
        assert_eq!(usage(&pipeline, &source).unwrap().tee, 2);
        assert_eq!(usage(&pipeline, &source).unwrap().bin, 1);
    }

    pipeline.release();
    assert_eq!(engine.bin_count(), 0);
    assert_eq!(engine.current_state(), PipelineState::Null);
}

#[test]
fn test_release_deactivates_everything() {
    let (engine, mut pipeline) = setup();
    let source = Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]));
    let display = Arc::new(ObjectFactory::video_sink());
    let id = link_and_activate(&mut pipeline, &source, &display);
    pipeline.play().unwrap();

    pipeline.release();
    assert!(pipeline.is_released());
    assert!(pipeline.action(id).is_none());
    assert!(pipeline.action_ids().is_empty());
    let events = pipeline.take_events();
    assert!(events.contains(&PipelineEvent::ActionStateChanged {
        action: id,
        active: false
    }));
    assert!(events.contains(&PipelineEvent::ActionRemoved(id)));
    assert_eq!(engine.bin_count(), 0);
    assert_eq!(engine.current_state(), PipelineState::Null);
    assert_eq!(pipeline.activate_action(id), Err(PipelineError::Released));
}

#[test]
fn test_stream_and_catch_all_links_share_one_bin() {
    let (engine, mut pipeline) = setup();
    let source = Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]));
    let display = Arc::new(ObjectFactory::video_sink());
    let encoder = Arc::new(ObjectFactory::encoder_sink(
        "/tmp/out.mkv",
        RenderSettings::default(),
        vec![StreamDescriptor::any_video()],
    ));
    for factory in [&source, &display, &encoder] {
        pipeline.add_factory(factory.clone()).unwrap();
    }

    let mut explicit = Action::generic();
    explicit
        .set_link(&source, &display, Some(video()), None)
        .unwrap();
    let explicit = pipeline.add_action(explicit).unwrap();
    let mut catch_all = Action::generic();
    catch_all.set_link(&source, &encoder, None, None).unwrap();
    let catch_all = pipeline.add_action(catch_all).unwrap();
    pipeline.activate_action(explicit).unwrap();
    pipeline.activate_action(catch_all).unwrap();

    assert_eq!(engine.bins_for(source.id()).len(), 1);
    assert_eq!(engine.tee_count(), 1);
    assert_eq!(
        pipeline
            .resources()
            .lock()
            .usage(source.id(), Some(&video()))
            .unwrap()
            .tee,
        2
    );

    pipeline.deactivate_action(explicit).unwrap();
    assert_eq!(engine.tee_count(), 1);
    pipeline.deactivate_action(catch_all).unwrap();
    assert_eq!(engine.bin_count(), 0);
    assert_eq!(pipeline.resources().lock().factory_entry_count(), 0);
}

#[test]
fn test_deactivating_while_paused_tears_down_dynamic_source() {
    let (engine, mut pipeline) = setup();
    engine.set_dynamic_pads(true);
    let source = Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]));
    let display = Arc::new(ObjectFactory::video_sink());
    let id = link_and_activate(&mut pipeline, &source, &display);
    pipeline.pause().unwrap();
    pipeline.dispatch_pending();
    assert_eq!(pipeline.action(id).unwrap().active_link_count(), 1);

    // The source bin reports its pads gone while the table is tearing it down
    assert!(pipeline.deactivate_action(id).unwrap());
    assert_eq!(engine.bin_count(), 0);
    assert_eq!(engine.tee_count(), 0);
    assert_eq!(engine.queue_count(), 0);

    let events = pipeline.dispatch_pending();
    assert!(!events.iter().any(|e| matches!(e, PipelineEvent::UnhandledStream { .. })));
    assert_eq!(pipeline.resources().lock().stream_entry_count(), 0);
    assert_eq!(pipeline.action(id).unwrap().pending_link_count(), 0);
}
