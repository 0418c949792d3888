// SPDX-License-Identifier: GPL-3.0-only

//! Purpose-specific orchestration of actions on a shared pipeline
//!
//! An [`Actioner`] binds one action (render to file, or live preview) onto a
//! pipeline it shares with other actions:
//!
//! ```text
//!   add_action:    stop ─► build action ─► register factories ─► filter sources ─► activate ─► pause
//!   remove_action: stop ─► deactivate ─► remove ─► restore filters
//! ```
//!
//! Source filters set for the action are undone when it goes away. View
//! sinks are switched off the real-time clock by the pipeline itself for as
//! long as a renderer is acting.

use crate::action::{Action, ActionId};
use crate::errors::PipelineResult;
use crate::events::{HandlerId, PipelineEvent, Signal};
use crate::factory::{FactoryId, ObjectFactory, RenderSettings};
use crate::pipeline::Pipeline;
use crate::stream::{MediaType, StreamDescriptor, VideoAttributes};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// What an actioner does with its action
pub trait ActionerPurpose {
    /// Preview actions survive end of stream and errors
    const PREVIEW: bool;

    fn build_action() -> Action;
}

#[derive(Debug)]
pub struct RenderPurpose;

impl ActionerPurpose for RenderPurpose {
    const PREVIEW: bool = false;

    fn build_action() -> Action {
        Action::render()
    }
}

#[derive(Debug)]
pub struct PreviewPurpose;

impl ActionerPurpose for PreviewPurpose {
    const PREVIEW: bool = true;

    fn build_action() -> Action {
        Action::view()
    }
}

/// Notifications from an actioner
#[derive(Debug, Clone, PartialEq)]
pub enum ActionerEvent {
    /// Fraction of the media processed, with an estimate of the time left
    Progress {
        fraction: f64,
        eta: Option<Duration>,
    },
    Eos,
    Error {
        message: String,
        detail: Option<String>,
    },
    /// The pipeline gave up recovering
    Died,
}

pub struct Actioner<P: ActionerPurpose> {
    producers: Vec<Arc<ObjectFactory>>,
    consumers: Vec<Arc<ObjectFactory>>,
    source_filter: Option<StreamDescriptor>,
    action: Option<ActionId>,
    saved_filters: Vec<(FactoryId, Option<StreamDescriptor>)>,
    started_at: Option<Instant>,
    signal: Signal<ActionerEvent>,
    _purpose: PhantomData<P>,
}

/// Renders producers into a file
pub type Renderer = Actioner<RenderPurpose>;

/// Plays producers on display/audio sinks
pub type Previewer = Actioner<PreviewPurpose>;

impl<P: ActionerPurpose> Actioner<P> {
    pub fn new(producers: Vec<Arc<ObjectFactory>>, consumers: Vec<Arc<ObjectFactory>>) -> Self {
        Self {
            producers,
            consumers,
            source_filter: None,
            action: None,
            saved_filters: Vec::new(),
            started_at: None,
            signal: Signal::new(),
            _purpose: PhantomData,
        }
    }

    /// Restrict producer output while acting (e.g. render frame size)
    pub fn with_source_filter(mut self, filter: StreamDescriptor) -> Self {
        self.source_filter = Some(filter);
        self
    }

    pub fn producers(&self) -> &[Arc<ObjectFactory>] {
        &self.producers
    }

    pub fn consumers(&self) -> &[Arc<ObjectFactory>] {
        &self.consumers
    }

    /// The action bound to the pipeline, while acting
    pub fn action(&self) -> Option<ActionId> {
        self.action
    }

    pub fn is_acting(&self) -> bool {
        self.action.is_some()
    }

    /// Whether there is something to act on and somewhere to send it
    pub fn is_ready(&self) -> bool {
        !self.producers.is_empty() && !self.consumers.is_empty()
    }

    pub fn connect<F>(&mut self, handler: F) -> HandlerId
    where
        F: FnMut(&ActionerEvent) + Send + 'static,
    {
        self.signal.connect(handler)
    }

    pub fn disconnect(&mut self, id: HandlerId) -> bool {
        self.signal.disconnect(id)
    }

    fn emit(&mut self, event: ActionerEvent) -> ActionerEvent {
        self.signal.emit(&event);
        event
    }

    /// Build, attach and activate the action, leaving the pipeline paused
    pub fn add_action(&mut self, pipeline: &mut Pipeline) -> PipelineResult<ActionId> {
        if let Some(id) = self.action {
            return Ok(id);
        }
        pipeline.stop()?;

        let mut action = P::build_action();
        action.add_producers(&self.producers)?;
        action.add_consumers(&self.consumers)?;
        for factory in self.producers.iter().chain(&self.consumers) {
            pipeline.add_factory(factory.clone())?;
        }

        if let Some(filter) = &self.source_filter {
            for producer in &self.producers {
                let previous = pipeline.set_source_filter(producer.id(), Some(filter.clone()));
                self.saved_filters.push((producer.id(), previous));
            }
        }

        let id = pipeline.add_action(action)?;
        if let Err(e) = pipeline.activate_action(id) {
            warn!(action = %id, ?e, "Failed to activate action");
            if let Err(remove) = pipeline.remove_action(id) {
                warn!(action = %id, ?remove, "Failed to remove action");
            }
            self.restore_filters(pipeline);
            return Err(e);
        }
        self.action = Some(id);
        info!(action = %id, preview = P::PREVIEW, "Actioner acting");
        pipeline.pause()?;
        Ok(id)
    }

    /// Tear the action down and restore what `add_action` changed
    pub fn remove_action(&mut self, pipeline: &mut Pipeline) -> PipelineResult<()> {
        let Some(id) = self.action.take() else {
            return Ok(());
        };
        self.started_at = None;
        if let Err(e) = pipeline.stop() {
            warn!(action = %id, ?e, "Failed to stop pipeline");
        }

        let result = pipeline
            .deactivate_action(id)
            .and_then(|_| pipeline.remove_action(id).map(|_| ()));
        self.restore_filters(pipeline);
        info!(action = %id, "Actioner done");
        result
    }

    fn restore_filters(&mut self, pipeline: &mut Pipeline) {
        for (factory, previous) in std::mem::take(&mut self.saved_filters) {
            pipeline.set_source_filter(factory, previous);
        }
    }

    /// Add the action and start playing
    ///
    /// Returns false without doing anything when already acting or not ready.
    pub fn start_action(&mut self, pipeline: &mut Pipeline) -> PipelineResult<bool> {
        if self.is_acting() || !self.is_ready() {
            debug!(
                acting = self.is_acting(),
                ready = self.is_ready(),
                "Not starting action"
            );
            return Ok(false);
        }
        self.add_action(pipeline)?;
        pipeline.play()?;
        self.started_at = Some(Instant::now());
        Ok(true)
    }

    /// Total media length, from the pipeline or the longest producer
    fn total_duration(&self, pipeline: &mut Pipeline) -> Option<u64> {
        pipeline
            .get_duration()
            .ok()
            .or_else(|| self.producers.iter().filter_map(|p| p.duration()).max())
            .filter(|d| *d > 0)
    }

    /// React to a pipeline event; returns the notification it produced
    pub fn handle_event(
        &mut self,
        pipeline: &mut Pipeline,
        event: &PipelineEvent,
    ) -> Option<ActionerEvent> {
        if !self.is_acting() {
            return None;
        }
        match event {
            PipelineEvent::Position(position) => {
                let started = self.started_at?;
                let duration = self.total_duration(pipeline)?;
                let fraction = (*position as f64 / duration as f64).clamp(0.0, 1.0);
                let eta = (fraction > 0.0).then(|| {
                    started
                        .elapsed()
                        .mul_f64((1.0 - fraction) / fraction)
                });
                Some(self.emit(ActionerEvent::Progress { fraction, eta }))
            }
            PipelineEvent::Eos if !P::PREVIEW => {
                if let Err(e) = self.remove_action(pipeline) {
                    warn!(?e, "Failed to tear down after end of stream");
                }
                Some(self.emit(ActionerEvent::Eos))
            }
            PipelineEvent::Error { message, detail } if !P::PREVIEW => {
                if let Err(e) = self.remove_action(pipeline) {
                    warn!(?e, "Failed to tear down after error");
                }
                Some(self.emit(ActionerEvent::Error {
                    message: message.clone(),
                    detail: detail.clone(),
                }))
            }
            PipelineEvent::Died => {
                if let Err(e) = self.remove_action(pipeline) {
                    warn!(?e, "Failed to tear down after pipeline died");
                }
                Some(self.emit(ActionerEvent::Died))
            }
            _ => None,
        }
    }
}

impl Renderer {
    /// Renderer encoding `producers` into `output`
    ///
    /// The encoder gets one input per stream kind the producers offer, and an
    /// output size in `settings` becomes a source filter while rendering.
    pub fn to_file(
        producers: Vec<Arc<ObjectFactory>>,
        output: impl Into<PathBuf>,
        settings: RenderSettings,
    ) -> Self {
        let offered: Vec<MediaType> = producers
            .iter()
            .flat_map(|p| p.output_streams())
            .map(|s| s.media_type())
            .collect();
        let mut inputs = Vec::new();
        if offered.contains(&MediaType::Video) {
            inputs.push(StreamDescriptor::any_video());
        }
        if offered.contains(&MediaType::Audio) {
            inputs.push(StreamDescriptor::any_audio());
        }

        let filter = match (settings.output_width, settings.output_height) {
            (None, None) => None,
            (width, height) => Some(StreamDescriptor::video(VideoAttributes {
                width,
                height,
                ..VideoAttributes::default()
            })),
        };
        let encoder = Arc::new(ObjectFactory::encoder_sink(output, settings, inputs));
        let renderer = Self::new(producers, vec![encoder]);
        match filter {
            Some(filter) => renderer.with_source_filter(filter),
            None => renderer,
        }
    }
}

impl Previewer {
    /// Previewer playing `producers` on a display and an audio output
    pub fn with_default_sinks(producers: Vec<Arc<ObjectFactory>>) -> Self {
        Self::new(
            producers,
            vec![
                Arc::new(ObjectFactory::video_sink()),
                Arc::new(ObjectFactory::audio_sink()),
            ],
        )
    }
}

impl<P: ActionerPurpose> std::fmt::Debug for Actioner<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Actioner")
            .field("preview", &P::PREVIEW)
            .field("producers", &self.producers.len())
            .field("consumers", &self.consumers.len())
            .field("action", &self.action)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryEngine;
    use crate::config::Config;
    use crate::stream::{AudioAttributes, Fraction};

    fn video() -> StreamDescriptor {
        StreamDescriptor::video(VideoAttributes::sized(1920, 1080, Fraction::new(25, 1)))
    }

    fn clip() -> Arc<ObjectFactory> {
        Arc::new(
            ObjectFactory::uri_source(
                "file:///clip.mp4",
                vec![video(), StreamDescriptor::audio(AudioAttributes::new(2, 48_000))],
            )
            .with_duration(10_000_000_000),
        )
    }

    #[test]
    fn test_renderer_inputs_follow_producer_streams() {
        let renderer = Renderer::to_file(vec![clip()], "/tmp/out.mkv", RenderSettings::default());
        assert_eq!(renderer.consumers().len(), 1);
        assert_eq!(renderer.consumers()[0].input_streams().len(), 2);
        assert!(renderer.source_filter.is_none());

        let settings = RenderSettings {
            output_width: Some(1280),
            output_height: Some(720),
            ..Default::default()
        };
        let renderer = Renderer::to_file(vec![clip()], "/tmp/out.mkv", settings);
        assert!(renderer.source_filter.is_some());
    }

    #[test]
    fn test_start_needs_producers_and_consumers() {
        let engine = Arc::new(MemoryEngine::new());
        let mut pipeline = Pipeline::new(engine, Config::default());
        let mut renderer = Renderer::new(vec![clip()], Vec::new());
        assert!(!renderer.start_action(&mut pipeline).unwrap());
        assert!(!renderer.is_acting());
    }

    #[test]
    fn test_render_pauses_preview_sync_until_done() {
        let engine = Arc::new(MemoryEngine::new());
        let mut pipeline = Pipeline::new(engine.clone(), Config::default());
        let source = clip();

        let mut previewer = Previewer::with_default_sinks(vec![source.clone()]);
        let preview = previewer.add_action(&mut pipeline).unwrap();
        assert!(pipeline.action(preview).unwrap().sync());

        let mut renderer =
            Renderer::to_file(vec![source.clone()], "/tmp/out.mkv", RenderSettings::default());
        assert!(renderer.start_action(&mut pipeline).unwrap());
        assert!(!renderer.start_action(&mut pipeline).unwrap(), "Already acting");
        assert!(!pipeline.action(preview).unwrap().sync());
        assert!(pipeline.is_rendering());

        pipeline.dispatch_pending();
        engine.post_eos();
        let events = pipeline.dispatch_pending();
        let notes: Vec<ActionerEvent> = events
            .iter()
            .filter_map(|e| renderer.handle_event(&mut pipeline, e))
            .collect();
        assert_eq!(notes, vec![ActionerEvent::Eos]);
        assert!(!renderer.is_acting());
        assert!(pipeline.action(preview).unwrap().sync());

        // Preview keeps running past end of stream
        engine.post_eos();
        let events = pipeline.dispatch_pending();
        for event in &events {
            assert_eq!(previewer.handle_event(&mut pipeline, event), None);
        }
        assert!(previewer.is_acting());
    }

    #[test]
    fn test_preview_started_during_render_waits_for_it() {
        let engine = Arc::new(MemoryEngine::new());
        let mut pipeline = Pipeline::new(engine.clone(), Config::default());
        let source = clip();

        let mut renderer =
            Renderer::to_file(vec![source.clone()], "/tmp/out.mkv", RenderSettings::default());
        assert!(renderer.start_action(&mut pipeline).unwrap());

        let mut previewer = Previewer::with_default_sinks(vec![source.clone()]);
        let preview = previewer.add_action(&mut pipeline).unwrap();
        let action = pipeline.action(preview).unwrap();
        assert!(!action.sync());
        let bins = action.consumer_bins();
        assert!(!bins.is_empty());
        for bin in &bins {
            assert_eq!(engine.element(*bin).unwrap().sync, Some(false));
        }

        pipeline.dispatch_pending();
        engine.post_eos();
        let events = pipeline.dispatch_pending();
        for event in &events {
            renderer.handle_event(&mut pipeline, event);
        }
        assert!(!renderer.is_acting());
        assert!(pipeline.action(preview).unwrap().sync());
        for bin in &bins {
            assert_eq!(engine.element(*bin).unwrap().sync, Some(true));
        }
    }
}
