// SPDX-License-Identifier: GPL-3.0-only

//! Pipeline
//!
//! Owns the engine, the resource table, the registered factories and the
//! actions, and turns bus messages into [`PipelineEvent`]s.
//!
//! ```text
//!  caller ──► Pipeline ──► Action::activate ──► SharedResources ──► GraphEngine
//!                ▲                                    ▲                 │
//!                │                                    └── pad observer ◄┤ (engine threads)
//!                └────────────── bus (mpsc) ◄─────────────────────────── ┘
//! ```
//!
//! All mutation happens on the thread owning the `Pipeline`. Engine threads
//! only post bus messages and, through the pad observer, lock the resource
//! table. Messages are handled when the owner calls
//! [`Pipeline::dispatch_pending`] or awaits [`Pipeline::next_events`].
//!
//! While a render action is active, view actions run with non real-time
//! sinks so the encoder is not throttled to playback speed. Their own
//! setting is held aside and comes back once no render is active.

mod bus;
mod position;
mod recovery;

pub use recovery::RecoveryState;

use crate::action::{Action, ActionId, ActionKind};
use crate::config::Config;
use crate::constants::timing;
use crate::engine::{BusMessage, BusSender, GraphEngine, PipelineState, StateChange};
use crate::errors::{PipelineError, PipelineResult};
use crate::events::{HandlerId, PipelineEvent, Signal};
use crate::factory::{FactoryId, ObjectFactory};
use crate::resources::SharedResources;
use crate::stream::StreamDescriptor;
use position::PositionListener;
use recovery::{Recovery, StateWatchdog};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

static NEXT_PIPELINE_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipelineId(u64);

impl PipelineId {
    pub(crate) fn next() -> Self {
        Self(NEXT_PIPELINE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipeline#{}", self.0)
    }
}

pub struct Pipeline {
    id: PipelineId,
    config: Config,
    engine: Arc<dyn GraphEngine>,
    resources: SharedResources,
    factories: Vec<Arc<ObjectFactory>>,
    actions: BTreeMap<ActionId, Action>,
    signal: Signal<PipelineEvent>,
    /// Emitted events not yet returned to the owner
    events: Vec<PipelineEvent>,
    bus_tx: BusSender,
    bus_rx: mpsc::UnboundedReceiver<BusMessage>,
    /// Last state reported by the engine
    state: PipelineState,
    released: bool,
    duration: Option<u64>,
    last_position: u64,
    listener: PositionListener,
    recovery: Recovery,
    watchdog: StateWatchdog,
    seek_in_flight: bool,
    pending_seek: Option<u64>,
    /// Sync setting of view actions, held while a render is active
    held_sync: BTreeMap<ActionId, bool>,
}

impl Pipeline {
    pub fn new(engine: Arc<dyn GraphEngine>, config: Config) -> Self {
        let (bus_tx, bus_rx) = mpsc::unbounded_channel();
        let resources = SharedResources::new(engine.clone());
        engine.attach(bus_tx.clone(), resources.pad_observer(bus_tx.clone()));

        let id = PipelineId::next();
        info!(pipeline = %id, "Pipeline created");
        Self {
            id,
            listener: PositionListener::new(config.position_interval()),
            recovery: Recovery::new(config.max_recovery_attempts),
            config,
            engine,
            resources,
            factories: Vec::new(),
            actions: BTreeMap::new(),
            signal: Signal::new(),
            events: Vec::new(),
            bus_tx,
            bus_rx,
            state: PipelineState::Null,
            released: false,
            duration: None,
            last_position: 0,
            watchdog: StateWatchdog::default(),
            seek_in_flight: false,
            pending_seek: None,
            held_sync: BTreeMap::new(),
        }
    }

    pub fn id(&self) -> PipelineId {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn engine(&self) -> &Arc<dyn GraphEngine> {
        &self.engine
    }

    pub fn resources(&self) -> &SharedResources {
        &self.resources
    }

    /// Buffer size of queues created for sinks
    pub fn queue_buffer(&self) -> Duration {
        self.config.queue_buffer()
    }

    /// Last state reported by the engine
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Ask the engine, waiting up to `timeout` for an in-flight transition
    pub fn query_state(&self, timeout: Duration) -> PipelineState {
        self.engine.state(timeout)
    }

    pub fn recovery_state(&self) -> RecoveryState {
        self.recovery.state()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    fn ensure_alive(&self) -> PipelineResult<()> {
        if self.released {
            return Err(PipelineError::Released);
        }
        Ok(())
    }

    // ===== Events =====

    /// Register an event handler; handlers run on the dispatching thread
    pub fn connect<F>(&mut self, handler: F) -> HandlerId
    where
        F: FnMut(&PipelineEvent) + Send + 'static,
    {
        self.signal.connect(handler)
    }

    pub fn disconnect(&mut self, id: HandlerId) -> bool {
        self.signal.disconnect(id)
    }

    pub(crate) fn emit(&mut self, event: PipelineEvent) {
        debug!(pipeline = %self.id, event = %event, "Emitting");
        self.signal.emit(&event);
        self.events.push(event);
    }

    /// Events emitted since the last call
    pub fn take_events(&mut self) -> Vec<PipelineEvent> {
        std::mem::take(&mut self.events)
    }

    // ===== Factories =====

    /// Register a factory; returns false if it already was
    pub fn add_factory(&mut self, factory: Arc<ObjectFactory>) -> PipelineResult<bool> {
        self.ensure_alive()?;
        if self.is_registered(factory.id()) {
            debug!(factory = factory.name(), "Factory already registered");
            return Ok(false);
        }
        info!(pipeline = %self.id, factory = factory.name(), "Factory added");
        let id = factory.id();
        self.factories.push(factory);
        self.emit(PipelineEvent::FactoryAdded(id));
        Ok(true)
    }

    /// Unregister a factory that no active action uses and that holds no resources
    pub fn remove_factory(&mut self, factory: FactoryId) -> PipelineResult<bool> {
        self.ensure_alive()?;
        let Some(index) = self.factories.iter().position(|f| f.id() == factory) else {
            return Ok(false);
        };
        if let Some(action) = self.actions.values().find(|a| {
            a.is_active()
                && a.producers()
                    .iter()
                    .chain(a.consumers())
                    .any(|f| f.id() == factory)
        }) {
            return Err(PipelineError::ActiveAction(action.id().to_string()));
        }
        if self.resources.lock().has_entries(factory) {
            return Err(PipelineError::ResourceBusy {
                factory: self.factories[index].name().to_string(),
                stream: "any stream".to_string(),
            });
        }
        let removed = self.factories.remove(index);
        info!(pipeline = %self.id, factory = removed.name(), "Factory removed");
        self.emit(PipelineEvent::FactoryRemoved(factory));
        Ok(true)
    }

    pub fn is_registered(&self, factory: FactoryId) -> bool {
        self.factories.iter().any(|f| f.id() == factory)
    }

    pub fn factories(&self) -> &[Arc<ObjectFactory>] {
        &self.factories
    }

    /// Restrict the output of a source factory's bins; returns the previous filter
    pub fn set_source_filter(
        &mut self,
        factory: FactoryId,
        filter: Option<StreamDescriptor>,
    ) -> Option<StreamDescriptor> {
        self.resources.lock().set_source_filter(factory, filter)
    }

    // ===== Actions =====

    /// Take ownership of `action` and bind it to this pipeline
    pub fn add_action(&mut self, mut action: Action) -> PipelineResult<ActionId> {
        self.ensure_alive()?;
        action.set_pipeline(self.id)?;
        let id = action.id();
        info!(pipeline = %self.id, action = %id, kind = ?action.kind(), "Action added");
        self.actions.insert(id, action);
        self.update_render_sync();
        self.emit(PipelineEvent::ActionAdded(id));
        Ok(id)
    }

    /// Hand an inactive action back to the caller
    pub fn remove_action(&mut self, id: ActionId) -> PipelineResult<Action> {
        let action = self
            .actions
            .get(&id)
            .ok_or_else(|| PipelineError::ActionNotFound(id.to_string()))?;
        if action.is_active() {
            return Err(PipelineError::ActiveAction(id.to_string()));
        }
        let mut action = self
            .actions
            .remove(&id)
            .ok_or_else(|| PipelineError::ActionNotFound(id.to_string()))?;
        action.unset_pipeline()?;
        if let Some(sync) = self.held_sync.remove(&id) {
            action.set_sync(sync);
        }
        info!(pipeline = %self.id, action = %id, "Action removed");
        self.emit(PipelineEvent::ActionRemoved(id));
        Ok(action)
    }

    pub fn action(&self, id: ActionId) -> Option<&Action> {
        self.actions.get(&id)
    }

    /// Mutable access for configuring producers, consumers and links
    pub fn action_mut(&mut self, id: ActionId) -> Option<&mut Action> {
        self.actions.get_mut(&id)
    }

    pub fn action_ids(&self) -> Vec<ActionId> {
        self.actions.keys().copied().collect()
    }

    /// Whether an active action renders to file
    pub fn is_rendering(&self) -> bool {
        self.actions
            .values()
            .any(|a| a.is_active() && a.kind() == ActionKind::Render)
    }

    /// Realize an action's links; returns false if it was already active
    pub fn activate_action(&mut self, id: ActionId) -> PipelineResult<bool> {
        self.ensure_alive()?;
        let mut action = self
            .actions
            .remove(&id)
            .ok_or_else(|| PipelineError::ActionNotFound(id.to_string()))?;
        let result = action.activate(self);
        if matches!(result, Ok(true)) && action.kind() == ActionKind::View {
            self.apply_sync(&action);
        }
        self.actions.insert(id, action);

        if matches!(result, Ok(true)) {
            self.update_render_sync();
            self.emit(PipelineEvent::ActionStateChanged {
                action: id,
                active: true,
            });
        }
        result
    }

    /// Release an action's resources; returns false if it was not active
    pub fn deactivate_action(&mut self, id: ActionId) -> PipelineResult<bool> {
        let action = self
            .actions
            .get_mut(&id)
            .ok_or_else(|| PipelineError::ActionNotFound(id.to_string()))?;
        let was_active = action.is_active();
        let result = action.deactivate();
        if was_active {
            self.update_render_sync();
            self.emit(PipelineEvent::ActionStateChanged {
                action: id,
                active: false,
            });
        }
        result
    }

    /// Toggle real-time synchronisation of a view action's sinks
    ///
    /// While a render is active the new setting is held and applied once it ends.
    pub fn set_action_sync(&mut self, id: ActionId, sync: bool) -> PipelineResult<()> {
        let action = self
            .actions
            .get_mut(&id)
            .ok_or_else(|| PipelineError::ActionNotFound(id.to_string()))?;
        if let Some(held) = self.held_sync.get_mut(&id) {
            debug!(action = %id, sync, "Render active, holding sync setting");
            *held = sync;
            return Ok(());
        }
        action.set_sync(sync);
        if let Some(action) = self.actions.get(&id) {
            self.apply_sync(action);
        }
        Ok(())
    }

    /// Hold view sync while rendering, give it back when the last render stops
    fn update_render_sync(&mut self) {
        let mut changed = Vec::new();
        if self.is_rendering() {
            for action in self.actions.values_mut() {
                if action.kind() != ActionKind::View || self.held_sync.contains_key(&action.id()) {
                    continue;
                }
                self.held_sync.insert(action.id(), action.sync());
                if action.sync() {
                    action.set_sync(false);
                    changed.push(action.id());
                }
            }
        } else {
            for (id, sync) in std::mem::take(&mut self.held_sync) {
                if let Some(action) = self.actions.get_mut(&id) {
                    if action.sync() != sync {
                        action.set_sync(sync);
                        changed.push(id);
                    }
                }
            }
        }
        for id in changed {
            if let Some(action) = self.actions.get(&id) {
                debug!(pipeline = %self.id, action = %id, sync = action.sync(), "View sync follows render");
                self.apply_sync(action);
            }
        }
    }

    fn apply_sync(&self, action: &Action) {
        for bin in action.consumer_bins() {
            if let Err(e) = self.engine.set_sync(bin, action.sync()) {
                warn!(action = %action.id(), element = %bin, ?e, "Failed to set sink sync");
            }
        }
    }

    // ===== State =====

    /// Move the graph to `target`
    ///
    /// On failure the graph is forced back to Null before the error is returned.
    pub fn set_state(&mut self, target: PipelineState) -> PipelineResult<()> {
        self.ensure_alive()?;
        info!(pipeline = %self.id, %target, "Setting state");
        match self.engine.set_state(target) {
            Ok(StateChange::Async) => {
                let window = self.config.state_watchdog();
                self.watchdog.arm(target, window, &self.bus_tx);
                Ok(())
            }
            Ok(StateChange::Success | StateChange::NoPreroll) => Ok(()),
            Err(e) => {
                warn!(pipeline = %self.id, %target, ?e, "State change failed, resetting to null");
                self.watchdog.disarm();
                if let Err(reset) = self.engine.set_state(PipelineState::Null) {
                    warn!(?reset, "Failed to reset graph to null");
                }
                self.state = PipelineState::Null;
                self.listener.reschedule(self.state, &self.bus_tx);
                Err(PipelineError::StateChangeFailed {
                    target,
                    reason: e.to_string(),
                })
            }
        }
    }

    pub fn play(&mut self) -> PipelineResult<()> {
        self.set_state(PipelineState::Playing)
    }

    pub fn pause(&mut self) -> PipelineResult<()> {
        self.set_state(PipelineState::Paused)
    }

    /// Back to Ready: resources stay allocated, position resets
    pub fn stop(&mut self) -> PipelineResult<()> {
        self.set_state(PipelineState::Ready)
    }

    pub fn toggle_playback(&mut self) -> PipelineResult<()> {
        let timeout = Duration::from_millis(timing::STATE_QUERY_TIMEOUT_MS);
        if self.engine.state(timeout) == PipelineState::Playing {
            self.pause()
        } else {
            self.play()
        }
    }

    /// Deactivate and remove every action, then tear the graph down; idempotent
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        info!(pipeline = %self.id, "Releasing pipeline");
        self.listener.disable();
        self.watchdog.disarm();

        let ids: Vec<ActionId> = self.actions.keys().copied().collect();
        for id in ids {
            if let Err(e) = self.deactivate_action(id) {
                warn!(pipeline = %self.id, action = %id, ?e, "Failed to deactivate action");
            }
            if let Err(e) = self.remove_action(id) {
                warn!(pipeline = %self.id, action = %id, ?e, "Failed to remove action");
            }
        }
        if let Err(e) = self.engine.set_state(PipelineState::Null) {
            warn!(pipeline = %self.id, ?e, "Failed to stop graph");
        }
        self.state = PipelineState::Null;
        self.released = true;
    }

    // ===== Queries =====

    /// Current position in nanoseconds
    pub fn get_position(&mut self) -> PipelineResult<u64> {
        let position = self
            .engine
            .query_position()
            .ok_or(PipelineError::QueryUnavailable("position"))?;
        self.last_position = position;
        Ok(position)
    }

    /// Duration in nanoseconds; emits `duration-changed` when it differs from the cached value
    pub fn get_duration(&mut self) -> PipelineResult<u64> {
        let duration = self
            .engine
            .query_duration()
            .ok_or(PipelineError::QueryUnavailable("duration"))?;
        if self.duration != Some(duration) {
            self.duration = Some(duration);
            self.emit(PipelineEvent::DurationChanged(duration));
        }
        Ok(duration)
    }

    /// Last known position, without querying the engine
    pub fn last_position(&self) -> u64 {
        self.last_position
    }

    // ===== Position listener =====

    /// Emit `position` every `interval` while playing (and while paused if `force`)
    pub fn activate_position_listener(&mut self, interval: Duration, force: bool) {
        self.listener.enable(interval, force);
        self.listener.reschedule(self.state, &self.bus_tx);
    }

    pub fn deactivate_position_listener(&mut self) {
        self.listener.disable();
    }

    pub fn position_listener_running(&self) -> bool {
        self.listener.is_running()
    }

    // ===== Seeking =====

    /// Flushing accurate seek, clamped into `[0, duration]`
    ///
    /// Emits `position` with the clamped value right away. While a previous
    /// seek is unconfirmed, only the latest request is kept and issued once
    /// the engine catches up.
    pub fn seek(&mut self, position: i64) -> PipelineResult<u64> {
        self.ensure_alive()?;
        let duration = self.duration.or_else(|| self.engine.query_duration());
        let mut target = position.max(0) as u64;
        if let Some(duration) = duration {
            target = target.min(duration);
        }

        if self.seek_in_flight {
            debug!(position = target, "Seek in flight, coalescing");
            self.pending_seek = Some(target);
        } else {
            self.engine
                .seek(target)
                .map_err(|e| PipelineError::SeekFailed {
                    position: target,
                    reason: e.to_string(),
                })?;
            self.seek_in_flight = true;
        }
        self.last_position = target;
        self.emit(PipelineEvent::Position(target));
        Ok(target)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.release();
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("factories", &self.factories.len())
            .field("actions", &self.actions)
            .field("recovery", &self.recovery)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryEngine;
    use crate::stream::{Fraction, VideoAttributes};

    fn video() -> StreamDescriptor {
        StreamDescriptor::video(VideoAttributes::sized(1920, 1080, Fraction::new(25, 1)))
    }

    fn pipeline() -> (Arc<MemoryEngine>, Pipeline) {
        let engine = Arc::new(MemoryEngine::new());
        let pipeline = Pipeline::new(engine.clone(), Config::default());
        (engine, pipeline)
    }

    #[test]
    fn test_failed_state_change_resets_to_null() {
        let (engine, mut pipeline) = pipeline();
        pipeline.pause().unwrap();
        pipeline.dispatch_pending();
        assert_eq!(pipeline.state(), PipelineState::Paused);

        engine.set_fail_state_changes(true);
        assert!(matches!(
            pipeline.play(),
            Err(PipelineError::StateChangeFailed {
                target: PipelineState::Playing,
                ..
            })
        ));
        assert_eq!(engine.current_state(), PipelineState::Null);
        assert_eq!(pipeline.state(), PipelineState::Null);
    }

    #[test]
    fn test_duration_changed_only_on_new_value() {
        let (engine, mut pipeline) = pipeline();
        assert_eq!(
            pipeline.get_duration(),
            Err(PipelineError::QueryUnavailable("duration"))
        );

        pipeline.pause().unwrap();
        pipeline.dispatch_pending();
        engine.set_duration(10_000);
        let events = pipeline.dispatch_pending();
        assert!(events.contains(&PipelineEvent::DurationChanged(10_000)));

        assert_eq!(pipeline.get_duration().unwrap(), 10_000);
        assert!(pipeline.take_events().is_empty());

        engine.set_duration(20_000);
        pipeline.take_events();
        assert_eq!(pipeline.get_duration().unwrap(), 20_000);
        assert_eq!(
            pipeline.take_events(),
            vec![PipelineEvent::DurationChanged(20_000)]
        );
    }

    #[test]
    fn test_seek_clamps_into_duration() {
        let (engine, mut pipeline) = pipeline();
        pipeline.pause().unwrap();
        engine.set_duration(1_000);
        pipeline.dispatch_pending();

        assert_eq!(pipeline.seek(5_000).unwrap(), 1_000);
        pipeline.dispatch_pending();
        assert_eq!(pipeline.seek(-20).unwrap(), 0);
        assert_eq!(engine.seeks(), vec![1_000, 0]);
    }

    #[test]
    fn test_rejected_seek_fails() {
        let (engine, mut pipeline) = pipeline();
        pipeline.pause().unwrap();
        engine.set_reject_seeks(true);
        assert!(matches!(
            pipeline.seek(10),
            Err(PipelineError::SeekFailed { position: 10, .. })
        ));
    }

    #[test]
    fn test_seeks_in_flight_are_coalesced() {
        let (engine, mut pipeline) = pipeline();
        pipeline.pause().unwrap();
        pipeline.dispatch_pending();

        pipeline.seek(100).unwrap();
        pipeline.seek(200).unwrap();
        pipeline.seek(300).unwrap();
        assert_eq!(engine.seeks(), vec![100]);

        pipeline.dispatch_pending();
        assert_eq!(engine.seeks(), vec![100, 300], "Only the latest request survives");
    }

    #[test]
    fn test_released_pipeline_rejects_calls() {
        let (_engine, mut pipeline) = pipeline();
        pipeline.release();
        pipeline.release();
        assert_eq!(pipeline.play(), Err(PipelineError::Released));
        let source = Arc::new(ObjectFactory::uri_source("file:///a", vec![video()]));
        assert_eq!(pipeline.add_factory(source), Err(PipelineError::Released));
    }

    #[test]
    fn test_factory_registration() {
        let (_engine, mut pipeline) = pipeline();
        let source = Arc::new(ObjectFactory::uri_source("file:///a", vec![video()]));
        assert!(pipeline.add_factory(source.clone()).unwrap());
        assert!(!pipeline.add_factory(source.clone()).unwrap());
        assert_eq!(
            pipeline.take_events(),
            vec![PipelineEvent::FactoryAdded(source.id())]
        );
        assert!(pipeline.remove_factory(source.id()).unwrap());
        assert!(!pipeline.is_registered(source.id()));
    }

    #[test]
    fn test_view_sync_is_held_while_rendering() {
        let (_engine, mut pipeline) = pipeline();
        let source = Arc::new(ObjectFactory::uri_source("file:///a", vec![video()]));
        let display = Arc::new(ObjectFactory::video_sink());
        let encoder = Arc::new(ObjectFactory::encoder_sink(
            "/tmp/out.mkv",
            crate::factory::RenderSettings::default(),
            vec![StreamDescriptor::any_video()],
        ));
        for factory in [&source, &display, &encoder] {
            pipeline.add_factory(factory.clone()).unwrap();
        }
        let mut view = Action::view();
        view.set_link(&source, &display, None, None).unwrap();
        let view = pipeline.add_action(view).unwrap();
        let mut render = Action::render();
        render.set_link(&source, &encoder, None, None).unwrap();
        let render = pipeline.add_action(render).unwrap();
        assert!(pipeline.action(view).unwrap().sync(), "Inactive renders do not count");

        pipeline.activate_action(render).unwrap();
        assert!(!pipeline.action(view).unwrap().sync());

        // Set while rendering, applied once the render stops
        pipeline.set_action_sync(view, false).unwrap();
        pipeline.deactivate_action(render).unwrap();
        assert!(!pipeline.action(view).unwrap().sync());

        pipeline.set_action_sync(view, true).unwrap();
        pipeline.activate_action(render).unwrap();
        let removed = pipeline.remove_action(view).unwrap();
        assert!(removed.sync());
    }
}
