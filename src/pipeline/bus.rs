// SPDX-License-Identifier: GPL-3.0-only

//! Bus message handling
//!
//! Engine threads, timers and the pad bridge all post onto one channel; the
//! owning thread drains it here and turns messages into pipeline events.

use super::Pipeline;
use super::recovery::{RecoveryState, RecoveryStep};
use crate::action::ActionKind;
use crate::engine::{BusMessage, PipelineState, StateChange};
use crate::events::PipelineEvent;
use crate::factory::FactoryId;
use crate::stream::StreamDescriptor;
use tracing::{debug, error, info, warn};

impl Pipeline {
    /// Handle every queued bus message; returns the events they produced
    pub fn dispatch_pending(&mut self) -> Vec<PipelineEvent> {
        while let Ok(message) = self.bus_rx.try_recv() {
            self.handle_message(message);
        }
        self.take_events()
    }

    /// Wait for at least one bus message, then handle everything queued
    pub async fn next_events(&mut self) -> Vec<PipelineEvent> {
        if let Some(message) = self.bus_rx.recv().await {
            self.handle_message(message);
        }
        self.dispatch_pending()
    }

    pub(crate) fn handle_message(&mut self, message: BusMessage) {
        match message {
            BusMessage::StateChanged { old, new, pending } => {
                self.handle_state_changed(old, new, pending)
            }
            BusMessage::AsyncDone => self.handle_async_done(),
            BusMessage::Eos => {
                info!(pipeline = %self.id, "End of stream");
                self.emit(PipelineEvent::Eos);
            }
            BusMessage::Error { message, debug } => self.handle_error(message, debug),
            BusMessage::Warning { message, debug: detail } => {
                warn!(pipeline = %self.id, warning = %message, ?detail, "Engine warning");
            }
            BusMessage::DurationChanged => {
                if let Err(e) = self.get_duration() {
                    debug!(?e, "Duration not known yet");
                }
            }
            BusMessage::Element(message) => self.emit(PipelineEvent::ElementMessage(message)),
            BusMessage::StreamAdded { factory, stream } => self.handle_new_stream(factory, stream),
            BusMessage::StreamRemoved { factory, stream } => {
                self.handle_stream_removed(factory, &stream)
            }
            BusMessage::PadChanged(event) => {
                if let Some(message) = self.resources.bridge_deferred(event) {
                    self.handle_message(message);
                }
            }
            BusMessage::PositionTick { generation } => self.handle_position_tick(generation),
            BusMessage::StateWatchdog { generation, target } => {
                self.handle_watchdog(generation, target)
            }
        }
    }

    fn handle_state_changed(
        &mut self,
        old: PipelineState,
        new: PipelineState,
        pending: Option<PipelineState>,
    ) {
        debug!(pipeline = %self.id, %old, %new, ?pending, "State changed");
        self.state = new;
        if self.watchdog.target() == Some(new) {
            self.watchdog.disarm();
        }
        self.listener.reschedule(new, &self.bus_tx);

        if new <= PipelineState::Ready {
            self.seek_in_flight = false;
            self.pending_seek = None;
        }
        if pending.is_none() {
            self.emit(PipelineEvent::StateChanged(new));
        }
    }

    fn handle_async_done(&mut self) {
        if self.watchdog.target().is_some_and(|t| t <= self.state) {
            self.watchdog.disarm();
        }
        match self.recovery.state() {
            RecoveryState::StartedRecovering if self.state >= PipelineState::Paused => {
                self.seek_after_recovery();
                return;
            }
            RecoveryState::SeekedAfterRecovering if self.seek_in_flight => {
                if self.recovery.seek_done() {
                    info!(pipeline = %self.id, "Recovery complete");
                }
            }
            _ => {}
        }
        if !self.seek_in_flight {
            return;
        }
        self.seek_in_flight = false;
        if let Some(position) = self.pending_seek.take() {
            match self.engine.seek(position) {
                Ok(()) => self.seek_in_flight = true,
                Err(e) => warn!(position, ?e, "Coalesced seek failed"),
            }
        }
    }

    /// The recovered graph prerolled; seek back to where playback failed
    fn seek_after_recovery(&mut self) {
        let Some(position) = self.recovery.resume_position() else {
            return;
        };
        info!(pipeline = %self.id, position, "Recovered graph prerolled, seeking back");
        match self.engine.seek(position) {
            Ok(()) => {
                self.recovery.seek_issued();
                self.seek_in_flight = true;
            }
            // Counts as another failed attempt
            Err(e) => self.handle_error(
                "seek after recovery failed".to_string(),
                Some(e.to_string()),
            ),
        }
    }

    /// Fatal engine error: surfaced while rendering, otherwise recovered from
    fn handle_error(&mut self, message: String, detail: Option<String>) {
        error!(pipeline = %self.id, error = %message, detail = ?detail, "Engine error");
        if self.is_rendering() || self.recovery.gave_up() {
            self.emit(PipelineEvent::Error { message, detail });
            return;
        }

        let position = self.engine.query_position().unwrap_or(self.last_position);
        match self.recovery.start(position) {
            RecoveryStep::GiveUp => {
                error!(pipeline = %self.id, attempts = self.recovery.attempts(), "Giving up on recovery");
                self.watchdog.disarm();
                self.emit(PipelineEvent::Died);
            }
            RecoveryStep::Retry { attempt } => {
                warn!(pipeline = %self.id, attempt, position, "Recovering from error");
                self.watchdog.disarm();
                if let Err(e) = self.engine.set_state(PipelineState::Null) {
                    warn!(?e, "Failed to reset graph during recovery");
                }
                match self.engine.set_state(PipelineState::Paused) {
                    Ok(StateChange::Async) => {
                        let window = self.config.state_watchdog();
                        self.watchdog.arm(PipelineState::Paused, window, &self.bus_tx);
                    }
                    // Live graphs do not preroll and cannot seek back
                    Ok(StateChange::NoPreroll) => {
                        info!(pipeline = %self.id, "Live graph restarted");
                        self.recovery.finish();
                    }
                    Ok(StateChange::Success) => {}
                    Err(e) => warn!(?e, "Failed to preroll during recovery"),
                }
            }
        }
    }

    fn handle_new_stream(&mut self, factory: FactoryId, stream: StreamDescriptor) {
        let buffer = self.queue_buffer();
        let mut handled = false;
        let mut resync = Vec::new();
        for action in self.actions.values_mut() {
            match action.handle_new_stream(&self.resources, buffer, factory, &stream) {
                Ok(true) => {
                    handled = true;
                    resync.push(action.id());
                }
                Ok(false) => {}
                Err(e) => warn!(action = %action.id(), ?e, "Failed to link new stream"),
            }
        }
        for id in resync {
            if let Some(action) = self.actions.get(&id) {
                if action.kind() == ActionKind::View {
                    self.apply_sync(action);
                }
            }
        }
        if !handled {
            info!(pipeline = %self.id, factory = %factory, %stream, "No action handled new stream");
            self.emit(PipelineEvent::UnhandledStream { factory, stream });
        }
    }

    fn handle_stream_removed(&mut self, factory: FactoryId, stream: &StreamDescriptor) {
        for action in self.actions.values_mut() {
            if let Err(e) = action.stream_removed(&self.resources, factory, stream) {
                warn!(action = %action.id(), ?e, "Failed to unlink removed stream");
            }
        }
    }

    fn handle_position_tick(&mut self, generation: u64) {
        if !self.listener.is_current(generation) || !self.listener.should_run(self.state) {
            return;
        }
        // Transient failures while the graph is in flux are expected
        match self.get_position() {
            Ok(position) => self.emit(PipelineEvent::Position(position)),
            Err(e) => debug!(?e, "Position query failed"),
        }
    }

    fn handle_watchdog(&mut self, generation: u64, target: PipelineState) {
        if !self.watchdog.is_current(generation) {
            return;
        }
        self.watchdog.disarm();
        let reached = self.engine.state(std::time::Duration::ZERO);
        if reached >= target {
            return;
        }
        warn!(pipeline = %self.id, %target, %reached, "State change stalled");
        self.handle_error(
            format!("state change to {} timed out", target),
            Some(format!("graph stuck in {}", reached)),
        );
    }
}
