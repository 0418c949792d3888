// SPDX-License-Identifier: GPL-3.0-only

//! Position listener
//!
//! A repeating timer posting [`BusMessage::PositionTick`] onto the pipeline
//! bus. The timer only runs while the graph plays (or is paused, in forced
//! mode); every (re)arm bumps a generation counter and ticks from an older
//! generation are ignored, so nothing fires after a cancel.

use crate::engine::{BusMessage, BusSender, PipelineState};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug)]
pub(crate) struct PositionListener {
    enabled: bool,
    interval: Duration,
    /// Also tick while paused, for frame redraws
    force: bool,
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl PositionListener {
    pub fn new(interval: Duration) -> Self {
        Self {
            enabled: false,
            interval,
            force: false,
            generation: 0,
            task: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.is_some()
    }

    pub fn enable(&mut self, interval: Duration, force: bool) {
        let changed = !self.enabled || self.interval != interval || self.force != force;
        self.enabled = true;
        self.interval = interval;
        self.force = force;
        if changed {
            self.cancel();
        }
    }

    pub fn disable(&mut self) {
        self.enabled = false;
        self.cancel();
    }

    /// Whether the listener should tick while the graph is in `state`
    pub fn should_run(&self, state: PipelineState) -> bool {
        self.enabled
            && (state == PipelineState::Playing || (self.force && state == PipelineState::Paused))
    }

    /// Start or stop the timer to match `state`
    pub fn reschedule(&mut self, state: PipelineState, bus: &BusSender) {
        match (self.should_run(state), self.task.is_some()) {
            (true, false) => self.start(bus),
            (false, true) => self.cancel(),
            _ => {}
        }
    }

    /// Whether a tick of `generation` comes from the live timer
    pub fn is_current(&self, generation: u64) -> bool {
        self.task.is_some() && generation == self.generation
    }

    fn start(&mut self, bus: &BusSender) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime, position listener cannot run");
            return;
        };
        self.generation += 1;
        let generation = self.generation;
        let period = self.interval;
        let bus = bus.clone();
        debug!(generation, interval_ms = period.as_millis() as u64, "Position listener started");
        self.task = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if bus.send(BusMessage::PositionTick { generation }).is_err() {
                    break;
                }
            }
        }));
    }

    fn cancel(&mut self) {
        self.generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
            debug!(generation = self.generation, "Position listener stopped");
        }
    }
}

impl Drop for PositionListener {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_runs_only_while_playing_unless_forced() {
        let mut listener = PositionListener::new(Duration::from_millis(300));
        assert!(!listener.should_run(PipelineState::Playing));

        listener.enable(Duration::from_millis(300), false);
        assert!(listener.should_run(PipelineState::Playing));
        assert!(!listener.should_run(PipelineState::Paused));

        listener.enable(Duration::from_millis(300), true);
        assert!(listener.should_run(PipelineState::Paused));
        assert!(!listener.should_run(PipelineState::Ready));
    }

    #[test]
    fn test_no_runtime_leaves_timer_stopped() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut listener = PositionListener::new(Duration::from_millis(10));
        listener.enable(Duration::from_millis(10), false);
        listener.reschedule(PipelineState::Playing, &tx);
        assert!(!listener.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_stop_after_cancel() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut listener = PositionListener::new(Duration::from_millis(100));
        listener.enable(Duration::from_millis(100), false);
        listener.reschedule(PipelineState::Playing, &tx);
        assert!(listener.is_running());

        let Some(BusMessage::PositionTick { generation }) = rx.recv().await else {
            panic!("expected a position tick");
        };
        assert!(listener.is_current(generation));

        listener.reschedule(PipelineState::Paused, &tx);
        assert!(!listener.is_running());
        assert!(!listener.is_current(generation));
    }
}
