// SPDX-License-Identifier: GPL-3.0-only

//! Error recovery
//!
//! ```text
//!   NotRecovering ──fatal error──► StartedRecovering ──prerolled──► SeekedAfterRecovering
//!         ▲                         (graph Null → Paused)            (seek to last position)
//!         └──────────────────────────── seek confirmed ◄───────────────────┘
//! ```
//!
//! Each error bumps the attempt counter; it clears once a recovery completes.
//! When the counter exceeds the configured maximum the pipeline gives up for
//! good. A watchdog turns async state changes that never settle into errors.

use crate::engine::{BusMessage, BusSender, PipelineState};
use serde::Serialize;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum RecoveryState {
    #[default]
    NotRecovering,
    StartedRecovering,
    SeekedAfterRecovering,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecoveryStep {
    /// Reset the graph and preroll again
    Retry { attempt: u32 },
    /// Attempts exhausted
    GiveUp,
}

#[derive(Debug)]
pub(crate) struct Recovery {
    state: RecoveryState,
    attempts: u32,
    max_attempts: u32,
    resume_position: u64,
    gave_up: bool,
}

impl Recovery {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            state: RecoveryState::NotRecovering,
            attempts: 0,
            max_attempts,
            resume_position: 0,
            gave_up: false,
        }
    }

    pub fn state(&self) -> RecoveryState {
        self.state
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn gave_up(&self) -> bool {
        self.gave_up
    }

    /// Record a fatal error at `position`
    pub fn start(&mut self, position: u64) -> RecoveryStep {
        self.attempts += 1;
        if self.gave_up || self.attempts > self.max_attempts {
            self.gave_up = true;
            self.state = RecoveryState::NotRecovering;
            return RecoveryStep::GiveUp;
        }
        // A failure mid-recovery keeps the original resume point
        if self.state == RecoveryState::NotRecovering {
            self.resume_position = position;
        }
        self.state = RecoveryState::StartedRecovering;
        RecoveryStep::Retry {
            attempt: self.attempts,
        }
    }

    /// Position to seek back to once the reset graph prerolled
    pub fn resume_position(&self) -> Option<u64> {
        (self.state == RecoveryState::StartedRecovering).then_some(self.resume_position)
    }

    /// The engine accepted the seek back to the resume position
    pub fn seek_issued(&mut self) {
        if self.state == RecoveryState::StartedRecovering {
            self.state = RecoveryState::SeekedAfterRecovering;
        }
    }

    /// The engine confirmed the seek back; returns true when that finished a recovery
    pub fn seek_done(&mut self) -> bool {
        if self.state != RecoveryState::SeekedAfterRecovering {
            return false;
        }
        self.finish();
        true
    }

    /// Recovery succeeded; the attempt counter starts over
    pub fn finish(&mut self) {
        self.state = RecoveryState::NotRecovering;
        self.attempts = 0;
    }
}

/// One-shot timer flagging async state changes that never complete
#[derive(Debug, Default)]
pub(crate) struct StateWatchdog {
    generation: u64,
    target: Option<PipelineState>,
    task: Option<JoinHandle<()>>,
}

impl StateWatchdog {
    pub fn arm(&mut self, target: PipelineState, window: Duration, bus: &BusSender) {
        self.disarm();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(%target, "No async runtime, state change watchdog disabled");
            return;
        };
        let generation = self.generation;
        let bus = bus.clone();
        self.target = Some(target);
        self.task = Some(runtime.spawn(async move {
            tokio::time::sleep(window).await;
            let _ = bus.send(BusMessage::StateWatchdog { generation, target });
        }));
        debug!(%target, window_ms = window.as_millis() as u64, "State watchdog armed");
    }

    pub fn disarm(&mut self) {
        self.generation += 1;
        self.target = None;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// Target the armed watchdog waits for
    pub fn target(&self) -> Option<PipelineState> {
        self.target
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.target.is_some() && generation == self.generation
    }
}

impl Drop for StateWatchdog {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_recovery_clears_attempts() {
        let mut recovery = Recovery::new(3);
        assert_eq!(recovery.start(42), RecoveryStep::Retry { attempt: 1 });
        assert_eq!(recovery.state(), RecoveryState::StartedRecovering);
        assert!(!recovery.seek_done(), "Not seeked yet");

        assert_eq!(recovery.resume_position(), Some(42));
        assert_eq!(recovery.state(), RecoveryState::StartedRecovering);
        recovery.seek_issued();
        assert_eq!(recovery.state(), RecoveryState::SeekedAfterRecovering);
        assert!(recovery.seek_done());
        assert_eq!(recovery.attempts(), 0);
        assert_eq!(recovery.resume_position(), None);
    }

    #[test]
    fn test_gives_up_after_max_attempts() {
        let mut recovery = Recovery::new(3);
        for attempt in 1..=3 {
            assert_eq!(recovery.start(10), RecoveryStep::Retry { attempt });
        }
        assert_eq!(recovery.start(10), RecoveryStep::GiveUp);
        assert!(recovery.gave_up());
        assert_eq!(recovery.start(10), RecoveryStep::GiveUp);
    }

    #[test]
    fn test_retry_keeps_first_resume_point() {
        let mut recovery = Recovery::new(3);
        recovery.start(500);
        recovery.start(0);
        assert_eq!(recovery.resume_position(), Some(500));
    }

    #[test]
    fn test_failed_seek_back_keeps_counting() {
        let mut recovery = Recovery::new(2);
        recovery.start(500);
        // The seek back was never issued, so the next error is another attempt
        assert_eq!(recovery.start(0), RecoveryStep::Retry { attempt: 2 });
        assert!(!recovery.seek_done());
        assert_eq!(recovery.attempts(), 2);
        assert_eq!(recovery.start(0), RecoveryStep::GiveUp);
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_fires_once_armed() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut watchdog = StateWatchdog::default();
        watchdog.arm(PipelineState::Paused, Duration::from_secs(5), &tx);

        let Some(BusMessage::StateWatchdog { generation, target }) = rx.recv().await else {
            panic!("expected a watchdog message");
        };
        assert_eq!(target, PipelineState::Paused);
        assert!(watchdog.is_current(generation));
        watchdog.disarm();
        assert!(!watchdog.is_current(generation));
    }
}
