// SPDX-License-Identifier: GPL-3.0-only

//! Graph engine abstraction
//!
//! The resource graph never talks to a media framework directly. It drives a
//! [`GraphEngine`], which owns the actual processing graph and hands out opaque
//! element and pad handles.
//!
//! ```text
//!   Pipeline ──calls──► GraphEngine (elements, pads, state, seek, queries)
//!       ▲                    │
//!       └──── BusMessage ◄───┘  (state changes, errors, EOS from engine threads)
//!       ▲                    │
//!       └──── PadEvent ◄─────┘  (pads appearing/disappearing on streaming threads)
//! ```
//!
//! Engines deliver bus messages and pad events from their own threads;
//! implementations must not hold internal locks while invoking the pad
//! observer, because the observer takes the resource table lock. Pad events
//! raised while the table itself is busy (a bin being torn down) come back
//! as [`BusMessage::PadChanged`].

use crate::errors::EngineResult;
use crate::factory::{FactoryId, ObjectFactory};
use crate::stream::StreamDescriptor;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Opaque element handle issued by an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "element#{}", self.0)
    }
}

/// Opaque pad handle issued by an engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PadId(pub u64);

impl fmt::Display for PadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pad#{}", self.0)
    }
}

/// State of the processing graph
///
/// `Null` is the fully stopped state: no resources are allocated by the engine.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub enum PipelineState {
    #[default]
    Null,
    Ready,
    Paused,
    Playing,
}

impl PipelineState {
    /// Next state on the way from `self` towards `target`
    pub fn step_towards(self, target: PipelineState) -> PipelineState {
        use PipelineState::*;
        match self.cmp(&target) {
            std::cmp::Ordering::Less => match self {
                Null => Ready,
                Ready => Paused,
                _ => Playing,
            },
            std::cmp::Ordering::Greater => match self {
                Playing => Paused,
                Paused => Ready,
                _ => Null,
            },
            std::cmp::Ordering::Equal => self,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Null => "null",
            PipelineState::Ready => "ready",
            PipelineState::Paused => "paused",
            PipelineState::Playing => "playing",
        };
        f.write_str(name)
    }
}

/// How the engine accepted a state change request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    /// Completed synchronously
    Success,
    /// Completes later; a `StateChanged`/`AsyncDone` message confirms it
    Async,
    /// Live source, no preroll
    NoPreroll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PadDirection {
    Src,
    Sink,
}

/// A pad as seen by the resource table
#[derive(Debug, Clone, PartialEq)]
pub struct PadInfo {
    pub id: PadId,
    pub name: String,
    pub direction: PadDirection,
    /// Negotiated or template stream shape; `None` when the engine cannot tell
    pub stream: Option<StreamDescriptor>,
}

/// Messages delivered to the thread owning the pipeline
#[derive(Debug, Clone, PartialEq)]
pub enum BusMessage {
    StateChanged {
        old: PipelineState,
        new: PipelineState,
        pending: Option<PipelineState>,
    },
    /// Asynchronous state change or seek completed
    AsyncDone,
    Eos,
    Error {
        message: String,
        debug: Option<String>,
    },
    Warning {
        message: String,
        debug: Option<String>,
    },
    DurationChanged,
    /// Element-specific message, passed through untouched
    Element(String),
    /// A source bin exposed a new stream (posted by pad bridging)
    StreamAdded {
        factory: FactoryId,
        stream: StreamDescriptor,
    },
    /// A source bin dropped a stream (posted by pad bridging)
    StreamRemoved {
        factory: FactoryId,
        stream: StreamDescriptor,
    },
    /// Pad event that arrived while the resource table was locked
    PadChanged(PadEvent),
    /// Position listener timer fired
    PositionTick { generation: u64 },
    /// State watchdog window elapsed
    StateWatchdog {
        generation: u64,
        target: PipelineState,
    },
}

/// Sending half of the pipeline bus
pub type BusSender = tokio::sync::mpsc::UnboundedSender<BusMessage>;

/// Pad appearance notifications, delivered from engine threads
#[derive(Debug, Clone, PartialEq)]
pub enum PadEvent {
    Added { element: ElementId, pad: PadInfo },
    Removed { element: ElementId, pad: PadInfo },
}

/// Callback the engine invokes for every pad event on elements it built
pub type PadObserver = Arc<dyn Fn(PadEvent) + Send + Sync>;

/// Seam between the resource graph and a media-processing engine
pub trait GraphEngine: Send + Sync {
    /// Wire the engine to the pipeline bus and pad bridge; called once at pipeline construction
    fn attach(&self, bus: BusSender, pads: PadObserver);

    // ===== Element creation =====

    /// Build the bin realizing `factory`, restricted to `stream` when given
    fn make_bin(
        &self,
        factory: &ObjectFactory,
        stream: Option<&StreamDescriptor>,
    ) -> EngineResult<ElementId>;

    /// Build a fan-out element with a static sink pad and request source pads
    fn make_tee(&self) -> EngineResult<ElementId>;

    /// Build a buffering element holding up to `buffer` of media
    fn make_queue(&self, buffer: Duration) -> EngineResult<ElementId>;

    // ===== Graph membership =====

    fn add_element(&self, element: ElementId) -> EngineResult<()>;

    /// Remove from the graph and dispose; pads of the element become invalid
    fn remove_element(&self, element: ElementId) -> EngineResult<()>;

    fn set_element_state(&self, element: ElementId, state: PipelineState) -> EngineResult<()>;

    fn sync_state_with_parent(&self, element: ElementId) -> EngineResult<()>;

    // ===== Pads =====

    fn pads(&self, element: ElementId, direction: PadDirection) -> Vec<PadInfo>;

    /// The always-present pad of a tee or queue
    fn static_pad(&self, element: ElementId, direction: PadDirection) -> Option<PadId>;

    /// New source pad on a tee
    fn request_pad(&self, element: ElementId) -> EngineResult<PadId>;

    fn release_request_pad(&self, element: ElementId, pad: PadId) -> EngineResult<()>;

    fn link_pads(&self, src: PadId, sink: PadId) -> EngineResult<()>;

    fn unlink_pads(&self, src: PadId, sink: PadId) -> EngineResult<()>;

    fn peer(&self, pad: PadId) -> Option<PadId>;

    fn pad_parent(&self, pad: PadId) -> Option<ElementId>;

    // ===== Element settings =====

    /// Toggle real-time synchronisation of the sinks inside `element`
    fn set_sync(&self, element: ElementId, sync: bool) -> EngineResult<()>;

    /// Restrict the output shape of a source bin; `None` lifts the restriction
    fn set_output_filter(
        &self,
        element: ElementId,
        filter: Option<&StreamDescriptor>,
    ) -> EngineResult<()>;

    // ===== Graph control =====

    fn set_state(&self, state: PipelineState) -> EngineResult<StateChange>;

    /// Current state, waiting up to `timeout` for a pending transition to settle
    fn state(&self, timeout: Duration) -> PipelineState;

    fn query_position(&self) -> Option<u64>;

    fn query_duration(&self) -> Option<u64>;

    /// Flushing, accurate seek to `position` nanoseconds
    fn seek(&self, position: u64) -> EngineResult<()>;
}
