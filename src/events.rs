// SPDX-License-Identifier: GPL-3.0-only

//! Typed events and handler registration
//!
//! Each component owns a [`Signal`] for its own event enum. Handlers are
//! registered with [`Signal::connect`] and removed with the returned
//! [`HandlerId`]; they run synchronously on the thread that emits, which for
//! the pipeline is the thread draining its bus.

use crate::action::ActionId;
use crate::engine::PipelineState;
use crate::factory::FactoryId;
use crate::stream::StreamDescriptor;
use std::fmt;

/// Events surfaced by the pipeline to orchestration and UI code
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    ActionAdded(ActionId),
    ActionRemoved(ActionId),
    /// An action was activated (`true`) or deactivated (`false`)
    ActionStateChanged { action: ActionId, active: bool },
    FactoryAdded(FactoryId),
    FactoryRemoved(FactoryId),
    StateChanged(PipelineState),
    /// Playback position in nanoseconds
    Position(u64),
    /// New duration in nanoseconds
    DurationChanged(u64),
    /// A stream appeared that no active action linked
    UnhandledStream {
        factory: FactoryId,
        stream: StreamDescriptor,
    },
    Eos,
    Error {
        message: String,
        detail: Option<String>,
    },
    /// Element-specific engine message
    ElementMessage(String),
    /// Recovery gave up; the pipeline must be rebuilt
    Died,
}

impl PipelineEvent {
    /// Stable event name, as used in logs
    pub fn name(&self) -> &'static str {
        match self {
            PipelineEvent::ActionAdded(_) => "action-added",
            PipelineEvent::ActionRemoved(_) => "action-removed",
            PipelineEvent::ActionStateChanged { .. } => "action-state-changed",
            PipelineEvent::FactoryAdded(_) => "factory-added",
            PipelineEvent::FactoryRemoved(_) => "factory-removed",
            PipelineEvent::StateChanged(_) => "state-changed",
            PipelineEvent::Position(_) => "position",
            PipelineEvent::DurationChanged(_) => "duration-changed",
            PipelineEvent::UnhandledStream { .. } => "unhandled-stream",
            PipelineEvent::Eos => "eos",
            PipelineEvent::Error { .. } => "error",
            PipelineEvent::ElementMessage(_) => "element-message",
            PipelineEvent::Died => "died",
        }
    }
}

impl fmt::Display for PipelineEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineEvent::ActionAdded(id) | PipelineEvent::ActionRemoved(id) => {
                write!(f, "{} {}", self.name(), id)
            }
            PipelineEvent::ActionStateChanged { action, active } => {
                write!(f, "{} {} active={}", self.name(), action, active)
            }
            PipelineEvent::FactoryAdded(id) | PipelineEvent::FactoryRemoved(id) => {
                write!(f, "{} {}", self.name(), id)
            }
            PipelineEvent::StateChanged(state) => write!(f, "{} {}", self.name(), state),
            PipelineEvent::Position(ns) | PipelineEvent::DurationChanged(ns) => {
                write!(f, "{} {}ns", self.name(), ns)
            }
            PipelineEvent::UnhandledStream { factory, stream } => {
                write!(f, "{} {} {}", self.name(), factory, stream)
            }
            PipelineEvent::Error { message, detail } => match detail {
                Some(detail) => write!(f, "error: {} ({})", message, detail),
                None => write!(f, "error: {}", message),
            },
            PipelineEvent::ElementMessage(message) => write!(f, "{} {}", self.name(), message),
            PipelineEvent::Eos | PipelineEvent::Died => f.write_str(self.name()),
        }
    }
}

/// Handle returned by [`Signal::connect`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

type Handler<E> = Box<dyn FnMut(&E) + Send>;

/// Ordered list of event handlers
pub struct Signal<E> {
    handlers: Vec<(HandlerId, Handler<E>)>,
    next_id: u64,
}

impl<E> Default for Signal<E> {
    fn default() -> Self {
        Self {
            handlers: Vec::new(),
            next_id: 1,
        }
    }
}

impl<E> Signal<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; handlers run in registration order
    pub fn connect<F>(&mut self, handler: F) -> HandlerId
    where
        F: FnMut(&E) + Send + 'static,
    {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers.push((id, Box::new(handler)));
        id
    }

    /// Unregister a handler; returns false if it was not connected
    pub fn disconnect(&mut self, id: HandlerId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(handler_id, _)| *handler_id != id);
        self.handlers.len() != before
    }

    pub fn emit(&mut self, event: &E) {
        for (_, handler) in self.handlers.iter_mut() {
            handler(event);
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl<E> fmt::Debug for Signal<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}
