// SPDX-License-Identifier: GPL-3.0-only

//! Error types for the resource graph core
//!
//! Errors fall into three groups:
//! - usage/contract errors (calling an operation while an action or the graph
//!   is in an incompatible state)
//! - resource-unavailability errors (the requested fragment or link cannot be
//!   formed with the current registrations)
//! - engine/runtime errors reported by the underlying [`GraphEngine`](crate::engine::GraphEngine)
//!
//! None of them are retried automatically.

use crate::engine::{ElementId, PadId, PipelineState};
use thiserror::Error;

/// Result type alias for resource graph operations
pub type PipelineResult<T> = Result<T, PipelineError>;

/// Result type alias for engine backends
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors reported by a graph engine backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// The engine has no element factory with this name
    #[error("element factory not available: {0}")]
    MissingElement(String),
    /// Element handle is not known to the engine
    #[error("unknown element {0}")]
    UnknownElement(ElementId),
    /// Pad handle is not known to the engine
    #[error("unknown pad {0}")]
    UnknownPad(PadId),
    /// Two pads could not be linked or unlinked
    #[error("link failed: {0}")]
    LinkFailed(String),
    /// The engine refused a state transition
    #[error("state change failed: {0}")]
    StateChange(String),
    /// The engine refused a seek request
    #[error("seek rejected: {0}")]
    SeekRejected(String),
    /// Anything else the backend wants to report
    #[error("{0}")]
    Other(String),
}

/// Errors returned by the pipeline, its resource table and actions
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    // ===== Resource table =====
    /// No entry exists and `automake` was false, or no matching pad was found
    #[error("no resource available for {factory} ({stream})")]
    ResourceUnavailable { factory: String, stream: String },
    /// A source bin may only be created while the graph is stopped or ready
    #[error("cannot create a source bin for {factory} while the graph is {state:?}")]
    InvalidState {
        factory: String,
        state: PipelineState,
    },
    /// The last bin reference cannot go while a tee or queue still feeds from it
    #[error("bin of {factory} ({stream}) still has live tee or queue users")]
    ResourceBusy { factory: String, stream: String },
    /// More than one candidate pad matched the requested stream
    #[error("{candidates} pads of {factory} match {stream}, pass an explicit stream")]
    AmbiguousStream {
        factory: String,
        stream: String,
        candidates: usize,
    },
    /// Tees can only be requested for source factories
    #[error("{0} is not a source factory")]
    NotASource(String),
    /// Queues can only be requested for sink factories
    #[error("{0} is not a sink factory")]
    NotASink(String),

    // ===== Actions =====
    /// The action is active and cannot be modified or removed
    #[error("action {0} is active")]
    ActiveAction(String),
    /// The action is already bound to another pipeline
    #[error("action {0} is already attached to another pipeline")]
    AlreadyAttached(String),
    /// The factory cannot play the requested role
    #[error("factory {factory} cannot be used as a {role}")]
    IncompatibleFactory { factory: String, role: &'static str },
    /// The factory does not declare the requested stream
    #[error("factory {factory} has no stream matching {stream}")]
    StreamNotFound { factory: String, stream: String },
    /// Producer and consumer streams do not intersect
    #[error("streams of {producer} and {consumer} are not compatible")]
    IncompatibleStreams { producer: String, consumer: String },
    /// An identical link was already recorded
    #[error("link {producer} -> {consumer} already exists")]
    DuplicateLink { producer: String, consumer: String },
    /// No recorded link matches the removal request
    #[error("no link {producer} -> {consumer}")]
    LinkNotFound { producer: String, consumer: String },
    /// More than one recorded link matches an under-specified removal request
    #[error("{count} links {producer} -> {consumer} match, pass explicit streams")]
    AmbiguousLink {
        producer: String,
        consumer: String,
        count: usize,
    },
    /// The action has no pipeline to realize its links in
    #[error("action {0} is not attached to a pipeline")]
    NoPipeline(String),
    /// The action is attached to a different pipeline than the one it is used with
    #[error("action {0} is attached to another pipeline")]
    NotAttached(String),
    /// A producer or consumer was never registered with the pipeline
    #[error("factory {0} is not registered with the pipeline")]
    UnregisteredFactory(String),
    /// Unknown action handle
    #[error("no action with id {0}")]
    ActionNotFound(String),

    // ===== Engine / runtime =====
    /// The engine reported failure while changing state; the graph was reset to Null
    #[error("failed to change state to {target:?}: {reason}")]
    StateChangeFailed {
        target: PipelineState,
        reason: String,
    },
    /// The engine rejected a seek request
    #[error("seek to {position}ns failed: {reason}")]
    SeekFailed { position: u64, reason: String },
    /// The engine could not answer a position or duration query
    #[error("{0} query unavailable")]
    QueryUnavailable(&'static str),
    /// The pipeline was released and cannot be used anymore
    #[error("pipeline has been released")]
    Released,
    /// Engine failure while building or linking graph fragments
    #[error(transparent)]
    Engine(#[from] EngineError),
}

impl PipelineError {
    /// Whether this error reflects a caller misusing the API
    pub fn is_contract_error(&self) -> bool {
        matches!(
            self,
            PipelineError::InvalidState { .. }
                | PipelineError::ResourceBusy { .. }
                | PipelineError::AmbiguousStream { .. }
                | PipelineError::NotASource(_)
                | PipelineError::NotASink(_)
                | PipelineError::ActiveAction(_)
                | PipelineError::AlreadyAttached(_)
                | PipelineError::IncompatibleFactory { .. }
                | PipelineError::DuplicateLink { .. }
                | PipelineError::LinkNotFound { .. }
                | PipelineError::AmbiguousLink { .. }
                | PipelineError::NoPipeline(_)
                | PipelineError::NotAttached(_)
                | PipelineError::UnregisteredFactory(_)
                | PipelineError::ActionNotFound(_)
                | PipelineError::Released
        )
    }
}

/// Errors while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    /// The config file is not valid JSON for [`Config`](crate::config::Config)
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_classification() {
        assert!(PipelineError::ActiveAction("a".into()).is_contract_error());
        assert!(
            PipelineError::ResourceBusy {
                factory: "f".into(),
                stream: "any".into()
            }
            .is_contract_error()
        );
        assert!(!PipelineError::QueryUnavailable("position").is_contract_error());
        assert!(
            !PipelineError::ResourceUnavailable {
                factory: "f".into(),
                stream: "any".into()
            }
            .is_contract_error()
        );
    }

    #[test]
    fn test_engine_error_converts() {
        let err: PipelineError = EngineError::MissingElement("x264enc".into()).into();
        assert_eq!(
            err.to_string(),
            "element factory not available: x264enc"
        );
    }
}
