// SPDX-License-Identifier: GPL-3.0-only

//! Montage - resource graph, action and playback core for a non-linear video editor
//!
//! A [`Pipeline`] owns one media-processing graph. Sources and sinks are
//! described by [`ObjectFactory`] values; [`Action`]s say which producers feed
//! which consumers, and the [`resources`] table turns that into shared,
//! reference-counted graph fragments (bins, tees, queues).
//!
//! # Architecture
//!
//! ```text
//!   Actioner (Renderer / Previewer)
//!        │ builds, activates
//!        ▼
//!   Pipeline ──owns──► Actions ──realize links──► SharedResources
//!        │                                              │
//!        └───────────────── GraphEngine ◄───────────────┘
//!                     (backends::memory / backends::gstreamer)
//! ```
//!
//! # Modules
//!
//! - [`action`]: producer/consumer sets, link policies and activation
//! - [`actioner`]: render and preview front ends
//! - [`backends`]: graph engine implementations
//! - [`config`]: user configuration handling
//! - [`engine`]: the engine seam and its message types
//! - [`pipeline`]: state control, seeking, bus dispatch and error recovery
//! - [`resources`]: the shared bin/tee/queue table

pub mod action;
pub mod actioner;
pub mod backends;
pub mod config;
pub mod constants;
pub mod engine;
pub mod errors;
pub mod events;
pub mod factory;
pub mod pipeline;
pub mod resources;
pub mod stream;

// Re-export commonly used types
pub use action::{Action, ActionId, ActionKind, ActionState, Link};
pub use actioner::{Actioner, ActionerEvent, Previewer, Renderer};
pub use config::Config;
pub use constants::BitratePreset;
pub use engine::{GraphEngine, PipelineState};
pub use errors::{EngineError, PipelineError, PipelineResult};
pub use events::PipelineEvent;
pub use factory::{ObjectFactory, RenderSettings};
pub use pipeline::{Pipeline, PipelineId, RecoveryState};
pub use stream::StreamDescriptor;
