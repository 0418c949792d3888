// SPDX-License-Identifier: GPL-3.0-only

//! Graph engine backends
//!
//! Implementations of [`GraphEngine`](crate::engine::GraphEngine), the seam
//! between the resource table and an actual media framework:
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │        Pipeline / Actions / Resources        │
//! └────────────────────┬────────────────────────┘
//!                      │ GraphEngine
//! ┌────────────────────┴────────────────────────┐
//! │              Backend Layer                   │
//! │  ┌─────────────┐    ┌──────────────────┐   │
//! │  │   Memory    │    │    GStreamer     │   │
//! │  │ (in-process)│    │ (feature gated)  │   │
//! │  └─────────────┘    └──────────────────┘   │
//! │         ElementFactoryCache (registry)      │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`memory`]: bookkeeping-only engine with fault injection, used by tests
//!   and `montage simulate`
//! - [`registry`]: cached element factory availability and encoder selection
//! - `gstreamer`: the real engine, built with the `gstreamer` feature

#[cfg(feature = "gstreamer")]
pub mod gstreamer;
pub mod memory;
pub mod registry;
