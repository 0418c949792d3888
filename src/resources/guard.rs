// SPDX-License-Identifier: GPL-3.0-only

//! Scoped resource references
//!
//! Every successful `acquire_*` on [`SharedResources`](super::SharedResources)
//! yields a [`ResourceGuard`]. Releasing it (explicitly, or by dropping it on an
//! early-return path) gives the reference back to the table exactly once.

use super::ResourceTable;
use crate::engine::ElementId;
use crate::errors::PipelineResult;
use crate::factory::FactoryId;
use crate::stream::StreamDescriptor;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Weak;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Bin,
    Tee,
    Queue,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResourceKind::Bin => "bin",
            ResourceKind::Tee => "tee",
            ResourceKind::Queue => "queue",
        })
    }
}

/// One counted reference on a bin, tee or queue
#[must_use = "dropping a guard releases the reference immediately"]
pub struct ResourceGuard {
    table: Weak<Mutex<ResourceTable>>,
    kind: ResourceKind,
    factory: FactoryId,
    stream: Option<StreamDescriptor>,
    element: ElementId,
    bin: Option<ElementId>,
    released: bool,
}

impl ResourceGuard {
    pub(super) fn new(
        table: Weak<Mutex<ResourceTable>>,
        kind: ResourceKind,
        factory: FactoryId,
        stream: Option<StreamDescriptor>,
        element: ElementId,
        bin: Option<ElementId>,
    ) -> Self {
        Self {
            table,
            kind,
            factory,
            stream,
            element,
            bin,
            released: false,
        }
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn factory(&self) -> FactoryId {
        self.factory
    }

    pub fn stream(&self) -> Option<&StreamDescriptor> {
        self.stream.as_ref()
    }

    /// The bin, tee or queue element this guard references
    pub fn element(&self) -> ElementId {
        self.element
    }

    /// Bin the tee reads from or the queue feeds
    pub fn bin(&self) -> Option<ElementId> {
        self.bin
    }

    /// Give the reference back, reporting table errors
    pub fn release(mut self) -> PipelineResult<()> {
        self.released = true;
        self.give_back()
    }

    fn give_back(&self) -> PipelineResult<()> {
        // Table already gone with its pipeline: nothing left to release
        let Some(table) = self.table.upgrade() else {
            return Ok(());
        };
        let mut table = table.lock();
        let stream = self.stream.as_ref();
        match self.kind {
            ResourceKind::Bin => table.release_bin(self.factory, stream),
            ResourceKind::Tee => table.release_tee(self.factory, stream),
            ResourceKind::Queue => table.release_queue(self.factory, stream),
        }
    }
}

impl Drop for ResourceGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(e) = self.give_back() {
            warn!(kind = %self.kind, factory = %self.factory, ?e, "Failed to release resource on drop");
        }
    }
}

impl fmt::Debug for ResourceGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceGuard")
            .field("kind", &self.kind)
            .field("factory", &self.factory)
            .field("stream", &self.stream)
            .field("element", &self.element)
            .field("released", &self.released)
            .finish()
    }
}
