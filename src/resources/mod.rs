// SPDX-License-Identifier: GPL-3.0-only

//! Resource table
//!
//! Maps logical (factory, stream) identities to the physical fragments built
//! for them. Every row owns up to three independently counted resources:
//!
//! ```text
//!   FactoryEntry (per factory)
//!     └── StreamEntry (per stream)          parent ──► StreamEntry owning the bin
//!           ├── bin    + bin_use_count      (graph fragment realizing the factory)
//!           ├── tee    + tee_use_count      (fan-out, sources only)
//!           └── queue  + queue_use_count    (buffer in front of a sink)
//! ```
//!
//! Rows live in an arena and refer to each other by [`StreamEntryId`]; there
//! are no owning back-references. A tee or queue holds exactly one reference
//! on the bin it is attached to, taken at creation and given back when its own
//! count returns to zero. Streams of timelines and multi-input sinks share one
//! bin: their rows are children of the row that owns the bin.
//!
//! The table is shared with the engine's pad callbacks through
//! [`SharedResources`], so every access goes through one mutex.

mod guard;

pub use guard::{ResourceGuard, ResourceKind};

use crate::engine::{
    BusMessage, BusSender, ElementId, GraphEngine, PadDirection, PadEvent, PadId, PadInfo,
    PadObserver, PipelineState,
};
use crate::errors::{EngineError, PipelineError, PipelineResult};
use crate::factory::{FactoryId, ObjectFactory};
use crate::stream::{StreamDescriptor, describe};
use parking_lot::{Mutex, MutexGuard};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

/// Stable arena index of a stream row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StreamEntryId(usize);

#[derive(Debug)]
struct TeeSlot {
    element: ElementId,
    /// Bin pad feeding the tee
    upstream: PadId,
    use_count: usize,
}

#[derive(Debug)]
struct QueueSlot {
    element: ElementId,
    /// Bin pad the queue feeds
    downstream: PadId,
    use_count: usize,
}

#[derive(Debug)]
struct StreamEntry {
    factory: FactoryId,
    stream: Option<StreamDescriptor>,
    parent: Option<StreamEntryId>,
    bin: Option<ElementId>,
    bin_use_count: usize,
    tee: Option<TeeSlot>,
    queue: Option<QueueSlot>,
}

#[derive(Debug)]
struct FactoryEntry {
    factory: Arc<ObjectFactory>,
    streams: Vec<StreamEntryId>,
}

/// Use counts of one (factory, stream) row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamUsage {
    /// References on the bin the row resolves to
    pub bin: usize,
    pub tee: usize,
    pub queue: usize,
}

/// Read-only view of one row, for diagnostics
#[derive(Debug, Clone)]
pub struct StreamSnapshot {
    pub factory: String,
    pub stream: Option<StreamDescriptor>,
    pub child: bool,
    pub bin: Option<ElementId>,
    pub usage: StreamUsage,
}

impl fmt::Display for StreamSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{} [{}] bin={} tee={} queue={}",
            if self.child { "  └ " } else { "" },
            self.factory,
            describe(self.stream.as_ref()),
            self.usage.bin,
            self.usage.tee,
            self.usage.queue
        )
    }
}

pub struct ResourceTable {
    engine: Arc<dyn GraphEngine>,
    factories: BTreeMap<FactoryId, FactoryEntry>,
    entries: BTreeMap<StreamEntryId, StreamEntry>,
    next_entry: usize,
    /// Bins registered for pad notifications
    bins: HashMap<ElementId, StreamEntryId>,
    /// Output restrictions applied to source bins
    filters: HashMap<FactoryId, StreamDescriptor>,
}

impl ResourceTable {
    pub fn new(engine: Arc<dyn GraphEngine>) -> Self {
        Self {
            engine,
            factories: BTreeMap::new(),
            entries: BTreeMap::new(),
            next_entry: 0,
            bins: HashMap::new(),
            filters: HashMap::new(),
        }
    }

    // ===== Lookup =====

    fn factory_name(&self, factory: FactoryId) -> String {
        self.factories
            .get(&factory)
            .map_or_else(|| factory.to_string(), |f| f.factory.name().to_string())
    }

    fn unavailable(&self, factory: FactoryId, stream: Option<&StreamDescriptor>) -> PipelineError {
        PipelineError::ResourceUnavailable {
            factory: self.factory_name(factory),
            stream: describe(stream),
        }
    }

    /// Row for (factory, stream)
    ///
    /// `None` prefers the catch-all row and otherwise falls back to the one
    /// bin the factory has, if it has exactly one. A concrete stream matches
    /// rows whose stream is name-compatible, preferring an identical descriptor.
    fn find_entry(
        &self,
        factory: FactoryId,
        stream: Option<&StreamDescriptor>,
    ) -> Option<StreamEntryId> {
        let rows = &self.factories.get(&factory)?.streams;
        let Some(stream) = stream else {
            return self.catch_all_entry(factory).or_else(|| {
                match self.bin_owners(factory).as_slice() {
                    [single] => Some(*single),
                    _ => None,
                }
            });
        };

        let mut compatible = None;
        for id in rows {
            let Some(row_stream) = self.entries.get(id).and_then(|e| e.stream.as_ref()) else {
                continue;
            };
            if row_stream == stream {
                return Some(*id);
            }
            if compatible.is_none() && row_stream.is_compatible_with_name(stream) {
                compatible = Some(*id);
            }
        }
        compatible
    }

    /// The row created for `None`, if any
    fn catch_all_entry(&self, factory: FactoryId) -> Option<StreamEntryId> {
        self.factories
            .get(&factory)?
            .streams
            .iter()
            .copied()
            .find(|id| self.entries.get(id).is_some_and(|e| e.stream.is_none()))
    }

    /// Distinct rows owning a bin of `factory`
    fn bin_owners(&self, factory: FactoryId) -> Vec<StreamEntryId> {
        let Some(factory_entry) = self.factories.get(&factory) else {
            return Vec::new();
        };
        let mut owners: Vec<StreamEntryId> = factory_entry
            .streams
            .iter()
            .filter_map(|id| self.bin_entry(*id))
            .collect();
        owners.sort();
        owners.dedup();
        owners
    }

    /// Like [`Self::find_entry`], but a concrete stream of a factory whose
    /// catch-all bin already exists gets a child row under that bin
    fn resolve_entry(
        &mut self,
        factory: &Arc<ObjectFactory>,
        stream: Option<&StreamDescriptor>,
    ) -> Option<StreamEntryId> {
        if let Some(id) = self.find_entry(factory.id(), stream) {
            return Some(id);
        }
        let stream = stream?;
        let root = self.catch_all_entry(factory.id())?;
        self.bin_entry(root)?;
        Some(self.create_entry(factory, Some(stream.clone()), Some(root)))
    }

    /// Row owning the bin `id` resolves to, following parent links
    fn bin_entry(&self, id: StreamEntryId) -> Option<StreamEntryId> {
        let mut current = id;
        loop {
            let entry = self.entries.get(&current)?;
            if entry.bin.is_some() {
                return Some(current);
            }
            current = entry.parent?;
        }
    }

    fn create_entry(
        &mut self,
        factory: &Arc<ObjectFactory>,
        stream: Option<StreamDescriptor>,
        parent: Option<StreamEntryId>,
    ) -> StreamEntryId {
        let id = StreamEntryId(self.next_entry);
        self.next_entry += 1;
        self.entries.insert(
            id,
            StreamEntry {
                factory: factory.id(),
                stream,
                parent,
                bin: None,
                bin_use_count: 0,
                tee: None,
                queue: None,
            },
        );
        self.factories
            .entry(factory.id())
            .or_insert_with(|| FactoryEntry {
                factory: factory.clone(),
                streams: Vec::new(),
            })
            .streams
            .push(id);
        id
    }

    fn delete_entry(&mut self, id: StreamEntryId) {
        let Some(entry) = self.entries.remove(&id) else {
            return;
        };
        let emptied = match self.factories.get_mut(&entry.factory) {
            Some(factory_entry) => {
                factory_entry.streams.retain(|row| *row != id);
                factory_entry.streams.is_empty()
            }
            None => false,
        };
        if emptied {
            self.factories.remove(&entry.factory);
            debug!(factory = %entry.factory, "Removed factory entry");
        }
    }

    fn children(&self, id: StreamEntryId) -> Vec<StreamEntryId> {
        self.entries
            .iter()
            .filter(|(_, e)| e.parent == Some(id))
            .map(|(child, _)| *child)
            .collect()
    }

    /// Whether the bin owned by `id` still feeds or is fed by a tee or queue
    fn has_live_users(&self, id: StreamEntryId) -> bool {
        std::iter::once(id)
            .chain(self.children(id))
            .filter_map(|row| self.entries.get(&row))
            .any(|e| e.tee.is_some() || e.queue.is_some())
    }

    // ===== Bins =====

    /// Shared bin for (factory, stream), built on first use when `automake` is set
    pub fn get_or_create_bin(
        &mut self,
        factory: &Arc<ObjectFactory>,
        stream: Option<&StreamDescriptor>,
        automake: bool,
    ) -> PipelineResult<ElementId> {
        let existing = self
            .resolve_entry(factory, stream)
            .and_then(|id| self.bin_entry(id))
            .or_else(|| {
                // Bundled streams share the catch-all bin
                if factory.bundles_streams() {
                    self.catch_all_entry(factory.id())
                        .and_then(|id| self.bin_entry(id))
                } else {
                    None
                }
            });

        if let Some(id) = existing {
            if let Some(entry) = self.entries.get_mut(&id) {
                if let Some(bin) = entry.bin {
                    entry.bin_use_count += 1;
                    debug!(
                        factory = factory.name(),
                        stream = %describe(stream),
                        count = entry.bin_use_count,
                        "Reusing bin"
                    );
                    return Ok(bin);
                }
            }
        }

        if !automake {
            return Err(self.unavailable(factory.id(), stream));
        }
        if stream.is_none() {
            // One bin per stream already: a catch-all request cannot pick
            let owners = self.bin_owners(factory.id()).len();
            if owners > 1 {
                return Err(PipelineError::AmbiguousStream {
                    factory: factory.name().to_string(),
                    stream: describe(None),
                    candidates: owners,
                });
            }
        }

        let stream = if factory.bundles_streams() {
            None
        } else {
            stream
        };
        self.create_bin(factory, stream)
    }

    fn create_bin(
        &mut self,
        factory: &Arc<ObjectFactory>,
        stream: Option<&StreamDescriptor>,
    ) -> PipelineResult<ElementId> {
        if factory.is_source() {
            let state = self.engine.state(Duration::ZERO);
            if state > PipelineState::Ready {
                return Err(PipelineError::InvalidState {
                    factory: factory.name().to_string(),
                    state,
                });
            }
        }

        let bin = self.engine.make_bin(factory, stream)?;
        if let Err(e) = self
            .engine
            .add_element(bin)
            .and_then(|_| self.engine.sync_state_with_parent(bin))
        {
            self.discard_element(bin);
            return Err(e.into());
        }
        if let Some(filter) = self.filters.get(&factory.id()) {
            if let Err(e) = self.engine.set_output_filter(bin, Some(filter)) {
                warn!(factory = factory.name(), ?e, "Failed to apply source filter");
            }
        }

        let id = self.create_entry(factory, stream.cloned(), None);
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.bin = Some(bin);
            entry.bin_use_count = 1;
        }
        self.bins.insert(bin, id);

        if factory.bundles_streams() {
            let declared: Vec<StreamDescriptor> =
                factory.streams().into_iter().cloned().collect();
            for declared_stream in declared {
                if stream != Some(&declared_stream) {
                    self.create_entry(factory, Some(declared_stream), Some(id));
                }
            }
        }

        info!(
            factory = factory.name(),
            stream = %describe(stream),
            element = %bin,
            "Created bin"
        );
        Ok(bin)
    }

    /// Give back one bin reference
    ///
    /// Fails with [`PipelineError::ResourceBusy`] when this is the last
    /// reference and a tee or queue still hangs off the bin.
    pub fn release_bin(
        &mut self,
        factory: FactoryId,
        stream: Option<&StreamDescriptor>,
    ) -> PipelineResult<()> {
        let id = self
            .find_entry(factory, stream)
            .and_then(|id| self.bin_entry(id))
            .or_else(|| {
                self.catch_all_entry(factory)
                    .and_then(|id| self.bin_entry(id))
            })
            .ok_or_else(|| self.unavailable(factory, stream))?;
        self.drop_bin_ref(id, stream)
    }

    fn drop_bin_ref(
        &mut self,
        id: StreamEntryId,
        stream: Option<&StreamDescriptor>,
    ) -> PipelineResult<()> {
        let Some(entry) = self.entries.get(&id) else {
            return Err(PipelineError::ResourceUnavailable {
                factory: "unknown".into(),
                stream: describe(stream),
            });
        };
        let factory = entry.factory;
        if entry.bin_use_count == 0 {
            return Err(self.unavailable(factory, stream));
        }
        if entry.bin_use_count == 1 && self.has_live_users(id) {
            return Err(PipelineError::ResourceBusy {
                factory: self.factory_name(factory),
                stream: describe(stream),
            });
        }

        let remaining = match self.entries.get_mut(&id) {
            Some(entry) => {
                entry.bin_use_count -= 1;
                entry.bin_use_count
            }
            None => 0,
        };
        if remaining > 0 {
            debug!(factory = %factory, stream = %describe(stream), count = remaining, "Released bin reference");
            return Ok(());
        }
        self.destroy_bin(id);
        Ok(())
    }

    fn destroy_bin(&mut self, id: StreamEntryId) {
        let Some(bin) = self.entries.get_mut(&id).and_then(|e| e.bin.take()) else {
            return;
        };
        self.bins.remove(&bin);
        self.discard_element(bin);

        for child in self.children(id) {
            self.delete_entry(child);
        }
        let factory = self.entries.get(&id).map(|e| e.factory);
        self.delete_entry(id);
        if let Some(factory) = factory {
            info!(factory = %self.factory_name(factory), element = %bin, "Removed bin");
        }
    }

    fn discard_element(&self, element: ElementId) {
        if let Err(e) = self.engine.set_element_state(element, PipelineState::Null) {
            warn!(element = %element, ?e, "Failed to stop element");
        }
        if let Err(e) = self.engine.remove_element(element) {
            warn!(element = %element, ?e, "Failed to remove element");
        }
    }

    /// The single pad of `bin` carrying `stream`
    fn select_pad(
        &self,
        factory: FactoryId,
        bin: ElementId,
        direction: PadDirection,
        stream: Option<&StreamDescriptor>,
    ) -> PipelineResult<PadId> {
        let pads = self.engine.pads(bin, direction);
        if let Some(stream) = stream {
            let exact: Vec<&PadInfo> = pads
                .iter()
                .filter(|p| p.stream.as_ref() == Some(stream))
                .collect();
            if exact.len() == 1 {
                return Ok(exact[0].id);
            }
        }

        let candidates: Vec<&PadInfo> = pads
            .iter()
            .filter(|p| match (stream, p.stream.as_ref()) {
                (None, _) => true,
                (Some(wanted), Some(offered)) => wanted.is_compatible(offered),
                (Some(_), None) => false,
            })
            .collect();

        match candidates.as_slice() {
            [] => Err(self.unavailable(factory, stream)),
            [pad] => Ok(pad.id),
            many => Err(PipelineError::AmbiguousStream {
                factory: self.factory_name(factory),
                stream: describe(stream),
                candidates: many.len(),
            }),
        }
    }

    fn bin_of(&self, id: StreamEntryId) -> Option<(StreamEntryId, ElementId)> {
        let owner = self.bin_entry(id)?;
        let bin = self.entries.get(&owner)?.bin?;
        Some((owner, bin))
    }

    // ===== Tees =====

    /// Shared fan-out for a source stream
    pub fn get_or_create_tee(
        &mut self,
        factory: &Arc<ObjectFactory>,
        stream: Option<&StreamDescriptor>,
        automake: bool,
    ) -> PipelineResult<ElementId> {
        if !factory.is_source() {
            return Err(PipelineError::NotASource(factory.name().to_string()));
        }

        if let Some(id) = self.find_entry(factory.id(), stream) {
            if let Some(tee) = self.entries.get_mut(&id).and_then(|e| e.tee.as_mut()) {
                tee.use_count += 1;
                debug!(factory = factory.name(), stream = %describe(stream), count = tee.use_count, "Reusing tee");
                return Ok(tee.element);
            }
        }

        if !automake {
            return Err(self.unavailable(factory.id(), stream));
        }

        // The tee's own reference on its bin
        self.get_or_create_bin(factory, stream, true)?;
        let result = self.attach_tee(factory, stream);
        if result.is_err() {
            self.rollback_bin_ref(factory, stream);
        }
        result
    }

    fn attach_tee(
        &mut self,
        factory: &Arc<ObjectFactory>,
        stream: Option<&StreamDescriptor>,
    ) -> PipelineResult<ElementId> {
        let id = self
            .resolve_entry(factory, stream)
            .ok_or_else(|| self.unavailable(factory.id(), stream))?;
        let (_, bin) = self
            .bin_of(id)
            .ok_or_else(|| self.unavailable(factory.id(), stream))?;
        let upstream = self.select_pad(factory.id(), bin, PadDirection::Src, stream)?;

        let tee = self.engine.make_tee()?;
        let linked = self
            .engine
            .add_element(tee)
            .and_then(|_| self.engine.sync_state_with_parent(tee))
            .and_then(|_| {
                self.engine
                    .static_pad(tee, PadDirection::Sink)
                    .ok_or_else(|| EngineError::LinkFailed("tee has no sink pad".into()))
            })
            .and_then(|sink| self.engine.link_pads(upstream, sink));
        if let Err(e) = linked {
            self.discard_element(tee);
            return Err(e.into());
        }

        if let Some(entry) = self.entries.get_mut(&id) {
            entry.tee = Some(TeeSlot {
                element: tee,
                upstream,
                use_count: 1,
            });
        }
        info!(factory = factory.name(), stream = %describe(stream), element = %tee, "Created tee");
        Ok(tee)
    }

    fn rollback_bin_ref(&mut self, factory: &Arc<ObjectFactory>, stream: Option<&StreamDescriptor>) {
        if let Err(e) = self.release_bin(factory.id(), stream) {
            warn!(factory = factory.name(), ?e, "Failed to roll back bin reference");
        }
    }

    /// Give back one tee reference; at zero the tee is unlinked and removed
    pub fn release_tee(
        &mut self,
        factory: FactoryId,
        stream: Option<&StreamDescriptor>,
    ) -> PipelineResult<()> {
        let id = self
            .find_entry(factory, stream)
            .filter(|id| self.entries.get(id).is_some_and(|e| e.tee.is_some()))
            .ok_or_else(|| self.unavailable(factory, stream))?;

        let Some(entry) = self.entries.get_mut(&id) else {
            return Err(self.unavailable(factory, stream));
        };
        let Some(slot) = entry.tee.as_mut() else {
            return Err(self.unavailable(factory, stream));
        };
        slot.use_count -= 1;
        if slot.use_count > 0 {
            debug!(factory = %factory, stream = %describe(stream), count = slot.use_count, "Released tee reference");
            return Ok(());
        }
        let Some(slot) = entry.tee.take() else {
            return Ok(());
        };

        if let Some(sink) = self.engine.static_pad(slot.element, PadDirection::Sink) {
            if let Err(e) = self.engine.unlink_pads(slot.upstream, sink) {
                warn!(element = %slot.element, ?e, "Failed to unlink tee");
            }
        }
        for pad in self.engine.pads(slot.element, PadDirection::Src) {
            if let Some(peer) = self.engine.peer(pad.id) {
                if let Err(e) = self.engine.unlink_pads(pad.id, peer) {
                    warn!(element = %slot.element, pad = %pad.name, ?e, "Failed to unlink tee output");
                }
            }
            if let Err(e) = self.engine.release_request_pad(slot.element, pad.id) {
                warn!(element = %slot.element, pad = %pad.name, ?e, "Failed to release tee request pad");
            }
        }
        self.discard_element(slot.element);
        info!(factory = %self.factory_name(factory), stream = %describe(stream), element = %slot.element, "Removed tee");

        let owner = self
            .bin_entry(id)
            .ok_or_else(|| self.unavailable(factory, stream))?;
        self.drop_bin_ref(owner, stream)
    }

    // ===== Queues =====

    /// Shared buffer in front of a sink stream, holding up to `buffer` of media
    pub fn get_or_create_queue(
        &mut self,
        factory: &Arc<ObjectFactory>,
        stream: Option<&StreamDescriptor>,
        automake: bool,
        buffer: Duration,
    ) -> PipelineResult<ElementId> {
        if !factory.is_sink() {
            return Err(PipelineError::NotASink(factory.name().to_string()));
        }

        if let Some(id) = self.find_entry(factory.id(), stream) {
            if let Some(queue) = self.entries.get_mut(&id).and_then(|e| e.queue.as_mut()) {
                queue.use_count += 1;
                debug!(factory = factory.name(), stream = %describe(stream), count = queue.use_count, "Reusing queue");
                return Ok(queue.element);
            }
        }

        if !automake {
            return Err(self.unavailable(factory.id(), stream));
        }

        // The queue's own reference on its bin
        self.get_or_create_bin(factory, stream, true)?;
        let result = self.attach_queue(factory, stream, buffer);
        if result.is_err() {
            self.rollback_bin_ref(factory, stream);
        }
        result
    }

    fn attach_queue(
        &mut self,
        factory: &Arc<ObjectFactory>,
        stream: Option<&StreamDescriptor>,
        buffer: Duration,
    ) -> PipelineResult<ElementId> {
        let id = self
            .resolve_entry(factory, stream)
            .ok_or_else(|| self.unavailable(factory.id(), stream))?;
        let (_, bin) = self
            .bin_of(id)
            .ok_or_else(|| self.unavailable(factory.id(), stream))?;
        let downstream = self.select_pad(factory.id(), bin, PadDirection::Sink, stream)?;

        let queue = self.engine.make_queue(buffer)?;
        let linked = self
            .engine
            .add_element(queue)
            .and_then(|_| self.engine.sync_state_with_parent(queue))
            .and_then(|_| {
                self.engine
                    .static_pad(queue, PadDirection::Src)
                    .ok_or_else(|| EngineError::LinkFailed("queue has no source pad".into()))
            })
            .and_then(|src| self.engine.link_pads(src, downstream));
        if let Err(e) = linked {
            self.discard_element(queue);
            return Err(e.into());
        }

        if let Some(entry) = self.entries.get_mut(&id) {
            entry.queue = Some(QueueSlot {
                element: queue,
                downstream,
                use_count: 1,
            });
        }
        info!(
            factory = factory.name(),
            stream = %describe(stream),
            element = %queue,
            buffer_ms = buffer.as_millis() as u64,
            "Created queue"
        );
        Ok(queue)
    }

    /// Give back one queue reference
    ///
    /// At zero: stops the sink bin (unless another queue still feeds it),
    /// unlinks queue -> sink and tee -> queue (releasing the tee's request pad)
    /// and removes the queue.
    pub fn release_queue(
        &mut self,
        factory: FactoryId,
        stream: Option<&StreamDescriptor>,
    ) -> PipelineResult<()> {
        let id = self
            .find_entry(factory, stream)
            .filter(|id| self.entries.get(id).is_some_and(|e| e.queue.is_some()))
            .ok_or_else(|| self.unavailable(factory, stream))?;

        let Some(entry) = self.entries.get_mut(&id) else {
            return Err(self.unavailable(factory, stream));
        };
        let Some(slot) = entry.queue.as_mut() else {
            return Err(self.unavailable(factory, stream));
        };
        slot.use_count -= 1;
        if slot.use_count > 0 {
            debug!(factory = %factory, stream = %describe(stream), count = slot.use_count, "Released queue reference");
            return Ok(());
        }
        let Some(slot) = entry.queue.take() else {
            return Ok(());
        };

        let (owner, bin) = self
            .bin_of(id)
            .ok_or_else(|| self.unavailable(factory, stream))?;
        if !self.has_live_users(owner) {
            if let Err(e) = self.engine.set_element_state(bin, PipelineState::Null) {
                warn!(element = %bin, ?e, "Failed to stop sink bin");
            }
        }

        if let Some(src) = self.engine.static_pad(slot.element, PadDirection::Src) {
            if let Err(e) = self.engine.unlink_pads(src, slot.downstream) {
                warn!(element = %slot.element, ?e, "Failed to unlink queue from sink");
            }
        }
        if let Some(sink) = self.engine.static_pad(slot.element, PadDirection::Sink) {
            if let Some(upstream) = self.engine.peer(sink) {
                if let Err(e) = self.engine.unlink_pads(upstream, sink) {
                    warn!(element = %slot.element, ?e, "Failed to unlink queue from upstream");
                }
                if let Some(tee) = self
                    .engine
                    .pad_parent(upstream)
                    .filter(|parent| self.is_tee(*parent))
                {
                    if let Err(e) = self.engine.release_request_pad(tee, upstream) {
                        warn!(element = %tee, ?e, "Failed to release tee request pad");
                    }
                }
            }
        }
        self.discard_element(slot.element);
        info!(factory = %self.factory_name(factory), stream = %describe(stream), element = %slot.element, "Removed queue");

        self.drop_bin_ref(owner, stream)
    }

    fn is_tee(&self, element: ElementId) -> bool {
        self.entries
            .values()
            .any(|e| e.tee.as_ref().is_some_and(|t| t.element == element))
    }

    /// Feed `queue` from a new request pad of `tee`; no-op if the queue is already fed
    pub fn link_tee_to_queue(&self, tee: ElementId, queue: ElementId) -> PipelineResult<()> {
        let sink = self
            .engine
            .static_pad(queue, PadDirection::Sink)
            .ok_or_else(|| EngineError::LinkFailed("queue has no sink pad".into()))?;
        if self.engine.peer(sink).is_some() {
            debug!(tee = %tee, queue = %queue, "Queue already linked");
            return Ok(());
        }
        let src = self.engine.request_pad(tee)?;
        if let Err(e) = self.engine.link_pads(src, sink) {
            if let Err(release) = self.engine.release_request_pad(tee, src) {
                warn!(tee = %tee, ?release, "Failed to release unused request pad");
            }
            return Err(e.into());
        }
        debug!(tee = %tee, queue = %queue, "Linked tee to queue");
        Ok(())
    }

    // ===== Pad bridging =====

    /// Record a pad change on one of our bins; returns the message to post
    pub fn bridge_pad_event(&mut self, event: PadEvent) -> Option<BusMessage> {
        match event {
            PadEvent::Added { element, pad } => {
                if pad.direction != PadDirection::Src {
                    return None;
                }
                let owner = *self.bins.get(&element)?;
                let Some(stream) = pad.stream else {
                    debug!(element = %element, pad = %pad.name, "Pad without stream description");
                    return None;
                };
                let factory = self.entries.get(&owner)?.factory;
                let known = self.entries.get(&owner)?.stream.as_ref() == Some(&stream)
                    || self.children(owner).iter().any(|child| {
                        self.entries
                            .get(child)
                            .is_some_and(|e| e.stream.as_ref() == Some(&stream))
                    });
                if !known {
                    let arc = self.factories.get(&factory)?.factory.clone();
                    self.create_entry(&arc, Some(stream.clone()), Some(owner));
                }
                info!(factory = %self.factory_name(factory), stream = %stream, pad = %pad.name, "New stream");
                Some(BusMessage::StreamAdded { factory, stream })
            }
            PadEvent::Removed { element, pad } => {
                if pad.direction != PadDirection::Src {
                    return None;
                }
                let owner = *self.bins.get(&element)?;
                let factory = self.entries.get(&owner)?.factory;
                let stream = pad.stream?;
                info!(factory = %self.factory_name(factory), stream = %stream, pad = %pad.name, "Stream removed");
                Some(BusMessage::StreamRemoved { factory, stream })
            }
        }
    }

    /// Whether the bin for (factory, stream) currently offers a matching source pad
    pub fn output_pad_available(
        &self,
        factory: FactoryId,
        stream: Option<&StreamDescriptor>,
    ) -> bool {
        let Some((_, bin)) = self
            .find_entry(factory, stream)
            .or_else(|| self.catch_all_entry(factory))
            .and_then(|id| self.bin_of(id))
        else {
            return false;
        };
        self.engine
            .pads(bin, PadDirection::Src)
            .iter()
            .any(|p| match (stream, p.stream.as_ref()) {
                (None, _) => true,
                (Some(wanted), Some(offered)) => wanted.is_compatible(offered),
                (Some(_), None) => false,
            })
    }

    // ===== Filters =====

    /// Restrict the output of every bin of `factory`; returns the previous filter
    pub fn set_source_filter(
        &mut self,
        factory: FactoryId,
        filter: Option<StreamDescriptor>,
    ) -> Option<StreamDescriptor> {
        let previous = match &filter {
            Some(f) => self.filters.insert(factory, f.clone()),
            None => self.filters.remove(&factory),
        };
        for bin in self.bins_of(factory) {
            if let Err(e) = self.engine.set_output_filter(bin, filter.as_ref()) {
                warn!(factory = %factory, element = %bin, ?e, "Failed to apply source filter");
            }
        }
        previous
    }

    pub fn source_filter(&self, factory: FactoryId) -> Option<&StreamDescriptor> {
        self.filters.get(&factory)
    }

    // ===== Inspection =====

    pub fn bins_of(&self, factory: FactoryId) -> Vec<ElementId> {
        self.entries
            .values()
            .filter(|e| e.factory == factory)
            .filter_map(|e| e.bin)
            .collect()
    }

    /// Bin element (factory, stream) resolves to
    pub fn bin_element(
        &self,
        factory: FactoryId,
        stream: Option<&StreamDescriptor>,
    ) -> Option<ElementId> {
        self.find_entry(factory, stream)
            .or_else(|| self.catch_all_entry(factory))
            .and_then(|id| self.bin_of(id))
            .map(|(_, bin)| bin)
    }

    pub fn usage(
        &self,
        factory: FactoryId,
        stream: Option<&StreamDescriptor>,
    ) -> Option<StreamUsage> {
        let id = self.find_entry(factory, stream)?;
        let entry = self.entries.get(&id)?;
        let bin = self
            .bin_entry(id)
            .and_then(|owner| self.entries.get(&owner))
            .map_or(0, |owner| owner.bin_use_count);
        Some(StreamUsage {
            bin,
            tee: entry.tee.as_ref().map_or(0, |t| t.use_count),
            queue: entry.queue.as_ref().map_or(0, |q| q.use_count),
        })
    }

    pub fn has_entries(&self, factory: FactoryId) -> bool {
        self.factories.contains_key(&factory)
    }

    pub fn factory_entry_count(&self) -> usize {
        self.factories.len()
    }

    pub fn stream_entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn snapshot(&self) -> Vec<StreamSnapshot> {
        let mut rows = Vec::new();
        for factory_entry in self.factories.values() {
            for id in &factory_entry.streams {
                let Some(entry) = self.entries.get(id) else {
                    continue;
                };
                rows.push(StreamSnapshot {
                    factory: factory_entry.factory.name().to_string(),
                    stream: entry.stream.clone(),
                    child: entry.parent.is_some(),
                    bin: entry.bin,
                    usage: StreamUsage {
                        bin: entry.bin_use_count,
                        tee: entry.tee.as_ref().map_or(0, |t| t.use_count),
                        queue: entry.queue.as_ref().map_or(0, |q| q.use_count),
                    },
                });
            }
        }
        rows
    }
}

impl fmt::Debug for ResourceTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceTable")
            .field("factories", &self.factories.len())
            .field("entries", &self.entries)
            .finish()
    }
}

/// Resource table shared between the owning thread and engine pad callbacks
#[derive(Clone)]
pub struct SharedResources {
    inner: Arc<Mutex<ResourceTable>>,
}

impl SharedResources {
    pub fn new(engine: Arc<dyn GraphEngine>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ResourceTable::new(engine))),
        }
    }

    /// Lock the table; never hold the guard while releasing a [`ResourceGuard`]
    pub fn lock(&self) -> MutexGuard<'_, ResourceTable> {
        self.inner.lock()
    }

    /// Pad callback for the engine: records new streams and posts them on `bus`
    ///
    /// Holds the table weakly, the engine must not keep it alive. Engines
    /// report pads synchronously while the table tears a bin down, so the
    /// callback never waits for the lock: a busy table gets the event back
    /// through the bus, bridged later by [`Self::bridge_deferred`].
    pub fn pad_observer(&self, bus: BusSender) -> PadObserver {
        let table = Arc::downgrade(&self.inner);
        Arc::new(move |event: PadEvent| {
            let Some(table) = table.upgrade() else {
                return;
            };
            let message = match table.try_lock() {
                Some(mut table) => table.bridge_pad_event(event),
                None => {
                    trace!(?event, "Resource table busy, deferring pad event");
                    Some(BusMessage::PadChanged(event))
                }
            };
            if let Some(message) = message {
                if bus.send(message).is_err() {
                    debug!("Bus closed, dropping stream notification");
                }
            }
        })
    }

    /// Bridge a pad event the observer could not handle in place
    pub fn bridge_deferred(&self, event: PadEvent) -> Option<BusMessage> {
        self.lock().bridge_pad_event(event)
    }

    fn guard(
        &self,
        kind: ResourceKind,
        factory: &ObjectFactory,
        stream: Option<&StreamDescriptor>,
        element: ElementId,
        bin: Option<ElementId>,
    ) -> ResourceGuard {
        ResourceGuard::new(
            Arc::downgrade(&self.inner),
            kind,
            factory.id(),
            stream.cloned(),
            element,
            bin,
        )
    }

    /// Counted bin reference, building the bin if needed
    pub fn acquire_bin(
        &self,
        factory: &Arc<ObjectFactory>,
        stream: Option<&StreamDescriptor>,
    ) -> PipelineResult<ResourceGuard> {
        let bin = self.lock().get_or_create_bin(factory, stream, true)?;
        Ok(self.guard(ResourceKind::Bin, factory, stream, bin, Some(bin)))
    }

    /// Counted tee reference, building bin and tee if needed
    pub fn acquire_tee(
        &self,
        factory: &Arc<ObjectFactory>,
        stream: Option<&StreamDescriptor>,
    ) -> PipelineResult<ResourceGuard> {
        let (tee, bin) = {
            let mut table = self.lock();
            let tee = table.get_or_create_tee(factory, stream, true)?;
            (tee, table.bin_element(factory.id(), stream))
        };
        Ok(self.guard(ResourceKind::Tee, factory, stream, tee, bin))
    }

    /// Counted queue reference, building bin and queue if needed
    pub fn acquire_queue(
        &self,
        factory: &Arc<ObjectFactory>,
        stream: Option<&StreamDescriptor>,
        buffer: Duration,
    ) -> PipelineResult<ResourceGuard> {
        let (queue, bin) = {
            let mut table = self.lock();
            let queue = table.get_or_create_queue(factory, stream, true, buffer)?;
            (queue, table.bin_element(factory.id(), stream))
        };
        Ok(self.guard(ResourceKind::Queue, factory, stream, queue, bin))
    }
}

impl fmt::Debug for SharedResources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedResources").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryEngine;
    use crate::factory::TimelineTrack;
    use crate::stream::{AudioAttributes, Fraction, VideoAttributes};

    const BUFFER: Duration = Duration::from_secs(1);

    fn video() -> StreamDescriptor {
        StreamDescriptor::video(VideoAttributes::sized(1920, 1080, Fraction::new(25, 1)))
    }

    fn audio() -> StreamDescriptor {
        StreamDescriptor::audio(AudioAttributes::new(2, 48_000))
    }

    fn setup() -> (Arc<MemoryEngine>, ResourceTable) {
        let engine = Arc::new(MemoryEngine::new());
        let table = ResourceTable::new(engine.clone());
        (engine, table)
    }

    #[test]
    fn test_bin_is_shared_and_counted() {
        let (engine, mut table) = setup();
        let source = Arc::new(ObjectFactory::uri_source("file:///a.mp4", vec![video()]));

        let first = table.get_or_create_bin(&source, None, true).unwrap();
        let second = table.get_or_create_bin(&source, None, true).unwrap();
        assert_eq!(first, second);
        assert_eq!(engine.bin_count(), 1);
        assert_eq!(table.usage(source.id(), None).unwrap().bin, 2);

        table.release_bin(source.id(), None).unwrap();
        table.release_bin(source.id(), None).unwrap();
        assert_eq!(engine.bin_count(), 0);
        assert_eq!(table.factory_entry_count(), 0);
        assert!(table.release_bin(source.id(), None).is_err());
    }

    #[test]
    fn test_no_automake_without_entry() {
        let (_engine, mut table) = setup();
        let source = Arc::new(ObjectFactory::uri_source("file:///a.mp4", vec![video()]));
        let sink = Arc::new(ObjectFactory::video_sink());

        assert!(matches!(
            table.get_or_create_tee(&source, None, false),
            Err(PipelineError::ResourceUnavailable { .. })
        ));
        assert!(matches!(
            table.get_or_create_queue(&sink, None, false, BUFFER),
            Err(PipelineError::ResourceUnavailable { .. })
        ));
        assert!(matches!(
            table.get_or_create_bin(&source, None, false),
            Err(PipelineError::ResourceUnavailable { .. })
        ));
    }

    #[test]
    fn test_source_bin_needs_stopped_graph() {
        let (engine, mut table) = setup();
        let source = Arc::new(ObjectFactory::uri_source("file:///a.mp4", vec![video()]));
        engine.set_state(PipelineState::Playing).unwrap();

        assert!(matches!(
            table.get_or_create_bin(&source, None, true),
            Err(PipelineError::InvalidState { .. })
        ));
        // Sinks can join a running graph
        let sink = Arc::new(ObjectFactory::video_sink());
        assert!(table.get_or_create_bin(&sink, None, true).is_ok());
    }

    #[test]
    fn test_tee_holds_one_bin_reference() {
        let (engine, mut table) = setup();
        let source = Arc::new(ObjectFactory::uri_source("file:///a.mp4", vec![video()]));

        let tee = table.get_or_create_tee(&source, None, true).unwrap();
        assert_eq!(table.get_or_create_tee(&source, None, true).unwrap(), tee);
        assert_eq!(
            table.usage(source.id(), None),
            Some(StreamUsage {
                bin: 1,
                tee: 2,
                queue: 0
            })
        );
        assert_eq!(engine.tee_count(), 1);

        table.release_tee(source.id(), None).unwrap();
        assert_eq!(engine.tee_count(), 1);
        table.release_tee(source.id(), None).unwrap();
        assert_eq!(engine.tee_count(), 0);
        assert_eq!(engine.bin_count(), 0);
        assert_eq!(table.stream_entry_count(), 0);
    }

    #[test]
    fn test_last_bin_reference_with_live_tee_is_busy() {
        let (_engine, mut table) = setup();
        let source = Arc::new(ObjectFactory::uri_source("file:///a.mp4", vec![video()]));

        table.get_or_create_tee(&source, None, true).unwrap();
        assert!(matches!(
            table.release_bin(source.id(), None),
            Err(PipelineError::ResourceBusy { .. })
        ));
        // Extra holder: its reference can go, the tee keeps the bin
        table.get_or_create_bin(&source, None, true).unwrap();
        table.release_bin(source.id(), None).unwrap();
        table.release_tee(source.id(), None).unwrap();
        assert_eq!(table.factory_entry_count(), 0);
    }

    #[test]
    fn test_ambiguous_pads_need_explicit_stream() {
        let (engine, mut table) = setup();
        let source = Arc::new(ObjectFactory::uri_source(
            "file:///a.mp4",
            vec![video(), audio()],
        ));

        assert!(matches!(
            table.get_or_create_tee(&source, None, true),
            Err(PipelineError::AmbiguousStream { candidates: 2, .. })
        ));
        // Rolled back completely
        assert_eq!(table.stream_entry_count(), 0);
        assert_eq!(engine.bin_count(), 0);

        table.get_or_create_tee(&source, Some(&audio()), true).unwrap();
        table.get_or_create_tee(&source, Some(&video()), true).unwrap();
        assert_eq!(engine.bin_count(), 2, "One decoding bin per stream");
        assert_eq!(engine.tee_count(), 2);
    }

    #[test]
    fn test_timeline_tracks_share_one_bin() {
        let (engine, mut table) = setup();
        let timeline = Arc::new(ObjectFactory::timeline(
            "timeline",
            vec![
                TimelineTrack {
                    stream: video(),
                    uri: None,
                },
                TimelineTrack {
                    stream: audio(),
                    uri: None,
                },
            ],
        ));

        table.get_or_create_bin(&timeline, None, true).unwrap();
        assert_eq!(table.stream_entry_count(), 3, "Bin row plus one child per track");

        assert!(matches!(
            table.get_or_create_tee(&timeline, None, true),
            Err(PipelineError::AmbiguousStream { .. })
        ));
        table.get_or_create_tee(&timeline, Some(&video()), true).unwrap();
        table.get_or_create_tee(&timeline, Some(&audio()), true).unwrap();
        assert_eq!(engine.bin_count(), 1);
        assert_eq!(table.usage(timeline.id(), Some(&video())).unwrap().bin, 3);

        table.release_tee(timeline.id(), Some(&video())).unwrap();
        table.release_tee(timeline.id(), Some(&audio())).unwrap();
        table.release_bin(timeline.id(), None).unwrap();
        assert_eq!(table.stream_entry_count(), 0);
        assert_eq!(engine.bin_count(), 0);
    }

    #[test]
    fn test_queue_release_unlinks_tee_request_pad() {
        let (engine, mut table) = setup();
        let source = Arc::new(ObjectFactory::uri_source("file:///a.mp4", vec![video()]));
        let sink = Arc::new(ObjectFactory::video_sink());

        let tee = table.get_or_create_tee(&source, None, true).unwrap();
        let queue = table.get_or_create_queue(&sink, None, true, BUFFER).unwrap();
        table.link_tee_to_queue(tee, queue).unwrap();
        // bin -> tee, tee -> queue, queue -> sink
        assert_eq!(engine.link_count(), 3);

        table.release_queue(sink.id(), None).unwrap();
        assert_eq!(engine.link_count(), 1);
        assert!(engine.pads(tee, PadDirection::Src).is_empty());
        assert_eq!(engine.queue_count(), 0);

        table.release_tee(source.id(), None).unwrap();
        assert_eq!(engine.link_count(), 0);
        assert_eq!(engine.element_count(), 0);
    }

    #[test]
    fn test_catch_all_lookup_falls_back_to_single_bin() {
        let (engine, mut table) = setup();
        let source = Arc::new(ObjectFactory::uri_source(
            "file:///a.mp4",
            vec![video(), audio()],
        ));

        let bin = table.get_or_create_bin(&source, Some(&video()), true).unwrap();
        assert_eq!(table.usage(source.id(), None).unwrap().bin, 1);
        assert_eq!(table.get_or_create_bin(&source, None, true).unwrap(), bin);
        assert_eq!(table.usage(source.id(), Some(&video())).unwrap().bin, 2);
        assert_eq!(engine.bin_count(), 1);

        // With one bin per stream there is nothing to fall back to
        table.get_or_create_bin(&source, Some(&audio()), true).unwrap();
        assert!(table.usage(source.id(), None).is_none());
        assert!(matches!(
            table.get_or_create_bin(&source, None, true),
            Err(PipelineError::AmbiguousStream { candidates: 2, .. })
        ));
        assert_eq!(engine.bin_count(), 2);

        table.release_bin(source.id(), Some(&audio())).unwrap();
        table.release_bin(source.id(), None).unwrap();
        table.release_bin(source.id(), Some(&video())).unwrap();
        assert_eq!(table.factory_entry_count(), 0);
        assert_eq!(engine.bin_count(), 0);
    }

    #[test]
    fn test_concrete_stream_does_not_join_other_stream_bin() {
        let (engine, mut table) = setup();
        let source = Arc::new(ObjectFactory::uri_source(
            "file:///a.mp4",
            vec![video(), audio()],
        ));

        let video_bin = table.get_or_create_bin(&source, Some(&video()), true).unwrap();
        let audio_bin = table.get_or_create_bin(&source, Some(&audio()), true).unwrap();
        assert_ne!(video_bin, audio_bin);
        assert_eq!(engine.bin_count(), 2);
        assert_eq!(table.bin_element(source.id(), Some(&audio())), Some(audio_bin));
    }

    #[test]
    fn test_pad_bridge_registers_child_rows() {
        let (engine, mut table) = setup();
        engine.set_dynamic_pads(true);
        let source = Arc::new(ObjectFactory::uri_source("file:///a.mp4", vec![video()]));
        let bin = table.get_or_create_bin(&source, None, true).unwrap();

        let pad = PadInfo {
            id: PadId(999),
            name: "src_0".into(),
            direction: PadDirection::Src,
            stream: Some(video()),
        };
        let message = table.bridge_pad_event(PadEvent::Added {
            element: bin,
            pad: pad.clone(),
        });
        assert_eq!(
            message,
            Some(BusMessage::StreamAdded {
                factory: source.id(),
                stream: video()
            })
        );
        assert_eq!(table.stream_entry_count(), 2);

        // Unknown elements are ignored
        assert!(
            table
                .bridge_pad_event(PadEvent::Added {
                    element: ElementId(12345),
                    pad
                })
                .is_none()
        );
    }

    #[test]
    fn test_source_filter_applies_to_live_and_new_bins() {
        let (engine, mut table) = setup();
        let source = Arc::new(ObjectFactory::test_source("smpte", vec![video()]));
        let bin = table.get_or_create_bin(&source, None, true).unwrap();

        let small = StreamDescriptor::video(VideoAttributes::sized(640, 360, Fraction::new(25, 1)));
        assert_eq!(table.set_source_filter(source.id(), Some(small.clone())), None);
        assert_eq!(engine.element(bin).unwrap().filter, Some(small.clone()));
        assert_eq!(table.set_source_filter(source.id(), None), Some(small));
        assert_eq!(engine.element(bin).unwrap().filter, None);
    }

    #[test]
    fn test_guards_release_on_drop() {
        let engine = Arc::new(MemoryEngine::new());
        let shared = SharedResources::new(engine.clone());
        let source = Arc::new(ObjectFactory::uri_source("file:///a.mp4", vec![video()]));

        {
            let tee = shared.acquire_tee(&source, None).unwrap();
            assert_eq!(tee.kind(), ResourceKind::Tee);
            assert!(tee.bin().is_some());
            assert_eq!(engine.tee_count(), 1);
        }
        assert_eq!(engine.tee_count(), 0);
        assert_eq!(shared.lock().factory_entry_count(), 0);

        let bin = shared.acquire_bin(&source, None).unwrap();
        bin.release().unwrap();
        assert_eq!(engine.bin_count(), 0);
    }
}
