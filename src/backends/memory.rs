// SPDX-License-Identifier: GPL-3.0-only

//! In-process graph engine
//!
//! `MemoryEngine` keeps elements, pads and links as plain bookkeeping and
//! reproduces the observable behaviour of a real engine: stepwise state
//! changes with bus messages, preroll, flushing seeks, request pads on tees,
//! pads that only appear once a source prerolls. Fault injection hooks let
//! tests drive failure paths (refused state changes, rejected seeks, stalled
//! async transitions, fatal errors).
//!
//! Bus messages and pad events are delivered after the internal lock is
//! dropped, matching the [`GraphEngine`] contract.

use super::registry::ElementFactoryCache;
use crate::engine::{
    BusMessage, BusSender, ElementId, GraphEngine, PadDirection, PadEvent, PadId, PadInfo,
    PadObserver, PipelineState, StateChange,
};
use crate::errors::{EngineError, EngineResult};
use crate::factory::{FactoryId, FactoryRole, ObjectFactory, SinkKind, SourceKind};
use crate::stream::StreamDescriptor;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

/// What an element is
#[derive(Debug, Clone, PartialEq)]
pub enum ElementKind {
    Bin { factory: FactoryId },
    Tee,
    Queue { buffer: Duration },
}

/// Snapshot of an element for inspection
#[derive(Debug, Clone)]
pub struct MemoryElement {
    pub kind: ElementKind,
    pub name: String,
    pub in_graph: bool,
    pub state: PipelineState,
    pub sync: Option<bool>,
    pub filter: Option<StreamDescriptor>,
    deferred_pads: Vec<StreamDescriptor>,
    next_request_pad: u32,
}

#[derive(Debug, Clone)]
struct MemoryPad {
    element: ElementId,
    name: String,
    direction: PadDirection,
    stream: Option<StreamDescriptor>,
    peer: Option<PadId>,
    request: bool,
}

impl MemoryPad {
    fn info(&self, id: PadId) -> PadInfo {
        PadInfo {
            id,
            name: self.name.clone(),
            direction: self.direction,
            stream: self.stream.clone(),
        }
    }
}

#[derive(Debug, Default)]
struct Faults {
    fail_state_changes: bool,
    reject_seeks: bool,
    async_state_changes: bool,
    dynamic_pads: bool,
}

#[derive(Debug, Default)]
struct MemoryGraph {
    next_id: u64,
    elements: BTreeMap<ElementId, MemoryElement>,
    pads: BTreeMap<PadId, MemoryPad>,
    state: PipelineState,
    pending: Option<PipelineState>,
    position: u64,
    duration: Option<u64>,
    faults: Faults,
    state_change_calls: usize,
    seeks: Vec<u64>,
}

/// Side effects to deliver once the graph lock is released
#[derive(Default)]
struct Outbox {
    messages: Vec<BusMessage>,
    pads: Vec<PadEvent>,
}

impl MemoryGraph {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn add_element(&mut self, kind: ElementKind, name: String) -> ElementId {
        let id = ElementId(self.next_id());
        self.elements.insert(
            id,
            MemoryElement {
                kind,
                name,
                in_graph: false,
                state: PipelineState::Null,
                sync: None,
                filter: None,
                deferred_pads: Vec::new(),
                next_request_pad: 0,
            },
        );
        id
    }

    fn add_pad(
        &mut self,
        element: ElementId,
        name: String,
        direction: PadDirection,
        stream: Option<StreamDescriptor>,
        request: bool,
    ) -> PadId {
        let id = PadId(self.next_id());
        self.pads.insert(
            id,
            MemoryPad {
                element,
                name,
                direction,
                stream,
                peer: None,
                request,
            },
        );
        id
    }

    fn element_mut(&mut self, id: ElementId) -> EngineResult<&mut MemoryElement> {
        self.elements
            .get_mut(&id)
            .ok_or(EngineError::UnknownElement(id))
    }

    fn pad(&self, id: PadId) -> EngineResult<&MemoryPad> {
        self.pads.get(&id).ok_or(EngineError::UnknownPad(id))
    }

    fn detach_pad(&mut self, id: PadId) {
        if let Some(peer) = self.pads.get(&id).and_then(|p| p.peer) {
            if let Some(peer_pad) = self.pads.get_mut(&peer) {
                peer_pad.peer = None;
            }
        }
        self.pads.remove(&id);
    }

    /// Walk from the current state to `target`, one step at a time
    fn transition(&mut self, target: PipelineState, outbox: &mut Outbox) {
        let mut current = self.state;
        let mut prerolled = false;

        while current != target {
            let next = current.step_towards(target);
            if current == PipelineState::Ready && next == PipelineState::Paused {
                prerolled = true;
                self.expose_deferred_pads(outbox);
            }
            outbox.messages.push(BusMessage::StateChanged {
                old: current,
                new: next,
                pending: (next != target).then_some(target),
            });
            current = next;
        }

        self.state = target;
        self.pending = None;
        for element in self.elements.values_mut().filter(|e| e.in_graph) {
            element.state = target;
        }
        if target <= PipelineState::Ready {
            self.position = 0;
        }
        if prerolled {
            outbox.messages.push(BusMessage::AsyncDone);
        }
    }

    /// Sources with dynamic pads only expose them once they preroll
    fn expose_deferred_pads(&mut self, outbox: &mut Outbox) {
        let ready: Vec<(ElementId, Vec<StreamDescriptor>)> = self
            .elements
            .iter_mut()
            .filter(|(_, e)| e.in_graph && !e.deferred_pads.is_empty())
            .map(|(id, e)| (*id, std::mem::take(&mut e.deferred_pads)))
            .collect();

        for (element, streams) in ready {
            for (index, stream) in streams.into_iter().enumerate() {
                let name = pad_name(&stream, "src", index);
                let pad = self.add_pad(element, name, PadDirection::Src, Some(stream), false);
                if let Ok(p) = self.pad(pad) {
                    outbox.pads.push(PadEvent::Added {
                        element,
                        pad: p.info(pad),
                    });
                }
            }
        }
    }
}

fn pad_name(stream: &StreamDescriptor, prefix: &str, index: usize) -> String {
    stream
        .pad_name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("{}_{}", prefix, index))
}

/// Graph engine keeping everything in memory
pub struct MemoryEngine {
    graph: Mutex<MemoryGraph>,
    bus: Mutex<Option<BusSender>>,
    observer: Mutex<Option<PadObserver>>,
    element_cache: Arc<ElementFactoryCache>,
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::with_element_cache(Arc::new(ElementFactoryCache::permissive()))
    }

    /// Engine whose encoder availability is answered by `cache`
    pub fn with_element_cache(cache: Arc<ElementFactoryCache>) -> Self {
        Self {
            graph: Mutex::new(MemoryGraph::default()),
            bus: Mutex::new(None),
            observer: Mutex::new(None),
            element_cache: cache,
        }
    }

    fn deliver(&self, outbox: Outbox) {
        if !outbox.messages.is_empty() {
            match self.bus.lock().clone() {
                Some(bus) => {
                    for message in outbox.messages {
                        trace!(?message, "Posting bus message");
                        let _ = bus.send(message);
                    }
                }
                None => debug!("Engine not attached, dropping bus messages"),
            }
        }
        if !outbox.pads.is_empty() {
            let observer = self.observer.lock().clone();
            if let Some(observer) = observer {
                for event in outbox.pads {
                    observer(event);
                }
            }
        }
    }

    fn check_encoder(&self, kind: &SinkKind) -> EngineResult<()> {
        if let SinkKind::Encoder { settings, .. } = kind {
            let wanted = [
                Some(settings.muxer.as_str()),
                settings.video_encoder.as_deref(),
                settings.audio_encoder.as_deref(),
            ];
            for name in wanted.into_iter().flatten() {
                if !self.element_cache.is_available(name) {
                    return Err(EngineError::MissingElement(name.to_string()));
                }
            }
        }
        Ok(())
    }

    // ===== Fault injection =====

    /// Refuse every transition to a state above Null
    pub fn set_fail_state_changes(&self, fail: bool) {
        self.graph.lock().faults.fail_state_changes = fail;
    }

    pub fn set_reject_seeks(&self, reject: bool) {
        self.graph.lock().faults.reject_seeks = reject;
    }

    /// Leave transitions to Paused/Playing pending until [`Self::complete_pending_state`]
    pub fn set_async_state_changes(&self, enabled: bool) {
        self.graph.lock().faults.async_state_changes = enabled;
    }

    /// URI sources built from now on expose their pads only when prerolling
    pub fn set_dynamic_pads(&self, enabled: bool) {
        self.graph.lock().faults.dynamic_pads = enabled;
    }

    /// Finish a pending async state change; returns false if none was pending
    pub fn complete_pending_state(&self) -> bool {
        let mut outbox = Outbox::default();
        {
            let mut graph = self.graph.lock();
            let Some(target) = graph.pending else {
                return false;
            };
            graph.transition(target, &mut outbox);
        }
        self.deliver(outbox);
        true
    }

    pub fn post(&self, message: BusMessage) {
        self.deliver(Outbox {
            messages: vec![message],
            pads: Vec::new(),
        });
    }

    pub fn post_error(&self, message: &str) {
        self.post(BusMessage::Error {
            message: message.to_string(),
            debug: None,
        });
    }

    pub fn post_eos(&self) {
        self.post(BusMessage::Eos);
    }

    // ===== Playback simulation =====

    pub fn set_duration(&self, duration: u64) {
        self.graph.lock().duration = Some(duration);
        self.post(BusMessage::DurationChanged);
    }

    /// Pretend playback advanced to `position`
    pub fn set_position(&self, position: u64) {
        self.graph.lock().position = position;
    }

    /// Expose a new source pad on `element`, as a demuxer would
    pub fn add_dynamic_pad(
        &self,
        element: ElementId,
        stream: StreamDescriptor,
    ) -> EngineResult<PadId> {
        let mut outbox = Outbox::default();
        let pad = {
            let mut graph = self.graph.lock();
            let index = graph
                .pads
                .values()
                .filter(|p| p.element == element && p.direction == PadDirection::Src)
                .count();
            graph.element_mut(element)?;
            let name = pad_name(&stream, "src", index);
            let pad = graph.add_pad(element, name, PadDirection::Src, Some(stream), false);
            let info = graph.pad(pad)?.info(pad);
            outbox.pads.push(PadEvent::Added { element, pad: info });
            pad
        };
        self.deliver(outbox);
        Ok(pad)
    }

    /// Drop a pad, unlinking it first
    pub fn remove_pad(&self, pad: PadId) -> EngineResult<()> {
        let mut outbox = Outbox::default();
        {
            let mut graph = self.graph.lock();
            let p = graph.pad(pad)?;
            let element = p.element;
            let info = p.info(pad);
            graph.detach_pad(pad);
            outbox.pads.push(PadEvent::Removed { element, pad: info });
        }
        self.deliver(outbox);
        Ok(())
    }

    // ===== Inspection =====

    pub fn element(&self, id: ElementId) -> Option<MemoryElement> {
        self.graph.lock().elements.get(&id).cloned()
    }

    fn count(&self, matches: impl Fn(&ElementKind) -> bool) -> usize {
        self.graph
            .lock()
            .elements
            .values()
            .filter(|e| e.in_graph && matches(&e.kind))
            .count()
    }

    /// Bins currently in the graph
    pub fn bin_count(&self) -> usize {
        self.count(|k| matches!(k, ElementKind::Bin { .. }))
    }

    pub fn tee_count(&self) -> usize {
        self.count(|k| matches!(k, ElementKind::Tee))
    }

    pub fn queue_count(&self) -> usize {
        self.count(|k| matches!(k, ElementKind::Queue { .. }))
    }

    /// Every element the engine still knows, in or out of the graph
    pub fn element_count(&self) -> usize {
        self.graph.lock().elements.len()
    }

    /// Bins built for `factory`
    pub fn bins_for(&self, factory: FactoryId) -> Vec<ElementId> {
        self.graph
            .lock()
            .elements
            .iter()
            .filter(|(_, e)| e.kind == ElementKind::Bin { factory })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of links between pads of different elements
    pub fn link_count(&self) -> usize {
        self.graph
            .lock()
            .pads
            .values()
            .filter(|p| p.direction == PadDirection::Src && p.peer.is_some())
            .count()
    }

    pub fn state_change_calls(&self) -> usize {
        self.graph.lock().state_change_calls
    }

    /// Positions of every seek request, accepted or not
    pub fn seeks(&self) -> Vec<u64> {
        self.graph.lock().seeks.clone()
    }

    pub fn current_state(&self) -> PipelineState {
        self.graph.lock().state
    }
}

impl GraphEngine for MemoryEngine {
    fn attach(&self, bus: BusSender, pads: PadObserver) {
        *self.bus.lock() = Some(bus);
        *self.observer.lock() = Some(pads);
    }

    fn make_bin(
        &self,
        factory: &ObjectFactory,
        stream: Option<&StreamDescriptor>,
    ) -> EngineResult<ElementId> {
        if let FactoryRole::Sink { kind, .. } = factory.role() {
            self.check_encoder(kind)?;
        }

        let declared: Vec<StreamDescriptor> = factory.streams().into_iter().cloned().collect();
        let streams = match stream {
            Some(requested) => {
                let found = declared
                    .iter()
                    .find(|s| *s == requested)
                    .or_else(|| declared.iter().find(|s| s.is_compatible_with_name(requested)));
                vec![found.cloned().unwrap_or_else(|| requested.clone())]
            }
            None => declared,
        };

        let mut graph = self.graph.lock();
        let dynamic = graph.faults.dynamic_pads
            && matches!(
                factory.role(),
                FactoryRole::Source {
                    kind: SourceKind::Uri(_),
                    ..
                }
            );
        let id = graph.add_element(
            ElementKind::Bin {
                factory: factory.id(),
            },
            format!("bin-{}", factory.name()),
        );

        if factory.is_sink() {
            for (index, stream) in streams.into_iter().enumerate() {
                let name = pad_name(&stream, "sink", index);
                graph.add_pad(id, name, PadDirection::Sink, Some(stream), false);
            }
        } else if dynamic {
            graph.element_mut(id)?.deferred_pads = streams;
        } else {
            for (index, stream) in streams.into_iter().enumerate() {
                let name = pad_name(&stream, "src", index);
                graph.add_pad(id, name, PadDirection::Src, Some(stream), false);
            }
        }

        debug!(element = %id, factory = factory.name(), dynamic, "Built bin");
        Ok(id)
    }

    fn make_tee(&self) -> EngineResult<ElementId> {
        let mut graph = self.graph.lock();
        let id = graph.add_element(ElementKind::Tee, "tee".to_string());
        graph.add_pad(id, "sink".to_string(), PadDirection::Sink, None, false);
        Ok(id)
    }

    fn make_queue(&self, buffer: Duration) -> EngineResult<ElementId> {
        let mut graph = self.graph.lock();
        let id = graph.add_element(ElementKind::Queue { buffer }, "queue".to_string());
        graph.add_pad(id, "sink".to_string(), PadDirection::Sink, None, false);
        graph.add_pad(id, "src".to_string(), PadDirection::Src, None, false);
        Ok(id)
    }

    fn add_element(&self, element: ElementId) -> EngineResult<()> {
        self.graph.lock().element_mut(element)?.in_graph = true;
        Ok(())
    }

    /// Disposing a bin reports its source pads as removed, like a demuxer does
    fn remove_element(&self, element: ElementId) -> EngineResult<()> {
        let mut outbox = Outbox::default();
        {
            let mut graph = self.graph.lock();
            let removed = graph
                .elements
                .remove(&element)
                .ok_or(EngineError::UnknownElement(element))?;
            let is_bin = matches!(removed.kind, ElementKind::Bin { .. });
            let pads: Vec<PadId> = graph
                .pads
                .iter()
                .filter(|(_, p)| p.element == element)
                .map(|(id, _)| *id)
                .collect();
            for pad in pads {
                if let Some(p) = graph.pads.get(&pad) {
                    if is_bin && p.direction == PadDirection::Src {
                        outbox.pads.push(PadEvent::Removed {
                            element,
                            pad: p.info(pad),
                        });
                    }
                }
                graph.detach_pad(pad);
            }
        }
        self.deliver(outbox);
        Ok(())
    }

    fn set_element_state(&self, element: ElementId, state: PipelineState) -> EngineResult<()> {
        self.graph.lock().element_mut(element)?.state = state;
        Ok(())
    }

    fn sync_state_with_parent(&self, element: ElementId) -> EngineResult<()> {
        let mut graph = self.graph.lock();
        let state = graph.state;
        graph.element_mut(element)?.state = state;
        Ok(())
    }

    fn pads(&self, element: ElementId, direction: PadDirection) -> Vec<PadInfo> {
        self.graph
            .lock()
            .pads
            .iter()
            .filter(|(_, p)| p.element == element && p.direction == direction)
            .map(|(id, p)| p.info(*id))
            .collect()
    }

    fn static_pad(&self, element: ElementId, direction: PadDirection) -> Option<PadId> {
        self.graph
            .lock()
            .pads
            .iter()
            .find(|(_, p)| p.element == element && p.direction == direction && !p.request)
            .map(|(id, _)| *id)
    }

    fn request_pad(&self, element: ElementId) -> EngineResult<PadId> {
        let mut graph = self.graph.lock();
        let tee = graph.element_mut(element)?;
        if tee.kind != ElementKind::Tee {
            return Err(EngineError::LinkFailed(format!(
                "{} has no request pads",
                element
            )));
        }
        let name = format!("src_{}", tee.next_request_pad);
        tee.next_request_pad += 1;
        Ok(graph.add_pad(element, name, PadDirection::Src, None, true))
    }

    fn release_request_pad(&self, element: ElementId, pad: PadId) -> EngineResult<()> {
        let mut graph = self.graph.lock();
        let p = graph.pad(pad)?;
        if p.element != element || !p.request {
            return Err(EngineError::UnknownPad(pad));
        }
        graph.detach_pad(pad);
        Ok(())
    }

    fn link_pads(&self, src: PadId, sink: PadId) -> EngineResult<()> {
        let mut graph = self.graph.lock();
        let (src_pad, sink_pad) = (graph.pad(src)?, graph.pad(sink)?);
        if src_pad.direction != PadDirection::Src || sink_pad.direction != PadDirection::Sink {
            return Err(EngineError::LinkFailed(format!(
                "wrong pad directions for {} -> {}",
                src, sink
            )));
        }
        if src_pad.peer.is_some() || sink_pad.peer.is_some() {
            return Err(EngineError::LinkFailed(format!(
                "{} or {} is already linked",
                src, sink
            )));
        }
        if let Some(p) = graph.pads.get_mut(&src) {
            p.peer = Some(sink);
        }
        if let Some(p) = graph.pads.get_mut(&sink) {
            p.peer = Some(src);
        }
        Ok(())
    }

    fn unlink_pads(&self, src: PadId, sink: PadId) -> EngineResult<()> {
        let mut graph = self.graph.lock();
        if graph.pad(src)?.peer != Some(sink) {
            return Err(EngineError::LinkFailed(format!(
                "{} is not linked to {}",
                src, sink
            )));
        }
        if let Some(p) = graph.pads.get_mut(&src) {
            p.peer = None;
        }
        if let Some(p) = graph.pads.get_mut(&sink) {
            p.peer = None;
        }
        Ok(())
    }

    fn peer(&self, pad: PadId) -> Option<PadId> {
        self.graph.lock().pads.get(&pad).and_then(|p| p.peer)
    }

    fn pad_parent(&self, pad: PadId) -> Option<ElementId> {
        self.graph.lock().pads.get(&pad).map(|p| p.element)
    }

    fn set_sync(&self, element: ElementId, sync: bool) -> EngineResult<()> {
        self.graph.lock().element_mut(element)?.sync = Some(sync);
        Ok(())
    }

    fn set_output_filter(
        &self,
        element: ElementId,
        filter: Option<&StreamDescriptor>,
    ) -> EngineResult<()> {
        self.graph.lock().element_mut(element)?.filter = filter.cloned();
        Ok(())
    }

    fn set_state(&self, target: PipelineState) -> EngineResult<StateChange> {
        let mut outbox = Outbox::default();
        let result = {
            let mut graph = self.graph.lock();
            graph.state_change_calls += 1;

            if graph.faults.fail_state_changes && target > PipelineState::Null {
                return Err(EngineError::StateChange(format!(
                    "refused transition to {}",
                    target
                )));
            }

            if graph.faults.async_state_changes
                && target >= PipelineState::Paused
                && graph.state < target
            {
                graph.pending = Some(target);
                StateChange::Async
            } else {
                graph.transition(target, &mut outbox);
                StateChange::Success
            }
        };
        self.deliver(outbox);
        Ok(result)
    }

    fn state(&self, _timeout: Duration) -> PipelineState {
        self.graph.lock().state
    }

    fn query_position(&self) -> Option<u64> {
        let graph = self.graph.lock();
        (graph.state >= PipelineState::Paused).then_some(graph.position)
    }

    fn query_duration(&self) -> Option<u64> {
        let graph = self.graph.lock();
        if graph.state >= PipelineState::Paused {
            graph.duration
        } else {
            None
        }
    }

    fn seek(&self, position: u64) -> EngineResult<()> {
        {
            let mut graph = self.graph.lock();
            graph.seeks.push(position);
            if graph.faults.reject_seeks {
                return Err(EngineError::SeekRejected("injected rejection".into()));
            }
            if graph.state < PipelineState::Paused {
                return Err(EngineError::SeekRejected(format!(
                    "cannot seek while {}",
                    graph.state
                )));
            }
            graph.position = position;
        }
        self.post(BusMessage::AsyncDone);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{AudioAttributes, VideoAttributes};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn source() -> ObjectFactory {
        ObjectFactory::uri_source(
            "file:///clip.mp4",
            vec![
                StreamDescriptor::video(VideoAttributes::default()),
                StreamDescriptor::audio(AudioAttributes::new(2, 48_000)),
            ],
        )
    }

    #[test]
    fn test_bin_pads_follow_requested_stream() {
        let engine = MemoryEngine::new();
        let factory = source();

        let all = engine.make_bin(&factory, None).unwrap();
        assert_eq!(engine.pads(all, PadDirection::Src).len(), 2);

        let audio = engine
            .make_bin(&factory, Some(&StreamDescriptor::any_audio()))
            .unwrap();
        let pads = engine.pads(audio, PadDirection::Src);
        assert_eq!(pads.len(), 1);
        assert_eq!(
            pads[0].stream,
            Some(StreamDescriptor::audio(AudioAttributes::new(2, 48_000)))
        );
    }

    #[test]
    fn test_state_changes_step_and_preroll() {
        let engine = MemoryEngine::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        engine.attach(tx, Arc::new(|_: PadEvent| {}));

        assert_eq!(
            engine.set_state(PipelineState::Paused).unwrap(),
            StateChange::Success
        );
        let mut messages = Vec::new();
        while let Ok(m) = rx.try_recv() {
            messages.push(m);
        }
        assert_eq!(messages.len(), 3, "Null->Ready, Ready->Paused, AsyncDone");
        assert_eq!(messages[2], BusMessage::AsyncDone);
    }

    #[test]
    fn test_tee_request_pads_and_links() {
        let engine = MemoryEngine::new();
        let tee = engine.make_tee().unwrap();
        let queue = engine.make_queue(Duration::from_secs(1)).unwrap();

        let src = engine.request_pad(tee).unwrap();
        let sink = engine.static_pad(queue, PadDirection::Sink).unwrap();
        engine.link_pads(src, sink).unwrap();
        assert_eq!(engine.peer(sink), Some(src));
        assert!(engine.link_pads(src, sink).is_err(), "Already linked");

        engine.release_request_pad(tee, src).unwrap();
        assert_eq!(engine.peer(sink), None);
    }

    #[test]
    fn test_dynamic_pads_appear_on_preroll() {
        let engine = MemoryEngine::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.attach(
            tx,
            Arc::new(move |event: PadEvent| {
                if matches!(event, PadEvent::Added { .. }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );
        engine.set_dynamic_pads(true);

        let bin = engine.make_bin(&source(), None).unwrap();
        engine.add_element(bin).unwrap();
        assert!(engine.pads(bin, PadDirection::Src).is_empty());

        engine.set_state(PipelineState::Paused).unwrap();
        assert_eq!(engine.pads(bin, PadDirection::Src).len(), 2);
        assert_eq!(seen.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_removing_bin_reports_its_source_pads() {
        let engine = MemoryEngine::new();
        let removed = Arc::new(AtomicUsize::new(0));
        let counter = removed.clone();
        let (tx, _rx) = mpsc::unbounded_channel();
        engine.attach(
            tx,
            Arc::new(move |event: PadEvent| {
                if matches!(event, PadEvent::Removed { .. }) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            }),
        );

        let bin = engine.make_bin(&source(), None).unwrap();
        engine.add_element(bin).unwrap();
        let tee = engine.make_tee().unwrap();
        engine.add_element(tee).unwrap();

        engine.remove_element(tee).unwrap();
        assert_eq!(removed.load(Ordering::SeqCst), 0);
        engine.remove_element(bin).unwrap();
        assert_eq!(removed.load(Ordering::SeqCst), 2);
        assert_eq!(engine.element_count(), 0);
    }

    #[test]
    fn test_missing_encoder_fails_bin_creation() {
        let cache = Arc::new(ElementFactoryCache::with_available(&["matroskamux"]));
        let engine = MemoryEngine::with_element_cache(cache);
        let settings = crate::factory::RenderSettings {
            video_encoder: Some("x264enc".into()),
            ..Default::default()
        };
        let sink = ObjectFactory::encoder_sink(
            "/tmp/out.mkv",
            settings,
            vec![StreamDescriptor::any_video()],
        );
        assert_eq!(
            engine.make_bin(&sink, None),
            Err(EngineError::MissingElement("x264enc".into()))
        );
    }

    #[test]
    fn test_seek_requires_preroll() {
        let engine = MemoryEngine::new();
        assert!(engine.seek(10).is_err());
        engine.set_state(PipelineState::Paused).unwrap();
        engine.seek(10).unwrap();
        assert_eq!(engine.query_position(), Some(10));
        engine.set_state(PipelineState::Null).unwrap();
        assert_eq!(engine.query_position(), None);
    }
}
