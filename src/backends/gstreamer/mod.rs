// SPDX-License-Identifier: GPL-3.0-only

//! GStreamer graph engine
//!
//! Wraps one top-level `gst::Pipeline`. Element and pad handles map onto
//! GStreamer objects through a registry; pads are registered the first time
//! they are seen.
//!
//! ```text
//!   GstEngine ──owns──► gst::Pipeline
//!       │                    │ bus
//!       │             bus watch thread ──BusMessage──► pipeline bus channel
//!       │
//!       └── factory bins ── pad-added/pad-removed ──PadEvent──► pad observer
//! ```
//!
//! The registry lock is never held while the pad observer runs, since the
//! observer calls straight back into the engine to link tees and queues.

mod bins;
mod caps;

use super::registry::ElementFactoryCache;
use crate::constants::timing;
use crate::engine::{
    BusMessage, BusSender, ElementId, GraphEngine, PadDirection, PadEvent, PadId, PadInfo,
    PadObserver, PipelineState, StateChange,
};
use crate::errors::{EngineError, EngineResult};
use crate::factory::ObjectFactory;
use crate::stream::StreamDescriptor;
use bins::{BuiltBin, SharedFilter, engine_error, make};
use gstreamer as gst;
use gstreamer::prelude::*;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

struct ElementEntry {
    element: gst::Element,
    sinks: Vec<gst::Element>,
    filter: SharedFilter,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    elements: HashMap<ElementId, ElementEntry>,
    pads: HashMap<PadId, gst::Pad>,
}

impl Registry {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn entry(&self, id: ElementId) -> EngineResult<&ElementEntry> {
        self.elements
            .get(&id)
            .ok_or(EngineError::UnknownElement(id))
    }

    fn element(&self, id: ElementId) -> EngineResult<gst::Element> {
        self.entry(id).map(|e| e.element.clone())
    }

    fn pad(&self, id: PadId) -> EngineResult<gst::Pad> {
        self.pads.get(&id).cloned().ok_or(EngineError::UnknownPad(id))
    }

    /// Handle for `pad`, registering it on first sight
    fn pad_id(&mut self, pad: &gst::Pad) -> PadId {
        if let Some((id, _)) = self.pads.iter().find(|(_, p)| *p == pad) {
            return *id;
        }
        let id = PadId(self.next_id());
        self.pads.insert(id, pad.clone());
        id
    }

    fn element_id(&self, element: &gst::Element) -> Option<ElementId> {
        self.elements
            .iter()
            .find(|(_, e)| e.element == *element)
            .map(|(id, _)| *id)
    }

    fn pad_info(&mut self, pad: &gst::Pad) -> Option<PadInfo> {
        let direction = caps::from_gst_direction(pad.direction())?;
        Some(PadInfo {
            id: self.pad_id(pad),
            name: pad.name().to_string(),
            direction,
            stream: caps::pad_stream(pad),
        })
    }

    fn forget(&mut self, id: ElementId) -> Option<ElementEntry> {
        let entry = self.elements.remove(&id)?;
        self.pads
            .retain(|_, pad| pad.parent_element().as_ref() != Some(&entry.element));
        Some(entry)
    }
}

/// Graph engine driving a real GStreamer pipeline
pub struct GstEngine {
    pipeline: gst::Pipeline,
    registry: Arc<Mutex<Registry>>,
    observer: Arc<Mutex<Option<PadObserver>>>,
    element_cache: Arc<ElementFactoryCache>,
    stop: Arc<AtomicBool>,
    bus_thread: Mutex<Option<JoinHandle<()>>>,
}

impl GstEngine {
    /// Initialize GStreamer and create an empty pipeline
    pub fn new() -> EngineResult<Self> {
        gst::init().map_err(|e| EngineError::Other(format!("GStreamer init failed: {}", e)))?;
        let cache = ElementFactoryCache::new(|name| gst::ElementFactory::find(name).is_some());
        Ok(Self {
            pipeline: gst::Pipeline::with_name("montage"),
            registry: Arc::default(),
            observer: Arc::default(),
            element_cache: Arc::new(cache),
            stop: Arc::new(AtomicBool::new(false)),
            bus_thread: Mutex::new(None),
        })
    }

    pub fn element_cache(&self) -> &Arc<ElementFactoryCache> {
        &self.element_cache
    }

    fn spawn_bus_watch(&self, sender: BusSender) {
        let Some(bus) = self.pipeline.bus() else {
            error!("Pipeline has no bus, messages will not be delivered");
            return;
        };
        let pipeline = self.pipeline.clone();
        let stop = self.stop.clone();
        let handle = std::thread::spawn(move || {
            let poll = gst::ClockTime::from_mseconds(timing::BUS_POLL_INTERVAL_MS);
            while !stop.load(Ordering::Relaxed) {
                let Some(msg) = bus.timed_pop(poll) else {
                    continue;
                };
                if let Some(message) = translate(&pipeline, &msg) {
                    trace!(?message, "Bus message");
                    if sender.send(message).is_err() {
                        debug!("Pipeline bus closed, stopping bus watch");
                        break;
                    }
                }
            }
        });
        if let Some(old) = self.bus_thread.lock().replace(handle) {
            warn!("Engine attached twice, previous bus watch keeps running");
            drop(old);
        }
    }

    /// Report pads appearing on and leaving factory bins
    fn watch_pads(&self, id: ElementId, bin: &gst::Bin) {
        let registry = self.registry.clone();
        let observer = self.observer.clone();
        bin.connect_pad_added(move |element, pad| {
            let info = registry.lock().pad_info(pad);
            let Some(info) = info else {
                return;
            };
            debug!(element = %element.name(), pad = %info.name, "Pad added");
            let observer = observer.lock().clone();
            if let Some(observer) = observer {
                observer(PadEvent::Added { element: id, pad: info });
            }
        });

        let registry = self.registry.clone();
        let observer = self.observer.clone();
        bin.connect_pad_removed(move |element, pad| {
            let info = {
                let mut registry = registry.lock();
                let info = registry.pad_info(pad);
                if let Some(info) = &info {
                    registry.pads.remove(&info.id);
                }
                info
            };
            let Some(info) = info else {
                return;
            };
            debug!(element = %element.name(), pad = %info.name, "Pad removed");
            let observer = observer.lock().clone();
            if let Some(observer) = observer {
                observer(PadEvent::Removed { element: id, pad: info });
            }
        });
    }

    fn insert(
        &self,
        element: gst::Element,
        sinks: Vec<gst::Element>,
        filter: SharedFilter,
    ) -> ElementId {
        let mut registry = self.registry.lock();
        let id = ElementId(registry.next_id());
        registry.elements.insert(
            id,
            ElementEntry {
                element,
                sinks,
                filter,
            },
        );
        id
    }
}

impl Drop for GstEngine {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Err(e) = self.pipeline.set_state(gst::State::Null) {
            warn!(?e, "Failed to stop pipeline");
        }
        if let Some(handle) = self.bus_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

/// Bus message the resource graph cares about; state changes only from the top-level pipeline
fn translate(pipeline: &gst::Pipeline, msg: &gst::Message) -> Option<BusMessage> {
    use gst::MessageView;

    match msg.view() {
        MessageView::StateChanged(s) => {
            if msg.src() != Some(pipeline.upcast_ref::<gst::Object>()) {
                return None;
            }
            Some(BusMessage::StateChanged {
                old: caps::from_gst_state(s.old())?,
                new: caps::from_gst_state(s.current())?,
                pending: caps::from_gst_state(s.pending()),
            })
        }
        MessageView::AsyncDone(_) => Some(BusMessage::AsyncDone),
        MessageView::Eos(_) => Some(BusMessage::Eos),
        MessageView::Error(err) => Some(BusMessage::Error {
            message: err.error().to_string(),
            debug: err.debug().map(|d| d.to_string()),
        }),
        MessageView::Warning(w) => Some(BusMessage::Warning {
            message: w.error().to_string(),
            debug: w.debug().map(|d| d.to_string()),
        }),
        MessageView::DurationChanged(_) => Some(BusMessage::DurationChanged),
        MessageView::Element(e) => e
            .structure()
            .map(|s| BusMessage::Element(s.name().to_string())),
        _ => None,
    }
}

impl GraphEngine for GstEngine {
    fn attach(&self, bus: BusSender, pads: PadObserver) {
        *self.observer.lock() = Some(pads);
        self.spawn_bus_watch(bus);
    }

    fn make_bin(
        &self,
        factory: &ObjectFactory,
        stream: Option<&StreamDescriptor>,
    ) -> EngineResult<ElementId> {
        let BuiltBin { bin, sinks, filter } = bins::build(factory, stream, &self.element_cache)?;
        let id = self.insert(bin.clone().upcast(), sinks, filter);
        self.watch_pads(id, &bin);
        info!(element = %id, factory = factory.name(), "Bin ready");
        Ok(id)
    }

    fn make_tee(&self) -> EngineResult<ElementId> {
        let tee = make(crate::constants::pipeline::TEE_ELEMENT)?;
        tee.set_property("allow-not-linked", true);
        Ok(self.insert(tee, Vec::new(), SharedFilter::default()))
    }

    fn make_queue(&self, buffer: Duration) -> EngineResult<ElementId> {
        let queue = make(crate::constants::pipeline::QUEUE_ELEMENT)?;
        queue.set_property("max-size-time", buffer.as_nanos() as u64);
        queue.set_property("max-size-buffers", 0u32);
        queue.set_property("max-size-bytes", 0u32);
        Ok(self.insert(queue, Vec::new(), SharedFilter::default()))
    }

    fn add_element(&self, element: ElementId) -> EngineResult<()> {
        let element = self.registry.lock().element(element)?;
        self.pipeline.add(&element).map_err(engine_error)
    }

    fn remove_element(&self, element: ElementId) -> EngineResult<()> {
        let entry = self
            .registry
            .lock()
            .forget(element)
            .ok_or(EngineError::UnknownElement(element))?;
        if let Err(e) = entry.element.set_state(gst::State::Null) {
            warn!(%element, ?e, "Element did not stop cleanly");
        }
        if entry.element.parent().is_some() {
            self.pipeline.remove(&entry.element).map_err(engine_error)?;
        }
        Ok(())
    }

    fn set_element_state(&self, element: ElementId, state: PipelineState) -> EngineResult<()> {
        let element = self.registry.lock().element(element)?;
        element
            .set_state(caps::to_gst_state(state))
            .map(|_| ())
            .map_err(|e| EngineError::StateChange(format!("{:?}", e)))
    }

    fn sync_state_with_parent(&self, element: ElementId) -> EngineResult<()> {
        let element = self.registry.lock().element(element)?;
        element
            .sync_state_with_parent()
            .map_err(|e| EngineError::StateChange(e.to_string()))
    }

    fn pads(&self, element: ElementId, direction: PadDirection) -> Vec<PadInfo> {
        let mut registry = self.registry.lock();
        let Ok(element) = registry.element(element) else {
            return Vec::new();
        };
        element
            .pads()
            .iter()
            .filter_map(|pad| registry.pad_info(pad))
            .filter(|info| info.direction == direction)
            .collect()
    }

    fn static_pad(&self, element: ElementId, direction: PadDirection) -> Option<PadId> {
        let mut registry = self.registry.lock();
        let element = registry.element(element).ok()?;
        let name = match direction {
            PadDirection::Src => "src",
            PadDirection::Sink => "sink",
        };
        let pad = element.static_pad(name)?;
        Some(registry.pad_id(&pad))
    }

    fn request_pad(&self, element: ElementId) -> EngineResult<PadId> {
        let element = self.registry.lock().element(element)?;
        let pad = element
            .request_pad_simple(crate::constants::pipeline::TEE_SRC_TEMPLATE)
            .ok_or_else(|| {
                EngineError::LinkFailed(format!("{} has no request pads", element.name()))
            })?;
        Ok(self.registry.lock().pad_id(&pad))
    }

    fn release_request_pad(&self, element: ElementId, pad: PadId) -> EngineResult<()> {
        let (element, pad) = {
            let mut registry = self.registry.lock();
            let element = registry.element(element)?;
            let pad = registry.pads.remove(&pad).ok_or(EngineError::UnknownPad(pad))?;
            (element, pad)
        };
        element.release_request_pad(&pad);
        Ok(())
    }

    fn link_pads(&self, src: PadId, sink: PadId) -> EngineResult<()> {
        let (src, sink) = {
            let registry = self.registry.lock();
            (registry.pad(src)?, registry.pad(sink)?)
        };
        src.link(&sink).map(|_| ()).map_err(|e| {
            EngineError::LinkFailed(format!("{} -> {}: {:?}", src.name(), sink.name(), e))
        })
    }

    fn unlink_pads(&self, src: PadId, sink: PadId) -> EngineResult<()> {
        let (src, sink) = {
            let registry = self.registry.lock();
            (registry.pad(src)?, registry.pad(sink)?)
        };
        src.unlink(&sink)
            .map_err(|e| EngineError::LinkFailed(e.to_string()))
    }

    fn peer(&self, pad: PadId) -> Option<PadId> {
        let mut registry = self.registry.lock();
        let peer = registry.pad(pad).ok()?.peer()?;
        Some(registry.pad_id(&peer))
    }

    fn pad_parent(&self, pad: PadId) -> Option<ElementId> {
        let registry = self.registry.lock();
        let parent = registry.pad(pad).ok()?.parent_element()?;
        registry.element_id(&parent)
    }

    fn set_sync(&self, element: ElementId, sync: bool) -> EngineResult<()> {
        let registry = self.registry.lock();
        for sink in &registry.entry(element)?.sinks {
            if sink.has_property("sync") {
                sink.set_property("sync", sync);
            }
        }
        Ok(())
    }

    fn set_output_filter(
        &self,
        element: ElementId,
        filter: Option<&StreamDescriptor>,
    ) -> EngineResult<()> {
        let shared = self.registry.lock().entry(element)?.filter.clone();
        shared.lock().set(filter.map(caps::to_caps));
        Ok(())
    }

    fn set_state(&self, state: PipelineState) -> EngineResult<StateChange> {
        match self.pipeline.set_state(caps::to_gst_state(state)) {
            Ok(gst::StateChangeSuccess::Success) => Ok(StateChange::Success),
            Ok(gst::StateChangeSuccess::Async) => Ok(StateChange::Async),
            Ok(gst::StateChangeSuccess::NoPreroll) => Ok(StateChange::NoPreroll),
            Err(e) => Err(EngineError::StateChange(format!("{:?}", e))),
        }
    }

    fn state(&self, timeout: Duration) -> PipelineState {
        let timeout = gst::ClockTime::from_mseconds(timeout.as_millis() as u64);
        let (_, current, _) = self.pipeline.state(timeout);
        caps::from_gst_state(current).unwrap_or_default()
    }

    fn query_position(&self) -> Option<u64> {
        self.pipeline
            .query_position::<gst::ClockTime>()
            .map(gst::ClockTime::nseconds)
    }

    fn query_duration(&self) -> Option<u64> {
        self.pipeline
            .query_duration::<gst::ClockTime>()
            .map(gst::ClockTime::nseconds)
    }

    fn seek(&self, position: u64) -> EngineResult<()> {
        self.pipeline
            .seek_simple(
                gst::SeekFlags::FLUSH | gst::SeekFlags::ACCURATE,
                gst::ClockTime::from_nseconds(position),
            )
            .map_err(|e| EngineError::SeekRejected(e.to_string()))
    }
}
