// SPDX-License-Identifier: GPL-3.0-only

//! Actions
//!
//! An action claims producer (source) and consumer (sink) factories and, while
//! active, holds the graph fragments linking them:
//!
//! ```text
//!   producer bin ──► tee ──► queue ──► consumer bin
//!                     │
//!                     └────► queue ──► (another action's consumer)
//! ```
//!
//! ```text
//!   NotActive ──activate()──► Active ──deactivate()──► NotActive
//! ```
//!
//! Every resource an active action holds is a [`ResourceGuard`]; deactivation
//! gives back all queues, then all tees, then any bins still waiting for
//! their streams to appear.

mod policy;

pub use policy::{ActionKind, ActionPolicy, GenericPolicy, RenderPolicy, ViewPolicy};

use crate::engine::ElementId;
use crate::errors::{PipelineError, PipelineResult};
use crate::factory::{FactoryId, ObjectFactory};
use crate::pipeline::{Pipeline, PipelineId};
use crate::resources::{ResourceGuard, SharedResources};
use crate::stream::{StreamDescriptor, describe};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

static NEXT_ACTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

impl ActionId {
    fn next() -> Self {
        Self(NEXT_ACTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActionState {
    #[default]
    NotActive,
    Active,
}

/// A producer stream feeding a consumer stream
///
/// `None` streams resolve to the factory's sole stream.
#[derive(Debug, Clone)]
pub struct Link {
    pub producer: Arc<ObjectFactory>,
    pub consumer: Arc<ObjectFactory>,
    pub producer_stream: Option<StreamDescriptor>,
    pub consumer_stream: Option<StreamDescriptor>,
}

impl Link {
    fn matches(
        &self,
        producer: FactoryId,
        consumer: FactoryId,
        producer_stream: Option<&StreamDescriptor>,
        consumer_stream: Option<&StreamDescriptor>,
    ) -> bool {
        self.producer.id() == producer
            && self.consumer.id() == consumer
            && producer_stream.is_none_or(|s| self.producer_stream.as_ref() == Some(s))
            && consumer_stream.is_none_or(|s| self.consumer_stream.as_ref() == Some(s))
    }
}

impl PartialEq for Link {
    fn eq(&self, other: &Self) -> bool {
        self.producer.id() == other.producer.id()
            && self.consumer.id() == other.consumer.id()
            && self.producer_stream == other.producer_stream
            && self.consumer_stream == other.consumer_stream
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] -> {} [{}]",
            self.producer.name(),
            describe(self.producer_stream.as_ref()),
            self.consumer.name(),
            describe(self.consumer_stream.as_ref())
        )
    }
}

/// A realized link and the references keeping it alive
#[derive(Debug)]
struct ActiveLink {
    link: Link,
    tee: ResourceGuard,
    queue: ResourceGuard,
    /// Built for a stream that appeared at runtime
    dynamic: bool,
}

/// A link whose producer stream has not appeared yet; holds the producer bin
#[derive(Debug)]
struct PendingLink {
    link: Link,
    bin: ResourceGuard,
}

enum Realized {
    Linked(ActiveLink),
    Pending(PendingLink),
}

pub struct Action {
    id: ActionId,
    state: ActionState,
    pipeline: Option<PipelineId>,
    producers: Vec<Arc<ObjectFactory>>,
    consumers: Vec<Arc<ObjectFactory>>,
    links: Vec<Link>,
    policy: Box<dyn ActionPolicy>,
    sync: bool,
    active: Vec<ActiveLink>,
    pending: Vec<PendingLink>,
}

impl Action {
    pub fn new(policy: impl ActionPolicy + 'static) -> Self {
        Self {
            id: ActionId::next(),
            state: ActionState::NotActive,
            pipeline: None,
            producers: Vec::new(),
            consumers: Vec::new(),
            links: Vec::new(),
            policy: Box::new(policy),
            sync: true,
            active: Vec::new(),
            pending: Vec::new(),
        }
    }

    /// Action realizing only explicitly set links
    pub fn generic() -> Self {
        Self::new(GenericPolicy)
    }

    pub fn view() -> Self {
        Self::new(ViewPolicy)
    }

    pub fn render() -> Self {
        Self::new(RenderPolicy)
    }

    pub fn id(&self) -> ActionId {
        self.id
    }

    pub fn state(&self) -> ActionState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state == ActionState::Active
    }

    pub fn kind(&self) -> ActionKind {
        self.policy.kind()
    }

    pub fn pipeline(&self) -> Option<PipelineId> {
        self.pipeline
    }

    pub fn producers(&self) -> &[Arc<ObjectFactory>] {
        &self.producers
    }

    pub fn consumers(&self) -> &[Arc<ObjectFactory>] {
        &self.consumers
    }

    /// Explicitly set links
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// Whether the consumer sinks follow the real-time clock
    pub fn sync(&self) -> bool {
        self.sync
    }

    pub fn active_link_count(&self) -> usize {
        self.active.len()
    }

    pub fn pending_link_count(&self) -> usize {
        self.pending.len()
    }

    /// Consumer bins fed by the realized links
    pub fn consumer_bins(&self) -> Vec<ElementId> {
        let mut bins: Vec<ElementId> = self.active.iter().filter_map(|a| a.queue.bin()).collect();
        bins.sort();
        bins.dedup();
        bins
    }

    fn ensure_inactive(&self) -> PipelineResult<()> {
        if self.is_active() {
            return Err(PipelineError::ActiveAction(self.id.to_string()));
        }
        Ok(())
    }

    pub(crate) fn set_sync(&mut self, sync: bool) {
        self.sync = sync;
    }

    // ===== Pipeline binding =====

    /// Bind to `pipeline`; binding again to the same pipeline is a no-op
    pub fn set_pipeline(&mut self, pipeline: PipelineId) -> PipelineResult<()> {
        match self.pipeline {
            Some(current) if current == pipeline => return Ok(()),
            Some(_) => return Err(PipelineError::AlreadyAttached(self.id.to_string())),
            None => {}
        }
        self.ensure_inactive()?;
        self.pipeline = Some(pipeline);
        Ok(())
    }

    pub fn unset_pipeline(&mut self) -> PipelineResult<()> {
        self.ensure_inactive()?;
        self.pipeline = None;
        Ok(())
    }

    // ===== Producers and consumers =====

    pub fn add_producers(&mut self, factories: &[Arc<ObjectFactory>]) -> PipelineResult<()> {
        self.ensure_inactive()?;
        if let Some(f) = factories.iter().find(|f| !f.is_source()) {
            return Err(PipelineError::IncompatibleFactory {
                factory: f.name().to_string(),
                role: "producer",
            });
        }
        for factory in factories {
            if !self.producers.iter().any(|p| p.id() == factory.id()) {
                self.producers.push(factory.clone());
            }
        }
        Ok(())
    }

    pub fn add_consumers(&mut self, factories: &[Arc<ObjectFactory>]) -> PipelineResult<()> {
        self.ensure_inactive()?;
        if let Some(f) = factories.iter().find(|f| !f.is_sink()) {
            return Err(PipelineError::IncompatibleFactory {
                factory: f.name().to_string(),
                role: "consumer",
            });
        }
        for factory in factories {
            if !self.consumers.iter().any(|c| c.id() == factory.id()) {
                self.consumers.push(factory.clone());
            }
        }
        Ok(())
    }

    /// Remove producers along with every link they take part in
    pub fn remove_producers(&mut self, factories: &[Arc<ObjectFactory>]) -> PipelineResult<()> {
        self.ensure_inactive()?;
        for factory in factories {
            self.producers.retain(|p| p.id() != factory.id());
            self.links.retain(|l| l.producer.id() != factory.id());
        }
        Ok(())
    }

    /// Remove consumers along with every link they take part in
    pub fn remove_consumers(&mut self, factories: &[Arc<ObjectFactory>]) -> PipelineResult<()> {
        self.ensure_inactive()?;
        for factory in factories {
            self.consumers.retain(|c| c.id() != factory.id());
            self.links.retain(|l| l.consumer.id() != factory.id());
        }
        Ok(())
    }

    // ===== Links =====

    /// Record a link; producer and consumer join the action if needed
    pub fn set_link(
        &mut self,
        producer: &Arc<ObjectFactory>,
        consumer: &Arc<ObjectFactory>,
        producer_stream: Option<StreamDescriptor>,
        consumer_stream: Option<StreamDescriptor>,
    ) -> PipelineResult<()> {
        self.ensure_inactive()?;
        if !producer.is_source() {
            return Err(PipelineError::IncompatibleFactory {
                factory: producer.name().to_string(),
                role: "producer",
            });
        }
        if !consumer.is_sink() {
            return Err(PipelineError::IncompatibleFactory {
                factory: consumer.name().to_string(),
                role: "consumer",
            });
        }

        let not_found = |factory: &ObjectFactory, stream: &StreamDescriptor| {
            PipelineError::StreamNotFound {
                factory: factory.name().to_string(),
                stream: stream.to_string(),
            }
        };
        if let Some(stream) = &producer_stream {
            producer
                .find_output(stream)
                .ok_or_else(|| not_found(producer, stream))?;
        }
        if let Some(stream) = &consumer_stream {
            consumer
                .find_input(stream)
                .ok_or_else(|| not_found(consumer, stream))?;
        }

        let outputs: Vec<&StreamDescriptor> = match &producer_stream {
            Some(s) => vec![s],
            None => producer.output_streams(),
        };
        let inputs: Vec<&StreamDescriptor> = match &consumer_stream {
            Some(s) => vec![s],
            None => consumer.input_streams().iter().collect(),
        };
        // Streams unknown until runtime are checked when they appear
        let checkable = !outputs.is_empty() && !inputs.is_empty();
        if checkable && !outputs.iter().any(|o| inputs.iter().any(|i| o.is_compatible(i))) {
            return Err(PipelineError::IncompatibleStreams {
                producer: producer.name().to_string(),
                consumer: consumer.name().to_string(),
            });
        }

        let link = Link {
            producer: producer.clone(),
            consumer: consumer.clone(),
            producer_stream,
            consumer_stream,
        };
        if self.links.contains(&link) {
            return Err(PipelineError::DuplicateLink {
                producer: producer.name().to_string(),
                consumer: consumer.name().to_string(),
            });
        }

        self.add_producers(std::slice::from_ref(producer))?;
        self.add_consumers(std::slice::from_ref(consumer))?;
        debug!(action = %self.id, link = %link, "Link set");
        self.links.push(link);
        Ok(())
    }

    /// Remove the single link matching the arguments; `None` streams match any
    pub fn remove_link(
        &mut self,
        producer: &ObjectFactory,
        consumer: &ObjectFactory,
        producer_stream: Option<&StreamDescriptor>,
        consumer_stream: Option<&StreamDescriptor>,
    ) -> PipelineResult<()> {
        self.ensure_inactive()?;
        let matching: Vec<usize> = self
            .links
            .iter()
            .enumerate()
            .filter(|(_, l)| l.matches(producer.id(), consumer.id(), producer_stream, consumer_stream))
            .map(|(index, _)| index)
            .collect();

        match matching.as_slice() {
            [] => Err(PipelineError::LinkNotFound {
                producer: producer.name().to_string(),
                consumer: consumer.name().to_string(),
            }),
            [index] => {
                let link = self.links.remove(*index);
                debug!(action = %self.id, link = %link, "Link removed");
                Ok(())
            }
            many => Err(PipelineError::AmbiguousLink {
                producer: producer.name().to_string(),
                consumer: consumer.name().to_string(),
                count: many.len(),
            }),
        }
    }

    // ===== Activation =====

    /// Realize every link in `pipeline`
    ///
    /// Returns `false` when the action was already active. On failure all
    /// resources acquired so far are given back and the action stays inactive.
    pub(crate) fn activate(&mut self, pipeline: &Pipeline) -> PipelineResult<bool> {
        match self.pipeline {
            None => return Err(PipelineError::NoPipeline(self.id.to_string())),
            Some(id) if id != pipeline.id() => {
                return Err(PipelineError::NotAttached(self.id.to_string()));
            }
            Some(_) => {}
        }
        if self.is_active() {
            debug!(action = %self.id, "Action already active");
            return Ok(false);
        }
        if let Some(f) = self
            .producers
            .iter()
            .chain(&self.consumers)
            .find(|f| !pipeline.is_registered(f.id()))
        {
            return Err(PipelineError::UnregisteredFactory(f.name().to_string()));
        }

        let links = if self.links.is_empty() {
            self.policy.auto_links(&self.producers, &self.consumers)
        } else {
            self.links.clone()
        };
        let resources = pipeline.resources();
        let buffer = pipeline.queue_buffer();

        for link in links {
            match realize(resources, &link, buffer) {
                Ok(Realized::Linked(active)) => self.active.push(active),
                Ok(Realized::Pending(pending)) => {
                    debug!(action = %self.id, link = %link, "Producer stream not exposed yet");
                    self.pending.push(pending);
                }
                Err(e) => {
                    warn!(action = %self.id, link = %link, ?e, "Failed to realize link");
                    if let Err(rollback) = self.release_all() {
                        warn!(action = %self.id, ?rollback, "Failed to roll back partial activation");
                    }
                    return Err(e);
                }
            }
        }

        self.state = ActionState::Active;
        info!(
            action = %self.id,
            kind = ?self.kind(),
            linked = self.active.len(),
            pending = self.pending.len(),
            "Action activated"
        );
        Ok(true)
    }

    /// Give back everything the action holds
    ///
    /// Returns `false` when the action was not active. The action ends up
    /// inactive even when a release fails; the first failure is returned.
    pub(crate) fn deactivate(&mut self) -> PipelineResult<bool> {
        if !self.is_active() {
            debug!(action = %self.id, "Action not active");
            return Ok(false);
        }
        let result = self.release_all();
        self.state = ActionState::NotActive;
        info!(action = %self.id, "Action deactivated");
        result.map(|_| true)
    }

    /// Queues first, then tees, then pending bins, newest first
    fn release_all(&mut self) -> PipelineResult<()> {
        let mut first_error = None;
        let (queues, tees): (Vec<ResourceGuard>, Vec<ResourceGuard>) = std::mem::take(&mut self.active)
            .into_iter()
            .rev()
            .map(|a| (a.queue, a.tee))
            .unzip();
        let bins = std::mem::take(&mut self.pending)
            .into_iter()
            .rev()
            .map(|p| p.bin);

        for guard in queues.into_iter().chain(tees).chain(bins) {
            let (kind, element) = (guard.kind(), guard.element());
            if let Err(e) = guard.release() {
                warn!(action = %self.id, %kind, %element, ?e, "Failed to release resource");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    // ===== Runtime streams =====

    /// Take responsibility for a stream `factory` exposed at runtime
    ///
    /// Returns whether the action linked the stream.
    pub(crate) fn handle_new_stream(
        &mut self,
        resources: &SharedResources,
        buffer: Duration,
        factory: FactoryId,
        stream: &StreamDescriptor,
    ) -> PipelineResult<bool> {
        if !self.is_active() {
            return Ok(false);
        }
        let Some(producer) = self.producers.iter().find(|p| p.id() == factory).cloned() else {
            return Ok(false);
        };

        let waiting = self.pending.iter().position(|p| {
            p.link.producer.id() == factory
                && p.link
                    .producer_stream
                    .as_ref()
                    .is_none_or(|s| s.is_compatible(stream))
        });
        if let Some(index) = waiting {
            let pending = self.pending.remove(index);
            return match realize(resources, &pending.link, buffer) {
                Ok(Realized::Linked(active)) => {
                    info!(action = %self.id, link = %active.link, "Linked pending stream");
                    self.active.push(active);
                    pending.bin.release()?;
                    Ok(true)
                }
                Ok(Realized::Pending(again)) => {
                    drop(again);
                    self.pending.insert(index, pending);
                    Ok(false)
                }
                Err(e) => {
                    self.pending.insert(index, pending);
                    Err(e)
                }
            };
        }

        let linked: Vec<Link> = self.active.iter().map(|a| a.link.clone()).collect();
        let Some(link) = self
            .policy
            .link_for_new_stream(&producer, stream, &self.consumers, &linked)
        else {
            return Ok(false);
        };
        match realize(resources, &link, buffer)? {
            Realized::Linked(mut active) => {
                active.dynamic = true;
                info!(action = %self.id, link = %active.link, "Linked new stream");
                self.active.push(active);
                Ok(true)
            }
            Realized::Pending(_) => Ok(false),
        }
    }

    /// Tear down links built on a stream that went away
    ///
    /// Links built for runtime streams are dropped; explicit or automatic
    /// links wait for the stream to come back.
    pub(crate) fn stream_removed(
        &mut self,
        resources: &SharedResources,
        factory: FactoryId,
        stream: &StreamDescriptor,
    ) -> PipelineResult<bool> {
        if !self.is_active() {
            return Ok(false);
        }
        let (gone, kept): (Vec<ActiveLink>, Vec<ActiveLink>) =
            std::mem::take(&mut self.active).into_iter().partition(|a| {
                a.link.producer.id() == factory
                    && a.link
                        .producer_stream
                        .as_ref()
                        .is_none_or(|s| s.is_compatible(stream))
            });
        self.active = kept;
        if gone.is_empty() {
            return Ok(false);
        }

        let mut first_error = None;
        for active in gone {
            let ActiveLink {
                link,
                tee,
                queue,
                dynamic,
            } = active;
            info!(action = %self.id, link = %link, "Stream removed, unlinking");
            let waiting = if dynamic {
                None
            } else {
                match resources.acquire_bin(&link.producer, link.producer_stream.as_ref()) {
                    Ok(bin) => Some(PendingLink {
                        link: link.clone(),
                        bin,
                    }),
                    Err(e) => {
                        first_error.get_or_insert(e);
                        None
                    }
                }
            };
            for guard in [queue, tee] {
                if let Err(e) = guard.release() {
                    warn!(action = %self.id, ?e, "Failed to release resource");
                    first_error.get_or_insert(e);
                }
            }
            if let Some(pending) = waiting {
                self.pending.push(pending);
            }
        }
        first_error.map_or(Ok(true), Err)
    }
}

/// Acquire producer bin and tee, consumer queue, and link them
///
/// A producer bin reference is held for the duration of the call so that a
/// bin whose output is not exposed yet can be kept as pending.
fn realize(resources: &SharedResources, link: &Link, buffer: Duration) -> PipelineResult<Realized> {
    let producer_stream = link.producer_stream.as_ref();
    let bin = resources.acquire_bin(&link.producer, producer_stream)?;
    let tee = match resources.acquire_tee(&link.producer, producer_stream) {
        Ok(tee) => tee,
        Err(PipelineError::ResourceUnavailable { .. })
            if !resources
                .lock()
                .output_pad_available(link.producer.id(), producer_stream) =>
        {
            return Ok(Realized::Pending(PendingLink {
                link: link.clone(),
                bin,
            }));
        }
        Err(e) => return Err(e),
    };
    let queue = resources.acquire_queue(&link.consumer, link.consumer_stream.as_ref(), buffer)?;
    resources
        .lock()
        .link_tee_to_queue(tee.element(), queue.element())?;
    bin.release()?;
    Ok(Realized::Linked(ActiveLink {
        link: link.clone(),
        tee,
        queue,
        dynamic: false,
    }))
}

impl Drop for Action {
    fn drop(&mut self) {
        if self.is_active() {
            warn!(action = %self.id, "Dropping active action, releasing its resources");
            if let Err(e) = self.release_all() {
                warn!(action = %self.id, ?e, "Failed to release resources of dropped action");
            }
        }
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.id)
            .field("kind", &self.kind())
            .field("state", &self.state)
            .field("pipeline", &self.pipeline)
            .field("producers", &self.producers.len())
            .field("consumers", &self.consumers.len())
            .field("links", &self.links.len())
            .field("active", &self.active.len())
            .field("pending", &self.pending.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryEngine;
    use crate::config::Config;
    use crate::stream::{AudioAttributes, Fraction, VideoAttributes};

    fn video() -> StreamDescriptor {
        StreamDescriptor::video(VideoAttributes::sized(1920, 1080, Fraction::new(25, 1)))
    }

    fn audio() -> StreamDescriptor {
        StreamDescriptor::audio(AudioAttributes::new(2, 48_000))
    }

    fn source() -> Arc<ObjectFactory> {
        Arc::new(ObjectFactory::uri_source("file:///video.mp4", vec![video()]))
    }

    fn sink() -> Arc<ObjectFactory> {
        Arc::new(ObjectFactory::video_sink())
    }

    #[test]
    fn test_roles_are_checked() {
        let mut action = Action::generic();
        assert!(matches!(
            action.add_producers(&[sink()]),
            Err(PipelineError::IncompatibleFactory {
                role: "producer",
                ..
            })
        ));
        assert!(matches!(
            action.add_consumers(&[source()]),
            Err(PipelineError::IncompatibleFactory {
                role: "consumer",
                ..
            })
        ));
        let producer = source();
        action.add_producers(&[producer.clone(), producer]).unwrap();
        assert_eq!(action.producers().len(), 1, "Duplicates are skipped");
    }

    #[test]
    fn test_set_link_validates_streams() {
        let mut action = Action::generic();
        let (producer, consumer) = (source(), sink());

        assert!(matches!(
            action.set_link(&producer, &consumer, Some(audio()), None),
            Err(PipelineError::StreamNotFound { .. })
        ));
        let audio_out = Arc::new(ObjectFactory::audio_sink());
        assert!(matches!(
            action.set_link(&producer, &audio_out, None, None),
            Err(PipelineError::IncompatibleStreams { .. })
        ));

        action.set_link(&producer, &consumer, None, None).unwrap();
        assert_eq!(action.producers().len(), 1);
        assert_eq!(action.consumers().len(), 1);
        assert!(matches!(
            action.set_link(&producer, &consumer, None, None),
            Err(PipelineError::DuplicateLink { .. })
        ));
    }

    #[test]
    fn test_remove_link_needs_a_single_match() {
        let mut action = Action::generic();
        let producer = Arc::new(ObjectFactory::uri_source(
            "file:///clip.mkv",
            vec![video(), video().with_pad_name("video_1")],
        ));
        let consumer = Arc::new(ObjectFactory::null_sink(vec![
            StreamDescriptor::any_video(),
            StreamDescriptor::any_video().with_pad_name("video_1"),
        ]));

        assert!(matches!(
            action.remove_link(&producer, &consumer, None, None),
            Err(PipelineError::LinkNotFound { .. })
        ));
        action
            .set_link(&producer, &consumer, Some(video()), None)
            .unwrap();
        action
            .set_link(
                &producer,
                &consumer,
                Some(video().with_pad_name("video_1")),
                None,
            )
            .unwrap();
        assert!(matches!(
            action.remove_link(&producer, &consumer, None, None),
            Err(PipelineError::AmbiguousLink { count: 2, .. })
        ));
        action
            .remove_link(&producer, &consumer, Some(&video()), None)
            .unwrap();
        assert_eq!(action.links().len(), 1);
    }

    #[test]
    fn test_set_pipeline_twice_is_noop() {
        let mut action = Action::generic();
        let first = PipelineId::next();
        action.set_pipeline(first).unwrap();
        action.set_pipeline(first).unwrap();
        assert!(matches!(
            action.set_pipeline(PipelineId::next()),
            Err(PipelineError::AlreadyAttached(_))
        ));
        action.unset_pipeline().unwrap();
        assert_eq!(action.pipeline(), None);
    }

    #[test]
    fn test_removing_producer_drops_its_links() {
        let mut action = Action::generic();
        let (producer, consumer) = (source(), sink());
        action.set_link(&producer, &consumer, None, None).unwrap();
        action.remove_producers(&[producer]).unwrap();
        assert!(action.links().is_empty());
        assert_eq!(action.consumers().len(), 1);
    }

    #[test]
    fn test_dropping_active_action_gives_resources_back() {
        let engine = Arc::new(MemoryEngine::new());
        let mut pipeline = Pipeline::new(engine.clone(), Config::default());
        let (producer, consumer) = (source(), sink());
        pipeline.add_factory(producer.clone()).unwrap();
        pipeline.add_factory(consumer.clone()).unwrap();

        let mut action = Action::generic();
        action.set_link(&producer, &consumer, None, None).unwrap();
        action.set_pipeline(pipeline.id()).unwrap();
        assert!(action.activate(&pipeline).unwrap());
        assert_eq!(engine.bin_count(), 2);

        drop(action);
        assert_eq!(engine.element_count(), 0);
        assert_eq!(pipeline.resources().lock().factory_entry_count(), 0);
    }
}
