use crate::envelope::{Envelope, Filter};
use crate::error::{PipelineError, Result};
use crate::queue::{Queue, Sequence};
use crossbeam::channel::Sender;
use parking_lot::Mutex;
use std::sync::Arc;

/// Head of a pipeline: produces envelopes and consumes none
pub trait Source<T>: Send {
    /// Offer zero or more envelopes into `queue`
    ///
    /// Called exactly once. The pipeline finishes the queue after it returns.
    fn run(&mut self, queue: &mut dyn Queue<T>) -> Result<()>;

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "source"
    }
}

/// Terminal stage: consumes envelopes and produces none
///
/// Only `process` is required. [`run`](Sink::run) drives the lifecycle:
/// `init`, then `process` for every accepted envelope, then `finish`. If any
/// of those fails, `error` sees the failure before it is returned.
/// `cleanup` runs last in every case.
pub trait Sink<T>: Send {
    /// Called before the first envelope
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handle one accepted envelope
    fn process(&mut self, envelope: Envelope<T>) -> Result<()>;

    /// Called after the last envelope when nothing failed
    fn finish(&mut self) -> Result<()> {
        Ok(())
    }

    /// Called with the failure before it propagates
    fn error(&mut self, _error: &PipelineError) {}

    /// Always called once the stage is done, successful or not
    fn cleanup(&mut self) {}

    /// Get a human-readable name for this stage
    fn name(&self) -> &str {
        "sink"
    }

    /// Consume `sequence`, dropping envelopes `filter` rejects
    fn run(&mut self, sequence: &mut Sequence<'_, T>, filter: &dyn Filter<T>) -> Result<()> {
        let result = drain_into_sink(self, sequence, filter);
        if let Err(err) = &result {
            self.error(err);
        }
        self.cleanup();
        result
    }
}

/// Middle stage: consumes envelopes and offers zero or more per input
///
/// Envelopes the filter rejects bypass `process` and are forwarded to the
/// output queue unchanged, in their original position.
pub trait Transform<T>: Send {
    fn init(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handle one accepted envelope, offering any output to `queue`
    fn process(&mut self, envelope: Envelope<T>, queue: &mut dyn Queue<T>) -> Result<()>;

    /// Called after the last envelope; may still offer trailing output
    fn finish(&mut self, _queue: &mut dyn Queue<T>) -> Result<()> {
        Ok(())
    }

    fn error(&mut self, _error: &PipelineError) {}

    fn cleanup(&mut self) {}

    fn name(&self) -> &str {
        "transform"
    }

    /// Consume `sequence` into `queue`, forwarding envelopes `filter` rejects
    fn run(
        &mut self,
        sequence: &mut Sequence<'_, T>,
        queue: &mut dyn Queue<T>,
        filter: &dyn Filter<T>,
    ) -> Result<()> {
        let result = drain_into_transform(self, sequence, queue, filter);
        if let Err(err) = &result {
            self.error(err);
        }
        self.cleanup();
        result
    }
}

fn drain_into_sink<T, S>(
    sink: &mut S,
    sequence: &mut Sequence<'_, T>,
    filter: &dyn Filter<T>,
) -> Result<()>
where
    S: Sink<T> + ?Sized,
{
    sink.init()?;
    for item in sequence {
        let envelope = item?;
        if filter.accept(&envelope) {
            sink.process(envelope)?;
        }
    }
    sink.finish()
}

fn drain_into_transform<T, S>(
    transform: &mut S,
    sequence: &mut Sequence<'_, T>,
    queue: &mut dyn Queue<T>,
    filter: &dyn Filter<T>,
) -> Result<()>
where
    S: Transform<T> + ?Sized,
{
    transform.init()?;
    for item in sequence {
        let envelope = item?;
        if filter.accept(&envelope) {
            transform.process(envelope, queue)?;
        } else {
            queue.offer(envelope)?;
        }
    }
    transform.finish(queue)
}

/// A downstream stage as handed to the pipeline builder
pub enum Stage<T> {
    Sink(Box<dyn Sink<T>>),
    Transform(Box<dyn Transform<T>>),
}

impl<T> Stage<T> {
    /// Wrap a sink
    pub fn sink(sink: impl Sink<T> + 'static) -> Self {
        Stage::Sink(Box::new(sink))
    }

    /// Wrap a transform
    pub fn transform(transform: impl Transform<T> + 'static) -> Self {
        Stage::Transform(Box::new(transform))
    }

    /// Get the wrapped stage's name
    pub fn name(&self) -> &str {
        match self {
            Stage::Sink(sink) => sink.name(),
            Stage::Transform(transform) => transform.name(),
        }
    }

    /// Whether this is the terminal stage kind
    pub fn is_sink(&self) -> bool {
        matches!(self, Stage::Sink(_))
    }
}

/// Source offering every item of an iterator
pub struct IterSource<I> {
    name: String,
    items: Option<I>,
}

impl<I> IterSource<I>
where
    I: Iterator + Send,
{
    /// Create a source over `items`
    pub fn new(name: impl Into<String>, items: impl IntoIterator<IntoIter = I>) -> Self {
        Self {
            name: name.into(),
            items: Some(items.into_iter()),
        }
    }
}

impl<T, I> Source<T> for IterSource<I>
where
    I: Iterator<Item = T> + Send,
{
    fn run(&mut self, queue: &mut dyn Queue<T>) -> Result<()> {
        let items = self.items.take().ok_or(PipelineError::AlreadyStarted)?;
        for item in items {
            queue.offer(Envelope::new(item))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A pass-through transform that re-offers every envelope
#[derive(Debug)]
pub struct PassthroughTransform;

impl<T> Transform<T> for PassthroughTransform {
    fn process(&mut self, envelope: Envelope<T>, queue: &mut dyn Queue<T>) -> Result<()> {
        queue.offer(envelope)
    }

    fn name(&self) -> &str {
        "passthrough"
    }
}

/// A mapping transform that rewrites each accepted payload
pub struct MapTransform<F> {
    name: String,
    mapper: F,
}

impl<F> MapTransform<F> {
    /// Create a transform applying `mapper` to each accepted payload
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
        }
    }
}

impl<T, F> Transform<T> for MapTransform<F>
where
    F: FnMut(T) -> Result<T> + Send,
{
    fn process(&mut self, envelope: Envelope<T>, queue: &mut dyn Queue<T>) -> Result<()> {
        let mapped = (self.mapper)(envelope.into_payload())?;
        queue.offer(Envelope::new(mapped))
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// A transform emitting zero or more payloads per accepted input
pub struct FlatMapTransform<F> {
    name: String,
    mapper: F,
}

impl<F> FlatMapTransform<F> {
    /// Create a transform expanding each accepted payload with `mapper`
    pub fn new(name: impl Into<String>, mapper: F) -> Self {
        Self {
            name: name.into(),
            mapper,
        }
    }
}

impl<T, F> Transform<T> for FlatMapTransform<F>
where
    F: FnMut(T) -> Result<Vec<T>> + Send,
{
    fn process(&mut self, envelope: Envelope<T>, queue: &mut dyn Queue<T>) -> Result<()> {
        for output in (self.mapper)(envelope.into_payload())? {
            queue.offer(Envelope::new(output))?;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Sink appending payloads to a shared vector
pub struct CollectSink<T> {
    name: String,
    items: Arc<Mutex<Vec<T>>>,
}

impl<T> CollectSink<T> {
    /// Create an empty collector
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Shared view of everything collected so far
    pub fn handle(&self) -> Arc<Mutex<Vec<T>>> {
        Arc::clone(&self.items)
    }
}

impl<T: Send> Sink<T> for CollectSink<T> {
    fn process(&mut self, envelope: Envelope<T>) -> Result<()> {
        self.items.lock().push(envelope.into_payload());
        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Sink forwarding payloads into a crossbeam channel
pub struct ChannelSink<T> {
    name: String,
    sender: Sender<T>,
}

impl<T> ChannelSink<T> {
    /// Create a sink sending into `sender`
    pub fn new(name: impl Into<String>, sender: Sender<T>) -> Self {
        Self {
            name: name.into(),
            sender,
        }
    }
}

impl<T: Send> Sink<T> for ChannelSink<T> {
    fn process(&mut self, envelope: Envelope<T>) -> Result<()> {
        self.sender
            .send(envelope.into_payload())
            .map_err(|_| PipelineError::stage(format!("{}: receiver disconnected", self.name)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
