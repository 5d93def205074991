use crate::bounded::{self, QueueConfig, QueueReader, QueueWriter};
use crate::cascade::{Cascade, PanicGuard};
use crate::envelope::{Envelope, Filter};
use crate::error::{PipelineError, Result};
use crate::metrics::LinkMetrics;
use crate::queue::{Queue, Sequence, VecQueue};
use crate::stage::{Sink, Stage, Transform};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// How a link hands envelopes from one stage to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkMode {
    /// Synchronous call into the downstream stage; no buffering, no thread
    CallThrough,
    /// Upstream runs to completion into an unbounded buffer, then downstream drains it
    Buffered,
    /// Downstream runs on its own thread behind a bounded queue
    Threaded(QueueConfig),
}

impl LinkMode {
    /// Threaded with the default queue configuration
    pub fn threaded() -> Self {
        LinkMode::Threaded(QueueConfig::default())
    }

    /// Threaded with a default queue of the given capacity
    pub fn threaded_with_capacity(capacity: usize) -> Self {
        LinkMode::Threaded(QueueConfig::default().with_capacity(capacity))
    }

    /// Short name for logs and test messages
    pub fn label(&self) -> &'static str {
        match self {
            LinkMode::CallThrough => "call-through",
            LinkMode::Buffered => "buffered",
            LinkMode::Threaded(_) => "threaded",
        }
    }
}

/// The stage behind a link and, for a transform, the link it feeds
enum Downstream<T> {
    Sink(Box<dyn Sink<T>>),
    Transform {
        stage: Box<dyn Transform<T>>,
        next: Box<Link<T>>,
    },
}

impl<T: Send + 'static> Downstream<T> {
    fn start_next(&mut self) -> Result<()> {
        match self {
            Downstream::Sink(_) => Ok(()),
            Downstream::Transform { next, .. } => next.start(),
        }
    }

    fn finish_next(&mut self) -> Result<()> {
        match self {
            Downstream::Sink(_) => Ok(()),
            Downstream::Transform { next, .. } => next.finish(),
        }
    }

    fn abort_next(&mut self, cause: &PipelineError) {
        if let Downstream::Transform { next, .. } = self {
            next.abort(cause);
        }
    }

    /// Full stage lifecycle over `sequence`
    fn run(&mut self, sequence: &mut Sequence<'_, T>, filter: &dyn Filter<T>) -> Result<()> {
        match self {
            Downstream::Sink(sink) => sink.run(sequence, filter),
            Downstream::Transform { stage, next } => stage.run(sequence, &mut **next, filter),
        }
    }

    fn init(&mut self) -> Result<()> {
        match self {
            Downstream::Sink(sink) => sink.init(),
            Downstream::Transform { stage, .. } => stage.init(),
        }
    }

    fn process(&mut self, envelope: Envelope<T>) -> Result<()> {
        match self {
            Downstream::Sink(sink) => sink.process(envelope),
            Downstream::Transform { stage, next } => stage.process(envelope, &mut **next),
        }
    }

    /// Pass a rejected envelope on; a sink has nowhere to send it
    fn forward(&mut self, envelope: Envelope<T>) -> Result<()> {
        match self {
            Downstream::Sink(_) => Ok(()),
            Downstream::Transform { next, .. } => next.offer(envelope),
        }
    }

    fn finish_stage(&mut self) -> Result<()> {
        match self {
            Downstream::Sink(sink) => sink.finish(),
            Downstream::Transform { stage, next } => stage.finish(&mut **next),
        }
    }

    fn error(&mut self, cause: &PipelineError) {
        match self {
            Downstream::Sink(sink) => sink.error(cause),
            Downstream::Transform { stage, .. } => stage.error(cause),
        }
    }

    fn cleanup(&mut self) {
        match self {
            Downstream::Sink(sink) => sink.cleanup(),
            Downstream::Transform { stage, .. } => stage.cleanup(),
        }
    }
}

/// Counts envelopes crossing a link and how long the stage held each one
struct MeteredSequence<'a, I> {
    inner: I,
    metrics: &'a LinkMetrics,
    handed_out: Option<Instant>,
}

impl<'a, I> MeteredSequence<'a, I> {
    fn new(inner: I, metrics: &'a LinkMetrics) -> Self {
        Self {
            inner,
            metrics,
            handed_out: None,
        }
    }
}

impl<T, I> Iterator for MeteredSequence<'_, I>
where
    I: Iterator<Item = Result<Envelope<T>>>,
{
    type Item = Result<Envelope<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(at) = self.handed_out.take() {
            self.metrics.record_processed(at.elapsed());
        }
        let item = self.inner.next();
        if let Some(Ok(_)) = &item {
            self.handed_out = Some(Instant::now());
        }
        item
    }
}

/// Counts envelopes the wrapped filter rejects
struct MeteredFilter<'a, T> {
    inner: &'a dyn Filter<T>,
    metrics: &'a LinkMetrics,
}

impl<T> Filter<T> for MeteredFilter<'_, T> {
    fn accept(&self, envelope: &Envelope<T>) -> bool {
        let accepted = self.inner.accept(envelope);
        if !accepted {
            self.metrics.record_forwarded();
        }
        accepted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Closed,
}

pub(crate) struct CallThroughLink<T> {
    name: String,
    downstream: Downstream<T>,
    filter: Arc<dyn Filter<T>>,
    metrics: LinkMetrics,
    phase: Phase,
}

impl<T: Send + 'static> CallThroughLink<T> {
    fn start(&mut self) -> Result<()> {
        self.downstream.start_next()?;
        if let Err(err) = self.downstream.init() {
            self.fail(&err);
            return Err(err);
        }
        self.phase = Phase::Running;
        debug!(link = %self.name, "call-through link started");
        Ok(())
    }

    fn offer(&mut self, envelope: Envelope<T>) -> Result<()> {
        match self.phase {
            Phase::Running => {}
            Phase::Idle => {
                return Err(PipelineError::stage(format!(
                    "link '{}' offered to before start",
                    self.name
                )))
            }
            Phase::Closed => {
                warn!(link = %self.name, "offer after finish rejected");
                return Err(PipelineError::QueueFinished(self.name.clone()));
            }
        }

        let started = Instant::now();
        let result = if self.filter.accept(&envelope) {
            self.downstream.process(envelope)
        } else {
            self.metrics.record_forwarded();
            self.downstream.forward(envelope)
        };
        match result {
            Ok(()) => {
                self.metrics.record_processed(started.elapsed());
                Ok(())
            }
            Err(err) => {
                self.fail(&err);
                Err(err)
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        match self.phase {
            Phase::Running => {}
            Phase::Closed => return Ok(()),
            Phase::Idle => {
                return Err(PipelineError::stage(format!(
                    "link '{}' finished before start",
                    self.name
                )))
            }
        }
        if let Err(err) = self.downstream.finish_stage() {
            self.fail(&err);
            return Err(err);
        }
        self.downstream.cleanup();
        self.phase = Phase::Closed;
        trace!(link = %self.name, "call-through link finished");
        self.downstream.finish_next()
    }

    fn abort(&mut self, cause: &PipelineError) {
        if self.phase == Phase::Running {
            self.fail(cause);
        }
        self.phase = Phase::Closed;
        self.downstream.abort_next(cause);
    }

    /// Report `cause` to the stage and clean it up; the stage is done after this
    fn fail(&mut self, cause: &PipelineError) {
        self.phase = Phase::Closed;
        self.downstream.error(cause);
        self.downstream.cleanup();
    }
}

pub(crate) struct BufferedLink<T> {
    name: String,
    buffer: VecQueue<T>,
    downstream: Downstream<T>,
    filter: Arc<dyn Filter<T>>,
    metrics: LinkMetrics,
    phase: Phase,
}

impl<T: Send + 'static> BufferedLink<T> {
    fn start(&mut self) -> Result<()> {
        self.downstream.start_next()?;
        self.phase = Phase::Running;
        debug!(link = %self.name, "buffered link started");
        Ok(())
    }

    fn offer(&mut self, envelope: Envelope<T>) -> Result<()> {
        match self.phase {
            Phase::Running => self.buffer.offer(envelope),
            Phase::Idle => Err(PipelineError::stage(format!(
                "link '{}' offered to before start",
                self.name
            ))),
            Phase::Closed => {
                warn!(link = %self.name, "offer after finish rejected");
                Err(PipelineError::QueueFinished(self.name.clone()))
            }
        }
    }

    fn finish(&mut self) -> Result<()> {
        match self.phase {
            Phase::Running => {}
            Phase::Closed => return Ok(()),
            Phase::Idle => {
                return Err(PipelineError::stage(format!(
                    "link '{}' finished before start",
                    self.name
                )))
            }
        }
        self.phase = Phase::Closed;
        self.buffer.finish()?;
        debug!(link = %self.name, buffered = self.buffer.len(), "draining buffer");

        let filter = MeteredFilter {
            inner: self.filter.as_ref(),
            metrics: &self.metrics,
        };
        let mut sequence = MeteredSequence::new(self.buffer.drain(), &self.metrics);
        self.downstream.run(&mut sequence, &filter)?;
        self.downstream.finish_next()
    }

    fn abort(&mut self, cause: &PipelineError) {
        self.phase = Phase::Closed;
        // The downstream stage never ran, so there are no hooks to report to.
        let discarded = self.buffer.len();
        self.buffer = VecQueue::new(self.name.clone());
        trace!(link = %self.name, discarded, "buffer discarded");
        self.downstream.abort_next(cause);
    }
}

/// Everything a threaded link moves onto its worker thread
struct Worker<T> {
    name: String,
    reader: QueueReader<T>,
    downstream: Downstream<T>,
    filter: Arc<dyn Filter<T>>,
    metrics: LinkMetrics,
    cascade: Arc<Cascade>,
}

impl<T: Send + 'static> Worker<T> {
    fn run(mut self) -> Result<()> {
        let _guard = PanicGuard::new(&self.cascade, &self.name);
        debug!(link = %self.name, "worker started");

        let result = self.drive();
        match &result {
            Ok(()) => debug!(link = %self.name, "worker finished"),
            Err(err) => {
                self.cascade.interrupt(&self.name, err);
                self.downstream.abort_next(err);
                debug!(link = %self.name, %err, "worker exiting after failure");
            }
        }
        result
    }

    fn drive(&mut self) -> Result<()> {
        self.downstream.start_next()?;
        let filter = MeteredFilter {
            inner: self.filter.as_ref(),
            metrics: &self.metrics,
        };
        let mut sequence = MeteredSequence::new(&mut self.reader, &self.metrics);
        self.downstream.run(&mut sequence, &filter)?;
        self.downstream.finish_next()
    }
}

pub(crate) struct ThreadedLink<T> {
    name: String,
    writer: QueueWriter<T>,
    worker: Option<Worker<T>>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl<T: Send + 'static> ThreadedLink<T> {
    fn start(&mut self) -> Result<()> {
        let worker = self
            .worker
            .take()
            .ok_or(PipelineError::AlreadyStarted)?;
        let handle = thread::Builder::new()
            .name(format!("link-{}", self.name))
            .spawn(move || worker.run())
            .map_err(|e| {
                PipelineError::ThreadError(format!("failed to spawn worker '{}': {}", self.name, e))
            })?;
        self.handle = Some(handle);
        debug!(link = %self.name, "threaded link started");
        Ok(())
    }

    fn offer(&mut self, envelope: Envelope<T>) -> Result<()> {
        self.writer.offer(envelope)
    }

    fn finish(&mut self) -> Result<()> {
        self.writer.finish();
        match self.handle.take() {
            Some(handle) => self.join(handle),
            None if self.worker.is_some() => Err(PipelineError::stage(format!(
                "link '{}' finished before start",
                self.name
            ))),
            None => Ok(()),
        }
    }

    fn abort(&mut self, cause: &PipelineError) {
        self.writer.reserve_interrupt(cause);
        self.writer.finish();
        if let Some(handle) = self.handle.take() {
            if let Err(err) = self.join(handle) {
                trace!(link = %self.name, %err, "worker result discarded during abort");
            }
        }
    }

    fn join(&self, handle: JoinHandle<Result<()>>) -> Result<()> {
        match handle.join() {
            Ok(result) => result,
            Err(_) => Err(PipelineError::ThreadError(format!(
                "worker '{}' panicked",
                self.name
            ))),
        }
    }
}

impl<T> Drop for ThreadedLink<T> {
    fn drop(&mut self) {
        // Dropped without finish or abort, e.g. while unwinding: stop the worker and wait.
        if let Some(handle) = self.handle.take() {
            self.writer.reserve_interrupt(&PipelineError::ThreadError(format!(
                "link '{}' dropped while running",
                self.name
            )));
            self.writer.finish();
            let _ = handle.join();
        }
    }
}

/// One boundary of the pipeline chain
///
/// Each link owns its downstream stage and, for a transform, the rest of the
/// chain behind it. Success tears a chain down with `finish`, failure with
/// `abort`; both walk to the tail and join every worker on the way.
pub(crate) enum Link<T> {
    CallThrough(CallThroughLink<T>),
    Buffered(BufferedLink<T>),
    Threaded(ThreadedLink<T>),
}

impl<T: Send + 'static> Link<T> {
    /// Wrap `stage` behind a link of the given mode
    ///
    /// `next` must be present exactly when `stage` is a transform.
    pub(crate) fn new(
        name: String,
        mode: LinkMode,
        stage: Stage<T>,
        filter: Arc<dyn Filter<T>>,
        next: Option<Link<T>>,
        metrics: LinkMetrics,
        cascade: &Arc<Cascade>,
    ) -> Result<Self> {
        let downstream = match (stage, next) {
            (Stage::Sink(sink), None) => Downstream::Sink(sink),
            (Stage::Transform(stage), Some(next)) => Downstream::Transform {
                stage,
                next: Box::new(next),
            },
            (Stage::Sink(sink), Some(_)) => {
                return Err(PipelineError::ConfigError(format!(
                    "sink '{}' must be the last stage",
                    sink.name()
                )))
            }
            (Stage::Transform(stage), None) => {
                return Err(PipelineError::ConfigError(format!(
                    "transform '{}' has no downstream stage; pipelines end with a sink",
                    stage.name()
                )))
            }
        };

        let link = match mode {
            LinkMode::CallThrough => Link::CallThrough(CallThroughLink {
                name,
                downstream,
                filter,
                metrics,
                phase: Phase::Idle,
            }),
            LinkMode::Buffered => Link::Buffered(BufferedLink {
                buffer: VecQueue::new(name.clone()),
                name,
                downstream,
                filter,
                metrics,
                phase: Phase::Idle,
            }),
            LinkMode::Threaded(config) => {
                config.validate()?;
                let (writer, reader) = bounded::channel(name.clone(), config, metrics.clone());
                cascade.register(Arc::new(writer.interrupt_handle()));
                Link::Threaded(ThreadedLink {
                    worker: Some(Worker {
                        name: name.clone(),
                        reader,
                        downstream,
                        filter,
                        metrics,
                        cascade: Arc::clone(cascade),
                    }),
                    name,
                    writer,
                    handle: None,
                })
            }
        };
        Ok(link)
    }

    pub(crate) fn name(&self) -> &str {
        match self {
            Link::CallThrough(link) => &link.name,
            Link::Buffered(link) => &link.name,
            Link::Threaded(link) => &link.name,
        }
    }

    /// Bring up this link and everything behind it
    ///
    /// Threaded links start their own tail from the worker thread.
    pub(crate) fn start(&mut self) -> Result<()> {
        match self {
            Link::CallThrough(link) => link.start(),
            Link::Buffered(link) => link.start(),
            Link::Threaded(link) => link.start(),
        }
    }

    /// Tear down after a failure: report `cause` to running stages and join workers
    pub(crate) fn abort(&mut self, cause: &PipelineError) {
        match self {
            Link::CallThrough(link) => link.abort(cause),
            Link::Buffered(link) => link.abort(cause),
            Link::Threaded(link) => link.abort(cause),
        }
    }
}

impl<T: Send + 'static> Queue<T> for Link<T> {
    fn offer(&mut self, envelope: Envelope<T>) -> Result<()> {
        match self {
            Link::CallThrough(link) => link.offer(envelope),
            Link::Buffered(link) => link.offer(envelope),
            Link::Threaded(link) => link.offer(envelope),
        }
    }

    /// Finish this link and, in order, every link behind it
    fn finish(&mut self) -> Result<()> {
        match self {
            Link::CallThrough(link) => link.finish(),
            Link::Buffered(link) => link.finish(),
            Link::Threaded(link) => link.finish(),
        }
    }
}
