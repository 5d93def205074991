use crate::envelope::Envelope;
use crate::error::{PipelineError, Result};
use std::collections::VecDeque;
use tracing::warn;

/// Where a stage sends its output
///
/// Sources and transforms only ever `offer`. The engine calls `finish` once
/// the producing stage is done; implementations treat a second `finish` as a
/// no-op and reject offers after it.
pub trait Queue<T> {
    fn offer(&mut self, envelope: Envelope<T>) -> Result<()>;

    fn finish(&mut self) -> Result<()>;
}

/// The consuming side of a queue, as sinks and transforms iterate it
pub type Sequence<'a, T> = dyn Iterator<Item = Result<Envelope<T>>> + 'a;

/// Unbounded in-memory queue
///
/// Backs buffered links, where the upstream stage runs to completion before
/// the downstream one starts. Also handy for driving a single stage in tests.
#[derive(Debug)]
pub struct VecQueue<T> {
    name: String,
    items: VecDeque<Envelope<T>>,
    finished: bool,
}

impl<T> VecQueue<T> {
    /// Create an empty, unfinished buffer
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            items: VecDeque::new(),
            finished: false,
        }
    }

    /// Number of buffered envelopes
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Whether `finish` has been called
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Drain queued envelopes in arrival order
    pub fn drain(&mut self) -> impl Iterator<Item = Result<Envelope<T>>> + '_ {
        self.items.drain(..).map(Ok)
    }

    /// Unwrap every queued payload
    pub fn into_payloads(self) -> Vec<T> {
        self.items.into_iter().map(Envelope::into_payload).collect()
    }
}

impl<T> Queue<T> for VecQueue<T> {
    fn offer(&mut self, envelope: Envelope<T>) -> Result<()> {
        if self.finished {
            warn!(queue = %self.name, "offer after finish rejected");
            return Err(PipelineError::QueueFinished(self.name.clone()));
        }
        self.items.push_back(envelope);
        Ok(())
    }

    fn finish(&mut self) -> Result<()> {
        self.finished = true;
        Ok(())
    }
}
