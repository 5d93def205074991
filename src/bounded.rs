use crate::envelope::Envelope;
use crate::error::{PipelineError, QueueSide, Result};
use crate::metrics::LinkMetrics;
use crate::queue::Queue;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Smallest capacity a bounded queue will run with
pub const MIN_CAPACITY: usize = 10;

/// Sizing and timing of a bounded queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueConfig {
    /// Maximum number of queued envelopes; values below [`MIN_CAPACITY`] are raised to it
    pub capacity: usize,
    /// Long wait between re-checks
    ///
    /// A reader whose slice runs out with envelopes queued takes them even
    /// below the watermark, so a producer trickling items in is seen within
    /// one slice.
    pub wait_slice: Duration,
    /// Short wait interleaved with the long ones
    pub emergency_slice: Duration,
    /// Waits allowed per blocking call before giving up
    pub retry_budget: u32,
}

impl QueueConfig {
    /// Default: capacity 100, 100ms / 5ms slices, 2000 waits
    pub fn new() -> Self {
        Self {
            capacity: 100,
            wait_slice: Duration::from_millis(100),
            emergency_slice: Duration::from_millis(5),
            retry_budget: 2000,
        }
    }

    /// Set the capacity (raised to [`MIN_CAPACITY`] when smaller)
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Set the long wait slice
    pub fn with_wait_slice(mut self, slice: Duration) -> Self {
        self.wait_slice = slice;
        self
    }

    /// Set the short wait slice
    pub fn with_emergency_slice(mut self, slice: Duration) -> Self {
        self.emergency_slice = slice;
        self
    }

    /// Set how many waits one blocking call may use
    pub fn with_retry_budget(mut self, budget: u32) -> Self {
        self.retry_budget = budget;
        self
    }

    /// Capacity after applying the minimum
    pub fn effective_capacity(&self) -> usize {
        self.capacity.max(MIN_CAPACITY)
    }

    /// Queue size at which a blocked side resumes
    pub fn watermark(&self) -> usize {
        self.effective_capacity() / 2 + 1
    }

    /// Upper bound on how long one blocking call can wait in total
    pub fn max_wait(&self) -> Duration {
        let short = self.retry_budget.div_ceil(2);
        let long = self.retry_budget / 2;
        self.emergency_slice * short + self.wait_slice * long
    }

    /// Reject settings that would make every blocking call fail immediately
    pub fn validate(&self) -> Result<()> {
        if self.retry_budget == 0 {
            return Err(PipelineError::ConfigError(
                "queue retry budget must be at least 1".into(),
            ));
        }
        if self.wait_slice.is_zero() || self.emergency_slice.is_zero() {
            return Err(PipelineError::ConfigError(
                "queue wait slices must be non-zero".into(),
            ));
        }
        Ok(())
    }

    fn slice(&self, attempt: u32) -> Duration {
        if attempt % 2 == 0 {
            self.emergency_slice
        } else {
            self.wait_slice
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self::new()
    }
}

struct State<T> {
    items: VecDeque<Envelope<T>>,
    finished: bool,
    interrupt: Option<PipelineError>,
    /// Cleared once an interrupt has been observed; no signalling after that
    gates_linked: bool,
}

struct Shared<T> {
    name: String,
    config: QueueConfig,
    capacity: usize,
    watermark: usize,
    state: Mutex<State<T>>,
    producer_gate: Condvar,
    consumer_gate: Condvar,
    metrics: LinkMetrics,
}

impl<T> Shared<T> {
    /// Raise the pending interrupt, if any, and detach the gates
    fn check_interrupt(&self, state: &mut MutexGuard<'_, State<T>>) -> Result<()> {
        match state.interrupt.clone() {
            Some(cause) => {
                state.gates_linked = false;
                Err(PipelineError::Interrupted(Box::new(cause)))
            }
            None => Ok(()),
        }
    }

    fn reserve_interrupt(&self, cause: &PipelineError) {
        {
            let mut state = self.state.lock();
            if state.interrupt.is_some() {
                return;
            }
            state.interrupt = Some(cause.clone());
        }
        debug!(queue = %self.name, %cause, "interrupt reserved");
        self.producer_gate.notify_all();
        self.consumer_gate.notify_all();
    }

    fn timeout(&self, side: QueueSide, started: Instant) -> PipelineError {
        let waited = started.elapsed();
        warn!(queue = %self.name, %side, ?waited, "retry budget exhausted");
        PipelineError::BackpressureTimeout {
            queue: self.name.clone(),
            side,
            waited,
        }
    }
}

/// Create a bounded queue and split it into its two halves
///
/// The queue is a `VecDeque` under one short critical section plus two gates:
/// the producer waits on one while the queue is full, the consumer on the
/// other while it is empty. Every wait is bounded by a slice and counted
/// against the retry budget, so a partner that never comes back surfaces as
/// [`PipelineError::BackpressureTimeout`] instead of a hang.
///
/// Neither half is `Clone`, so there is always exactly one producer and one
/// consumer.
pub fn channel<T>(
    name: impl Into<String>,
    config: QueueConfig,
    metrics: LinkMetrics,
) -> (QueueWriter<T>, QueueReader<T>) {
    let name = name.into();
    if config.capacity < MIN_CAPACITY {
        debug!(
            queue = %name,
            requested = config.capacity,
            capacity = MIN_CAPACITY,
            "queue capacity raised to minimum"
        );
    }
    let capacity = config.effective_capacity();
    let shared = Arc::new(Shared {
        name,
        config,
        capacity,
        watermark: config.watermark(),
        state: Mutex::new(State {
            items: VecDeque::with_capacity(capacity),
            finished: false,
            interrupt: None,
            gates_linked: true,
        }),
        producer_gate: Condvar::new(),
        consumer_gate: Condvar::new(),
        metrics,
    });
    (
        QueueWriter {
            shared: Arc::clone(&shared),
        },
        QueueReader { shared },
    )
}

/// Producer half of a bounded queue
pub struct QueueWriter<T> {
    shared: Arc<Shared<T>>,
}

impl<T> QueueWriter<T> {
    /// Append an envelope, blocking while the queue is full
    ///
    /// A full queue blocks the caller until the reader has drained it to the
    /// watermark. Fails with `BackpressureTimeout` if that does not happen
    /// within the retry budget, with `Interrupted` if the cascade fired, and
    /// with `QueueFinished` after [`finish`](Self::finish).
    pub fn offer(&mut self, envelope: Envelope<T>) -> Result<()> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        shared.check_interrupt(&mut state)?;
        if state.finished {
            warn!(queue = %shared.name, "offer after finish rejected");
            return Err(PipelineError::QueueFinished(shared.name.clone()));
        }

        if state.items.len() >= shared.capacity {
            shared.metrics.record_producer_block();
            let started = Instant::now();
            let mut attempt = 0;
            loop {
                if attempt >= shared.config.retry_budget {
                    return Err(shared.timeout(QueueSide::Producer, started));
                }
                if state.gates_linked {
                    shared.consumer_gate.notify_one();
                }
                let slice = shared.config.slice(attempt);
                trace!(queue = %shared.name, attempt, ?slice, "producer waiting");
                shared.producer_gate.wait_for(&mut state, slice);
                attempt += 1;
                shared.check_interrupt(&mut state)?;
                if state.items.len() <= shared.watermark {
                    break;
                }
            }
        }

        state.items.push_back(envelope);
        let wake_reader = state.items.len() >= shared.watermark && state.gates_linked;
        drop(state);
        if wake_reader {
            shared.consumer_gate.notify_one();
        }
        Ok(())
    }

    /// Mark the queue finished and wake the reader
    ///
    /// Envelopes already queued are still delivered. Calling it again is a no-op.
    pub fn finish(&mut self) {
        {
            let mut state = self.shared.state.lock();
            if state.finished {
                return;
            }
            state.finished = true;
        }
        trace!(queue = %self.shared.name, "finished");
        self.shared.consumer_gate.notify_all();
    }

    /// Make the next blocking call on either half fail with `Interrupted(cause)`
    pub fn reserve_interrupt(&self, cause: &PipelineError) {
        self.shared.reserve_interrupt(cause);
    }

    /// Handle the cascade uses to interrupt this queue
    pub fn interrupt_handle(&self) -> InterruptHandle<T> {
        InterruptHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Number of queued envelopes
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Effective capacity after the minimum is applied
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Size at which a blocked side resumes
    pub fn watermark(&self) -> usize {
        self.shared.watermark
    }

    /// Get the queue name
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl<T> Queue<T> for QueueWriter<T> {
    fn offer(&mut self, envelope: Envelope<T>) -> Result<()> {
        QueueWriter::offer(self, envelope)
    }

    fn finish(&mut self) -> Result<()> {
        QueueWriter::finish(self);
        Ok(())
    }
}

impl<T> Drop for QueueWriter<T> {
    fn drop(&mut self) {
        // An unfinished writer going away means the producer died mid-stream.
        let finished = self.shared.state.lock().finished;
        if !finished {
            self.shared.reserve_interrupt(&PipelineError::ThreadError(format!(
                "producer of queue '{}' dropped before finishing",
                self.shared.name
            )));
        }
    }
}

/// Consumer half of a bounded queue
///
/// Also an `Iterator` over `Result<Envelope<T>>`, which is how stages see it.
pub struct QueueReader<T> {
    shared: Arc<Shared<T>>,
}

impl<T> QueueReader<T> {
    /// Whether another envelope will be delivered, blocking while the queue is empty
    ///
    /// An empty, unfinished queue blocks until the writer finishes, the queue
    /// fills to the watermark, or a wait slice ends with something queued.
    /// Returns `false` once the queue is finished and drained.
    pub fn has_next(&mut self) -> Result<bool> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        shared.check_interrupt(&mut state)?;
        if !state.items.is_empty() {
            return Ok(true);
        }
        if state.finished {
            return Ok(false);
        }

        shared.metrics.record_consumer_block();
        let started = Instant::now();
        let mut attempt = 0;
        loop {
            if attempt >= shared.config.retry_budget {
                return Err(shared.timeout(QueueSide::Consumer, started));
            }
            if state.gates_linked {
                shared.producer_gate.notify_one();
            }
            let slice = shared.config.slice(attempt);
            trace!(queue = %shared.name, attempt, ?slice, "consumer waiting");
            let timed_out = shared.consumer_gate.wait_for(&mut state, slice).timed_out();
            attempt += 1;
            shared.check_interrupt(&mut state)?;
            if state.finished || state.items.len() >= shared.watermark {
                break;
            }
            if timed_out && !state.items.is_empty() {
                break;
            }
        }
        Ok(!state.items.is_empty())
    }

    /// Take the oldest envelope without blocking
    pub fn pop(&mut self) -> Option<Envelope<T>> {
        let shared = &*self.shared;
        let mut state = shared.state.lock();
        let envelope = state.items.pop_front();
        let wake_writer =
            envelope.is_some() && state.items.len() <= shared.watermark && state.gates_linked;
        drop(state);
        if wake_writer {
            shared.producer_gate.notify_one();
        }
        envelope
    }

    /// Make the next blocking call on either half fail with `Interrupted(cause)`
    pub fn reserve_interrupt(&self, cause: &PipelineError) {
        self.shared.reserve_interrupt(cause);
    }

    /// Whether the writer has finished
    pub fn is_finished(&self) -> bool {
        self.shared.state.lock().finished
    }

    /// Number of queued envelopes
    pub fn len(&self) -> usize {
        self.shared.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get the queue name
    pub fn name(&self) -> &str {
        &self.shared.name
    }
}

impl<T> Iterator for QueueReader<T> {
    type Item = Result<Envelope<T>>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => self.pop().map(Ok),
            Ok(false) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl<T> Drop for QueueReader<T> {
    fn drop(&mut self) {
        let abandoned = {
            let state = self.shared.state.lock();
            !(state.finished && state.items.is_empty())
        };
        if abandoned {
            self.shared.reserve_interrupt(&PipelineError::ThreadError(format!(
                "consumer of queue '{}' dropped before draining",
                self.shared.name
            )));
        }
    }
}

/// Anything the cascade can cancel
pub trait Interrupt: Send + Sync {
    fn reserve_interrupt(&self, cause: &PipelineError);

    fn name(&self) -> &str;
}

/// Type-erasable handle on a bounded queue, held by the cascade
pub struct InterruptHandle<T> {
    shared: Arc<Shared<T>>,
}

impl<T: Send> Interrupt for InterruptHandle<T> {
    fn reserve_interrupt(&self, cause: &PipelineError) {
        self.shared.reserve_interrupt(cause);
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}
