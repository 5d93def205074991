use crate::bounded::Interrupt;
use crate::error::PipelineError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error};

/// Broadcasts the first pipeline failure to every registered queue
///
/// Threaded links register their queues when the pipeline is built. The
/// failing link's own queue is among them, since its producer may be blocked
/// offering into it. A thread parked on a gate wakes at once and raises
/// `Interrupted`; a thread between blocking calls raises it on its next queue
/// touch.
#[derive(Default)]
pub struct Cascade {
    failure: Mutex<Option<PipelineError>>,
    tripped: AtomicBool,
    queues: Mutex<Vec<Arc<dyn Interrupt>>>,
}

impl Cascade {
    /// Create an untripped cascade with no queues
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a queue to be interrupted when the cascade trips
    ///
    /// A queue registered after the cascade tripped is interrupted right away.
    pub fn register(&self, queue: Arc<dyn Interrupt>) {
        let mut queues = self.queues.lock();
        if let Some(cause) = self.failure() {
            queue.reserve_interrupt(&cause);
        }
        queues.push(queue);
    }

    /// Record `cause` as the pipeline failure and interrupt every queue
    ///
    /// Only the first call has any effect; it returns `true`. `Interrupted`
    /// wrappers are stripped so the recorded failure is the original one.
    pub fn interrupt(&self, origin: &str, cause: &PipelineError) -> bool {
        let root = cause.root_cause().clone();
        {
            let mut failure = self.failure.lock();
            if failure.is_some() {
                debug!(origin, %cause, "cascade already tripped");
                return false;
            }
            *failure = Some(root.clone());
            self.tripped.store(true, Ordering::Release);
        }

        error!(origin, cause = %root, "stage failed, cancelling pipeline");
        let queues: Vec<_> = self.queues.lock().iter().cloned().collect();
        for queue in queues {
            debug!(origin, queue = queue.name(), "interrupting");
            queue.reserve_interrupt(&root);
        }
        true
    }

    /// Whether any stage has failed
    pub fn is_tripped(&self) -> bool {
        self.tripped.load(Ordering::Acquire)
    }

    /// The first recorded failure
    pub fn failure(&self) -> Option<PipelineError> {
        self.failure.lock().clone()
    }

    /// Number of registered queues
    pub fn len(&self) -> usize {
        self.queues.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Cascade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cascade")
            .field("failure", &self.failure())
            .field("queues", &self.len())
            .finish()
    }
}

/// Trips the cascade if the owning thread unwinds
pub(crate) struct PanicGuard {
    cascade: Arc<Cascade>,
    origin: String,
}

impl PanicGuard {
    pub(crate) fn new(cascade: &Arc<Cascade>, origin: &str) -> Self {
        Self {
            cascade: Arc::clone(cascade),
            origin: origin.to_string(),
        }
    }
}

impl Drop for PanicGuard {
    fn drop(&mut self) {
        if std::thread::panicking() {
            let cause = PipelineError::ThreadError(format!("worker '{}' panicked", self.origin));
            self.cascade.interrupt(&self.origin, &cause);
        }
    }
}
