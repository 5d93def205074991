//! An in-process pipeline engine with a per-link choice of concurrency.
//!
//! A pipeline is one [`Source`] followed by a linear chain of [`Transform`]s
//! and ends in exactly one [`Sink`]. Each boundary between two stages is a
//! link, and every link picks its own [`LinkMode`]:
//!
//! - `CallThrough`: the upstream `offer` calls straight into the downstream
//!   stage on the same stack, with no buffering.
//! - `Buffered`: upstream runs to completion into an unbounded buffer, then
//!   downstream drains it on the same thread.
//! - `Threaded`: downstream runs on a dedicated thread behind a bounded,
//!   backpressured queue (see [`bounded`]).
//!
//! Every stage has a [`Filter`]. Envelopes a transform rejects are forwarded
//! untouched, so control markers can ride the same queues as data. Any stage
//! failure trips the pipeline's [`Cascade`], which interrupts every threaded
//! queue so all worker threads exit promptly. [`Pipeline::execute`] returns
//! that first failure once every thread has been joined.
//!
//! # Example
//!
//! ```
//! use relay_pipeline::{CollectSink, IterSource, LinkMode, MapTransform, Pipeline, Stage};
//!
//! let sink = CollectSink::new("collect");
//! let collected = sink.handle();
//!
//! Pipeline::builder(IterSource::new("numbers", 1..=5u32))
//!     .append(
//!         Stage::transform(MapTransform::new("double", |n: u32| Ok(n * 2))),
//!         LinkMode::threaded_with_capacity(10),
//!     )
//!     .append(Stage::sink(sink), LinkMode::CallThrough)
//!     .build()?
//!     .execute()?;
//!
//! assert_eq!(*collected.lock(), vec![2, 4, 6, 8, 10]);
//! # Ok::<(), relay_pipeline::PipelineError>(())
//! ```

pub mod bounded;
pub mod cascade;
pub mod envelope;
pub mod error;
pub mod link;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod stage;

// Re-exports for convenience
pub use bounded::{QueueConfig, QueueReader, QueueWriter};
pub use cascade::Cascade;
pub use envelope::{AcceptAll, AcceptNone, Envelope, Filter};
pub use error::{PipelineError, QueueSide, Result};
pub use link::LinkMode;
pub use metrics::{LatencyWindow, LinkMetrics, MetricsSnapshot};
pub use pipeline::{Pipeline, PipelineBuilder, RunningPipeline};
pub use queue::{Queue, Sequence, VecQueue};
pub use stage::{
    ChannelSink, CollectSink, FlatMapTransform, IterSource, MapTransform, PassthroughTransform,
    Sink, Source, Stage, Transform,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
