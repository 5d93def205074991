use crate::cascade::Cascade;
use crate::envelope::{AcceptAll, Filter};
use crate::error::{PipelineError, Result};
use crate::link::{Link, LinkMode};
use crate::metrics::{LinkMetrics, MetricsSnapshot};
use crate::queue::Queue;
use crate::stage::{Source, Stage};
use std::sync::Arc;
use tracing::debug;

/// A stage configuration in the pipeline builder
struct PipelineStage<T> {
    stage: Stage<T>,
    mode: LinkMode,
    filter: Arc<dyn Filter<T>>,
}

/// Builder for constructing pipelines
///
/// Starts from a source; every appended stage gets its own link mode and
/// filter. The last stage must be a sink, and only the last.
pub struct PipelineBuilder<T> {
    source: Box<dyn Source<T>>,
    stages: Vec<PipelineStage<T>>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Create a new pipeline builder around `source`
    pub fn new(source: impl Source<T> + 'static) -> Self {
        Self {
            source: Box::new(source),
            stages: Vec::new(),
        }
    }

    /// Append a stage that accepts every envelope
    pub fn append(self, stage: Stage<T>, mode: LinkMode) -> Self {
        self.append_filtered(stage, mode, AcceptAll)
    }

    /// Append a stage that only processes envelopes `filter` accepts
    pub fn append_filtered(
        mut self,
        stage: Stage<T>,
        mode: LinkMode,
        filter: impl Filter<T> + 'static,
    ) -> Self {
        self.stages.push(PipelineStage {
            stage,
            mode,
            filter: Arc::new(filter),
        });
        self
    }

    /// Build the link chain
    pub fn build(self) -> Result<Pipeline<T>> {
        if self.stages.is_empty() {
            return Err(PipelineError::NoStages);
        }
        let last = self.stages.len() - 1;
        for (index, entry) in self.stages.iter().enumerate() {
            if entry.stage.is_sink() && index != last {
                return Err(PipelineError::ConfigError(format!(
                    "sink '{}' at position {} must be the last stage",
                    entry.stage.name(),
                    index
                )));
            }
        }
        if !self.stages[last].stage.is_sink() {
            return Err(PipelineError::ConfigError(format!(
                "pipeline must end with a sink, found transform '{}'",
                self.stages[last].stage.name()
            )));
        }

        let cascade = Arc::new(Cascade::new());
        let mut metrics = Vec::with_capacity(self.stages.len());
        let mut next: Option<Link<T>> = None;

        // Links are built tail first so each one can own the next.
        for (index, entry) in self.stages.into_iter().enumerate().rev() {
            let name = format!("{}:{}", index, entry.stage.name());
            let link_metrics = LinkMetrics::new();
            metrics.push((name.clone(), link_metrics.clone()));
            let link = Link::new(
                name,
                entry.mode,
                entry.stage,
                entry.filter,
                next.take(),
                link_metrics,
                &cascade,
            )?;
            next = Some(link);
        }
        metrics.reverse();

        let head = next.ok_or(PipelineError::NoStages)?;
        Ok(Pipeline {
            source: self.source,
            head,
            cascade,
            metrics,
        })
    }
}

/// A built pipeline, ready to run
pub struct Pipeline<T> {
    source: Box<dyn Source<T>>,
    head: Link<T>,
    cascade: Arc<Cascade>,
    metrics: Vec<(String, LinkMetrics)>,
}

impl<T: Send + 'static> Pipeline<T> {
    /// Create a new pipeline builder
    pub fn builder(source: impl Source<T> + 'static) -> PipelineBuilder<T> {
        PipelineBuilder::new(source)
    }

    /// Run the pipeline to completion
    ///
    /// Returns the first failure from any stage, after every worker thread
    /// has been joined.
    pub fn execute(self) -> Result<()> {
        self.run()?.join()
    }

    /// Start every link and drive the source to completion
    ///
    /// Downstream threaded links may still be draining when this returns;
    /// call [`RunningPipeline::join`] to finish them. On failure the pipeline
    /// is torn down and joined before the error is returned.
    pub fn run(mut self) -> Result<RunningPipeline<T>> {
        debug!(
            source = self.source.name(),
            links = self.metrics.len(),
            "starting pipeline"
        );
        let outcome = match self.head.start() {
            Ok(()) => self.source.run(&mut self.head),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                debug!(source = self.source.name(), "source finished");
                Ok(RunningPipeline {
                    head: self.head,
                    cascade: self.cascade,
                    metrics: self.metrics,
                })
            }
            Err(err) => {
                self.cascade.interrupt(self.source.name(), &err);
                self.head.abort(&err);
                Err(self.cascade.failure().unwrap_or(err))
            }
        }
    }

    /// Names of the links, head first
    pub fn link_names(&self) -> Vec<&str> {
        self.metrics.iter().map(|(name, _)| name.as_str()).collect()
    }

    /// Name of the head link
    pub fn head_name(&self) -> &str {
        self.head.name()
    }

    /// Get metrics for every link, head first
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        snapshot_all(&self.metrics)
    }

    /// Get metrics for a specific link
    pub fn link_metrics(&self, index: usize) -> Option<&LinkMetrics> {
        self.metrics.get(index).map(|(_, m)| m)
    }

    /// Get a summary of all metrics
    pub fn metrics_summary(&self) -> String {
        summarize(&self.metrics)
    }
}

/// A pipeline whose source has completed
pub struct RunningPipeline<T> {
    head: Link<T>,
    cascade: Arc<Cascade>,
    metrics: Vec<(String, LinkMetrics)>,
}

impl<T: Send + 'static> RunningPipeline<T> {
    /// Finish every link and wait for all worker threads
    ///
    /// Returns the first failure any stage raised.
    pub fn join(mut self) -> Result<()> {
        match self.head.finish() {
            Ok(()) => match self.cascade.failure() {
                Some(failure) => Err(failure),
                None => {
                    debug!("pipeline finished");
                    Ok(())
                }
            },
            Err(err) => {
                self.cascade.interrupt("join", &err);
                self.head.abort(&err);
                Err(self.cascade.failure().unwrap_or(err))
            }
        }
    }

    /// Whether any stage has failed so far
    pub fn has_failed(&self) -> bool {
        self.cascade.is_tripped()
    }

    /// Get metrics for every link, head first
    pub fn metrics(&self) -> Vec<(String, MetricsSnapshot)> {
        snapshot_all(&self.metrics)
    }

    /// Get a summary of all metrics
    pub fn metrics_summary(&self) -> String {
        summarize(&self.metrics)
    }
}

fn snapshot_all(metrics: &[(String, LinkMetrics)]) -> Vec<(String, MetricsSnapshot)> {
    metrics
        .iter()
        .map(|(name, m)| (name.clone(), m.snapshot()))
        .collect()
}

fn summarize(metrics: &[(String, LinkMetrics)]) -> String {
    let mut summary = String::from("Pipeline Metrics Summary:\n");
    for (name, m) in metrics {
        summary.push_str(&format!("  Link {}: {}\n", name, m.snapshot().format()));
    }
    summary
}
