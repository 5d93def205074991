use relay_pipeline::{
    AcceptAll, ChannelSink, CollectSink, Envelope, Filter, FlatMapTransform, IterSource,
    LinkMode, MapTransform, PassthroughTransform, Pipeline, PipelineError, QueueConfig, QueueSide,
    Queue, Result as PipelineResult, Sink, Source, Stage, Transform,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

fn all_modes() -> Vec<LinkMode> {
    vec![
        LinkMode::CallThrough,
        LinkMode::Buffered,
        LinkMode::threaded_with_capacity(10),
    ]
}

fn doubler() -> Stage<u32> {
    Stage::transform(MapTransform::new("double", |n: u32| Ok(n * 2)))
}

#[test]
fn test_doubling_scenario_for_every_first_link_mode() {
    for mode in all_modes() {
        let sink = CollectSink::new("collect");
        let out = sink.handle();

        Pipeline::builder(IterSource::new("numbers", 1..=5u32))
            .append(doubler(), mode)
            .append(Stage::sink(sink), LinkMode::CallThrough)
            .build()
            .expect("Pipeline build failed")
            .execute()
            .expect("Pipeline execute failed");

        assert_eq!(*out.lock(), vec![2, 4, 6, 8, 10], "mode {}", mode.label());
    }
}

#[test]
fn test_order_preserved_for_every_mode_mix() {
    let modes = all_modes();
    for first in &modes {
        for second in &modes {
            for third in &modes {
                let sink = CollectSink::new("collect");
                let out = sink.handle();

                Pipeline::builder(IterSource::new("numbers", 0..500u32))
                    .append(Stage::transform(PassthroughTransform), *first)
                    .append(
                        Stage::transform(MapTransform::new("inc", |n: u32| Ok(n + 1))),
                        *second,
                    )
                    .append(Stage::sink(sink), *third)
                    .build()
                    .expect("Pipeline build failed")
                    .execute()
                    .expect("Pipeline execute failed");

                assert_eq!(
                    *out.lock(),
                    (1..=500).collect::<Vec<_>>(),
                    "modes {} / {} / {}",
                    first.label(),
                    second.label(),
                    third.label()
                );
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Item {
    Data(u32),
    Marker(&'static str),
}

#[test]
fn test_rejected_markers_pass_through_in_position() {
    let input = vec![
        Item::Marker("begin"),
        Item::Data(1),
        Item::Data(2),
        Item::Marker("middle"),
        Item::Data(3),
        Item::Marker("end"),
    ];
    let data_only = |env: &Envelope<Item>| matches!(env.payload(), Item::Data(_));

    for mode in all_modes() {
        let sink = CollectSink::new("collect");
        let out = sink.handle();

        // Each data item becomes two items; markers bypass the transform.
        let split = FlatMapTransform::new("split", |item: Item| match item {
            Item::Data(n) => Ok(vec![Item::Data(n * 10), Item::Data(n * 10 + 1)]),
            Item::Marker(m) => Err(PipelineError::stage(format!("marker {m} reached split"))),
        });

        Pipeline::builder(IterSource::new("items", input.clone()))
            .append_filtered(Stage::transform(split), mode, data_only)
            .append(Stage::sink(sink), LinkMode::CallThrough)
            .build()
            .expect("Pipeline build failed")
            .execute()
            .expect("Pipeline execute failed");

        assert_eq!(
            *out.lock(),
            vec![
                Item::Marker("begin"),
                Item::Data(10),
                Item::Data(11),
                Item::Data(20),
                Item::Data(21),
                Item::Marker("middle"),
                Item::Data(30),
                Item::Data(31),
                Item::Marker("end"),
            ],
            "mode {}",
            mode.label()
        );
    }
}

/// Source that counts how many offers have returned
struct CountingSource {
    total: u32,
    offered: Arc<AtomicUsize>,
}

impl Source<u32> for CountingSource {
    fn run(&mut self, queue: &mut dyn Queue<u32>) -> PipelineResult<()> {
        for i in 0..self.total {
            queue.offer(Envelope::new(i))?;
            self.offered.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Sink that does not start draining until released
struct GatedSink {
    release: crossbeam::channel::Receiver<()>,
    seen: Arc<AtomicUsize>,
}

impl Sink<u32> for GatedSink {
    fn init(&mut self) -> PipelineResult<()> {
        self.release
            .recv()
            .map_err(|_| PipelineError::stage("release sender dropped"))
    }

    fn process(&mut self, _envelope: Envelope<u32>) -> PipelineResult<()> {
        self.seen.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[test]
fn test_offer_blocks_when_queue_is_full_until_draining_starts() {
    let offered = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(AtomicUsize::new(0));
    let (release_tx, release_rx) = crossbeam::channel::bounded(1);

    let pipeline = Pipeline::builder(CountingSource {
        total: 11,
        offered: Arc::clone(&offered),
    })
    .append(
        Stage::sink(GatedSink {
            release: release_rx,
            seen: Arc::clone(&seen),
        }),
        LinkMode::threaded_with_capacity(10),
    )
    .build()
    .expect("Pipeline build failed");

    let runner = thread::spawn(move || pipeline.execute());

    thread::sleep(Duration::from_millis(300));
    assert_eq!(offered.load(Ordering::SeqCst), 10, "11th offer should be blocked");
    assert_eq!(seen.load(Ordering::SeqCst), 0);

    release_tx.send(()).unwrap();
    runner.join().unwrap().expect("Pipeline execute failed");
    assert_eq!(offered.load(Ordering::SeqCst), 11);
    assert_eq!(seen.load(Ordering::SeqCst), 11);
}

/// Sink that stalls in init for a fixed time
struct StalledSink {
    stall: Duration,
}

impl Sink<u32> for StalledSink {
    fn init(&mut self) -> PipelineResult<()> {
        thread::sleep(self.stall);
        Ok(())
    }

    fn process(&mut self, _envelope: Envelope<u32>) -> PipelineResult<()> {
        Ok(())
    }
}

#[test]
fn test_offer_times_out_when_nothing_drains() {
    let config = QueueConfig::new()
        .with_capacity(10)
        .with_wait_slice(Duration::from_millis(20))
        .with_emergency_slice(Duration::from_millis(5))
        .with_retry_budget(10);

    let started = Instant::now();
    let err = Pipeline::builder(IterSource::new("numbers", 0..100u32))
        .append(
            Stage::sink(StalledSink {
                stall: Duration::from_millis(800),
            }),
            LinkMode::Threaded(config),
        )
        .build()
        .expect("Pipeline build failed")
        .execute()
        .unwrap_err();

    assert!(
        matches!(
            err,
            PipelineError::BackpressureTimeout {
                side: QueueSide::Producer,
                ..
            }
        ),
        "unexpected error: {err}"
    );
    // The stalled worker is still joined before execute returns.
    assert!(started.elapsed() >= Duration::from_millis(800));
}

/// Source that finishes its own queue early, then keeps offering
struct EagerFinishSource {
    late_offer_rejected: Arc<AtomicUsize>,
}

impl Source<u32> for EagerFinishSource {
    fn run(&mut self, queue: &mut dyn Queue<u32>) -> PipelineResult<()> {
        queue.offer(Envelope::new(1))?;
        queue.offer(Envelope::new(2))?;
        queue.finish()?;
        if queue.offer(Envelope::new(3)).is_err() {
            self.late_offer_rejected.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

#[test]
fn test_finish_is_terminal() {
    for mode in all_modes() {
        let rejected = Arc::new(AtomicUsize::new(0));
        let sink = CollectSink::new("collect");
        let out = sink.handle();

        Pipeline::builder(EagerFinishSource {
            late_offer_rejected: Arc::clone(&rejected),
        })
        .append(Stage::sink(sink), mode)
        .build()
        .expect("Pipeline build failed")
        .execute()
        .expect("Pipeline execute failed");

        assert_eq!(*out.lock(), vec![1, 2], "mode {}", mode.label());
        assert_eq!(rejected.load(Ordering::SeqCst), 1, "mode {}", mode.label());
    }
}

/// Pass-through transform that fails on one value and counts its cleanups
struct Tripwire {
    fail_at: Option<u32>,
    cleanups: Arc<AtomicUsize>,
    errors: Arc<AtomicUsize>,
}

impl Tripwire {
    fn new(fail_at: Option<u32>, cleanups: &Arc<AtomicUsize>, errors: &Arc<AtomicUsize>) -> Self {
        Self {
            fail_at,
            cleanups: Arc::clone(cleanups),
            errors: Arc::clone(errors),
        }
    }
}

impl Transform<u32> for Tripwire {
    fn process(&mut self, envelope: Envelope<u32>, queue: &mut dyn Queue<u32>) -> PipelineResult<()> {
        if Some(*envelope.payload()) == self.fail_at {
            return Err(PipelineError::stage("tripwire hit"));
        }
        queue.offer(envelope)
    }

    fn error(&mut self, _error: &PipelineError) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    fn cleanup(&mut self) {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
    }

    fn name(&self) -> &str {
        "tripwire"
    }
}

#[test]
fn test_failure_cascades_through_all_threaded_stages() {
    let cleanups = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let offered = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = crossbeam::channel::unbounded();

    let started = Instant::now();
    let err = Pipeline::builder(CountingSource {
        total: 1_000_000,
        offered: Arc::clone(&offered),
    })
    .append(
        Stage::transform(Tripwire::new(None, &cleanups, &errors)),
        LinkMode::threaded_with_capacity(10),
    )
    .append(
        Stage::transform(Tripwire::new(Some(50), &cleanups, &errors)),
        LinkMode::threaded_with_capacity(10),
    )
    .append(
        Stage::transform(Tripwire::new(None, &cleanups, &errors)),
        LinkMode::threaded_with_capacity(10),
    )
    .append(Stage::sink(ChannelSink::new("out", tx)), LinkMode::threaded_with_capacity(10))
    .build()
    .expect("Pipeline build failed")
    .execute()
    .unwrap_err();

    assert!(matches!(&err, PipelineError::StageError(m) if m == "tripwire hit"), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));
    // Every transform ran its error and cleanup hooks, so every worker got out.
    assert_eq!(cleanups.load(Ordering::SeqCst), 3);
    assert_eq!(errors.load(Ordering::SeqCst), 3);
    assert!(offered.load(Ordering::SeqCst) < 1_000_000);

    let delivered: Vec<u32> = rx.try_iter().collect();
    assert!(delivered.len() <= 50);
    assert_eq!(delivered, (0..delivered.len() as u32).collect::<Vec<_>>());
}

#[test]
fn test_call_through_failure_unwinds_the_stack() {
    let cleanups = Arc::new(AtomicUsize::new(0));
    let errors = Arc::new(AtomicUsize::new(0));
    let sink = CollectSink::new("collect");
    let out = sink.handle();

    let err = Pipeline::builder(IterSource::new("numbers", 0..10u32))
        .append(
            Stage::transform(Tripwire::new(None, &cleanups, &errors)),
            LinkMode::CallThrough,
        )
        .append(
            Stage::transform(Tripwire::new(Some(3), &cleanups, &errors)),
            LinkMode::CallThrough,
        )
        .append(Stage::sink(sink), LinkMode::CallThrough)
        .build()
        .expect("Pipeline build failed")
        .execute()
        .unwrap_err();

    assert!(matches!(err, PipelineError::StageError(_)));
    assert_eq!(*out.lock(), vec![0, 1, 2]);
    assert_eq!(errors.load(Ordering::SeqCst), 2);
    assert_eq!(cleanups.load(Ordering::SeqCst), 2);
}

/// Sink recording every lifecycle hook
struct RecordingSink {
    events: Arc<parking_lot::Mutex<Vec<String>>>,
}

impl Sink<u32> for RecordingSink {
    fn init(&mut self) -> PipelineResult<()> {
        self.events.lock().push("init".into());
        Ok(())
    }

    fn process(&mut self, envelope: Envelope<u32>) -> PipelineResult<()> {
        self.events.lock().push(format!("item {}", envelope.payload()));
        Ok(())
    }

    fn finish(&mut self) -> PipelineResult<()> {
        self.events.lock().push("finish".into());
        Ok(())
    }

    fn error(&mut self, error: &PipelineError) {
        let kind = if error.is_interrupted() { "interrupted" } else { "failed" };
        self.events.lock().push(format!("error {kind}"));
    }

    fn cleanup(&mut self) {
        self.events.lock().push("cleanup".into());
    }
}

/// Source that fails after a few envelopes
struct FailingSource;

impl Source<u32> for FailingSource {
    fn run(&mut self, queue: &mut dyn Queue<u32>) -> PipelineResult<()> {
        for i in 0..3 {
            queue.offer(Envelope::new(i))?;
        }
        Err(PipelineError::stage("source broke"))
    }
}

#[test]
fn test_source_failure_reaches_every_sink_mode() {
    for mode in all_modes() {
        let events = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let err = Pipeline::builder(FailingSource)
            .append(
                Stage::sink(RecordingSink {
                    events: Arc::clone(&events),
                }),
                mode,
            )
            .build()
            .expect("Pipeline build failed")
            .execute()
            .unwrap_err();

        assert!(matches!(&err, PipelineError::StageError(m) if m == "source broke"));
        let events = events.lock();
        assert!(!events.contains(&"finish".to_string()), "mode {}", mode.label());
        if mode != LinkMode::Buffered {
            assert_eq!(events.first().map(String::as_str), Some("init"));
            assert_eq!(events.last().map(String::as_str), Some("cleanup"));
            assert!(events.iter().any(|e| e.starts_with("error")), "mode {}", mode.label());
        } else {
            // A buffered sink never starts when its upstream fails.
            assert!(events.is_empty());
        }
    }
}

#[test]
fn test_sink_failure_after_source_completes() {
    let check = MapTransform::new("check", |n: u32| {
        if n == 3 {
            Err(PipelineError::stage("three is not allowed"))
        } else {
            Ok(n)
        }
    });
    let sink = CollectSink::new("collect");
    let out = sink.handle();

    let err = Pipeline::builder(IterSource::new("numbers", 0..5u32))
        .append(Stage::transform(check), LinkMode::threaded())
        .append(Stage::sink(sink), LinkMode::threaded())
        .build()
        .expect("Pipeline build failed")
        .execute()
        .unwrap_err();

    assert!(matches!(&err, PipelineError::StageError(m) if m == "three is not allowed"));
    assert!(out.lock().len() <= 3);
}

struct PanickingTransform;

impl Transform<u32> for PanickingTransform {
    fn process(&mut self, envelope: Envelope<u32>, queue: &mut dyn Queue<u32>) -> PipelineResult<()> {
        if *envelope.payload() == 5 {
            panic!("stage bug");
        }
        queue.offer(envelope)
    }
}

#[test]
fn test_panicking_worker_fails_pipeline_without_hanging() {
    let started = Instant::now();
    let err = Pipeline::builder(IterSource::new("numbers", 0..10_000u32))
        .append(Stage::transform(PanickingTransform), LinkMode::threaded_with_capacity(10))
        .append(Stage::sink(CollectSink::new("collect")), LinkMode::threaded_with_capacity(10))
        .build()
        .expect("Pipeline build failed")
        .execute()
        .unwrap_err();

    assert!(matches!(err, PipelineError::ThreadError(_)), "{err}");
    assert!(started.elapsed() < Duration::from_secs(10));
}

/// Sink recording which thread ran it
struct ThreadProbe {
    seen_on: Arc<parking_lot::Mutex<Option<thread::ThreadId>>>,
}

impl Sink<u32> for ThreadProbe {
    fn process(&mut self, _envelope: Envelope<u32>) -> PipelineResult<()> {
        *self.seen_on.lock() = Some(thread::current().id());
        Ok(())
    }
}

#[test]
fn test_only_threaded_links_leave_the_calling_thread() {
    for mode in all_modes() {
        let seen_on = Arc::new(parking_lot::Mutex::new(None));
        Pipeline::builder(IterSource::new("numbers", 0..3u32))
            .append(
                Stage::sink(ThreadProbe {
                    seen_on: Arc::clone(&seen_on),
                }),
                mode,
            )
            .build()
            .expect("Pipeline build failed")
            .execute()
            .expect("Pipeline execute failed");

        let same_thread = *seen_on.lock() == Some(thread::current().id());
        assert_eq!(same_thread, !matches!(mode, LinkMode::Threaded(_)), "mode {}", mode.label());
    }
}

#[test]
fn test_link_metrics_count_forwarded_envelopes() {
    let odd = |env: &Envelope<u32>| env.payload() % 2 == 1;
    for mode in all_modes() {
        let pipeline = Pipeline::builder(IterSource::new("numbers", 0..100u32))
            .append_filtered(doubler(), mode, odd)
            .append(Stage::sink(CollectSink::new("collect")), LinkMode::CallThrough)
            .build()
            .expect("Pipeline build failed");
        let transform_metrics = pipeline.link_metrics(0).cloned().unwrap();
        let sink_metrics = pipeline.link_metrics(1).cloned().unwrap();

        pipeline.execute().expect("Pipeline execute failed");

        assert_eq!(transform_metrics.total_processed(), 100, "mode {}", mode.label());
        assert_eq!(transform_metrics.total_forwarded(), 50, "mode {}", mode.label());
        assert_eq!(sink_metrics.total_processed(), 100, "mode {}", mode.label());
        assert_eq!(sink_metrics.total_forwarded(), 0);
    }
}

#[test]
fn test_accept_none_sink_sees_nothing() {
    let sink = CollectSink::new("collect");
    let out = sink.handle();
    Pipeline::builder(IterSource::new("numbers", 0..10u32))
        .append_filtered(Stage::sink(sink), LinkMode::threaded(), relay_pipeline::AcceptNone)
        .build()
        .expect("Pipeline build failed")
        .execute()
        .expect("Pipeline execute failed");
    assert!(out.lock().is_empty());
}

#[test]
fn test_explicit_accept_all_matches_default() {
    let first = CollectSink::new("first");
    let second = CollectSink::new("second");
    let (a, b) = (first.handle(), second.handle());

    Pipeline::builder(IterSource::new("numbers", 0..20u32))
        .append(Stage::sink(first), LinkMode::Buffered)
        .build()
        .unwrap()
        .execute()
        .unwrap();
    Pipeline::builder(IterSource::new("numbers", 0..20u32))
        .append_filtered(Stage::sink(second), LinkMode::Buffered, AcceptAll)
        .build()
        .unwrap()
        .execute()
        .unwrap();

    assert_eq!(*a.lock(), *b.lock());
    assert!(AcceptAll.accept(&Envelope::new(0u32)));
}
