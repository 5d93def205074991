//! Chunked file relay
//!
//! Copies a file through a three-stage pipeline: a reader splits it into
//! chunks, a checksum stage hashes data chunks, and a writer appends them to
//! the output. Section markers ride the same queues and bypass the checksum
//! stage through its filter.
//!
//! Usage: cargo run --example chunk_relay --release -- <input> <output> [capacity]
//!        RUST_LOG=relay_pipeline=debug for link lifecycle logs

use relay_pipeline::{
    Envelope, LinkMetrics, LinkMode, Pipeline, PipelineError, Queue, QueueConfig,
    Result as PipelineResult, Sink, Source, Stage, Transform,
};
use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const CHUNK_SIZE: usize = 64 * 1024;
const CHUNKS_PER_SECTION: usize = 16;

#[derive(Debug)]
enum Chunk {
    Data(Vec<u8>),
    /// Start of a new section of the input
    Section(usize),
    /// Checksum of everything before it
    Digest(u32),
}

/// Source reading the input file in fixed-size chunks
struct ChunkReader {
    path: PathBuf,
}

impl Source<Chunk> for ChunkReader {
    fn run(&mut self, queue: &mut dyn Queue<Chunk>) -> PipelineResult<()> {
        let mut file = File::open(&self.path)?;
        let mut chunks = 0usize;
        loop {
            if chunks % CHUNKS_PER_SECTION == 0 {
                queue.offer(Envelope::new(Chunk::Section(chunks / CHUNKS_PER_SECTION)))?;
            }
            let mut buf = vec![0u8; CHUNK_SIZE];
            let read = file.read(&mut buf)?;
            if read == 0 {
                return Ok(());
            }
            buf.truncate(read);
            queue.offer(Envelope::new(Chunk::Data(buf)))?;
            chunks += 1;
        }
    }

    fn name(&self) -> &str {
        "reader"
    }
}

/// Adler-32 over every data chunk; emits the digest after the last one
struct Checksum {
    a: u32,
    b: u32,
}

impl Checksum {
    const MOD: u32 = 65_521;

    fn new() -> Self {
        Self { a: 1, b: 0 }
    }
}

impl Transform<Chunk> for Checksum {
    fn process(&mut self, envelope: Envelope<Chunk>, queue: &mut dyn Queue<Chunk>) -> PipelineResult<()> {
        if let Chunk::Data(bytes) = envelope.payload() {
            for &byte in bytes {
                self.a = (self.a + u32::from(byte)) % Self::MOD;
                self.b = (self.b + self.a) % Self::MOD;
            }
        }
        queue.offer(envelope)
    }

    fn finish(&mut self, queue: &mut dyn Queue<Chunk>) -> PipelineResult<()> {
        queue.offer(Envelope::new(Chunk::Digest((self.b << 16) | self.a)))
    }

    fn name(&self) -> &str {
        "checksum"
    }
}

/// Sink writing data chunks to the output file
struct ChunkWriter {
    path: PathBuf,
    out: Option<BufWriter<File>>,
    written: u64,
}

impl Sink<Chunk> for ChunkWriter {
    fn init(&mut self) -> PipelineResult<()> {
        self.out = Some(BufWriter::new(File::create(&self.path)?));
        Ok(())
    }

    fn process(&mut self, envelope: Envelope<Chunk>) -> PipelineResult<()> {
        match envelope.into_payload() {
            Chunk::Data(bytes) => {
                let out = self
                    .out
                    .as_mut()
                    .ok_or_else(|| PipelineError::stage("output not open"))?;
                out.write_all(&bytes)?;
                self.written += bytes.len() as u64;
            }
            Chunk::Section(index) => tracing::debug!(index, "section"),
            Chunk::Digest(sum) => info!(checksum = %format!("{sum:08x}"), "input checksum"),
        }
        Ok(())
    }

    fn finish(&mut self) -> PipelineResult<()> {
        if let Some(out) = self.out.as_mut() {
            out.flush()?;
        }
        info!(bytes = self.written, path = %self.path.display(), "output written");
        Ok(())
    }

    fn error(&mut self, error: &PipelineError) {
        warn!(%error, "relay aborted, output is incomplete");
    }

    fn cleanup(&mut self) {
        self.out = None;
    }

    fn name(&self) -> &str {
        "writer"
    }
}

fn main() -> PipelineResult<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut args = std::env::args().skip(1);
    let (input, output) = match (args.next(), args.next()) {
        (Some(input), Some(output)) => (PathBuf::from(input), PathBuf::from(output)),
        _ => {
            eprintln!("usage: chunk_relay <input> <output> [capacity]");
            std::process::exit(2);
        }
    };
    let capacity = match args.next() {
        Some(raw) => raw
            .parse::<usize>()
            .map_err(|e| PipelineError::ConfigError(format!("bad capacity '{raw}': {e}")))?,
        None => 32,
    };

    let queue = QueueConfig::new()
        .with_capacity(capacity)
        .with_wait_slice(Duration::from_millis(50));
    // Only data chunks are hashed; markers pass through untouched.
    let data_only = |env: &Envelope<Chunk>| matches!(env.payload(), Chunk::Data(_));

    let pipeline = Pipeline::builder(ChunkReader { path: input.clone() })
        .append_filtered(Stage::transform(Checksum::new()), LinkMode::Threaded(queue), data_only)
        .append(
            Stage::sink(ChunkWriter {
                path: output,
                out: None,
                written: 0,
            }),
            LinkMode::Threaded(queue),
        )
        .build()?;

    info!(input = %input.display(), links = ?pipeline.link_names(), "starting relay");
    let links: Vec<(String, LinkMetrics)> = pipeline
        .link_names()
        .into_iter()
        .map(String::from)
        .zip((0..).map_while(|i| pipeline.link_metrics(i).cloned()))
        .collect();

    let started = Instant::now();
    pipeline.execute()?;

    info!(elapsed = ?started.elapsed(), "relay complete");
    for (name, metrics) in links {
        info!(link = %name, "{}", metrics.snapshot().format());
    }
    Ok(())
}
