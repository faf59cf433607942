//! Audio Sender Application
//!
//! Segments a WAV file (or raw s16le PCM from stdin) into overlapping
//! chunks and streams them to a receiver over TCP.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::io::Read;
use std::path::PathBuf;
use std::thread;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use overlap_streamer::{
    audio::{s16le_to_f32, WavAudio},
    codec::CodecKind,
    config::AppConfig,
    pipeline::CancelToken,
    session::{SenderSession, SessionReport},
};

/// Stream audio to a receiver as overlapping chunks
#[derive(Parser, Debug)]
#[command(name = "sender", version)]
struct Args {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Receiver host
    #[arg(long)]
    host: Option<String>,

    /// Receiver port
    #[arg(long)]
    port: Option<u16>,

    /// WAV file to stream
    #[arg(long, value_name = "WAV", conflicts_with = "stdin")]
    input: Option<PathBuf>,

    /// Read raw signed 16-bit little-endian mono PCM from stdin
    #[arg(long)]
    stdin: bool,

    /// Sample rate of the stdin source
    #[arg(long)]
    sample_rate: Option<u32>,

    /// Chunk size in samples
    #[arg(long)]
    chunk_size: Option<usize>,

    /// Overlap between consecutive chunks in samples
    #[arg(long)]
    overlap_size: Option<usize>,

    /// Transform quality (number of streams)
    #[arg(long)]
    num_streams: Option<u32>,

    /// Pace chunks at playback speed
    #[arg(long)]
    realtime: bool,

    /// Throttle outbound bytes
    #[arg(long)]
    enable_rate_limit: bool,

    /// Rate limit budget in bytes per second
    #[arg(long, value_name = "BPS")]
    rate_limit_bps: Option<u64>,

    /// Transform applied to every chunk
    #[arg(long, default_value = "float32")]
    codec: CodecKind,

    /// Write the session report as JSON
    #[arg(long, value_name = "PATH")]
    report_json: Option<PathBuf>,
}

impl Args {
    fn load_config(&self) -> Result<AppConfig> {
        let mut config = match &self.config {
            Some(path) => AppConfig::load(path)?,
            None => AppConfig::load_or_default()?,
        };

        if let Some(host) = &self.host {
            config.network.host = host.clone();
        }
        if let Some(port) = self.port {
            config.network.port = port;
        }
        if let Some(sample_rate) = self.sample_rate {
            config.stream.sample_rate = sample_rate;
        }
        if let Some(chunk_size) = self.chunk_size {
            config.stream.chunk_size = chunk_size;
        }
        if let Some(overlap_size) = self.overlap_size {
            config.stream.overlap_size = overlap_size;
        }
        if let Some(num_streams) = self.num_streams {
            config.stream.num_streams = num_streams;
        }
        config.stream.realtime |= self.realtime;
        config.rate_limit.enabled |= self.enable_rate_limit;
        if let Some(bps) = self.rate_limit_bps {
            config.rate_limit.bytes_per_second = bps;
        }

        config.validate()?;
        Ok(config)
    }
}

enum Source {
    File(WavAudio),
    Stdin,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.load_config().context("Invalid configuration")?;

    let source = match (&args.input, args.stdin) {
        (Some(path), _) => {
            let audio = WavAudio::open(path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            info!(
                "Loaded {}: {} samples at {} Hz ({:.2}s)",
                path.display(),
                audio.samples.len(),
                audio.sample_rate,
                audio.samples.len() as f64 / audio.sample_rate.max(1) as f64
            );
            Source::File(audio)
        }
        (None, true) => Source::Stdin,
        (None, false) => bail!("either --input <WAV> or --stdin is required"),
    };

    info!(
        "Starting sender: target {}, codec {}, chunk {} / overlap {}, {} streams",
        config.network.endpoint(),
        args.codec,
        config.stream.chunk_size,
        config.stream.overlap_size,
        config.stream.num_streams
    );
    if config.rate_limit.enabled {
        info!(
            "Rate limiting enabled: {} B/s ({:.1} kbps)",
            config.rate_limit.bytes_per_second,
            config.rate_limit.bytes_per_second as f64 * 8.0 / 1000.0
        );
    }

    let cancel = CancelToken::new();
    let session_cancel = cancel.clone();
    let codec = args.codec;

    let mut task = tokio::task::spawn_blocking(move || -> Result<SessionReport> {
        let sample_rate = match &source {
            Source::File(audio) => audio.sample_rate,
            Source::Stdin => config.stream.sample_rate,
        };
        let transform = codec.build(sample_rate)?;
        let live_capacity = config.pipeline.encode_queue_capacity;
        let session = SenderSession::connect(config, transform, session_cancel.clone())?;

        let report = match source {
            Source::File(audio) => session.stream_samples(&audio.samples, audio.sample_rate)?,
            Source::Stdin => {
                let bursts = spawn_stdin_reader(live_capacity, session_cancel);
                session.stream_live(bursts, sample_rate)?
            }
        };
        Ok(report)
    });

    let report = tokio::select! {
        joined = &mut task => joined??,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling session");
            cancel.cancel();
            task.await??
        }
    };

    if let Some(path) = &args.report_json {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &report)?;
        info!("Report written to {}", path.display());
    }

    if !report.outcome.is_completed() {
        bail!("session ended: {}", report.outcome);
    }
    info!("Sender stopped");
    Ok(())
}

/// Read stdin on its own thread, forwarding whole samples as bursts.
/// EOF disconnects the channel, which ends the live stream.
fn spawn_stdin_reader(
    capacity: usize,
    cancel: CancelToken,
) -> crossbeam_channel::Receiver<Vec<f32>> {
    let (tx, rx) = crossbeam_channel::bounded(capacity);

    let spawned = thread::Builder::new()
        .name("stdin-reader".into())
        .spawn(move || {
            let mut stdin = std::io::stdin().lock();
            let mut buf = vec![0u8; 4096];
            let mut pending: Vec<u8> = Vec::new();

            while !cancel.is_cancelled() {
                let n = match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        warn!("stdin read failed: {}", e);
                        break;
                    }
                };
                pending.extend_from_slice(&buf[..n]);
                let whole = pending.len() & !1;
                let burst = s16le_to_f32(&pending[..whole]);
                pending.drain(..whole);

                if !burst.is_empty() && tx.send(burst).is_err() {
                    break;
                }
            }
            info!("stdin source finished");
        });

    if let Err(e) = spawned {
        // Dropping the only sender ends the stream immediately
        warn!("Failed to spawn stdin reader: {}", e);
    }
    rx
}
