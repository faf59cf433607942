//! Audio Receiver Application
//!
//! Accepts one sender, rebuilds the waveform from overlapping chunks and
//! saves it as WAV.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use overlap_streamer::{
    audio::write_wav,
    codec::CodecKind,
    config::AppConfig,
    pipeline::CancelToken,
    session::{ReceivedStream, ReceiverSession},
    Error,
};

/// Receive an overlap-chunked audio stream
#[derive(Parser, Debug)]
#[command(name = "receiver", version)]
struct Args {
    /// Path to configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(long)]
    port: Option<u16>,

    /// Directory for received audio
    #[arg(long, value_name = "DIR")]
    save_path: Option<PathBuf>,

    /// Also save every reconstructed chunk separately
    #[arg(long)]
    save_chunks: bool,

    /// Transform the sender uses
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
        if let Some(save_path) = &self.save_path {
            config.output.save_path = save_path.clone();
        }
        config.output.save_chunks |= self.save_chunks;

        config.validate()?;
        Ok(config)
    }
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
    let save_path = config.output.save_path.clone();

    let transform = args.codec.build(config.stream.sample_rate)?;
    let cancel = CancelToken::new();
    let session = ReceiverSession::bind(config, transform, cancel.clone())?;
    info!(
        "Listening on {} (codec {})",
        session.local_addr()?,
        args.codec
    );

    let mut task = tokio::task::spawn_blocking(move || session.run());

    let joined = tokio::select! {
        joined = &mut task => joined?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling session");
            cancel.cancel();
            task.await?
        }
    };

    let received = match joined {
        Ok(received) => received,
        Err(Error::Cancelled) => {
            info!("Receiver stopped before a sender connected");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    if let Some(path) = &args.report_json {
        let file = std::fs::File::create(path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        serde_json::to_writer_pretty(file, &received.report)?;
        info!("Report written to {}", path.display());
    }

    if !received.report.outcome.is_completed() {
        warn!("Session ended early: {}", received.report.outcome);
    }
    save_stream(&received, &save_path)?;
    info!("Receiver stopped");
    Ok(())
}

/// Save the waveform, plus every kept chunk, under `dir`
fn save_stream(received: &ReceivedStream, dir: &Path) -> Result<()> {
    let audio = &received.audio;
    if audio.samples.is_empty() {
        warn!("No audio received, nothing to save");
        return Ok(());
    }

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create {}", dir.display()))?;

    let sample_rate = received.metadata.sample_rate;
    let kbps = received.metadata.num_streams as f64 * 1.5;
    let timestamp = chrono::Utc::now().timestamp();

    let path = dir.join(format!("received_audio_{:.1}kbps_{}.wav", kbps, timestamp));
    write_wav(&path, &audio.samples, sample_rate)?;
    info!(
        "Saved {} ({:.2}s, {} chunks)",
        path.display(),
        audio.duration_secs(sample_rate),
        audio.chunk_indices.len()
    );

    if let Some(chunks) = &audio.chunks {
        for (i, chunk) in chunks.iter().enumerate() {
            let path = dir.join(format!(
                "received_{:.1}kbps_{}_chunk_{}.wav",
                kbps,
                timestamp,
                i + 1
            ));
            write_wav(&path, chunk, sample_rate)?;
        }
        info!("Saved {} chunk files to {}", chunks.len(), dir.display());
    }
    Ok(())
}
