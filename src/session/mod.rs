//! Session orchestration
//!
//! A session owns one TCP connection for one stream. It exchanges the
//! metadata, runs both pipeline stages of its endpoint on named threads,
//! watches the cancel token and produces a [`SessionReport`] at teardown.
//!
//! Sessions are single use: every streaming method consumes the session.

pub mod state;
pub mod stats;

use crossbeam_channel::Receiver;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, info_span, Span};
use uuid::Uuid;

use crate::audio::{Chunk, LiveChunks, OverlapReconstructor, Segmenter};
use crate::codec::Transform;
use crate::config::AppConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::{self, RateLimiter};
use crate::pipeline::{
    self, CancelToken, DecodeStage, EncodeStage, Flow, ReceiveStage, SendStage, StageEnd,
    StageResult,
};
use crate::protocol::{read_frame, write_frame, StreamMetadata};

pub use crate::pipeline::ReconstructedAudio;
pub use state::SessionState;
pub use stats::{Role, SessionOutcome, SessionReport, Stage, StageSnapshot};

use stats::StageStats;

/// How often the watchdog checks the cancel token
const WATCH_INTERVAL: Duration = Duration::from_millis(10);

/// Shuts the connection down once the session is cancelled so that
/// blocked reads and writes return
struct Watchdog {
    done: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Watchdog {
    fn spawn(stream: &TcpStream, cancel: CancelToken, span: Span) -> Result<Self> {
        let stream = stream.try_clone()?;
        let done = Arc::new(AtomicBool::new(false));
        let finished = done.clone();

        let handle = thread::Builder::new()
            .name("watchdog".into())
            .spawn(move || {
                let _entered = span.enter();
                while !finished.load(Ordering::SeqCst) {
                    if cancel.is_cancelled() {
                        debug!("Cancelled, shutting down connection");
                        let _ = stream.shutdown(Shutdown::Both);
                        return;
                    }
                    thread::sleep(WATCH_INTERVAL);
                }
            })?;

        Ok(Self {
            done,
            handle: Some(handle),
        })
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.done.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_stage<R, F>(stage: Stage, span: &Span, f: F) -> Result<JoinHandle<R>>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let span = span.clone();
    let handle = thread::Builder::new()
        .name(format!("{}-stage", stage))
        .spawn(move || {
            let _entered = span.enter();
            f()
        })?;
    Ok(handle)
}

/// Join a stage thread
///
/// A panicked stage ends as `Failed` with empty stats; `panicked` turns
/// that result into the stage's return type so the report still gets built.
fn join_stage<R>(
    stage: Stage,
    handle: JoinHandle<R>,
    panicked: impl FnOnce(StageResult) -> R,
) -> R {
    match handle.join() {
        Ok(result) => result,
        Err(_) => {
            let reason = Error::StagePanicked(format!("{} stage", stage)).to_string();
            error!("{}", reason);
            panicked(StageResult {
                stats: StageStats::new(stage),
                end: StageEnd::Failed(reason),
            })
        }
    }
}

/// Worst stage end wins: failure, then peer closure, then cancellation
fn outcome(ends: &[&StageEnd]) -> SessionOutcome {
    if let Some(reason) = ends.iter().find_map(|end| match end {
        StageEnd::Failed(reason) => Some(reason.clone()),
        _ => None,
    }) {
        return SessionOutcome::Failed(reason);
    }
    if ends.iter().any(|end| **end == StageEnd::PeerClosed) {
        SessionOutcome::PeerClosed
    } else if ends.iter().any(|end| **end == StageEnd::Cancelled) {
        SessionOutcome::Cancelled
    } else {
        SessionOutcome::Completed
    }
}

/// Validated, logged state holder shared by both endpoints
#[derive(Debug)]
struct Lifecycle {
    state: SessionState,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: SessionState::Idle,
        }
    }

    fn advance(&mut self, next: SessionState) -> Result<()> {
        let from = self.state;
        self.state = from.transition(next)?;
        info!("Session state: {} -> {}", from, next);
        Ok(())
    }
}

/// Sending endpoint
pub struct SenderSession<T: Transform + 'static> {
    id: Uuid,
    config: AppConfig,
    transform: T,
    cancel: CancelToken,
    stream: TcpStream,
    lifecycle: Lifecycle,
    started: Instant,
}

impl<T: Transform + 'static> SenderSession<T> {
    /// Dial the configured receiver
    pub fn connect(config: AppConfig, transform: T, cancel: CancelToken) -> Result<Self> {
        config.validate()?;
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(SessionState::Connecting)?;

        info!("Connecting to {}", config.network.endpoint());
        let stream = network::connect(&config.network)?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(Self::with_lifecycle(config, transform, cancel, stream, lifecycle))
    }

    /// Use an already connected stream
    pub fn from_stream(
        config: AppConfig,
        transform: T,
        cancel: CancelToken,
        stream: TcpStream,
    ) -> Result<Self> {
        config.validate()?;
        network::configure_stream(&stream, &config.network)?;
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(SessionState::Connecting)?;
        Ok(Self::with_lifecycle(config, transform, cancel, stream, lifecycle))
    }

    fn with_lifecycle(
        config: AppConfig,
        transform: T,
        cancel: CancelToken,
        stream: TcpStream,
        lifecycle: Lifecycle,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            config,
            transform,
            cancel,
            stream,
            lifecycle,
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state
    }

    /// Stream a finite buffer
    pub fn stream_samples(self, samples: &[f32], sample_rate: u32) -> Result<SessionReport> {
        let layout = self.config.stream.layout()?;
        let segmenter = Segmenter::new(samples, layout);
        let metadata = StreamMetadata::new(
            sample_rate,
            layout,
            self.config.stream.num_streams,
            segmenter.total_chunks(),
            samples.len() as u64,
        );
        self.stream_chunks(metadata, segmenter)
    }

    /// Stream sample bursts until the channel disconnects or the session is cancelled
    pub fn stream_live(self, bursts: Receiver<Vec<f32>>, sample_rate: u32) -> Result<SessionReport> {
        let layout = self.config.stream.layout()?;
        let metadata =
            StreamMetadata::new(sample_rate, layout, self.config.stream.num_streams, 0, 0);
        let chunks = LiveChunks::new(
            bursts,
            layout,
            self.cancel.clone(),
            self.config.pipeline.poll_interval(),
        );
        self.stream_chunks(metadata, chunks)
    }

    /// Send `metadata`, then every chunk, then the end message
    pub fn stream_chunks<I>(self, metadata: StreamMetadata, chunks: I) -> Result<SessionReport>
    where
        I: IntoIterator<Item = Chunk>,
    {
        let SenderSession {
            id,
            config,
            transform,
            cancel,
            mut stream,
            mut lifecycle,
            started,
        } = self;
        let span = info_span!("session", id = %id, role = %Role::Sender);
        let _entered = span.enter();

        metadata.validate()?;
        let json = metadata.to_json()?;
        write_frame(&mut stream, &json).map_err(NetworkError::from_write)?;
        lifecycle.advance(SessionState::MetadataExchanged)?;
        info!(
            "Metadata sent: {} Hz, chunk {}, overlap {}, {} chunks",
            metadata.sample_rate, metadata.chunk_size, metadata.overlap_size, metadata.total_chunks
        );

        let watchdog = Watchdog::spawn(&stream, cancel.clone(), span.clone())?;
        let poll = config.pipeline.poll_interval();
        let (chunk_tx, chunk_rx) = pipeline::queue::<Chunk>(config.pipeline.encode_queue_capacity);
        let (packet_tx, packet_rx) = pipeline::queue(config.pipeline.send_queue_capacity);

        let encode = EncodeStage::new(
            transform,
            metadata.num_streams,
            chunk_rx,
            packet_tx,
            cancel.clone(),
            poll,
        );
        let limiter = config
            .rate_limit
            .enabled
            .then(|| RateLimiter::new(config.rate_limit.bytes_per_second));
        let send = SendStage::new(stream.try_clone()?, packet_rx, limiter, cancel.clone(), poll);

        let encode_handle = spawn_stage(Stage::Encode, &span, move || encode.run())?;
        let send_handle = spawn_stage(Stage::Send, &span, move || send.run())?;
        lifecycle.advance(SessionState::Streaming)?;

        // Producer runs on the calling thread
        let pace = (config.stream.realtime && !metadata.is_live())
            .then(|| config.stream.chunk_duration(metadata.sample_rate));
        let mut produced = 0u64;
        let mut interrupted = false;
        for chunk in chunks {
            if cancel.is_cancelled() || !pipeline::push(&chunk_tx, Flow::Next(chunk), &cancel, poll) {
                interrupted = true;
                break;
            }
            produced += 1;
            if let Some(pace) = pace {
                if !cancel.sleep(pace) {
                    interrupted = true;
                    break;
                }
            }
        }
        if !interrupted && !cancel.is_cancelled() {
            pipeline::push(&chunk_tx, Flow::Finish, &cancel, poll);
        }
        drop(chunk_tx);
        info!("Produced {} chunks", produced);

        lifecycle.advance(SessionState::Draining)?;
        let encoded = join_stage(Stage::Encode, encode_handle, |r| r);
        let sent = join_stage(Stage::Send, send_handle, |r| r);
        drop(watchdog);
        let _ = stream.shutdown(Shutdown::Both);
        lifecycle.advance(SessionState::Closed)?;

        let report = SessionReport {
            session_id: id,
            role: Role::Sender,
            outcome: outcome(&[&encoded.end, &sent.end]),
            final_state: lifecycle.state,
            elapsed_secs: started.elapsed().as_secs_f64(),
            chunks: encoded.stats.items(),
            packets: sent.stats.items(),
            bytes: sent.stats.bytes(),
            malformed: 0,
            stages: vec![encoded.stats.snapshot(), sent.stats.snapshot()],
        };
        report.log_summary();
        Ok(report)
    }
}

/// Everything a receiving session produced
#[derive(Debug, Clone)]
pub struct ReceivedStream {
    pub metadata: StreamMetadata,
    pub audio: ReconstructedAudio,
    pub report: SessionReport,
}

enum Endpoint {
    Listener(TcpListener),
    Stream(TcpStream),
}

/// Receiving endpoint
pub struct ReceiverSession<T: Transform + 'static> {
    id: Uuid,
    config: AppConfig,
    transform: T,
    cancel: CancelToken,
    endpoint: Endpoint,
    lifecycle: Lifecycle,
}

impl<T: Transform + 'static> ReceiverSession<T> {
    /// Listen on the configured endpoint for a single sender
    pub fn bind(config: AppConfig, transform: T, cancel: CancelToken) -> Result<Self> {
        config.validate()?;
        let listener = network::listen(&config.network)?;
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(SessionState::Listening)?;
        info!("Listening on {}", listener.local_addr()?);

        Ok(Self {
            id: Uuid::new_v4(),
            config,
            transform,
            cancel,
            endpoint: Endpoint::Listener(listener),
            lifecycle,
        })
    }

    /// Serve an already accepted connection
    pub fn from_stream(
        config: AppConfig,
        transform: T,
        cancel: CancelToken,
        stream: TcpStream,
    ) -> Result<Self> {
        config.validate()?;
        let mut lifecycle = Lifecycle::new();
        lifecycle.advance(SessionState::Listening)?;
        Ok(Self {
            id: Uuid::new_v4(),
            config,
            transform,
            cancel,
            endpoint: Endpoint::Stream(stream),
            lifecycle,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.lifecycle.state
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        let addr = match &self.endpoint {
            Endpoint::Listener(listener) => listener.local_addr()?,
            Endpoint::Stream(stream) => stream.local_addr()?,
        };
        Ok(addr)
    }

    /// Accept one sender and receive its stream until the end message or
    /// connection closure
    pub fn run(mut self) -> Result<ReceivedStream> {
        let span = info_span!("session", id = %self.id, role = %Role::Receiver);
        let _entered = span.enter();
        let poll = self.config.pipeline.poll_interval();

        let mut stream = match self.endpoint {
            Endpoint::Stream(stream) => stream,
            Endpoint::Listener(listener) => {
                match network::accept_cancellable(&listener, &self.cancel, poll)? {
                    Some((stream, peer)) => {
                        info!("Sender connected from {}", peer);
                        stream
                    }
                    None => {
                        info!("Cancelled while waiting for a sender");
                        return Err(Error::Cancelled);
                    }
                }
            }
        };
        network::configure_stream(&stream, &self.config.network)?;
        let started = Instant::now();
        let watchdog = Watchdog::spawn(&stream, self.cancel.clone(), span.clone())?;

        let metadata = match read_frame(&mut stream) {
            Ok(frame) => StreamMetadata::from_json(&frame)?,
            Err(e) if self.cancel.is_cancelled() => {
                debug!("Metadata read interrupted: {}", e);
                return Err(Error::Cancelled);
            }
            Err(e) => return Err(e),
        };
        metadata.validate()?;
        self.lifecycle.advance(SessionState::MetadataExchanged)?;
        info!(
            "Metadata received: {} Hz, chunk {}, overlap {}, {} streams, {} chunks",
            metadata.sample_rate,
            metadata.chunk_size,
            metadata.overlap_size,
            metadata.num_streams,
            metadata.total_chunks
        );

        let mut reconstructor = OverlapReconstructor::new(metadata.layout()?, metadata.total_chunks);
        if metadata.total_samples > 0 {
            reconstructor = reconstructor.with_sample_limit(metadata.total_samples);
        }

        let (packet_tx, packet_rx) = pipeline::queue(self.config.pipeline.decode_queue_capacity);
        let receive = ReceiveStage::new(stream.try_clone()?, packet_tx, self.cancel.clone(), poll);
        let decode = DecodeStage::new(
            self.transform,
            packet_rx,
            reconstructor,
            self.cancel.clone(),
            poll,
        )
        .keep_chunks(self.config.output.save_chunks);

        let receive_handle = spawn_stage(Stage::Receive, &span, move || receive.run())?;
        let decode_handle = spawn_stage(Stage::Decode, &span, move || decode.run())?;
        self.lifecycle.advance(SessionState::Streaming)?;

        let received = join_stage(Stage::Receive, receive_handle, |r| r);
        self.lifecycle.advance(SessionState::Draining)?;
        let (decoded, audio) = join_stage(Stage::Decode, decode_handle, |r| {
            (r, ReconstructedAudio::default())
        });
        drop(watchdog);
        let _ = stream.shutdown(Shutdown::Both);
        self.lifecycle.advance(SessionState::Closed)?;

        let report = SessionReport {
            session_id: self.id,
            role: Role::Receiver,
            outcome: outcome(&[&received.end, &decoded.end]),
            final_state: self.lifecycle.state,
            elapsed_secs: started.elapsed().as_secs_f64(),
            chunks: decoded.stats.items(),
            packets: received.stats.items(),
            bytes: received.stats.bytes(),
            malformed: received.stats.failures(),
            stages: vec![received.stats.snapshot(), decoded.stats.snapshot()],
        };
        report.log_summary();
        info!(
            "Reconstructed {} samples ({:.2}s)",
            audio.samples.len(),
            audio.duration_secs(metadata.sample_rate)
        );

        Ok(ReceivedStream {
            metadata,
            audio,
            report,
        })
    }
}
