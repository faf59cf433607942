//! Receiver stages: receive and decode

use std::io::Read;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audio::OverlapReconstructor;
use crate::codec::Transform;
use crate::error::Error;
use crate::pipeline::{pop, push, CancelToken, Flow, FlowReceiver, FlowSender, StageEnd, StageResult};
use crate::protocol::{decode_message, read_frame, Message, Packet, FRAME_HEADER_LEN};
use crate::session::stats::{Stage, StageStats};

/// Output of the decode stage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconstructedAudio {
    /// Continuous waveform
    pub samples: Vec<f32>,
    /// Indices of the chunks that made it into `samples`, in order
    pub chunk_indices: Vec<u64>,
    /// Per-chunk output segments, kept only when requested
    pub chunks: Option<Vec<Vec<f32>>>,
}

impl ReconstructedAudio {
    pub fn duration_secs(&self, sample_rate: u32) -> f64 {
        self.samples.len() as f64 / sample_rate.max(1) as f64
    }
}

/// Connection → frame → packet
///
/// The only reader of the connection.
pub struct ReceiveStage<R: Read> {
    reader: R,
    output: FlowSender<Packet>,
    cancel: CancelToken,
    poll: Duration,
}

impl<R: Read> ReceiveStage<R> {
    pub fn new(reader: R, output: FlowSender<Packet>, cancel: CancelToken, poll: Duration) -> Self {
        Self {
            reader,
            output,
            cancel,
            poll,
        }
    }

    pub fn run(mut self) -> StageResult {
        let mut stats = StageStats::new(Stage::Receive);
        info!("Receive stage started");

        let end = loop {
            if self.cancel.is_cancelled() {
                break StageEnd::Cancelled;
            }

            let started = Instant::now();
            let frame = match read_frame(&mut self.reader) {
                Ok(frame) => frame,
                Err(e) => break self.read_failed(e),
            };

            match decode_message(&frame) {
                Ok(Message::Data(packet)) => {
                    let elapsed = started.elapsed();
                    stats.record(elapsed, (FRAME_HEADER_LEN + frame.len()) as u64);
                    debug!(
                        chunk = packet.chunk_index,
                        bytes = frame.len(),
                        "Received chunk in {:.4}s",
                        elapsed.as_secs_f64()
                    );
                    if !push(&self.output, Flow::Next(packet), &self.cancel, self.poll) {
                        break StageEnd::interrupted(&self.cancel, "decode stage");
                    }
                }
                Ok(Message::End) => {
                    info!("End of stream received");
                    // Exit without waiting for the decode queue to drain
                    if push(&self.output, Flow::Finish, &self.cancel, self.poll) {
                        break StageEnd::Finished;
                    }
                    break StageEnd::interrupted(&self.cancel, "decode stage");
                }
                Err(e) => {
                    warn!("Dropping malformed message ({} bytes): {}", frame.len(), e);
                    stats.record_failure();
                }
            }
        };

        info!("Receive stage {} after {} packets", end, stats.items());
        StageResult { stats, end }
    }

    fn read_failed(&self, err: Error) -> StageEnd {
        if self.cancel.is_cancelled() {
            return StageEnd::Cancelled;
        }
        self.cancel.cancel();
        if err.is_connection_closed() {
            warn!("Connection closed by sender before end of stream");
            StageEnd::PeerClosed
        } else {
            error!("Receive failed: {}", err);
            StageEnd::Failed(err.to_string())
        }
    }
}

/// Packet → `Transform::decode` → overlap reconstructor
pub struct DecodeStage<T: Transform> {
    transform: T,
    input: FlowReceiver<Packet>,
    reconstructor: OverlapReconstructor,
    keep_chunks: bool,
    cancel: CancelToken,
    poll: Duration,
}

impl<T: Transform> DecodeStage<T> {
    pub fn new(
        transform: T,
        input: FlowReceiver<Packet>,
        reconstructor: OverlapReconstructor,
        cancel: CancelToken,
        poll: Duration,
    ) -> Self {
        Self {
            transform,
            input,
            reconstructor,
            keep_chunks: false,
            cancel,
            poll,
        }
    }

    /// Also return every chunk's output segment
    pub fn keep_chunks(mut self, keep: bool) -> Self {
        self.keep_chunks = keep;
        self
    }

    pub fn run(mut self) -> (StageResult, ReconstructedAudio) {
        let mut stats = StageStats::new(Stage::Decode);
        let mut audio = ReconstructedAudio {
            chunks: self.keep_chunks.then(Vec::new),
            ..ReconstructedAudio::default()
        };
        info!("Decode stage started ({})", self.transform.name());

        let end = loop {
            let packet = match pop(&self.input, &self.cancel, self.poll) {
                Some(Flow::Next(packet)) => packet,
                Some(Flow::Finish) => break StageEnd::Finished,
                None => break StageEnd::interrupted(&self.cancel, "receive stage"),
            };
            let index = packet.chunk_index;

            let started = Instant::now();
            let decoded = match self.transform.decode(&packet.payload, &packet.shape) {
                Ok(samples) => samples,
                Err(e) => {
                    warn!(chunk = index, "Decoding failed, skipping chunk: {}", e);
                    stats.record_failure();
                    continue;
                }
            };
            let segment = match self.reconstructor.push(index, decoded) {
                Ok(segment) => segment,
                Err(e) => {
                    warn!(chunk = index, "Chunk rejected by reconstructor: {}", e);
                    stats.record_failure();
                    continue;
                }
            };
            let elapsed = started.elapsed();
            stats.record(elapsed, packet.payload.len() as u64);
            debug!(
                chunk = index,
                samples = segment.len(),
                "Decoded chunk in {:.4}s",
                elapsed.as_secs_f64()
            );

            audio.chunk_indices.push(index);
            if let Some(chunks) = audio.chunks.as_mut() {
                chunks.push(segment.clone());
            }
            audio.samples.extend(segment);
        };

        // Flush whatever overlap is still held, on every exit path
        let tail = self.reconstructor.finish();
        if !tail.is_empty() {
            debug!(samples = tail.len(), "Flushed held overlap");
            if let Some(last) = audio.chunks.as_mut().and_then(|c| c.last_mut()) {
                last.extend_from_slice(&tail);
            }
            audio.samples.extend(tail);
        }

        info!(
            "Decode stage {} after {} chunks, {} samples",
            end,
            stats.items(),
            audio.samples.len()
        );
        (StageResult { stats, end }, audio)
    }
}
