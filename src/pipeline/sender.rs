//! Sender stages: encode and send

use std::io::Write;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

use crate::audio::Chunk;
use crate::codec::Transform;
use crate::error::NetworkError;
use crate::network::RateLimiter;
use crate::pipeline::{pop, push, CancelToken, Flow, FlowReceiver, FlowSender, StageEnd, StageResult};
use crate::protocol::{encode_message, write_frame, Message, Packet, FRAME_HEADER_LEN};
use crate::session::stats::{Stage, StageStats};

/// Chunk → `Transform::encode` → packet
pub struct EncodeStage<T: Transform> {
    transform: T,
    quality: u32,
    input: FlowReceiver<Chunk>,
    output: FlowSender<Packet>,
    cancel: CancelToken,
    poll: Duration,
}

impl<T: Transform> EncodeStage<T> {
    pub fn new(
        transform: T,
        quality: u32,
        input: FlowReceiver<Chunk>,
        output: FlowSender<Packet>,
        cancel: CancelToken,
        poll: Duration,
    ) -> Self {
        Self {
            transform,
            quality,
            input,
            output,
            cancel,
            poll,
        }
    }

    pub fn run(mut self) -> StageResult {
        let mut stats = StageStats::new(Stage::Encode);
        info!("Encode stage started ({})", self.transform.name());

        let end = loop {
            let chunk = match pop(&self.input, &self.cancel, self.poll) {
                Some(Flow::Next(chunk)) => chunk,
                Some(Flow::Finish) => {
                    if push(&self.output, Flow::Finish, &self.cancel, self.poll) {
                        break StageEnd::Finished;
                    }
                    break StageEnd::interrupted(&self.cancel, "send stage");
                }
                None => break StageEnd::interrupted(&self.cancel, "producer"),
            };

            let started = Instant::now();
            let encoded = match self.transform.encode(&chunk.samples, self.quality) {
                Ok(encoded) => encoded,
                Err(e) => {
                    warn!(chunk = chunk.index, "Encoding failed, skipping chunk: {}", e);
                    stats.record_failure();
                    continue;
                }
            };
            let elapsed = started.elapsed();
            stats.record(elapsed, encoded.payload.len() as u64);
            debug!(
                chunk = chunk.index,
                bytes = encoded.payload.len(),
                "Encoded chunk in {:.4}s",
                elapsed.as_secs_f64()
            );

            let packet = Packet {
                chunk_index: chunk.index,
                timestamp_us: chunk.captured_at_us,
                shape: encoded.shape,
                payload: encoded.payload,
            };
            if !push(&self.output, Flow::Next(packet), &self.cancel, self.poll) {
                break StageEnd::interrupted(&self.cancel, "send stage");
            }
        };

        info!("Encode stage {} after {} chunks", end, stats.items());
        StageResult { stats, end }
    }
}

/// Packet → rate limiter → frame → connection
///
/// The only writer of the connection.
pub struct SendStage<W: Write> {
    writer: W,
    input: FlowReceiver<Packet>,
    limiter: Option<RateLimiter>,
    cancel: CancelToken,
    poll: Duration,
}

impl<W: Write> SendStage<W> {
    pub fn new(
        writer: W,
        input: FlowReceiver<Packet>,
        limiter: Option<RateLimiter>,
        cancel: CancelToken,
        poll: Duration,
    ) -> Self {
        Self {
            writer,
            input,
            limiter,
            cancel,
            poll,
        }
    }

    pub fn run(mut self) -> StageResult {
        let mut stats = StageStats::new(Stage::Send);
        match &self.limiter {
            Some(limiter) => info!("Send stage started, rate limit {} bytes/s", limiter.budget()),
            None => info!("Send stage started"),
        }

        let end = loop {
            let packet = match pop(&self.input, &self.cancel, self.poll) {
                Some(Flow::Next(packet)) => packet,
                Some(Flow::Finish) => break self.finish(),
                None => break StageEnd::interrupted(&self.cancel, "encode stage"),
            };
            let index = packet.chunk_index;

            let payload = match encode_message(&Message::Data(packet)) {
                Ok(payload) => payload,
                Err(e) => {
                    warn!(chunk = index, "Failed to serialize packet: {}", e);
                    stats.record_failure();
                    continue;
                }
            };

            if let Some(limiter) = self.limiter.as_mut() {
                let wire_len = (FRAME_HEADER_LEN + payload.len()) as u64;
                if !limiter.acquire(wire_len, &self.cancel) {
                    break StageEnd::Cancelled;
                }
            }

            let started = Instant::now();
            match write_frame(&mut self.writer, &payload) {
                Ok(written) => {
                    let elapsed = started.elapsed();
                    stats.record(elapsed, written as u64);
                    debug!(
                        chunk = index,
                        bytes = written,
                        "Sent chunk in {:.4}s",
                        elapsed.as_secs_f64()
                    );
                }
                Err(e) => break self.write_failed(NetworkError::from_write(e)),
            }
        };

        if let Some(limiter) = &self.limiter {
            stats.set_throttled(limiter.throttled());
        }
        info!("Send stage {} after {} packets", end, stats.items());
        StageResult { stats, end }
    }

    fn finish(&mut self) -> StageEnd {
        let end = encode_message(&Message::End)
            .map_err(|e| e.to_string())
            .and_then(|payload| {
                write_frame(&mut self.writer, &payload)
                    .and_then(|_| self.writer.flush())
                    .map_err(|e| e.to_string())
            });
        match end {
            Ok(()) => {
                debug!("End message sent");
                StageEnd::Finished
            }
            Err(reason) => {
                error!("Failed to send end message: {}", reason);
                self.cancel.cancel();
                StageEnd::Failed(reason)
            }
        }
    }

    fn write_failed(&self, err: NetworkError) -> StageEnd {
        if self.cancel.is_cancelled() {
            return StageEnd::Cancelled;
        }
        self.cancel.cancel();
        match err {
            NetworkError::ConnectionClosed => {
                warn!("Receiver closed the connection");
                StageEnd::PeerClosed
            }
            other => {
                error!("Send failed: {}", other);
                StageEnd::Failed(other.to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{EncodedChunk, Float32Transform};
    use crate::error::CodecError;
    use crate::pipeline::queue;
    use crate::protocol::{decode_message, read_frame};
    use std::io::{self, Cursor};

    const POLL: Duration = Duration::from_millis(10);

    /// Fails on every chunk whose first sample is negative
    struct Picky;

    impl Transform for Picky {
        fn encode(&mut self, samples: &[f32], _quality: u32) -> Result<EncodedChunk, CodecError> {
            if samples[0] < 0.0 {
                return Err(CodecError::EncodingFailed("negative".into()));
            }
            Float32Transform.encode(samples, 0)
        }

        fn decode(&mut self, payload: &[u8], shape: &[u32]) -> Result<Vec<f32>, CodecError> {
            Float32Transform.decode(payload, shape)
        }

        fn name(&self) -> &'static str {
            "picky"
        }
    }

    struct Broken;

    impl Write for Broken {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn packet(index: u64) -> Packet {
        Packet {
            chunk_index: index,
            timestamp_us: 0,
            shape: vec![1],
            payload: bytes::Bytes::from(0.5f32.to_be_bytes().to_vec()),
        }
    }

    #[test]
    fn test_encode_skips_failed_chunks() {
        let (chunk_tx, chunk_rx) = queue(8);
        let (packet_tx, packet_rx) = queue(8);
        for (index, first) in [(1u64, 0.1f32), (2, -0.1), (3, 0.3)] {
            chunk_tx.send(Flow::Next(Chunk::new(index, vec![first, 0.0], 0))).unwrap();
        }
        chunk_tx.send(Flow::Finish).unwrap();

        let result = EncodeStage::new(Picky, 6, chunk_rx, packet_tx, CancelToken::new(), POLL).run();
        assert_eq!(result.end, StageEnd::Finished);
        assert_eq!(result.stats.items(), 2);
        assert_eq!(result.stats.failures(), 1);

        let indices: Vec<u64> = packet_rx
            .try_iter()
            .filter_map(|flow| match flow {
                Flow::Next(p) => Some(p.chunk_index),
                Flow::Finish => None,
            })
            .collect();
        assert_eq!(indices, vec![1, 3]);
    }

    #[test]
    fn test_encode_abnormal_end_does_not_forward_finish() {
        let (chunk_tx, chunk_rx) = queue::<Chunk>(8);
        let (packet_tx, packet_rx) = queue(8);
        drop(chunk_tx);

        let result = EncodeStage::new(Picky, 6, chunk_rx, packet_tx, CancelToken::new(), POLL).run();
        assert!(matches!(result.end, StageEnd::Failed(_)));
        assert!(packet_rx.try_recv().is_err());
    }

    #[test]
    fn test_send_writes_frames_and_end() {
        let (tx, rx) = queue(8);
        tx.send(Flow::Next(packet(1))).unwrap();
        tx.send(Flow::Next(packet(2))).unwrap();
        tx.send(Flow::Finish).unwrap();

        let mut wire = Vec::new();
        let result = SendStage::new(&mut wire, rx, None, CancelToken::new(), POLL).run();
        assert_eq!(result.end, StageEnd::Finished);
        assert_eq!(result.stats.items(), 2);

        let mut reader = Cursor::new(wire);
        for expected in [1, 2] {
            let frame = read_frame(&mut reader).unwrap();
            match decode_message(&frame).unwrap() {
                Message::Data(p) => assert_eq!(p.chunk_index, expected),
                Message::End => panic!("end before data"),
            }
        }
        let frame = read_frame(&mut reader).unwrap();
        assert_eq!(decode_message(&frame).unwrap(), Message::End);
        // Wire bytes include the length prefixes
        assert_eq!(result.stats.bytes(), 2 * (4 + 2 + 8 + 8 + 12 + 12));
    }

    #[test]
    fn test_send_failure_cancels_session() {
        let (tx, rx) = queue(8);
        tx.send(Flow::Next(packet(1))).unwrap();

        let cancel = CancelToken::new();
        let result = SendStage::new(Broken, rx, None, cancel.clone(), POLL).run();
        assert_eq!(result.end, StageEnd::PeerClosed);
        assert!(cancel.is_cancelled());
        assert_eq!(result.stats.items(), 0);
    }

    #[test]
    fn test_send_respects_rate_limit_cancellation() {
        let (tx, rx) = queue(8);
        tx.send(Flow::Next(packet(1))).unwrap();
        tx.send(Flow::Next(packet(2))).unwrap();

        let cancel = CancelToken::new();
        let canceller = {
            let cancel = cancel.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(100));
                cancel.cancel();
            })
        };

        // Budget fits one packet, so the second waits for the next window
        let mut wire = Vec::new();
        let limiter = RateLimiter::new(50);
        let result = SendStage::new(&mut wire, rx, Some(limiter), cancel, POLL).run();
        canceller.join().unwrap();

        assert_eq!(result.end, StageEnd::Cancelled);
        assert_eq!(result.stats.items(), 1);
    }
}
