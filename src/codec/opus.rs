//! Opus-backed transform
//!
//! Each chunk is cut into 20 ms Opus frames. The payload is the
//! concatenation of `[len: u16 BE][opus packet]` records; the shape is
//! `[samples, frame_size, frames]`. Bitrate follows the quality parameter
//! at 1.5 kbit/s per stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use opus::{Application, Bitrate, Channels, Decoder, Encoder};

use crate::codec::{EncodedChunk, Transform};
use crate::error::CodecError;

/// Bits per second contributed by each quality step
const BITS_PER_STREAM: u32 = 1_500;

/// Largest packet a single Opus frame can produce
const MAX_PACKET: usize = 4000;

pub struct OpusTransform {
    encoder: Encoder,
    decoder: Decoder,
    frame_size: usize,
    /// Bitrate currently configured on the encoder
    bitrate: Option<u32>,
    /// Encoding buffer (reused to avoid allocations)
    encode_buffer: Vec<u8>,
    decode_buffer: Vec<f32>,
}

impl OpusTransform {
    pub fn new(sample_rate: u32) -> Result<Self, CodecError> {
        if !matches!(sample_rate, 8000 | 12000 | 16000 | 24000 | 48000) {
            return Err(CodecError::EncoderInit(format!(
                "Opus does not support {} Hz",
                sample_rate
            )));
        }

        let encoder = Encoder::new(sample_rate, Channels::Mono, Application::Audio)
            .map_err(|e| CodecError::EncoderInit(e.to_string()))?;
        let decoder = Decoder::new(sample_rate, Channels::Mono)
            .map_err(|e| CodecError::DecoderInit(e.to_string()))?;
        let frame_size = sample_rate as usize / 50;

        Ok(Self {
            encoder,
            decoder,
            frame_size,
            bitrate: None,
            encode_buffer: vec![0u8; MAX_PACKET],
            decode_buffer: vec![0.0f32; frame_size],
        })
    }

    pub fn frame_size(&self) -> usize {
        self.frame_size
    }

    fn apply_quality(&mut self, quality: u32) -> Result<(), CodecError> {
        let bitrate = quality.max(1) * BITS_PER_STREAM;
        if self.bitrate != Some(bitrate) {
            self.encoder
                .set_bitrate(Bitrate::Bits(bitrate as i32))
                .map_err(|e| CodecError::EncoderInit(format!("Failed to set bitrate: {}", e)))?;
            self.bitrate = Some(bitrate);
        }
        Ok(())
    }
}

impl Transform for OpusTransform {
    fn encode(&mut self, samples: &[f32], quality: u32) -> Result<EncodedChunk, CodecError> {
        self.apply_quality(quality)?;

        let mut payload = BytesMut::new();
        let mut frame = vec![0.0f32; self.frame_size];
        let mut frames = 0u32;

        for part in samples.chunks(self.frame_size) {
            frame[..part.len()].copy_from_slice(part);
            frame[part.len()..].fill(0.0);

            let size = self
                .encoder
                .encode_float(&frame, &mut self.encode_buffer)
                .map_err(|e| CodecError::EncodingFailed(e.to_string()))?;
            payload.put_u16(size as u16);
            payload.put_slice(&self.encode_buffer[..size]);
            frames += 1;
        }

        Ok(EncodedChunk {
            payload: payload.freeze(),
            shape: vec![samples.len() as u32, self.frame_size as u32, frames],
        })
    }

    fn decode(&mut self, payload: &[u8], shape: &[u32]) -> Result<Vec<f32>, CodecError> {
        let (len, frame_size, frames) = match shape {
            [len, frame_size, frames] => (*len as usize, *frame_size as usize, *frames),
            other => {
                return Err(CodecError::InvalidShape(format!(
                    "expected [samples, frame_size, frames], got {:?}",
                    other
                )))
            }
        };
        if frame_size != self.frame_size {
            return Err(CodecError::InvalidShape(format!(
                "frame size {} does not match decoder frame size {}",
                frame_size, self.frame_size
            )));
        }

        // Bound every allocation by what the payload can actually hold
        let frames = frames as usize;
        let capacity = frames.checked_mul(frame_size).ok_or_else(|| {
            CodecError::InvalidShape(format!("{} frames of {} samples overflow", frames, frame_size))
        })?;
        if len > capacity {
            return Err(CodecError::InvalidShape(format!(
                "{} samples do not fit in {} frames of {}",
                len, frames, frame_size
            )));
        }
        if frames > payload.len() / 2 {
            return Err(CodecError::DecodingFailed(format!(
                "payload of {} bytes cannot hold {} frames",
                payload.len(),
                frames
            )));
        }

        let mut input = Bytes::copy_from_slice(payload);
        let mut output = Vec::with_capacity(capacity);
        for _ in 0..frames {
            if input.remaining() < 2 {
                return Err(CodecError::DecodingFailed("truncated frame header".into()));
            }
            let size = input.get_u16() as usize;
            if input.remaining() < size {
                return Err(CodecError::DecodingFailed("truncated frame".into()));
            }
            let packet = input.split_to(size);
            let decoded = self
                .decoder
                .decode_float(&packet, &mut self.decode_buffer, false)
                .map_err(|e| CodecError::DecodingFailed(e.to_string()))?;
            output.extend_from_slice(&self.decode_buffer[..decoded]);
        }

        output.resize(len, 0.0);
        Ok(output)
    }

    fn name(&self) -> &'static str {
        "opus"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_rate() {
        assert!(matches!(
            OpusTransform::new(44100),
            Err(CodecError::EncoderInit(_))
        ));
    }

    #[test]
    fn test_chunk_roundtrip_length() {
        let mut transform = OpusTransform::new(16000).unwrap();
        assert_eq!(transform.frame_size(), 320);

        // 1 s sine at 440 Hz, not a multiple of the frame size
        let samples: Vec<f32> = (0..16100)
            .map(|i| (i as f32 / 16000.0 * 440.0 * std::f32::consts::TAU).sin() * 0.5)
            .collect();
        let encoded = transform.encode(&samples, 6).unwrap();
        assert_eq!(encoded.shape, vec![16100, 320, 51]);
        // 9 kbit/s for ~1 s of audio stays far below raw PCM
        assert!(encoded.payload.len() < samples.len());

        let decoded = transform.decode(&encoded.payload, &encoded.shape).unwrap();
        assert_eq!(decoded.len(), samples.len());
    }

    #[test]
    fn test_oversized_shape_rejected() {
        let mut transform = OpusTransform::new(16000).unwrap();
        assert!(transform.decode(&[0, 0], &[16000, 320, u32::MAX]).is_err());
        assert!(matches!(
            transform.decode(&[0, 0], &[u32::MAX, 320, 1]),
            Err(CodecError::InvalidShape(_))
        ));
        assert!(matches!(
            transform.decode(&[], &[0, 320, 0]),
            Ok(ref samples) if samples.is_empty()
        ));
    }

    #[test]
    fn test_truncated_payload() {
        let mut transform = OpusTransform::new(16000).unwrap();
        let encoded = transform.encode(&vec![0.0; 640], 6).unwrap();
        let cut = &encoded.payload[..encoded.payload.len() - 1];
        assert!(matches!(
            transform.decode(cut, &encoded.shape),
            Err(CodecError::DecodingFailed(_))
        ));
    }
}
