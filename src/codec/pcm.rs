//! Sample-wise transforms
//!
//! `Float32Transform` is lossless and serves as the no-op transform;
//! `Pcm16Transform` halves the payload by quantising to 16 bits.

use bytes::{BufMut, Bytes, BytesMut};

use crate::codec::{expect_len_shape, EncodedChunk, Transform};
use crate::error::CodecError;

/// Lossless big-endian f32 passthrough
#[derive(Debug, Clone, Copy, Default)]
pub struct Float32Transform;

impl Transform for Float32Transform {
    fn encode(&mut self, samples: &[f32], _quality: u32) -> Result<EncodedChunk, CodecError> {
        Ok(EncodedChunk {
            payload: encode_f32(samples),
            shape: vec![samples.len() as u32],
        })
    }

    fn decode(&mut self, payload: &[u8], shape: &[u32]) -> Result<Vec<f32>, CodecError> {
        let len = expect_len_shape(shape)?;
        if payload.len() != len * 4 {
            return Err(CodecError::DecodingFailed(format!(
                "payload of {} bytes does not hold {} f32 samples",
                payload.len(),
                len
            )));
        }
        Ok(payload
            .chunks_exact(4)
            .map(|b| f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn name(&self) -> &'static str {
        "float32"
    }
}

/// 16-bit linear PCM, big-endian
#[derive(Debug, Clone, Copy, Default)]
pub struct Pcm16Transform;

impl Transform for Pcm16Transform {
    fn encode(&mut self, samples: &[f32], _quality: u32) -> Result<EncodedChunk, CodecError> {
        let mut buf = BytesMut::with_capacity(samples.len() * 2);
        for &s in samples {
            if !s.is_finite() {
                return Err(CodecError::EncodingFailed("non-finite sample".into()));
            }
            buf.put_i16((s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16);
        }
        Ok(EncodedChunk {
            payload: buf.freeze(),
            shape: vec![samples.len() as u32],
        })
    }

    fn decode(&mut self, payload: &[u8], shape: &[u32]) -> Result<Vec<f32>, CodecError> {
        let len = expect_len_shape(shape)?;
        if payload.len() != len * 2 {
            return Err(CodecError::DecodingFailed(format!(
                "payload of {} bytes does not hold {} i16 samples",
                payload.len(),
                len
            )));
        }
        Ok(payload
            .chunks_exact(2)
            .map(|b| i16::from_be_bytes([b[0], b[1]]) as f32 / i16::MAX as f32)
            .collect())
    }

    fn name(&self) -> &'static str {
        "pcm16"
    }
}

fn encode_f32(samples: &[f32]) -> Bytes {
    let mut buf = BytesMut::with_capacity(samples.len() * 4);
    for &s in samples {
        buf.put_f32(s);
    }
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float32_is_lossless() {
        let mut t = Float32Transform;
        let samples = vec![0.0, 1.0, -1.0, 0.123_456_7, f32::MIN_POSITIVE];
        let encoded = t.encode(&samples, 6).unwrap();
        assert_eq!(encoded.payload.len(), samples.len() * 4);
        assert_eq!(encoded.shape, vec![5]);
        assert_eq!(t.decode(&encoded.payload, &encoded.shape).unwrap(), samples);
    }

    #[test]
    fn test_pcm16_quantisation_error() {
        let mut t = Pcm16Transform;
        let samples: Vec<f32> = (0..480)
            .map(|i| (i as f32 / 48.0 * std::f32::consts::TAU).sin() * 0.8)
            .collect();
        let encoded = t.encode(&samples, 6).unwrap();
        assert_eq!(encoded.payload.len(), samples.len() * 2);

        let decoded = t.decode(&encoded.payload, &encoded.shape).unwrap();
        for (a, b) in samples.iter().zip(&decoded) {
            assert!((a - b).abs() < 1.0 / 16384.0);
        }
    }

    #[test]
    fn test_pcm16_clamps_and_rejects_nan() {
        let mut t = Pcm16Transform;
        let encoded = t.encode(&[2.0, -2.0], 0).unwrap();
        let decoded = t.decode(&encoded.payload, &encoded.shape).unwrap();
        assert_eq!(decoded, vec![1.0, -1.0]);

        assert!(matches!(
            t.encode(&[f32::NAN], 0),
            Err(CodecError::EncodingFailed(_))
        ));
    }

    #[test]
    fn test_shape_mismatch_is_decode_failure() {
        let mut t = Float32Transform;
        let payload = encode_f32(&[1.0, 2.0]);
        assert!(matches!(
            t.decode(&payload, &[3]),
            Err(CodecError::DecodingFailed(_))
        ));
        assert!(matches!(
            t.decode(&payload, &[1, 2]),
            Err(CodecError::InvalidShape(_))
        ));
    }
}
