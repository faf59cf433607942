//! Transform capability
//!
//! The pipeline treats the codec as an opaque encode/decode pair. Each
//! endpoint owns one instance and calls it from a single stage thread.

pub mod pcm;
#[cfg(feature = "opus-codec")]
pub mod opus;

use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

use crate::error::CodecError;

pub use pcm::{Float32Transform, Pcm16Transform};
#[cfg(feature = "opus-codec")]
pub use self::opus::OpusTransform;

/// Compact representation of one chunk plus what is needed to invert it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedChunk {
    pub payload: Bytes,
    /// Transform-defined size metadata
    pub shape: Vec<u32>,
}

/// Encode/decode pair injected into the pipeline
pub trait Transform: Send {
    /// Encode `samples` at the given quality / stream count
    fn encode(&mut self, samples: &[f32], quality: u32) -> Result<EncodedChunk, CodecError>;

    /// Invert [`Transform::encode`]
    fn decode(&mut self, payload: &[u8], shape: &[u32]) -> Result<Vec<f32>, CodecError>;

    /// Short name for logs and reports
    fn name(&self) -> &'static str;
}

impl<T: Transform + ?Sized> Transform for Box<T> {
    fn encode(&mut self, samples: &[f32], quality: u32) -> Result<EncodedChunk, CodecError> {
        (**self).encode(samples, quality)
    }

    fn decode(&mut self, payload: &[u8], shape: &[u32]) -> Result<Vec<f32>, CodecError> {
        (**self).decode(payload, shape)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Built-in transforms selectable by name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecKind {
    Float32,
    Pcm16,
    #[cfg(feature = "opus-codec")]
    Opus,
}

impl CodecKind {
    /// Instantiate the transform for a stream at `sample_rate`
    #[cfg_attr(not(feature = "opus-codec"), allow(unused_variables))]
    pub fn build(self, sample_rate: u32) -> Result<Box<dyn Transform>, CodecError> {
        match self {
            CodecKind::Float32 => Ok(Box::new(Float32Transform)),
            CodecKind::Pcm16 => Ok(Box::new(Pcm16Transform)),
            #[cfg(feature = "opus-codec")]
            CodecKind::Opus => Ok(Box::new(OpusTransform::new(sample_rate)?)),
        }
    }
}

impl FromStr for CodecKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float32" | "f32" => Ok(CodecKind::Float32),
            "pcm16" | "s16" => Ok(CodecKind::Pcm16),
            #[cfg(feature = "opus-codec")]
            "opus" => Ok(CodecKind::Opus),
            other => Err(CodecError::Unknown(other.to_string())),
        }
    }
}

impl fmt::Display for CodecKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CodecKind::Float32 => "float32",
            CodecKind::Pcm16 => "pcm16",
            #[cfg(feature = "opus-codec")]
            CodecKind::Opus => "opus",
        };
        f.write_str(name)
    }
}

/// Read the single-length shape used by the sample-wise transforms
pub(crate) fn expect_len_shape(shape: &[u32]) -> Result<usize, CodecError> {
    match shape {
        [len] => Ok(*len as usize),
        other => Err(CodecError::InvalidShape(format!(
            "expected [len], got {:?}",
            other
        ))),
    }
}
