//! WAV input/output for the binaries

use std::io::{Read, Seek, Write};
use std::path::Path;

use crate::error::AudioError;

/// Decoded mono audio
#[derive(Debug, Clone, PartialEq)]
pub struct WavAudio {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl WavAudio {
    pub fn open(path: &Path) -> Result<Self, AudioError> {
        let reader = hound::WavReader::open(path)
            .map_err(|e| AudioError::Wav(format!("{}: {}", path.display(), e)))?;
        Self::decode(reader)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self, AudioError> {
        let reader = hound::WavReader::new(reader)
            .map_err(|e| AudioError::Wav(format!("Failed to parse WAV data: {}", e)))?;
        Self::decode(reader)
    }

    fn decode<R: Read>(mut reader: hound::WavReader<R>) -> Result<Self, AudioError> {
        let spec = reader.spec();
        let channels = spec.channels.max(1) as usize;

        let interleaved: Vec<f32> = match spec.sample_format {
            hound::SampleFormat::Float => reader
                .samples::<f32>()
                .collect::<Result<_, _>>()
                .map_err(|e| AudioError::Wav(format!("Failed to read WAV samples: {}", e)))?,
            hound::SampleFormat::Int => {
                let scale = (1i64 << (spec.bits_per_sample.max(1) - 1)) as f32;
                reader
                    .samples::<i32>()
                    .map(|s| s.map(|v| v as f32 / scale))
                    .collect::<Result<_, _>>()
                    .map_err(|e| AudioError::Wav(format!("Failed to read WAV samples: {}", e)))?
            }
        };

        // Downmix to mono by averaging channels
        let samples = if channels > 1 {
            interleaved
                .chunks_exact(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        } else {
            interleaved
        };

        Ok(Self {
            samples,
            sample_rate: spec.sample_rate,
        })
    }
}

/// Write mono samples as 16-bit PCM
pub fn write_wav(path: &Path, samples: &[f32], sample_rate: u32) -> Result<(), AudioError> {
    let writer = hound::WavWriter::create(path, pcm16_spec(sample_rate))
        .map_err(|e| AudioError::Wav(format!("{}: {}", path.display(), e)))?;
    write_samples(writer, samples)
}

/// Like [`write_wav`] for any seekable writer
pub fn write_wav_to<W: Write + Seek>(
    writer: W,
    samples: &[f32],
    sample_rate: u32,
) -> Result<(), AudioError> {
    let writer = hound::WavWriter::new(writer, pcm16_spec(sample_rate))
        .map_err(|e| AudioError::Wav(e.to_string()))?;
    write_samples(writer, samples)
}

fn pcm16_spec(sample_rate: u32) -> hound::WavSpec {
    hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    }
}

fn write_samples<W: Write + Seek>(
    mut writer: hound::WavWriter<W>,
    samples: &[f32],
) -> Result<(), AudioError> {
    for &s in samples {
        let v = (s.clamp(-1.0, 1.0) * i16::MAX as f32).round() as i16;
        writer
            .write_sample(v)
            .map_err(|e| AudioError::Wav(e.to_string()))?;
    }
    writer.finalize().map_err(|e| AudioError::Wav(e.to_string()))
}

/// Convert raw signed 16-bit little-endian PCM to samples
///
/// A trailing odd byte is ignored.
pub fn s16le_to_f32(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0)
        .collect()
}
