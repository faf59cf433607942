//! Chunk geometry and the chunk type carried through the sender pipeline

use crate::error::AudioError;

/// Fixed-size window of consecutive mono samples
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    /// 1-based position in the stream
    pub index: u64,
    /// Exactly `chunk_size` samples
    pub samples: Vec<f32>,
    /// Capture timestamp in microseconds since the Unix epoch
    pub captured_at_us: u64,
}

impl Chunk {
    pub fn new(index: u64, samples: Vec<f32>, captured_at_us: u64) -> Self {
        Self {
            index,
            samples,
            captured_at_us,
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Chunk duration in microseconds
    pub fn duration_us(&self, sample_rate: u32) -> u64 {
        (self.samples.len() as u64 * 1_000_000) / sample_rate.max(1) as u64
    }
}

/// Chunk size and overlap, validated so that the hop is never zero
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkLayout {
    chunk_size: usize,
    overlap_size: usize,
}

impl ChunkLayout {
    pub fn new(chunk_size: usize, overlap_size: usize) -> Result<Self, AudioError> {
        if chunk_size == 0 {
            return Err(AudioError::InvalidLayout("chunk size must be positive".into()));
        }
        if overlap_size >= chunk_size {
            return Err(AudioError::InvalidLayout(format!(
                "overlap {} must be smaller than chunk size {}",
                overlap_size, chunk_size
            )));
        }
        Ok(Self {
            chunk_size,
            overlap_size,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn overlap_size(&self) -> usize {
        self.overlap_size
    }

    /// Non-overlapping advance per chunk
    pub fn hop_size(&self) -> usize {
        self.chunk_size - self.overlap_size
    }

    /// Number of chunks a finite source of `len` samples produces
    pub fn chunk_count(&self, len: usize) -> u64 {
        let hop = self.hop_size() as u64;
        (len as u64 + hop - 1) / hop
    }
}
