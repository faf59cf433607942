//! Overlap-add reconstruction
//!
//! Decoded chunks overlap their neighbours by `overlap_size` samples. The
//! reconstructor averages each overlap region with the tail held from the
//! previous chunk and emits a non-overlapping stream.
//!
//! Final chunk policy: the final chunk (`index == total_chunks`) is emitted
//! in full only when no overlap tail was held from its predecessor;
//! otherwise only its first `hop_size` samples are emitted. When the source
//! length is known, output is additionally capped at that many samples so
//! the zero padding of the last chunk never reaches the consumer.

use tracing::debug;

use crate::audio::chunk::ChunkLayout;
use crate::error::AudioError;

pub struct OverlapReconstructor {
    layout: ChunkLayout,
    /// 0 when the stream length is unknown (live)
    total_chunks: u64,
    sample_limit: Option<u64>,
    overlap: Option<Vec<f32>>,
    last_index: Option<u64>,
    emitted: u64,
}

impl OverlapReconstructor {
    pub fn new(layout: ChunkLayout, total_chunks: u64) -> Self {
        Self {
            layout,
            total_chunks,
            sample_limit: None,
            overlap: None,
            last_index: None,
            emitted: 0,
        }
    }

    /// Never emit more than `limit` samples in total
    pub fn with_sample_limit(mut self, limit: u64) -> Self {
        self.sample_limit = Some(limit);
        self
    }

    /// Blend one decoded chunk and return the samples ready for output
    pub fn push(&mut self, index: u64, mut samples: Vec<f32>) -> Result<Vec<f32>, AudioError> {
        let chunk_size = self.layout.chunk_size();
        let overlap = self.layout.overlap_size();
        let hop = self.layout.hop_size();

        if samples.len() != chunk_size {
            return Err(AudioError::ChunkLength {
                index,
                expected: chunk_size,
                actual: samples.len(),
            });
        }
        if let Some(previous) = self.last_index {
            if index <= previous {
                return Err(AudioError::OutOfOrder { index, previous });
            }
            if index > previous + 1 {
                debug!(previous, index, "gap in chunk sequence, blending across it");
            }
        }
        self.last_index = Some(index);

        let had_overlap = match self.overlap.take() {
            Some(tail) => {
                for (sample, held) in samples[..overlap].iter_mut().zip(tail) {
                    *sample = (*sample + held) / 2.0;
                }
                true
            }
            None => false,
        };

        let is_final = self.total_chunks > 0 && index >= self.total_chunks;
        if !is_final {
            self.overlap = Some(samples[hop..].to_vec());
            samples.truncate(hop);
        } else if had_overlap {
            samples.truncate(hop);
        }

        Ok(self.cap(samples))
    }

    /// Flush a held overlap tail; used when the stream ends without a final chunk
    pub fn finish(&mut self) -> Vec<f32> {
        match self.overlap.take() {
            Some(tail) => self.cap(tail),
            None => Vec::new(),
        }
    }

    /// Total samples emitted so far
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn last_index(&self) -> Option<u64> {
        self.last_index
    }

    fn cap(&mut self, mut samples: Vec<f32>) -> Vec<f32> {
        if let Some(limit) = self.sample_limit {
            let room = limit.saturating_sub(self.emitted) as usize;
            samples.truncate(room);
        }
        self.emitted += samples.len() as u64;
        samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::Segmenter;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32 * 0.001).collect()
    }

    fn reconstruct(samples: &[f32], layout: ChunkLayout, limit: Option<u64>) -> Vec<f32> {
        let segmenter = Segmenter::new(samples, layout);
        let mut recon = OverlapReconstructor::new(layout, segmenter.total_chunks());
        if let Some(limit) = limit {
            recon = recon.with_sample_limit(limit);
        }
        let mut output = Vec::new();
        for chunk in segmenter {
            output.extend(recon.push(chunk.index, chunk.samples).unwrap());
        }
        output.extend(recon.finish());
        output
    }

    #[test]
    fn test_identity_reassembly_is_exact() {
        let layout = ChunkLayout::new(100, 20).unwrap();
        let input = ramp(1000);
        let output = reconstruct(&input, layout, Some(input.len() as u64));
        assert_eq!(output.len(), input.len());
        for (a, b) in input.iter().zip(&output) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_reference_scenario_length() {
        let layout = ChunkLayout::new(16000, 1600).unwrap();
        let input = ramp(48000);

        let trimmed = reconstruct(&input, layout, Some(48000));
        assert_eq!(trimmed.len(), 48000);

        // Without the source length the output is 4 hops long
        let untrimmed = reconstruct(&input, layout, None);
        assert_eq!(untrimmed.len(), 4 * 14400);
    }

    #[test]
    fn test_blends_by_mean() {
        let layout = ChunkLayout::new(4, 2).unwrap();
        let mut recon = OverlapReconstructor::new(layout, 2);

        let first = recon.push(1, vec![1.0, 1.0, 1.0, 1.0]).unwrap();
        assert_eq!(first, vec![1.0, 1.0]);

        // Final chunk after an overlap: trimmed to hop
        let last = recon.push(2, vec![3.0, 3.0, 5.0, 5.0]).unwrap();
        assert_eq!(last, vec![2.0, 2.0]);
        assert!(recon.finish().is_empty());
    }

    #[test]
    fn test_single_final_chunk_emitted_whole() {
        let layout = ChunkLayout::new(4, 1).unwrap();
        let mut recon = OverlapReconstructor::new(layout, 1);
        let out = recon.push(1, vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_live_stream_flushes_tail() {
        let layout = ChunkLayout::new(4, 1).unwrap();
        let mut recon = OverlapReconstructor::new(layout, 0);
        assert_eq!(recon.push(1, vec![1.0; 4]).unwrap().len(), 3);
        assert_eq!(recon.push(2, vec![3.0; 4]).unwrap(), vec![2.0, 3.0, 3.0]);
        assert_eq!(recon.finish(), vec![3.0]);
        assert_eq!(recon.emitted(), 7);
    }

    #[test]
    fn test_rejects_bad_chunks() {
        let layout = ChunkLayout::new(4, 1).unwrap();
        let mut recon = OverlapReconstructor::new(layout, 0);

        assert_eq!(
            recon.push(1, vec![0.0; 3]),
            Err(AudioError::ChunkLength {
                index: 1,
                expected: 4,
                actual: 3
            })
        );
        recon.push(2, vec![0.0; 4]).unwrap();
        assert_eq!(
            recon.push(2, vec![0.0; 4]),
            Err(AudioError::OutOfOrder {
                index: 2,
                previous: 2
            })
        );
        // Gaps are tolerated
        assert!(recon.push(5, vec![0.0; 4]).is_ok());
        assert_eq!(recon.last_index(), Some(5));
    }
}
