//! Splitting sample streams into overlapping chunks
//!
//! [`Segmenter`] walks a finite buffer; [`LiveSegmenter`] accumulates
//! bursts from an unbounded source. Both advance by `hop_size`, so every
//! chunk repeats the last `overlap_size` samples of its predecessor.

use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::collections::VecDeque;
use std::time::Duration;

use crate::audio::chunk::{Chunk, ChunkLayout};
use crate::pipeline::CancelToken;
use crate::timestamp_us;

/// Lazy chunk iterator over a finite sample buffer
pub struct Segmenter<'a> {
    samples: &'a [f32],
    layout: ChunkLayout,
    cursor: usize,
    next_index: u64,
}

impl<'a> Segmenter<'a> {
    pub fn new(samples: &'a [f32], layout: ChunkLayout) -> Self {
        Self {
            samples,
            layout,
            cursor: 0,
            next_index: 1,
        }
    }

    /// Total chunks this source yields
    pub fn total_chunks(&self) -> u64 {
        self.layout.chunk_count(self.samples.len())
    }
}

impl Iterator for Segmenter<'_> {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.cursor >= self.samples.len() {
            return None;
        }

        let chunk_size = self.layout.chunk_size();
        let end = (self.cursor + chunk_size).min(self.samples.len());
        let mut samples = Vec::with_capacity(chunk_size);
        samples.extend_from_slice(&self.samples[self.cursor..end]);
        samples.resize(chunk_size, 0.0);

        let chunk = Chunk::new(self.next_index, samples, timestamp_us());
        self.cursor += self.layout.hop_size();
        self.next_index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.samples.len().saturating_sub(self.cursor);
        let n = self.layout.chunk_count(remaining) as usize;
        (n, Some(n))
    }
}

impl ExactSizeIterator for Segmenter<'_> {}

/// Chunk assembler for an unbounded source
pub struct LiveSegmenter {
    layout: ChunkLayout,
    buffer: VecDeque<f32>,
    next_index: u64,
    /// Buffered samples already sent as part of an emitted chunk
    covered: usize,
}

impl LiveSegmenter {
    pub fn new(layout: ChunkLayout) -> Self {
        Self {
            layout,
            buffer: VecDeque::with_capacity(layout.chunk_size() * 2),
            next_index: 1,
            covered: 0,
        }
    }

    /// Append a burst and return every chunk that became complete
    pub fn push(&mut self, burst: &[f32]) -> Vec<Chunk> {
        self.buffer.extend(burst.iter().copied());

        let chunk_size = self.layout.chunk_size();
        let hop = self.layout.hop_size();
        let mut chunks = Vec::new();

        while self.buffer.len() >= chunk_size {
            let samples: Vec<f32> = self.buffer.iter().take(chunk_size).copied().collect();
            chunks.push(Chunk::new(self.next_index, samples, timestamp_us()));
            self.next_index += 1;

            // Advance by hop only; the overlap stays for the next chunk
            self.buffer.drain(..hop);
            self.covered = self.layout.overlap_size();
        }

        chunks
    }

    /// Emit the zero-padded remainder if it holds samples no chunk has carried yet
    pub fn finish(&mut self) -> Option<Chunk> {
        if self.buffer.len() <= self.covered {
            self.buffer.clear();
            self.covered = 0;
            return None;
        }

        let mut samples: Vec<f32> = self.buffer.drain(..).collect();
        samples.resize(self.layout.chunk_size(), 0.0);
        self.covered = 0;

        let chunk = Chunk::new(self.next_index, samples, timestamp_us());
        self.next_index += 1;
        Some(chunk)
    }

    /// Samples currently buffered
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Index the next emitted chunk will carry
    pub fn next_index(&self) -> u64 {
        self.next_index
    }
}

/// Iterator adapter turning a channel of sample bursts into chunks
///
/// Ends when the burst channel disconnects or the token is cancelled.
/// On disconnection the segmenter's remainder is yielded last.
pub struct LiveChunks {
    bursts: Receiver<Vec<f32>>,
    segmenter: LiveSegmenter,
    pending: VecDeque<Chunk>,
    cancel: CancelToken,
    poll_interval: Duration,
    done: bool,
}

impl LiveChunks {
    pub fn new(
        bursts: Receiver<Vec<f32>>,
        layout: ChunkLayout,
        cancel: CancelToken,
        poll_interval: Duration,
    ) -> Self {
        Self {
            bursts,
            segmenter: LiveSegmenter::new(layout),
            pending: VecDeque::new(),
            cancel,
            poll_interval,
            done: false,
        }
    }
}

impl Iterator for LiveChunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        loop {
            if let Some(chunk) = self.pending.pop_front() {
                return Some(chunk);
            }
            if self.done || self.cancel.is_cancelled() {
                return None;
            }

            match self.bursts.recv_timeout(self.poll_interval) {
                Ok(burst) => self.pending.extend(self.segmenter.push(&burst)),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    self.done = true;
                    self.pending.extend(self.segmenter.finish());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use proptest::prelude::*;

    fn ramp(len: usize) -> Vec<f32> {
        (0..len).map(|i| i as f32).collect()
    }

    #[test]
    fn test_reference_scenario() {
        let layout = ChunkLayout::new(16000, 1600).unwrap();
        let samples = ramp(48000);
        let segmenter = Segmenter::new(&samples, layout);
        assert_eq!(segmenter.total_chunks(), 4);
        assert_eq!(segmenter.len(), 4);

        let chunks: Vec<Chunk> = segmenter.collect();
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() == 16000));
        assert_eq!(chunks[1].samples[0], 14400.0);
        assert_eq!(chunks[3].samples[0], 43200.0);
        // 43200 + 4800 = 48000 real samples, the rest is padding
        assert_eq!(chunks[3].samples[4799], 47999.0);
        assert_eq!(chunks[3].samples[4800], 0.0);
        let indices: Vec<u64> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_empty_source() {
        let layout = ChunkLayout::new(10, 2).unwrap();
        let mut segmenter = Segmenter::new(&[], layout);
        assert_eq!(segmenter.total_chunks(), 0);
        assert!(segmenter.next().is_none());
    }

    #[test]
    fn test_overlap_repeats_tail() {
        let layout = ChunkLayout::new(10, 3).unwrap();
        let samples = ramp(30);
        let chunks: Vec<Chunk> = Segmenter::new(&samples, layout).collect();
        for pair in chunks.windows(2) {
            assert_eq!(pair[0].samples[7..], pair[1].samples[..3]);
        }
    }

    #[test]
    fn test_live_segmenter_advances_by_hop() {
        let layout = ChunkLayout::new(10, 4).unwrap();
        let mut live = LiveSegmenter::new(layout);

        assert!(live.push(&ramp(9)).is_empty());
        let chunks = live.push(&[9.0]);
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].samples, ramp(10));
        // Overlap of 4 retained
        assert_eq!(live.buffered(), 4);

        let more: Vec<f32> = (10..22).map(|i| i as f32).collect();
        let chunks = live.push(&more);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].index, 2);
        assert_eq!(chunks[0].samples[0], 6.0);
        assert_eq!(chunks[1].samples[0], 12.0);
        assert_eq!(live.buffered(), 22 - 18);
    }

    #[test]
    fn test_live_finish_only_emits_new_samples() {
        let layout = ChunkLayout::new(10, 4).unwrap();

        let mut live = LiveSegmenter::new(layout);
        live.push(&ramp(10));
        // Only the already-sent overlap is buffered
        assert!(live.finish().is_none());

        let mut live = LiveSegmenter::new(layout);
        live.push(&ramp(12));
        let tail = live.finish().unwrap();
        assert_eq!(tail.index, 2);
        assert_eq!(&tail.samples[..6], &[6.0, 7.0, 8.0, 9.0, 10.0, 11.0]);
        assert_eq!(&tail.samples[6..], &[0.0; 4]);

        let mut live = LiveSegmenter::new(layout);
        live.push(&ramp(3));
        let short = live.finish().unwrap();
        assert_eq!(short.index, 1);
        assert_eq!(short.len(), 10);
    }

    #[test]
    fn test_live_chunks_from_channel() {
        let layout = ChunkLayout::new(8, 2).unwrap();
        let (tx, rx) = unbounded();
        for burst in ramp(20).chunks(5) {
            tx.send(burst.to_vec()).unwrap();
        }
        drop(tx);

        let chunks: Vec<Chunk> =
            LiveChunks::new(rx, layout, CancelToken::new(), Duration::from_millis(10)).collect();
        let indices: Vec<u64> = chunks.iter().map(|c| c.index).collect();
        assert_eq!(indices, vec![1, 2, 3]);
        assert_eq!(chunks[1].samples[0], 6.0);
        assert_eq!(chunks[2].samples[6..], [18.0f32, 19.0]);
    }

    #[test]
    fn test_live_chunks_stop_on_cancel() {
        let layout = ChunkLayout::new(8, 2).unwrap();
        let (_tx, rx) = unbounded::<Vec<f32>>();
        let cancel = CancelToken::new();
        cancel.cancel();
        let mut chunks = LiveChunks::new(rx, layout, cancel, Duration::from_millis(10));
        assert!(chunks.next().is_none());
    }

    proptest! {
        #[test]
        fn prop_chunk_count_matches_formula(
            len in 0usize..5000,
            chunk in 1usize..300,
            overlap_frac in 0.0f64..1.0,
        ) {
            let overlap = ((chunk as f64) * overlap_frac) as usize % chunk;
            let layout = ChunkLayout::new(chunk, overlap).unwrap();
            let hop = chunk - overlap;
            let produced = Segmenter::new(&vec![0.5; len], layout).count() as u64;
            prop_assert_eq!(produced, ((len + hop - 1) / hop) as u64);
        }

        #[test]
        fn prop_live_matches_finite_prefix(
            len in 1usize..2000,
            burst in 1usize..97,
        ) {
            let layout = ChunkLayout::new(64, 16).unwrap();
            let samples = ramp(len);
            let finite: Vec<Chunk> = Segmenter::new(&samples, layout).collect();

            let mut live = LiveSegmenter::new(layout);
            let mut chunks = Vec::new();
            for part in samples.chunks(burst) {
                chunks.extend(live.push(part));
            }
            // Every full live chunk equals the finite chunk at the same index
            for chunk in &chunks {
                prop_assert_eq!(&chunk.samples, &finite[(chunk.index - 1) as usize].samples);
            }
        }
    }
}
