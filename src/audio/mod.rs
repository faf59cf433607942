//! Chunking, overlap-add reconstruction and WAV I/O

pub mod chunk;
pub mod reconstruct;
pub mod segmenter;
pub mod wav;

pub use chunk::{Chunk, ChunkLayout};
pub use reconstruct::OverlapReconstructor;
pub use segmenter::{LiveChunks, LiveSegmenter, Segmenter};
pub use wav::{s16le_to_f32, write_wav, WavAudio};
