//! # Overlap Streamer
//!
//! Streams audio between two endpoints over TCP as a sequence of
//! overlapping chunks, each passed through a pluggable transform.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                                SENDER                                │
//! │  ┌───────────────┐    ┌──────────────┐    ┌──────────────────────┐   │
//! │  │   Segmenter   │───▶│ encode queue │───▶│     Encode Stage     │   │
//! │  │ (file / live) │    │  (bounded)   │    │  Transform::encode   │   │
//! │  └───────────────┘    └──────────────┘    └──────────┬───────────┘   │
//! │                                                      ▼               │
//! │                       ┌──────────────┐    ┌──────────────────────┐   │
//! │                       │  send queue  │───▶│      Send Stage      │   │
//! │                       │  (bounded)   │    │ RateLimiter + frames │   │
//! │                       └──────────────┘    └──────────┬───────────┘   │
//! └──────────────────────────────────────────────────────┼───────────────┘
//!                 [len u32 BE][metadata | data | end]    │ TCP
//! ┌──────────────────────────────────────────────────────┼───────────────┐
//! │                               RECEIVER               ▼               │
//! │  ┌──────────────────────┐    ┌──────────────┐   ┌────────────────┐   │
//! │  │     Decode Stage     │◀───│ decode queue │◀──│ Receive Stage  │   │
//! │  │  Transform::decode   │    │  (bounded)   │   │ frames → Packet│   │
//! │  └──────────┬───────────┘    └──────────────┘   └────────────────┘   │
//! │             ▼                                                        │
//! │  ┌──────────────────────┐                                            │
//! │  │ Overlap Reconstructor│───▶ continuous samples                     │
//! │  └──────────────────────┘                                            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod codec;
pub mod config;
pub mod error;
pub mod network;
pub mod pipeline;
pub mod protocol;
pub mod session;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate (16 kHz mono)
    pub const DEFAULT_SAMPLE_RATE: u32 = 16000;

    /// Default chunk size in samples (1 s at 16 kHz)
    pub const DEFAULT_CHUNK_SIZE: usize = 16000;

    /// Default overlap in samples (0.1 s at 16 kHz)
    pub const DEFAULT_OVERLAP_SIZE: usize = 1600;

    /// Default transform quality / stream count
    pub const DEFAULT_NUM_STREAMS: u32 = 6;

    /// Default receiver host
    pub const DEFAULT_HOST: &str = "127.0.0.1";

    /// Default TCP port
    pub const DEFAULT_PORT: u16 = 8888;

    /// Default socket buffer size in bytes
    pub const DEFAULT_SOCKET_BUFFER_SIZE: usize = 4096;

    /// Default rate limit in bytes per second (3 kbps)
    pub const DEFAULT_RATE_LIMIT_BPS: u64 = 375;

    /// Default queue capacities
    pub const DEFAULT_ENCODE_QUEUE_CAPACITY: usize = 10;
    pub const DEFAULT_SEND_QUEUE_CAPACITY: usize = 10;
    pub const DEFAULT_DECODE_QUEUE_CAPACITY: usize = 20;

    /// Queue poll timeout; only bounds shutdown latency
    pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

    /// Upper bound for a single framed message
    pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

    /// Wire protocol version for data and end messages
    pub const PROTOCOL_VERSION: u8 = 1;
}

/// Wall-clock timestamp in microseconds since the Unix epoch
pub fn timestamp_us() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}
