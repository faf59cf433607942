//! Error types for the streaming pipeline

use thiserror::Error;

/// Main error type for the library
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Pipeline stage panicked: {0}")]
    StagePanicked(String),

    #[error("Session cancelled")]
    Cancelled,

    #[error("Invalid session transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the peer went away mid-stream.
    pub fn is_connection_closed(&self) -> bool {
        matches!(self, Error::Network(NetworkError::ConnectionClosed))
    }

    /// True for errors that only affect a single message or chunk.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::Codec(_) | Error::Audio(_) => true,
            Error::Protocol(e) => e.is_recoverable(),
            _ => false,
        }
    }
}

/// Chunking and reconstruction errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AudioError {
    #[error("Invalid chunk layout: {0}")]
    InvalidLayout(String),

    #[error("Chunk {index} has {actual} samples, expected {expected}")]
    ChunkLength {
        index: u64,
        expected: usize,
        actual: usize,
    },

    #[error("Chunk {index} arrived after chunk {previous}")]
    OutOfOrder { index: u64, previous: u64 },

    #[error("WAV file error: {0}")]
    Wav(String),
}

/// Transform (encode/decode) errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    #[error("Encoder initialization failed: {0}")]
    EncoderInit(String),

    #[error("Decoder initialization failed: {0}")]
    DecoderInit(String),

    #[error("Encoding failed: {0}")]
    EncodingFailed(String),

    #[error("Decoding failed: {0}")]
    DecodingFailed(String),

    #[error("Invalid shape metadata: {0}")]
    InvalidShape(String),

    #[error("Unknown codec: {0}")]
    Unknown(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed on {addr}: {reason}")]
    BindFailed { addr: String, reason: String },

    #[error("Connection to {addr} failed: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    #[error("Connection closed by peer")]
    ConnectionClosed,

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
}

impl NetworkError {
    /// Map an I/O error from a read into the receive taxonomy
    pub fn from_read(err: std::io::Error) -> Self {
        if is_disconnect(&err) {
            NetworkError::ConnectionClosed
        } else {
            NetworkError::ReceiveFailed(err.to_string())
        }
    }

    /// Map an I/O error from a write into the send taxonomy
    pub fn from_write(err: std::io::Error) -> Self {
        if is_disconnect(&err) {
            NetworkError::ConnectionClosed
        } else {
            NetworkError::SendFailed(err.to_string())
        }
    }
}

fn is_disconnect(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::UnexpectedEof
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::NotConnected
    )
}

/// Wire protocol errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),

    #[error("Unknown message kind: {0:#04x}")]
    UnknownKind(u8),

    #[error("Frame of {0} bytes exceeds the maximum frame length")]
    FrameTooLarge(usize),

    #[error("Invalid stream metadata: {0}")]
    InvalidMetadata(String),
}

impl ProtocolError {
    /// Malformed single messages are dropped; framing and metadata errors end the session.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ProtocolError::Malformed(_)
                | ProtocolError::UnsupportedVersion(_)
                | ProtocolError::UnknownKind(_)
        )
    }
}

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;
