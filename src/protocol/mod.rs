//! Wire protocol
//!
//! A session is one metadata frame followed by data frames and a single
//! end frame, each wrapped by [`framing`].
//!
//! ## Metadata (JSON)
//! ```text
//! {"sample_rate":16000,"chunk_size":16000,"overlap_size":1600,
//!  "num_streams":6,"total_chunks":4,"total_samples":48000,"version":1}
//! ```
//!
//! ## Data / End
//! ```text
//! ┌─────────┬──────┬──────────────────────────────────────────────┐
//! │ version │ kind │ body (bincode, big-endian, fixed-width ints) │
//! │  1 byte │ 1 B  │ data: chunk_index u64, timestamp_us u64,     │
//! │         │      │       shape [u32], payload [u8]              │
//! │         │      │ end:  end bool                               │
//! └─────────┴──────┴──────────────────────────────────────────────┘
//! ```

pub mod framing;

use bincode::Options;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

use crate::audio::ChunkLayout;
use crate::constants::{MAX_FRAME_LEN, PROTOCOL_VERSION};
use crate::error::ProtocolError;

pub use framing::{read_frame, receive_exact, write_frame, FRAME_HEADER_LEN};

/// Message kinds following the version byte
pub mod kind {
    pub const DATA: u8 = 0x01;
    pub const END: u8 = 0x02;
}

/// Stream parameters sent once before any data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub sample_rate: u32,
    pub chunk_size: usize,
    pub overlap_size: usize,
    pub num_streams: u32,
    /// 0 for live sources
    pub total_chunks: u64,
    /// Source length in samples, 0 when unknown
    #[serde(default)]
    pub total_samples: u64,
    #[serde(default = "default_version")]
    pub version: u8,
}

fn default_version() -> u8 {
    PROTOCOL_VERSION
}

impl StreamMetadata {
    pub fn new(
        sample_rate: u32,
        layout: ChunkLayout,
        num_streams: u32,
        total_chunks: u64,
        total_samples: u64,
    ) -> Self {
        Self {
            sample_rate,
            chunk_size: layout.chunk_size(),
            overlap_size: layout.overlap_size(),
            num_streams,
            total_chunks,
            total_samples,
            version: PROTOCOL_VERSION,
        }
    }

    /// Validated chunk geometry
    pub fn layout(&self) -> Result<ChunkLayout, ProtocolError> {
        ChunkLayout::new(self.chunk_size, self.overlap_size)
            .map_err(|e| ProtocolError::InvalidMetadata(e.to_string()))
    }

    pub fn hop_size(&self) -> usize {
        self.chunk_size.saturating_sub(self.overlap_size)
    }

    pub fn is_live(&self) -> bool {
        self.total_chunks == 0
    }

    pub fn validate(&self) -> Result<(), ProtocolError> {
        if self.version != PROTOCOL_VERSION {
            return Err(ProtocolError::InvalidMetadata(format!(
                "protocol version {} is not supported",
                self.version
            )));
        }
        if self.sample_rate == 0 {
            return Err(ProtocolError::InvalidMetadata("sample_rate must be positive".into()));
        }
        let layout = self.layout()?;
        if self.total_samples > 0 {
            let expected = layout.chunk_count(self.total_samples as usize);
            if expected != self.total_chunks {
                return Err(ProtocolError::InvalidMetadata(format!(
                    "{} samples make {} chunks, metadata says {}",
                    self.total_samples, expected, self.total_chunks
                )));
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<Vec<u8>, ProtocolError> {
        serde_json::to_vec(self).map_err(|e| ProtocolError::InvalidMetadata(e.to_string()))
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(|e| ProtocolError::InvalidMetadata(e.to_string()))
    }
}

/// One encoded chunk on the wire
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub chunk_index: u64,
    pub timestamp_us: u64,
    pub shape: Vec<u32>,
    pub payload: Bytes,
}

/// Messages following the metadata frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    Data(Packet),
    End,
}

#[derive(Serialize)]
struct DataBodyRef<'a> {
    chunk_index: u64,
    timestamp_us: u64,
    shape: &'a [u32],
    payload: &'a [u8],
}

#[derive(Deserialize)]
struct DataBody {
    chunk_index: u64,
    timestamp_us: u64,
    shape: Vec<u32>,
    payload: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
struct EndBody {
    end: bool,
}

fn body_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_big_endian()
        .with_fixint_encoding()
        .with_limit(MAX_FRAME_LEN as u64)
        .reject_trailing_bytes()
}

/// Serialize a message into a frame payload
pub fn encode_message(message: &Message) -> Result<Bytes, ProtocolError> {
    let (kind, body) = match message {
        Message::Data(packet) => {
            let body = DataBodyRef {
                chunk_index: packet.chunk_index,
                timestamp_us: packet.timestamp_us,
                shape: &packet.shape,
                payload: &packet.payload,
            };
            (kind::DATA, body_options().serialize(&body))
        }
        Message::End => (kind::END, body_options().serialize(&EndBody { end: true })),
    };
    let body = body.map_err(|e| ProtocolError::Malformed(e.to_string()))?;

    let mut buf = BytesMut::with_capacity(2 + body.len());
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(kind);
    buf.put_slice(&body);
    Ok(buf.freeze())
}

/// Parse a frame payload received after the metadata frame
pub fn decode_message(bytes: &[u8]) -> Result<Message, ProtocolError> {
    let (version, kind, body) = match bytes {
        [version, kind, body @ ..] => (*version, *kind, body),
        _ => {
            return Err(ProtocolError::Malformed(format!(
                "message of {} bytes has no header",
                bytes.len()
            )))
        }
    };
    if version != PROTOCOL_VERSION {
        return Err(ProtocolError::UnsupportedVersion(version));
    }

    match kind {
        kind::DATA => {
            let body: DataBody = body_options()
                .deserialize(body)
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            Ok(Message::Data(Packet {
                chunk_index: body.chunk_index,
                timestamp_us: body.timestamp_us,
                shape: body.shape,
                payload: Bytes::from(body.payload),
            }))
        }
        kind::END => {
            let body: EndBody = body_options()
                .deserialize(body)
                .map_err(|e| ProtocolError::Malformed(e.to_string()))?;
            if !body.end {
                return Err(ProtocolError::Malformed("end message without end flag".into()));
            }
            Ok(Message::End)
        }
        other => Err(ProtocolError::UnknownKind(other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet() -> Packet {
        Packet {
            chunk_index: 3,
            timestamp_us: 1_700_000_000_000_000,
            shape: vec![4],
            payload: Bytes::from_static(&[1, 2, 3, 4, 5]),
        }
    }

    #[test]
    fn test_data_message_layout() {
        let bytes = encode_message(&Message::Data(packet())).unwrap();
        assert_eq!(bytes[0], PROTOCOL_VERSION);
        assert_eq!(bytes[1], kind::DATA);
        // chunk_index as big-endian u64 right after the header
        assert_eq!(&bytes[2..10], &3u64.to_be_bytes());
        // 8 + 8 + (8 + 4) + (8 + 5)
        assert_eq!(bytes.len(), 2 + 41);

        assert_eq!(decode_message(&bytes).unwrap(), Message::Data(packet()));
    }

    #[test]
    fn test_end_message() {
        let bytes = encode_message(&Message::End).unwrap();
        assert_eq!(&bytes[..], &[PROTOCOL_VERSION, kind::END, 1]);
        assert_eq!(decode_message(&bytes).unwrap(), Message::End);

        assert!(matches!(
            decode_message(&[PROTOCOL_VERSION, kind::END, 0]),
            Err(ProtocolError::Malformed(_))
        ));
    }

    #[test]
    fn test_malformed_messages() {
        assert!(matches!(decode_message(&[]), Err(ProtocolError::Malformed(_))));
        assert_eq!(
            decode_message(&[9, kind::DATA]),
            Err(ProtocolError::UnsupportedVersion(9))
        );
        assert_eq!(
            decode_message(&[PROTOCOL_VERSION, 0x7f, 0]),
            Err(ProtocolError::UnknownKind(0x7f))
        );

        let bytes = encode_message(&Message::Data(packet())).unwrap();
        assert!(matches!(
            decode_message(&bytes[..bytes.len() - 1]),
            Err(ProtocolError::Malformed(_))
        ));

        let mut trailing = bytes.to_vec();
        trailing.push(0);
        assert!(matches!(decode_message(&trailing), Err(ProtocolError::Malformed(_))));
    }

    #[test]
    fn test_metadata_json() {
        let layout = ChunkLayout::new(16000, 1600).unwrap();
        let meta = StreamMetadata::new(16000, layout, 6, 4, 48000);
        assert!(meta.validate().is_ok());
        assert_eq!(meta.hop_size(), 14400);

        let json = meta.to_json().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&json).unwrap();
        assert_eq!(value["total_chunks"], 4);
        assert_eq!(value["overlap_size"], 1600);
        assert_eq!(StreamMetadata::from_json(&json).unwrap(), meta);
    }

    #[test]
    fn test_metadata_without_supplemental_fields() {
        let meta = StreamMetadata::from_json(
            br#"{"sample_rate":16000,"chunk_size":16000,"overlap_size":1600,"num_streams":6,"total_chunks":3}"#,
        )
        .unwrap();
        assert_eq!(meta.total_samples, 0);
        assert_eq!(meta.version, PROTOCOL_VERSION);
        assert!(meta.validate().is_ok());
    }

    #[test]
    fn test_invalid_metadata() {
        let layout = ChunkLayout::new(100, 10).unwrap();

        let mut meta = StreamMetadata::new(16000, layout, 6, 2, 180);
        assert!(meta.validate().is_ok());
        meta.total_chunks = 5;
        assert!(matches!(meta.validate(), Err(ProtocolError::InvalidMetadata(_))));

        let mut meta = StreamMetadata::new(16000, layout, 6, 0, 0);
        meta.overlap_size = 100;
        assert!(matches!(meta.validate(), Err(ProtocolError::InvalidMetadata(_))));

        let mut meta = StreamMetadata::new(0, layout, 6, 0, 0);
        assert!(meta.validate().is_err());
        meta.sample_rate = 8000;
        meta.version = 2;
        assert!(meta.validate().is_err());

        assert!(StreamMetadata::from_json(b"not json").is_err());
    }
}
