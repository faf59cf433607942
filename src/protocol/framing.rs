//! Length-prefixed framing over a byte stream
//!
//! `[length: u32 BE][payload]`. Reads either return a whole frame or fail;
//! partial frames never surface.

use bytes::{BufMut, Bytes, BytesMut};
use std::io::{self, ErrorKind, Read, Write};

use crate::constants::MAX_FRAME_LEN;
use crate::error::{Error, NetworkError, ProtocolError};

/// Size of the length prefix
pub const FRAME_HEADER_LEN: usize = 4;

/// Write one frame and return the number of bytes put on the wire
pub fn write_frame<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<usize> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds {}", payload.len(), MAX_FRAME_LEN),
        ));
    }

    // Single write so the prefix and payload leave in one segment
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    writer.write_all(&buf)?;
    Ok(buf.len())
}

/// Read exactly `n` bytes or fail
pub fn receive_exact<R: Read>(reader: &mut R, n: usize) -> Result<Vec<u8>, NetworkError> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;
    while filled < n {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(NetworkError::ConnectionClosed),
            Ok(read) => filled += read,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(NetworkError::from_read(e)),
        }
    }
    Ok(buf)
}

/// Read one frame payload
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Bytes, Error> {
    let header = receive_exact(reader, FRAME_HEADER_LEN)?;
    let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len).into());
    }
    Ok(Bytes::from(receive_exact(reader, len)?))
}
