use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{Error, Result};
use crate::pool::{BufferPool, PooledBuf};

/// Frame tags in their canonical, initiator-direction form.
///
/// The wire reserves two tags per event, one per direction: the endpoint
/// that did not open the stream decrements the encoded header by one, so
/// the receiver learns who the original initiator was from tag parity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u64)]
pub enum Tag {
    /// Open a stream; payload is an optional UTF-8 name
    NewStream = 0,
    /// Data bytes
    Message = 2,
    /// Graceful half-close, empty payload
    Close = 4,
    /// Unilateral termination, empty payload
    Reset = 6,
}

/// Identity of one logical stream within a session.
///
/// `num` is chosen by the endpoint that opened the stream; `initiator`
/// records whether that endpoint was us. Both endpoints number their own
/// streams independently, so the flag is part of the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId {
    pub num: u64,
    pub initiator: bool,
}

impl StreamId {
    /// Wire header for a frame of the given kind sent by this endpoint.
    pub fn header(&self, tag: Tag) -> u64 {
        let header = self.num << 3 | tag as u64;
        if self.initiator {
            header
        } else {
            header - 1
        }
    }
}

/// A decoded frame event, from the receiver's perspective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    NewStream,
    Message,
    Close,
    Reset,
}

/// Split a received header into the locally-keyed stream id and frame kind.
///
/// Odd tags are the sender's decremented encoding: the sender was not the
/// initiator, so the stream is one this endpoint opened.
pub fn split_header(header: u64) -> Result<(StreamId, FrameKind)> {
    match header & 0x7 {
        0 => Ok((
            StreamId {
                num: header >> 3,
                initiator: false,
            },
            FrameKind::NewStream,
        )),
        7 => Err(Error::Protocol(format!(
            "reserved tag 7 in frame header {header:#x}"
        ))),
        tag => {
            let initiator = tag % 2 == 1;
            let header = if initiator { header + 1 } else { header };
            let kind = match header & 0x7 {
                2 => FrameKind::Message,
                4 => FrameKind::Close,
                6 => FrameKind::Reset,
                _ => unreachable!("normalized tag is even and non-zero"),
            };
            Ok((
                StreamId {
                    num: header >> 3,
                    initiator,
                },
                kind,
            ))
        }
    }
}

const VARINT_MORE: u8 = 0x80;
const VARINT_MASK: u8 = 0x7f;

/// Maximum encoded length of a u64 varint.
const MAX_VARINT_LEN: usize = 10;

/// Append `value` as an unsigned LEB128 varint.
fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & VARINT_MASK as u64) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | VARINT_MORE);
    }
}

/// Read an unsigned LEB128 varint, rejecting encodings that overflow u64.
async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    loop {
        let byte = reader.read_u8().await?;
        if shift == 63 && byte > 1 {
            return Err(Error::Protocol("varint overflows u64".into()));
        }
        value |= u64::from(byte & VARINT_MASK) << shift;
        if byte & VARINT_MORE == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift as usize >= MAX_VARINT_LEN * 7 {
            return Err(Error::Protocol("varint longer than 10 bytes".into()));
        }
    }
}

/// Encode one frame: `varint(header) ‖ varint(len) ‖ payload`.
pub fn encode_frame(header: u64, payload: &[u8]) -> BytesMut {
    let mut buf = BytesMut::with_capacity(2 * MAX_VARINT_LEN + payload.len());
    put_varint(&mut buf, header);
    put_varint(&mut buf, payload.len() as u64);
    buf.extend_from_slice(payload);
    buf
}

/// Read one frame from the transport.
///
/// The payload lands in a pool buffer so ownership can be handed through a
/// stream's inbound queue without copying. Lengths above `max_len` are a
/// protocol error; a truncated frame surfaces as `Io`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    pool: &BufferPool,
    max_len: usize,
) -> Result<(u64, PooledBuf)> {
    let header = read_varint(reader).await?;
    let len = read_varint(reader).await?;
    if len > max_len as u64 {
        return Err(Error::MessageTooLarge(len as usize, max_len));
    }
    let mut payload = pool.acquire(len as usize);
    reader.read_exact(&mut payload).await?;
    Ok((header, payload))
}
