// Wire format for framing messages on the network.
//
// Every frame is `version(u8) | size(u32 LE) | stream_id(varint) | payload`.
// The five header bytes are fixed-size; `size` counts everything after them,
// so a reader can pull the header, then exactly `size` more bytes.
use bytes::{Buf, BufMut, Bytes, BytesMut};

mod message;
pub use message::{
    Ack, AckStatus, Delivery, GapType, GoodbyeCode, Message, MessageType, UnsubscribeReason,
};

/// Newest protocol version this build speaks.
pub const CURRENT_VERSION: u8 = 1;
/// Oldest version still accepted on decode.
pub const MIN_ACCEPTED_VERSION: u8 = 1;

/// Hard safety cap for a single frame body. A peer advertising a larger size
/// is treated as malformed before any allocation happens.
pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

/// On-wire identifier of a logical stream within one connection.
pub type StreamId = u64;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unsupported version {0}")]
    UnsupportedVersion(u8),
    #[error("frame too large ({0} bytes)")]
    FrameTooLarge(usize),
    #[error("incomplete frame")]
    Incomplete,
    #[error("varint overflows u64")]
    BadVarint,
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
    #[error("malformed {0} message")]
    Malformed(&'static str),
}

/// Fixed five-byte frame header.
///
/// ```
/// use petrel_wire::FrameHeader;
///
/// let header = FrameHeader::new(42);
/// let mut buf = [0u8; FrameHeader::LEN];
/// header.encode_into(&mut buf);
/// assert_eq!(FrameHeader::decode(&buf).expect("header"), header);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub size: u32,
}

impl FrameHeader {
    pub const LEN: usize = 5;

    // Create a header with the current protocol version.
    pub fn new(size: u32) -> Self {
        Self {
            version: CURRENT_VERSION,
            size,
        }
    }

    pub fn encode_into(&self, buf: &mut [u8; Self::LEN]) {
        buf[0] = self.version;
        buf[1..5].copy_from_slice(&self.size.to_le_bytes());
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        // Validate the version before trusting the size.
        if buf.len() < Self::LEN {
            return Err(Error::Incomplete);
        }
        let version = buf[0];
        if !(MIN_ACCEPTED_VERSION..=CURRENT_VERSION).contains(&version) {
            return Err(Error::UnsupportedVersion(version));
        }
        let size = u32::from_le_bytes(buf[1..5].try_into().expect("4 size bytes"));
        if size as usize > MAX_FRAME_BYTES {
            return Err(Error::FrameTooLarge(size as usize));
        }
        Ok(Self { version, size })
    }
}

/// Encode `stream_id` and a message into one ready-to-write frame.
pub fn encode_frame(stream_id: StreamId, message: &Message) -> Result<Bytes> {
    let mut body = BytesMut::with_capacity(64);
    put_varint(&mut body, stream_id);
    message.encode_into(&mut body)?;
    if body.len() > MAX_FRAME_BYTES {
        return Err(Error::FrameTooLarge(body.len()));
    }
    let mut frame = BytesMut::with_capacity(FrameHeader::LEN + body.len());
    let mut header = [0u8; FrameHeader::LEN];
    FrameHeader::new(body.len() as u32).encode_into(&mut header);
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&body);
    Ok(frame.freeze())
}

/// Split a frame body into its stream id and decoded message.
pub fn decode_frame_body(mut body: Bytes) -> Result<(StreamId, Message)> {
    let stream_id = get_varint(&mut body)?;
    let message = Message::decode(&mut body)?;
    Ok((stream_id, message))
}

// LEB128 unsigned varint, at most ten bytes for a u64.
pub(crate) fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

pub(crate) fn get_varint(buf: &mut Bytes) -> Result<u64> {
    let mut value: u64 = 0;
    let mut shift = 0u32;
    loop {
        if !buf.has_remaining() {
            return Err(Error::Incomplete);
        }
        let byte = buf.get_u8();
        if shift == 63 && byte > 1 {
            return Err(Error::BadVarint);
        }
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
        if shift > 63 {
            return Err(Error::BadVarint);
        }
    }
}

pub(crate) fn put_bytes(buf: &mut BytesMut, value: &[u8]) {
    put_varint(buf, value.len() as u64);
    buf.extend_from_slice(value);
}

pub(crate) fn get_bytes(buf: &mut Bytes) -> Result<Bytes> {
    let len = get_varint(buf)? as usize;
    if buf.remaining() < len {
        return Err(Error::Incomplete);
    }
    Ok(buf.split_to(len))
}

pub(crate) fn put_string(buf: &mut BytesMut, value: &str) {
    put_bytes(buf, value.as_bytes());
}

pub(crate) fn get_string(buf: &mut Bytes) -> Result<String> {
    let bytes = get_bytes(buf)?;
    String::from_utf8(bytes.to_vec()).map_err(|_| Error::Malformed("utf-8 string"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let header = FrameHeader::new(12345);
        let mut buf = [0u8; FrameHeader::LEN];
        header.encode_into(&mut buf);
        let decoded = FrameHeader::decode(&buf).expect("decode");
        assert_eq!(decoded, header);
    }

    #[test]
    fn header_rejects_future_version() {
        let mut buf = [0u8; FrameHeader::LEN];
        FrameHeader::new(4).encode_into(&mut buf);
        buf[0] = CURRENT_VERSION + 1;
        assert_eq!(
            FrameHeader::decode(&buf),
            Err(Error::UnsupportedVersion(CURRENT_VERSION + 1))
        );
    }

    #[test]
    fn header_rejects_version_zero() {
        let mut buf = [0u8; FrameHeader::LEN];
        FrameHeader::new(4).encode_into(&mut buf);
        buf[0] = 0;
        assert_eq!(FrameHeader::decode(&buf), Err(Error::UnsupportedVersion(0)));
    }

    #[test]
    fn header_rejects_oversized_frame() {
        let mut buf = [0u8; FrameHeader::LEN];
        buf[0] = CURRENT_VERSION;
        buf[1..5].copy_from_slice(&(u32::MAX).to_le_bytes());
        assert!(matches!(
            FrameHeader::decode(&buf),
            Err(Error::FrameTooLarge(_))
        ));
    }

    #[test]
    fn header_rejects_short_input() {
        assert_eq!(FrameHeader::decode(&[1, 2]), Err(Error::Incomplete));
    }

    #[test]
    fn varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            let mut bytes = buf.freeze();
            assert_eq!(get_varint(&mut bytes).expect("varint"), value);
            assert!(bytes.is_empty());
        }
    }

    #[test]
    fn varint_rejects_overflow() {
        // Eleven continuation bytes cannot encode a u64.
        let mut bytes = Bytes::from_static(&[0xff; 11]);
        assert_eq!(get_varint(&mut bytes), Err(Error::BadVarint));
    }

    #[test]
    fn frame_round_trip_carries_stream_id() {
        let message = Message::Ping {
            tenant: petrel_common::TenantId::GUEST,
            cookie: Bytes::from_static(b"abc"),
        };
        let frame = encode_frame(9001, &message).expect("encode");
        let header = FrameHeader::decode(&frame).expect("header");
        let body = frame.slice(FrameHeader::LEN..);
        assert_eq!(body.len(), header.size as usize);
        let (stream_id, decoded) = decode_frame_body(body).expect("decode");
        assert_eq!(stream_id, 9001);
        assert_eq!(decoded, message);
    }
}
