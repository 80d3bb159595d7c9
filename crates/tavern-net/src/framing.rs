//! Outer wire framing
//!
//! Wire format: `frame_code(1) || payload_len(4 BE) || payload`. The frame
//! code enumerates the channel's six frame types; anything else is rejected
//! as `UnknownFrame` after the offending frame has been consumed, so the
//! stream stays decodable.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame payload (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown frame code: {0}")]
    UnknownFrame(u8),
}

/// Frame codes on the wire
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameCode {
    HandshakeHello = 1,
    HandshakeAck = 2,
    Data = 3,
    Ack = 4,
    Close = 5,
    Heartbeat = 6,
}

impl TryFrom<u8> for FrameCode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::HandshakeHello),
            2 => Ok(Self::HandshakeAck),
            3 => Ok(Self::Data),
            4 => Ok(Self::Ack),
            5 => Ok(Self::Close),
            6 => Ok(Self::Heartbeat),
            other => Err(FrameError::UnknownFrame(other)),
        }
    }
}

/// A framed message
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    pub code: FrameCode,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(code: FrameCode, payload: Vec<u8>) -> Self {
        Self { code, payload }
    }

    pub fn close() -> Self {
        Self::new(FrameCode::Close, vec![])
    }

    pub fn heartbeat() -> Self {
        Self::new(FrameCode::Heartbeat, vec![])
    }

    /// Ack frame carrying the 8-byte big-endian sequence
    pub fn ack(sequence: u64) -> Self {
        Self::new(FrameCode::Ack, sequence.to_be_bytes().to_vec())
    }
}

/// Codec for the outer framing
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need code byte plus length prefix
        if src.len() < 5 {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if src.len() < 5 + length {
            return Ok(None);
        }

        let code_byte = src[0];
        src.advance(5);
        let payload = src.split_to(length).to_vec();

        // Consume before validating so an unknown code doesn't wedge the
        // stream mid-frame
        let code = FrameCode::try_from(code_byte)?;
        Ok(Some(Frame { code, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(item.payload.len()));
        }
        dst.reserve(5 + item.payload.len());
        dst.put_u8(item.code as u8);
        dst.put_u32(item.payload.len() as u32);
        dst.put_slice(&item.payload);
        Ok(())
    }
}
