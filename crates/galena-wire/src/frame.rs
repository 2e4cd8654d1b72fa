//! Length-prefixed framing over a byte stream.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{WireError, WireResult};

/// Size of the frame header: a big-endian `u32` payload length.
pub const FRAME_HEADER_SIZE: usize = 4;

/// Hard cap on a single frame's payload.
///
/// Large enough for any offer batch or value; anything beyond this is a
/// protocol violation, not a workload.
pub const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// One framed payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    pub fn new(payload: Bytes) -> Self {
        Self { payload }
    }

    /// Attempts to decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a complete
    /// frame; the caller reads more and retries. Consumed bytes are
    /// split off `buf` only when a whole frame is present.
    pub fn decode(buf: &mut BytesMut) -> WireResult<Option<Frame>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len > MAX_FRAME_SIZE {
            return Err(WireError::FrameTooLarge {
                got: len,
                cap: MAX_FRAME_SIZE,
            });
        }
        if buf.len() < FRAME_HEADER_SIZE + len {
            return Ok(None);
        }
        buf.advance(FRAME_HEADER_SIZE);
        let payload = buf.split_to(len).freeze();
        Ok(Some(Frame { payload }))
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(FRAME_HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.extend_from_slice(&self.payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let frame = Frame::new(Bytes::from_static(b"hello"));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_waits() {
        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert_eq!(Frame::decode(&mut buf).unwrap(), None);
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn partial_payload_waits() {
        let frame = Frame::new(Bytes::from_static(b"hello"));
        let mut full = BytesMut::new();
        frame.encode(&mut full);
        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert_eq!(Frame::decode(&mut partial).unwrap(), None);
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        Frame::new(Bytes::from_static(b"one")).encode(&mut buf);
        Frame::new(Bytes::from_static(b"two")).encode(&mut buf);
        assert_eq!(
            Frame::decode(&mut buf).unwrap().unwrap().payload,
            Bytes::from_static(b"one")
        );
        assert_eq!(
            Frame::decode(&mut buf).unwrap().unwrap().payload,
            Bytes::from_static(b"two")
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(WireError::FrameTooLarge { .. })
        ));
    }
}
