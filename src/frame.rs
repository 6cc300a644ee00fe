use std::fmt::{Display, Formatter};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::trace;

use crate::error::FrameError;
use crate::length_prefix::{peek_length_prefix, put_length_prefix, serialized_len};


/// Correlation key of a request and its reply. The reply reuses the request's identifier
///  verbatim, so both directions are keyed the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameKey {
    pub batch: u32,
    pub id: u32,
}

impl FrameKey {
    pub fn new(batch: u32, id: u32) -> FrameKey {
        FrameKey { batch, id }
    }
}

impl Display for FrameKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "batch={} id={}", self.batch, self.id)
    }
}


#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub batch: u32,
    pub id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(batch: u32, id: u32, payload: impl Into<Bytes>) -> Frame {
        Frame {
            batch,
            id,
            payload: payload.into(),
        }
    }

    pub fn key(&self) -> FrameKey {
        FrameKey::new(self.batch, self.id)
    }
}


/// Split of a wire frame at the front of a buffer, as determined by its length prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireLayout {
    pub prefix_len: usize,
    pub payload_len: usize,
}

impl WireLayout {
    pub fn total_len(&self) -> usize {
        FrameCodec::HEADER_LEN + self.prefix_len + self.payload_len
    }
}


/// Stateless conversion between frames and bytes. There are two representations:
///
/// * the *plain* encoding is the 8 byte header followed by the payload, without a length field;
///    its extent is defined by the buffer holding it
/// * the *wire* encoding has a variable-length length prefix between header and payload, so
///    frames can be told apart on a stream
pub struct FrameCodec;

impl FrameCodec {
    pub const HEADER_LEN: usize = 2 * size_of::<u32>();

    pub fn encode(batch: u32, id: u32, payload: &[u8]) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::HEADER_LEN + payload.len());
        buf.put_u32(batch);
        buf.put_u32(id);
        buf.put_slice(payload);
        buf.freeze()
    }

    /// The payload shares the passed-in buffer
    pub fn decode(mut bytes: Bytes) -> Result<Frame, FrameError> {
        if bytes.len() < Self::HEADER_LEN {
            return Err(FrameError::TruncatedHeader { len: bytes.len(), header_len: Self::HEADER_LEN });
        }

        let batch = bytes.get_u32();
        let id = bytes.get_u32();
        Ok(Frame {
            batch,
            id,
            payload: bytes,
        })
    }

    pub fn wire_len(frame: &Frame) -> usize {
        Self::HEADER_LEN + serialized_len(frame.payload.len()) + frame.payload.len()
    }

    pub fn encode_wire(frame: &Frame) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::wire_len(frame));
        buf.put_u32(frame.batch);
        buf.put_u32(frame.id);
        put_length_prefix(&mut buf, frame.payload.len());
        buf.put_slice(&frame.payload);
        buf.freeze()
    }

    /// Determines the layout of the wire frame at the start of `buf`, or `Ok(None)` if not enough
    ///  bytes are buffered to tell.
    pub fn wire_layout(buf: &[u8], max_payload_len: usize) -> Result<Option<WireLayout>, FrameError> {
        if buf.len() <= Self::HEADER_LEN {
            return Ok(None);
        }

        let Some(prefix) = peek_length_prefix(&buf[Self::HEADER_LEN..])? else {
            return Ok(None);
        };

        if prefix.len > max_payload_len as u64 {
            return Err(FrameError::PayloadTooLarge { len: prefix.len, max: max_payload_len });
        }

        Ok(Some(WireLayout {
            prefix_len: prefix.prefix_len,
            payload_len: prefix.len as usize,
        }))
    }

    /// Splits one complete wire frame off the front of `buf`. Returns `Ok(None)` and leaves `buf`
    ///  untouched if the frame is not completely buffered yet.
    pub fn decode_wire(buf: &mut BytesMut, max_payload_len: usize) -> Result<Option<Frame>, FrameError> {
        let Some(layout) = Self::wire_layout(buf, max_payload_len)? else {
            return Ok(None);
        };

        let total_len = layout.total_len();
        if buf.len() < total_len {
            trace!("{} of {} bytes of next frame buffered", buf.len(), total_len);
            return Ok(None);
        }

        let mut frame_buf = buf.split_to(total_len);
        let batch = frame_buf.get_u32();
        let id = frame_buf.get_u32();
        frame_buf.advance(layout.prefix_len);

        Ok(Some(Frame {
            batch,
            id,
            payload: frame_buf.freeze(),
        }))
    }
}
