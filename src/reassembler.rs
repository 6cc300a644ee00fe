use std::collections::VecDeque;

use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use crate::error::FrameError;
use crate::frame::{Frame, FrameCodec};


pub enum Offer {
    Taken,
    /// The consumer can't take the frame right now and hands it back
    NotReady(Frame),
}

/// Consumer side of the reassembler. Offering never blocks: a consumer that is not ready hands the
///  frame back, and the reassembler holds it (and everything after it) until [StreamReassembler::resume].
pub trait FrameSink {
    fn offer(&mut self, frame: Frame) -> Offer;
}

impl FrameSink for Vec<Frame> {
    fn offer(&mut self, frame: Frame) -> Offer {
        self.push(frame);
        Offer::Taken
    }
}

impl FrameSink for mpsc::Sender<Frame> {
    fn offer(&mut self, frame: Frame) -> Offer {
        match self.try_send(frame) {
            Ok(()) => Offer::Taken,
            Err(TrySendError::Full(frame)) => Offer::NotReady(frame),
            Err(TrySendError::Closed(frame)) => Offer::NotReady(frame),
        }
    }
}


/// Turns an arbitrarily chunked byte stream back into the sequence of frames that was written into
///  it. This is sans-io: the owner reads from the stream and feeds the chunks in.
///
/// Unconsumed bytes are kept in a single buffer, and complete frames are split off its front
///  without copying the payload.
pub struct StreamReassembler {
    buf: BytesMut,
    overflow: VecDeque<Frame>,
    max_payload_len: usize,
    failed: bool,
}

impl StreamReassembler {
    pub fn new(max_payload_len: usize) -> StreamReassembler {
        StreamReassembler {
            buf: BytesMut::new(),
            overflow: VecDeque::new(),
            max_payload_len,
            failed: false,
        }
    }

    /// Appends a chunk and emits every frame that is complete afterwards, in order.
    ///
    /// A framing error is returned once and leaves the reassembler failed: there is no way to
    ///  regain the frame alignment, so all further chunks are refused. Frames decoded before the
    ///  error stay in the backlog.
    pub fn on_chunk(&mut self, chunk: &[u8], sink: &mut impl FrameSink) -> Result<(), FrameError> {
        if self.failed {
            return Err(FrameError::Failed);
        }

        self.buf.extend_from_slice(chunk);
        loop {
            match FrameCodec::decode_wire(&mut self.buf, self.max_payload_len) {
                Ok(Some(frame)) => {
                    trace!("reassembled frame {}: {} payload bytes", frame.key(), frame.payload.len());
                    self.emit(frame, sink);
                }
                Ok(None) => return Ok(()),
                Err(e) => {
                    debug!("framing error with {} bytes buffered: {}", self.buf.len(), e);
                    self.failed = true;
                    self.buf.clear();
                    return Err(e);
                }
            }
        }
    }

    fn emit(&mut self, frame: Frame, sink: &mut impl FrameSink) {
        if !self.overflow.is_empty() {
            self.overflow.push_back(frame);
            return;
        }

        if let Offer::NotReady(frame) = sink.offer(frame) {
            trace!("consumer not ready, holding back frame {}", frame.key());
            self.overflow.push_back(frame);
        }
    }

    /// Offers held-back frames to the sink in arrival order. Returns `true` if the backlog is
    ///  empty afterwards.
    pub fn resume(&mut self, sink: &mut impl FrameSink) -> bool {
        while let Some(frame) = self.overflow.pop_front() {
            if let Offer::NotReady(frame) = sink.offer(frame) {
                self.overflow.push_front(frame);
                return false;
            }
        }
        true
    }

    pub fn has_backlog(&self) -> bool {
        !self.overflow.is_empty()
    }

    pub fn backlog_len(&self) -> usize {
        self.overflow.len()
    }

    /// Hands out all held-back frames, e.g. to flush them with a blocking send at end of stream
    pub fn take_backlog(&mut self) -> VecDeque<Frame> {
        std::mem::take(&mut self.overflow)
    }

    /// Number of bytes of an incomplete frame that are waiting for more data
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_failed(&self) -> bool {
        self.failed
    }
}
