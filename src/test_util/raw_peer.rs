use std::collections::VecDeque;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};

use crate::frame::{Frame, FrameCodec};
use crate::reassembler::StreamReassembler;


/// The remote end of a connection, reading and writing individual frames
pub struct RawPeer {
    stream: DuplexStream,
    reassembler: StreamReassembler,
    received: VecDeque<Frame>,
}

impl RawPeer {
    pub fn new(stream: DuplexStream) -> RawPeer {
        RawPeer {
            stream,
            reassembler: StreamReassembler::new(16 * 1024 * 1024),
            received: VecDeque::new(),
        }
    }

    pub async fn send_frame(&mut self, frame: &Frame) {
        self.send_raw(&FrameCodec::encode_wire(frame)).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    /// `None` at end of stream
    pub async fn read_frame(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.received.pop_front() {
                return Some(frame);
            }

            let n = self.stream.read(&mut buf).await.unwrap();
            if n == 0 {
                return None;
            }
            let mut frames = Vec::new();
            self.reassembler.on_chunk(&buf[..n], &mut frames).unwrap();
            self.received.extend(frames);
        }
    }

    pub async fn expect_frame(&mut self) -> Frame {
        match tokio::time::timeout(Duration::from_secs(10), self.read_frame()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => panic!("end of stream while waiting for a frame"),
            Err(_) => panic!("timed out waiting for a frame"),
        }
    }

    pub async fn expect_no_frame(&mut self, within: Duration) {
        if let Ok(Some(frame)) = tokio::time::timeout(within, self.read_frame()).await {
            panic!("unexpected frame {:?}", frame);
        }
    }
}
