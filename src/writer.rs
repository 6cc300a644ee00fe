use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::TransportError;
use crate::events::{report, ErrorListener};
use crate::frame::{Frame, FrameCodec};


/// Serializes frames onto the write half of the stream through a bounded queue, so frames from
///  concurrent callers are never interleaved. Writes wait when the queue is full.
///
/// Closing the writer lets it write the frames that are already queued, and then shuts down the
///  write half.
pub struct FrameWriter {
    tx: Mutex<Option<mpsc::Sender<Bytes>>>,
}

impl FrameWriter {
    /// `failed` is notified if a write fails. The failure is reported to `listener` before.
    pub fn spawn<W>(write_half: W, queue_capacity: usize, listener: Arc<dyn ErrorListener>, failed: Arc<Notify>) -> (FrameWriter, JoinHandle<()>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let handle = tokio::spawn(async move {
            if let Err(e) = write_loop(write_half, rx).await {
                report(listener.as_ref(), TransportError::UnderlyingStream { reason: e.to_string() });
                failed.notify_one();
            }
        });

        (FrameWriter { tx: Mutex::new(Some(tx)) }, handle)
    }

    pub async fn write_frame(&self, frame: &Frame) -> anyhow::Result<()> {
        let tx = match self.tx.lock().await.as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(anyhow!("writer is closed")),
        };

        trace!("queueing frame {} for writing", frame.key());
        tx.send(FrameCodec::encode_wire(frame)).await
            .map_err(|_| anyhow!("writer terminated"))
    }

    pub async fn close(&self) {
        if self.tx.lock().await.take().is_some() {
            debug!("closing frame writer");
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.tx.lock().await.is_none()
    }
}

async fn write_loop<W: AsyncWrite + Unpin>(mut write_half: W, mut rx: mpsc::Receiver<Bytes>) -> std::io::Result<()> {
    while let Some(buf) = rx.recv().await {
        write_half.write_all(&buf).await?;

        // flush when the queue is drained
        while let Ok(buf) = rx.try_recv() {
            write_half.write_all(&buf).await?;
        }
        write_half.flush().await?;
    }

    debug!("all queued frames written, shutting down write half");
    write_half.shutdown().await
}
