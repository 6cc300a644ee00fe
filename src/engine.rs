use std::sync::{Arc, Weak};
use std::time::SystemTime;

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tokio::select;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, span, trace, Instrument, Level};

use crate::batch::BatchEpochManager;
use crate::config::TransportConfig;
use crate::error::{BatchError, RequestError, TransportError};
use crate::events::{report, ErrorListener};
use crate::frame::{Frame, FrameKey};
use crate::inbound_tracker::InboundDedupTracker;
use crate::packet::{PacketCodec, PayloadKind, Rejection};
use crate::reassembler::StreamReassembler;
use crate::request_registry::RequestRegistry;
use crate::router::{HandlerRouter, RequestHandler, RequestMeta, SharedHandler};
use crate::writer::FrameWriter;

pub const ERROR_CHANNEL_CAPACITY: usize = 1024;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Open,
    /// No new outgoing requests, waiting for pending ones to complete. Incoming requests are
    ///  still served.
    Closing,
    Closed,
}


struct EngineInner<C: PacketCodec> {
    codec: C,
    config: TransportConfig,
    state: watch::Sender<EngineState>,
    batches: BatchEpochManager,
    outgoing: RequestRegistry<C::Reply>,
    incoming: InboundDedupTracker,
    router: HandlerRouter<C::Request, C::Reply>,
    writer: FrameWriter,
    writer_failed: Arc<Notify>,
    reader: Mutex<Option<JoinHandle<()>>>,
    listener: Arc<dyn ErrorListener>,
}


/// A request / reply transport over a single byte stream. Both sides can send requests, and any
///  number of requests can be in flight in either direction.
///
/// The engine runs its own tasks for reading, dispatching and writing, so it must be created
///  inside a tokio runtime. It is a cheap handle: clones refer to the same transport.
pub struct TransportEngine<C: PacketCodec> {
    inner: Arc<EngineInner<C>>,
}

impl<C: PacketCodec> Clone for TransportEngine<C> {
    fn clone(&self) -> Self {
        TransportEngine {
            inner: self.inner.clone(),
        }
    }
}

impl<C: PacketCodec> TransportEngine<C> {
    pub fn new<S>(stream: S, codec: C, config: TransportConfig, listener: Arc<dyn ErrorListener>) -> anyhow::Result<TransportEngine<C>>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        config.validate()?;

        let (read_half, write_half) = tokio::io::split(stream);

        let writer_failed = Arc::new(Notify::new());
        let (writer, _) = FrameWriter::spawn(write_half, config.write_queue_capacity, listener.clone(), writer_failed.clone());

        let (frames_tx, frames_rx) = mpsc::channel(config.frame_queue_capacity);
        let reader = tokio::spawn(read_loop(
            read_half,
            frames_tx,
            config.max_payload_len,
            config.read_chunk_size,
            listener.clone(),
        ));

        let (state, _) = watch::channel(EngineState::Open);

        info!("starting transport at batch {}", config.initial_batch);
        let engine = TransportEngine {
            inner: Arc::new(EngineInner {
                codec,
                state,
                batches: BatchEpochManager::new(config.initial_batch, config.batch_cutover_timeout),
                outgoing: RequestRegistry::new(config.max_timeout),
                incoming: InboundDedupTracker::new(config.max_timeout, listener.clone()),
                router: HandlerRouter::new(),
                writer,
                writer_failed,
                reader: Mutex::new(Some(reader)),
                listener,
                config,
            }),
        };

        tokio::spawn(dispatch_loop(Arc::downgrade(&engine.inner), frames_rx));
        Ok(engine)
    }

    /// Creates an engine that reports errors to a channel, and returns the channel's receiver
    pub fn with_error_channel<S>(stream: S, codec: C, config: TransportConfig) -> anyhow::Result<(TransportEngine<C>, mpsc::Receiver<TransportError>)>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(ERROR_CHANNEL_CAPACITY);
        let engine = Self::new(stream, codec, config, Arc::new(tx))?;
        Ok((engine, rx))
    }

    pub fn state(&self) -> EngineState {
        *self.inner.state.borrow()
    }

    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == EngineState::Closed).await;
    }

    pub fn router(&self) -> &HandlerRouter<C::Request, C::Reply> {
        &self.inner.router
    }

    pub async fn register_handler(&self, address: impl Into<String>, handler: impl RequestHandler<C::Request, C::Reply>) -> Option<SharedHandler<C::Request, C::Reply>> {
        self.inner.router.register_handler(address, handler).await
    }

    pub async fn remove_handler(&self, address: &str) -> Option<SharedHandler<C::Request, C::Reply>> {
        self.inner.router.remove_handler(address).await
    }

    pub async fn set_default_handler(&self, handler: impl RequestHandler<C::Request, C::Reply>) -> Option<SharedHandler<C::Request, C::Reply>> {
        self.inner.router.set_default_handler(handler).await
    }

    pub async fn clear_default_handler(&self) -> Option<SharedHandler<C::Request, C::Reply>> {
        self.inner.router.clear_default_handler().await
    }

    pub async fn batch(&self) -> u32 {
        self.inner.batches.current().await
    }

    /// Moves outgoing requests to a new batch, e.g. after reconnecting. Requests for the previous
    ///  batch are still accepted until the cutover timeout expires.
    pub async fn set_batch(&self, batch: u32) -> Result<(), BatchError> {
        self.inner.batches.advance(batch).await
    }

    pub async fn pending_requests(&self) -> usize {
        self.inner.outgoing.len().await
    }

    /// Sends a request and waits for the reply
    pub async fn request(&self, request: &C::Request) -> Result<C::Reply, RequestError> {
        let payload = self.inner.codec.encode_request(request);
        let expires_at = self.inner.codec.expires_at(request);
        self.request_encoded(payload, expires_at).await
    }

    /// Sends a request that was encoded by the caller
    pub async fn request_encoded(&self, payload: Bytes, expires_at: SystemTime) -> Result<C::Reply, RequestError> {
        if self.state() != EngineState::Open {
            return Err(RequestError::NotWritable);
        }
        self.inner.outgoing.timeout_for(expires_at)?;

        let batch = self.inner.batches.current().await;
        let id = self.inner.batches.next_identifier(batch).await;
        let frame = Frame::new(batch, id, payload);
        let key = frame.key();

        let reply = self.inner.outgoing.register(key, expires_at).await?;

        if let Err(e) = self.inner.writer.write_frame(&frame).await {
            debug!("error sending request {}: {}", key, e);
            self.inner.outgoing.cancel(key).await;
            return Err(RequestError::TransportClosed);
        }
        if self.state() == EngineState::Closed {
            // shut down while registering, so the request was not cancelled with the others
            self.inner.outgoing.cancel(key).await;
        }

        reply.await
    }

    /// Stops sending requests, waits for pending requests in both directions to complete and
    ///  closes the transport
    pub async fn close(&self) {
        let started = self.inner.state.send_if_modified(|state| {
            if *state == EngineState::Open {
                *state = EngineState::Closing;
                true
            }
            else {
                false
            }
        });
        if started {
            info!("closing transport, {} requests pending", self.pending_requests().await);
        }

        let drained = async {
            self.inner.outgoing.wait_drained().await;
            self.inner.incoming.wait_drained().await;
        };
        select! {
            _ = drained => {}
            _ = self.closed() => {}
        }
        self.shutdown().await;
    }

    async fn shutdown(&self) {
        if self.inner.state.send_replace(EngineState::Closed) == EngineState::Closed {
            return;
        }

        self.inner.batches.cancel_cutovers().await;
        let num_cancelled = self.inner.outgoing.cancel_all().await;
        self.inner.incoming.cancel_all().await;
        self.inner.writer.close().await;
        if let Some(reader) = self.inner.reader.lock().await.take() {
            reader.abort();
        }

        debug!("transport shut down, failed {} pending requests", num_cancelled);
        self.report(TransportError::TransportClosed);
    }

    fn report(&self, error: TransportError) {
        report(self.inner.listener.as_ref(), error);
    }

    /// Returns an error only for problems that make the transport unusable
    async fn on_frame(&self, frame: Frame) -> Result<(), TransportError> {
        trace!("dispatching frame with {} payload bytes", frame.payload.len());

        match self.inner.codec.classify(&frame.payload) {
            Some(PayloadKind::Request) => self.on_request(frame).await,
            Some(PayloadKind::Reply) => self.on_reply(frame).await,
            None => Err(TransportError::MalformedPayload {
                key: frame.key(),
                reason: "payload is neither a request nor a reply".to_string(),
            }),
        }
    }

    async fn on_reply(&self, frame: Frame) -> Result<(), TransportError> {
        let key = frame.key();
        let reply = self.inner.codec.decode_reply(&frame.payload)
            .map_err(|e| TransportError::MalformedPayload { key, reason: e.to_string() })?;

        if !self.inner.outgoing.resolve(key, reply).await {
            self.report(TransportError::UnsolicitedReply { key });
        }
        Ok(())
    }

    async fn on_request(&self, frame: Frame) -> Result<(), TransportError> {
        let key = frame.key();

        if !self.inner.batches.is_acceptable(frame.batch).await {
            let minimum_batch = self.inner.batches.minimum_acceptable().await;
            self.report(TransportError::StaleBatch { key, minimum_batch });
            return Ok(());
        }

        let request = self.inner.codec.decode_request(&frame.payload)
            .map_err(|e| TransportError::MalformedPayload { key, reason: e.to_string() })?;

        let expires_at = self.inner.codec.expires_at(&request);
        if !self.inner.incoming.begin(key, expires_at).await {
            self.report(TransportError::DuplicateRequest { key });
            return Ok(());
        }

        if frame.batch > self.inner.batches.current().await {
            debug!("peer moved to batch {}, following", frame.batch);
            if let Err(e) = self.inner.batches.advance(frame.batch).await {
                debug!("batch was moved concurrently: {}", e);
            }
        }

        let destination = self.inner.codec.destination(&request);
        let Some(handler) = self.inner.router.resolve(destination).await else {
            let destination = destination.to_string();
            self.report(TransportError::NoHandler { key, destination });
            if self.inner.incoming.end(key).await {
                self.write_reply(key, self.internal_error_reject()).await;
            }
            self.inner.incoming.finish(key).await;
            return Ok(());
        };

        let engine = self.clone();
        let span = span!(Level::TRACE, "handler", %key);
        tokio::spawn(async move {
            let result = handler.handle(request, RequestMeta { key }).await;

            if !engine.inner.incoming.end(key).await {
                debug!("handler completed after the request's deadline, dropping its result");
                return;
            }

            let payload = match result {
                Ok(reply) => engine.inner.codec.encode_reply(&reply),
                Err(e) => {
                    engine.report(TransportError::HandlerFailed { key, reason: e.to_string() });
                    engine.internal_error_reject()
                }
            };
            engine.write_reply(key, payload).await;
            engine.inner.incoming.finish(key).await;
        }.instrument(span));

        Ok(())
    }

    fn internal_error_reject(&self) -> Bytes {
        let rejection = Rejection::internal_error(self.inner.config.triggered_by(), "");
        self.inner.codec.encode_reply(&self.inner.codec.reject(rejection))
    }

    async fn write_reply(&self, key: FrameKey, payload: Bytes) {
        let frame = Frame::new(key.batch, key.id, payload);
        if let Err(e) = self.inner.writer.write_frame(&frame).await {
            debug!("error sending reply for {}: {}", key, e);
        }
    }
}

impl<C: PacketCodec> Drop for EngineInner<C> {
    fn drop(&mut self) {
        // the writer task shuts down the write half once its queue sender is dropped with us
        if let Some(reader) = self.reader.get_mut().take() {
            reader.abort();
        }
        if *self.state.borrow() != EngineState::Closed {
            debug!("all transport handles dropped without closing");
        }
    }
}


/// Holds the engine only while a frame is processed, so dropping all handles stops the transport
async fn dispatch_loop<C: PacketCodec>(inner: Weak<EngineInner<C>>, mut frames: mpsc::Receiver<Frame>) {
    let Some(writer_failed) = inner.upgrade().map(|inner| inner.writer_failed.clone()) else {
        return;
    };

    loop {
        let frame = select! {
            frame = frames.recv() => frame,
            _ = writer_failed.notified() => None,
        };
        let Some(engine) = inner.upgrade().map(|inner| TransportEngine { inner }) else {
            return;
        };
        let Some(frame) = frame else {
            engine.shutdown().await;
            return;
        };
        if engine.state() == EngineState::Closed {
            return;
        }

        let span = span!(Level::TRACE, "dispatch", batch = frame.batch, id = frame.id);
        if let Err(e) = engine.on_frame(frame).instrument(span).await {
            engine.report(e);
            engine.shutdown().await;
            return;
        }
    }
}


async fn read_loop<R>(mut read_half: R, mut frames: mpsc::Sender<Frame>, max_payload_len: usize, chunk_size: usize, listener: Arc<dyn ErrorListener>)
where
    R: AsyncRead + Unpin,
{
    let mut reassembler = StreamReassembler::new(max_payload_len);
    let mut chunk = vec![0u8; chunk_size];

    loop {
        // frames held back by the reassembler have to go out before reading anything else
        while reassembler.has_backlog() {
            match frames.reserve().await {
                Ok(permit) => drop(permit),
                Err(_) => {
                    debug!("frame dispatcher terminated, stopping read loop");
                    return;
                }
            }
            reassembler.resume(&mut frames);
        }

        let num_read = match read_half.read(&mut chunk).await {
            Ok(0) => {
                info!("end of stream");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                report(listener.as_ref(), TransportError::UnderlyingStream { reason: e.to_string() });
                break;
            }
        };
        trace!("read {} bytes", num_read);

        if let Err(e) = reassembler.on_chunk(&chunk[..num_read], &mut frames) {
            report(listener.as_ref(), TransportError::MalformedFrame(e));
            break;
        }
    }

    if reassembler.buffered_len() > 0 {
        debug!("discarding {} bytes of an incomplete frame", reassembler.buffered_len());
    }
    for frame in reassembler.take_backlog() {
        if frames.send(frame).await.is_err() {
            break;
        }
    }
}
