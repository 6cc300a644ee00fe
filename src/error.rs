use crate::frame::FrameKey;


/// Errors in the byte-level framing. Anything in here means that byte alignment on the stream
///  is lost, so the transport cannot continue afterwards.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {len} bytes is shorter than the {header_len} byte header")]
    TruncatedHeader { len: usize, header_len: usize },

    #[error("long form length prefix encodes {len}, which fits the short form")]
    NonMinimalLength { len: u64 },

    #[error("length prefix announces {length_of_length} length bytes")]
    LengthOfLengthTooLarge { length_of_length: usize },

    #[error("payload length {len} exceeds the configured maximum of {max}")]
    PayloadTooLarge { len: u64, max: usize },

    #[error("reassembler stopped after an earlier framing error")]
    Failed,
}


/// Everything the transport reports on its error channel. None of these terminate the process;
///  engine state tells whether the transport is still usable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    #[error("payload of frame {key} could not be decoded: {reason}")]
    MalformedPayload { key: FrameKey, reason: String },

    #[error("unsolicited reply received for {key}")]
    UnsolicitedReply { key: FrameKey },

    #[error("duplicate request received for {key}")]
    DuplicateRequest { key: FrameKey },

    #[error("request received for closed batch: {key}, minimum acceptable batch is {minimum_batch}")]
    StaleBatch { key: FrameKey, minimum_batch: u32 },

    #[error("no request handler for incoming request {key} to {destination}")]
    NoHandler { key: FrameKey, destination: String },

    #[error("timed out waiting for response from request handler: {key}")]
    HandlerTimeout { key: FrameKey },

    #[error("error handling incoming request {key}: {reason}")]
    HandlerFailed { key: FrameKey, reason: String },

    #[error("transport closed")]
    TransportClosed,

    #[error("error in underlying stream: {reason}")]
    UnderlyingStream { reason: String },
}


/// The failures a caller of `request()` can see
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    #[error("timed out waiting for response: {key}")]
    Timeout { key: FrameKey },

    #[error("transport closed before a reply arrived")]
    TransportClosed,

    #[error("invalid expiresAt: timeout_ms={timeout_ms}, max_timeout_ms={max_timeout_ms}")]
    InvalidExpiry { timeout_ms: i64, max_timeout_ms: u64 },

    #[error("underlying stream is not writeable")]
    NotWritable,

    #[error("identifier is still in use by a pending request: {key}")]
    IdentifierInUse { key: FrameKey },
}


#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BatchError {
    #[error("can't reduce batch number from current value of {current} to {requested}")]
    InvalidBatchTransition { current: u32, requested: u32 },
}
