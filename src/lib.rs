//! Multiplexed request / reply transport for ILP packets over a single reliable byte stream
//!  (e.g. a WebSocket or TCP connection). Both ends can send requests at any time, and replies are
//!  matched to requests by a frame key.
//!
//! Every frame on the wire looks like this:
//!
//! ```ascii
//! 0:  batch (u32 BE)
//! 4:  identifier (u32 BE)
//! 8:  payload length: OER length prefix
//!       short form: 0x00..0x7F is the length itself
//!       long form:  0x80 | N, followed by the length in N bytes BE
//! *:  payload
//! ```
//!
//! A reply carries the batch and identifier of its request. The batch is the connection epoch:
//!  after a reconnect one side moves to a higher batch, and requests of older batches are
//!  rejected once a cutover period has passed.

pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod frame;
pub mod inbound_tracker;
pub mod length_prefix;
pub mod packet;
pub mod reassembler;
pub mod request_registry;
pub mod router;
pub mod writer;

#[cfg(test)]
mod test_util;

pub use config::TransportConfig;
pub use engine::{EngineState, TransportEngine};
pub use error::{BatchError, FrameError, RequestError, TransportError};
pub use events::ErrorListener;
pub use frame::{Frame, FrameKey};
pub use packet::{PacketCodec, PayloadKind, Rejection};
pub use router::{RequestHandler, RequestMeta};


#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
