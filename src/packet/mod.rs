//! The transport moves opaque payloads. Everything it needs to know about their content goes
//!  through a [PacketCodec]: telling requests from replies, the destination and expiry of a
//!  request, and how to build a reject.

use std::time::SystemTime;

use bytes::Bytes;

pub mod ilp;


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadKind {
    Request,
    Reply,
}


/// The parts of a reject the transport generates itself
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub code: [u8; 3],
    pub triggered_by: String,
    pub message: String,
    pub data: Bytes,
}

impl Rejection {
    pub const INTERNAL_ERROR: [u8; 3] = *b"T00";

    pub fn internal_error(triggered_by: impl Into<String>, message: impl Into<String>) -> Rejection {
        Rejection {
            code: Self::INTERNAL_ERROR,
            triggered_by: triggered_by.into(),
            message: message.into(),
            data: Bytes::new(),
        }
    }
}


pub trait PacketCodec: Send + Sync + 'static {
    type Request: Send + Sync + 'static;
    type Reply: Send + Sync + 'static;

    /// `None` if the payload is neither a request nor a reply
    fn classify(&self, payload: &[u8]) -> Option<PayloadKind>;

    fn encode_request(&self, request: &Self::Request) -> Bytes;
    fn decode_request(&self, payload: &[u8]) -> anyhow::Result<Self::Request>;

    fn encode_reply(&self, reply: &Self::Reply) -> Bytes;
    fn decode_reply(&self, payload: &[u8]) -> anyhow::Result<Self::Reply>;

    fn destination<'a>(&self, request: &'a Self::Request) -> &'a str;
    fn expires_at(&self, request: &Self::Request) -> SystemTime;

    fn reject(&self, rejection: Rejection) -> Self::Reply;
}
