//! Helpers for testing the transport against a peer that is scripted at the frame level

pub mod raw_peer;

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;

use crate::packet::ilp::{IlpFulfill, IlpPrepare, IlpReply};


/// truncated to millisecond precision so it survives encoding unchanged
pub fn expiring_in(duration: Duration) -> SystemTime {
    let millis = (SystemTime::now() + duration)
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis();
    UNIX_EPOCH + Duration::from_millis(millis as u64)
}

pub fn prepare(destination: &str, expires_in: Duration) -> IlpPrepare {
    IlpPrepare {
        amount: 100,
        expires_at: expiring_in(expires_in),
        execution_condition: [7u8; 32],
        destination: destination.to_string(),
        data: Bytes::from_static(b"request data"),
    }
}

pub fn fulfill(data: &'static [u8]) -> IlpReply {
    IlpReply::Fulfill(IlpFulfill {
        fulfillment: [9u8; 32],
        data: Bytes::from_static(data),
    })
}
