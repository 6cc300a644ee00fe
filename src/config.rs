use std::time::Duration;

use anyhow::bail;


pub struct TransportConfig {
    /// The batch that outgoing requests start with. Applications that reconnect after losing a
    ///  stream should pass a higher batch than the previous connection used, so identifiers of
    ///  old and new requests can not be confused.
    pub initial_batch: u32,

    /// After moving to a new batch, requests that arrive for older batches are still accepted for
    ///  this long. After that, they are rejected as stale.
    pub batch_cutover_timeout: Duration,

    /// Upper bound for the lifetime of a request, both outgoing and incoming. Outgoing requests
    ///  that expire further in the future are refused.
    pub max_timeout: Duration,

    /// Frames announcing a longer payload are treated as a protocol violation, bounding the memory
    ///  a peer can make us allocate
    pub max_payload_len: usize,

    pub read_chunk_size: usize,

    /// Maximum number of reassembled frames waiting to be dispatched before the read loop stops
    ///  reading from the stream
    pub frame_queue_capacity: usize,

    /// Maximum number of frames waiting to be written to the stream
    pub write_queue_capacity: usize,

    /// Our own address, used as `triggered_by` in rejects the transport generates. Falls back to
    ///  [DEFAULT_TRIGGERED_BY] if not set.
    pub self_address: Option<String>,
}

pub const DEFAULT_TRIGGERED_BY: &str = "peer";

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig {
            initial_batch: 1,
            batch_cutover_timeout: Duration::from_secs(30),
            max_timeout: Duration::from_secs(5 * 60),
            max_payload_len: 16 * 1024 * 1024,
            read_chunk_size: 64 * 1024,
            frame_queue_capacity: 64,
            write_queue_capacity: 1024,
            self_address: None,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_timeout.is_zero() {
            bail!("max timeout must be positive");
        }
        if self.read_chunk_size == 0 {
            bail!("read chunk size must be positive");
        }
        if self.frame_queue_capacity == 0 {
            bail!("frame queue capacity must be positive");
        }
        if self.write_queue_capacity == 0 {
            bail!("write queue capacity must be positive");
        }
        Ok(())
    }

    pub fn triggered_by(&self) -> &str {
        self.self_address.as_deref()
            .unwrap_or(DEFAULT_TRIGGERED_BY)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        TransportConfig::default().validate().unwrap();
    }

    #[rstest]
    #[case::zero_max_timeout(TransportConfig { max_timeout: Duration::ZERO, ..Default::default() })]
    #[case::zero_chunk_size(TransportConfig { read_chunk_size: 0, ..Default::default() })]
    #[case::zero_frame_queue(TransportConfig { frame_queue_capacity: 0, ..Default::default() })]
    #[case::zero_write_queue(TransportConfig { write_queue_capacity: 0, ..Default::default() })]
    fn test_invalid(#[case] config: TransportConfig) {
        assert!(config.validate().is_err());
    }

    #[rstest]
    #[case::default(None, "peer")]
    #[case::configured(Some("g.us.alice".to_string()), "g.us.alice")]
    fn test_triggered_by(#[case] self_address: Option<String>, #[case] expected: &str) {
        let config = TransportConfig { self_address, ..Default::default() };
        assert_eq!(config.triggered_by(), expected);
    }
}
