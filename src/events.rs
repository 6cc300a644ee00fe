#[cfg(test)] use mockall::automock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{error, info, warn};

use crate::error::TransportError;


/// Receives every error the transport runs into. Calls happen on the transport's own tasks, so
///  implementations must not block.
#[cfg_attr(test, automock)]
pub trait ErrorListener: Send + Sync + 'static {
    fn on_error(&self, error: &TransportError);
}

impl ErrorListener for mpsc::Sender<TransportError> {
    fn on_error(&self, error: &TransportError) {
        match self.try_send(error.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(e)) => warn!("error channel is full, dropping {}", e),
            Err(TrySendError::Closed(_)) => {}
        }
    }
}

pub(crate) fn report(listener: &dyn ErrorListener, error: TransportError) {
    match &error {
        TransportError::MalformedFrame(_) |
        TransportError::MalformedPayload { .. } |
        TransportError::UnderlyingStream { .. } => error!("{}", error),
        TransportError::TransportClosed => info!("{}", error),
        _ => warn!("{}", error),
    }
    listener.on_error(&error);
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKey;

    #[test]
    fn test_report_to_channel() {
        let (tx, mut rx) = mpsc::channel(1);
        report(&tx, TransportError::UnsolicitedReply { key: FrameKey::new(1, 2) });
        assert_eq!(rx.try_recv().unwrap(), TransportError::UnsolicitedReply { key: FrameKey::new(1, 2) });
    }

    #[test]
    fn test_full_channel_drops() {
        let (tx, mut rx) = mpsc::channel(1);
        report(&tx, TransportError::TransportClosed);
        report(&tx, TransportError::UnderlyingStream { reason: "x".to_string() });
        assert_eq!(rx.try_recv().unwrap(), TransportError::TransportClosed);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_closed_channel() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        report(&tx, TransportError::TransportClosed);
    }

    #[test]
    fn test_report_to_mock() {
        let mut listener = MockErrorListener::new();
        listener.expect_on_error()
            .withf(|e| *e == TransportError::DuplicateRequest { key: FrameKey::new(1, 1) })
            .once()
            .return_const(());
        report(&listener, TransportError::DuplicateRequest { key: FrameKey::new(1, 1) });
    }
}
