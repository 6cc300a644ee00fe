use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::trace;

use crate::error::TransportError;
use crate::events::{report, ErrorListener};
use crate::frame::FrameKey;


enum InFlight {
    Handling { deadline: JoinHandle<()> },
    /// the handler's result is being sent, the deadline no longer applies
    Replying,
}


/// Inbound requests that are currently being handled, each with a deadline. This is used both to
///  detect duplicate requests and to drop handler results that arrive after the deadline.
///
/// A request stays tracked from [InboundDedupTracker::begin] until [InboundDedupTracker::finish]
///  (or until its deadline fires). [InboundDedupTracker::end] in between claims the result.
#[derive(Clone)]
pub struct InboundDedupTracker {
    in_flight: Arc<Mutex<FxHashMap<FrameKey, InFlight>>>,
    drained: Arc<Notify>,
    listener: Arc<dyn ErrorListener>,
    max_timeout: Duration,
}

impl InboundDedupTracker {
    pub fn new(max_timeout: Duration, listener: Arc<dyn ErrorListener>) -> InboundDedupTracker {
        InboundDedupTracker {
            in_flight: Default::default(),
            drained: Default::default(),
            listener,
            max_timeout,
        }
    }

    /// Starts tracking a request. Returns `false` if a request with the same key is in flight.
    pub async fn begin(&self, key: FrameKey, expires_at: SystemTime) -> bool {
        let mut in_flight = self.in_flight.lock().await;
        if in_flight.contains_key(&key) {
            return false;
        }

        let timeout = expires_at.duration_since(SystemTime::now())
            .unwrap_or(Duration::ZERO)
            .min(self.max_timeout);
        trace!("tracking inbound request {}, deadline in {:?}", key, timeout);

        let tracker = self.clone();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let mut in_flight = tracker.in_flight.lock().await;
            let expired = matches!(in_flight.get(&key), Some(InFlight::Handling { .. }));
            if expired {
                in_flight.remove(&key);
                tracker.notify_if_drained(&in_flight);
            }
            drop(in_flight);

            if expired {
                report(tracker.listener.as_ref(), TransportError::HandlerTimeout { key });
            }
        });
        in_flight.insert(key, InFlight::Handling { deadline });
        true
    }

    /// Claims the handler's result before its deadline. `false` means that the deadline fired
    ///  before, and the result must be dropped.
    pub async fn end(&self, key: FrameKey) -> bool {
        let mut in_flight = self.in_flight.lock().await;
        match in_flight.get_mut(&key) {
            Some(entry @ InFlight::Handling { .. }) => {
                if let InFlight::Handling { deadline } = std::mem::replace(entry, InFlight::Replying) {
                    deadline.abort();
                }
                true
            }
            _ => false,
        }
    }

    /// Stops tracking a request once its reply is queued for writing
    pub async fn finish(&self, key: FrameKey) {
        let mut in_flight = self.in_flight.lock().await;
        if let Some(InFlight::Handling { deadline }) = in_flight.remove(&key) {
            deadline.abort();
        }
        self.notify_if_drained(&in_flight);
    }

    pub async fn cancel_all(&self) {
        let mut in_flight = self.in_flight.lock().await;
        for (_, entry) in in_flight.drain() {
            if let InFlight::Handling { deadline } = entry {
                deadline.abort();
            }
        }
        self.notify_if_drained(&in_flight);
    }

    fn notify_if_drained(&self, in_flight: &FxHashMap<FrameKey, InFlight>) {
        if in_flight.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// Returns as soon as no inbound request is in flight. Deadlines bound the wait.
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.in_flight.lock().await.is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub async fn contains(&self, key: FrameKey) -> bool {
        self.in_flight.lock().await.contains_key(&key)
    }

    pub async fn len(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}
