use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, SystemTime};

use rustc_hash::FxHashMap;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::RequestError;
use crate::frame::FrameKey;

type ReplySlot<T> = oneshot::Sender<Result<T, RequestError>>;

struct PendingRequest<T> {
    reply_tx: ReplySlot<T>,
    timer: JoinHandle<()>,
}


/// Resolves once with the reply to an outgoing request, or with the reason there will be none.
pub struct PendingReply<T> {
    key: FrameKey,
    rx: oneshot::Receiver<Result<T, RequestError>>,
}

impl<T> PendingReply<T> {
    pub fn key(&self) -> FrameKey {
        self.key
    }
}

impl<T> Future for PendingReply<T> {
    type Output = Result<T, RequestError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(RequestError::TransportClosed)))
    }
}


/// Outgoing requests waiting for their replies. Reply, timeout and cancellation race for removing
///  the map entry, and only whoever removes it completes the reply slot.
pub struct RequestRegistry<T> {
    pending: Arc<Mutex<FxHashMap<FrameKey, PendingRequest<T>>>>,
    drained: Arc<Notify>,
    max_timeout: Duration,
}

impl<T> Clone for RequestRegistry<T> {
    fn clone(&self) -> Self {
        RequestRegistry {
            pending: self.pending.clone(),
            drained: self.drained.clone(),
            max_timeout: self.max_timeout,
        }
    }
}

impl<T: Send + 'static> RequestRegistry<T> {
    pub fn new(max_timeout: Duration) -> RequestRegistry<T> {
        RequestRegistry {
            pending: Default::default(),
            drained: Default::default(),
            max_timeout,
        }
    }

    /// Timeouts are handled with millisecond precision, so anything below one millisecond is
    ///  already expired.
    pub fn timeout_for(&self, expires_at: SystemTime) -> Result<Duration, RequestError> {
        let invalid = |timeout_ms: i64| RequestError::InvalidExpiry {
            timeout_ms,
            max_timeout_ms: self.max_timeout.as_millis() as u64,
        };

        match expires_at.duration_since(SystemTime::now()) {
            Ok(timeout) if timeout.as_millis() == 0 => Err(invalid(0)),
            Ok(timeout) if timeout > self.max_timeout => Err(invalid(timeout.as_millis() as i64)),
            Ok(timeout) => Ok(timeout),
            Err(e) => Err(invalid(-(e.duration().as_millis() as i64))),
        }
    }

    pub async fn register(&self, key: FrameKey, expires_at: SystemTime) -> Result<PendingReply<T>, RequestError> {
        let timeout = self.timeout_for(expires_at)?;

        let mut pending = self.pending.lock().await;
        if pending.contains_key(&key) {
            return Err(RequestError::IdentifierInUse { key });
        }

        let (reply_tx, rx) = oneshot::channel();
        let timer = self.spawn_timer(key, timeout);
        pending.insert(key, PendingRequest { reply_tx, timer });
        trace!("registered pending request {} with timeout {:?}", key, timeout);

        Ok(PendingReply { key, rx })
    }

    fn spawn_timer(&self, key: FrameKey, timeout: Duration) -> JoinHandle<()> {
        let registry = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;

            let mut pending = registry.pending.lock().await;
            if let Some(entry) = pending.remove(&key) {
                debug!("request {} timed out after {:?}", key, timeout);
                let _ = entry.reply_tx.send(Err(RequestError::Timeout { key }));
            }
            registry.notify_if_drained(&pending);
        })
    }

    fn notify_if_drained(&self, pending: &FxHashMap<FrameKey, PendingRequest<T>>) {
        if pending.is_empty() {
            self.drained.notify_waiters();
        }
    }

    /// Completes the request with `reply`. Returns `false` if no request with this key is
    ///  pending, i.e. the reply is unsolicited or late.
    pub async fn resolve(&self, key: FrameKey, reply: T) -> bool {
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.remove(&key) else {
            return false;
        };
        self.notify_if_drained(&pending);
        drop(pending);

        entry.timer.abort();
        if entry.reply_tx.send(Ok(reply)).is_err() {
            debug!("reply for {} arrived, but the requester is gone", key);
        }
        true
    }

    /// Forgets a pending request, failing it with [RequestError::TransportClosed]
    pub async fn cancel(&self, key: FrameKey) -> bool {
        let mut pending = self.pending.lock().await;
        let Some(entry) = pending.remove(&key) else {
            return false;
        };
        self.notify_if_drained(&pending);
        drop(pending);

        entry.timer.abort();
        let _ = entry.reply_tx.send(Err(RequestError::TransportClosed));
        true
    }

    pub async fn cancel_all(&self) -> usize {
        let mut pending = self.pending.lock().await;
        let entries = std::mem::take(&mut *pending);
        self.notify_if_drained(&pending);
        drop(pending);

        let num_cancelled = entries.len();
        for (_, entry) in entries {
            entry.timer.abort();
            let _ = entry.reply_tx.send(Err(RequestError::TransportClosed));
        }
        if num_cancelled > 0 {
            debug!("cancelled {} pending requests", num_cancelled);
        }
        num_cancelled
    }

    pub async fn len(&self) -> usize {
        self.pending.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.pending.lock().await.is_empty()
    }

    pub async fn contains(&self, key: FrameKey) -> bool {
        self.pending.lock().await.contains_key(&key)
    }

    /// Returns as soon as no request is pending
    pub async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_empty().await {
                return;
            }
            notified.await;
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use rstest::rstest;
    use tokio::runtime::Builder;
    use tokio::time;

    const MAX_TIMEOUT: Duration = Duration::from_secs(300);

    fn paused_runtime() -> tokio::runtime::Runtime {
        Builder::new_current_thread()
            .enable_all()
            .start_paused(true)
            .build()
            .unwrap()
    }

    fn new_registry() -> RequestRegistry<Bytes> {
        RequestRegistry::new(MAX_TIMEOUT)
    }

    fn in_millis(millis: i64) -> SystemTime {
        if millis >= 0 {
            SystemTime::now() + Duration::from_millis(millis as u64)
        }
        else {
            SystemTime::now() - Duration::from_millis(-millis as u64)
        }
    }

    #[rstest]
    #[case::past(-1, false)]
    #[case::long_past(-100_000, false)]
    #[case::one_second(1_000, true)]
    #[case::just_below_max(299_000, true)]
    #[case::above_max(301_000, false)]
    fn test_timeout_for(#[case] offset_millis: i64, #[case] valid: bool) {
        let registry = new_registry();
        match registry.timeout_for(in_millis(offset_millis)) {
            Ok(timeout) => {
                assert!(valid);
                assert!(timeout <= Duration::from_millis(offset_millis as u64));
            }
            Err(RequestError::InvalidExpiry { timeout_ms, max_timeout_ms }) => {
                assert!(!valid);
                assert_eq!(max_timeout_ms, 300_000);
                if offset_millis < 0 {
                    assert!(timeout_ms <= 0);
                }
            }
            Err(e) => panic!("unexpected error {:?}", e),
        }
    }

    #[test]
    fn test_timeout_below_one_millisecond() {
        let registry = new_registry();
        let result = registry.timeout_for(SystemTime::now() + Duration::from_micros(500));
        assert!(matches!(result, Err(RequestError::InvalidExpiry { timeout_ms: 0, .. })));
    }

    #[test]
    fn test_resolve() {
        paused_runtime().block_on(async {
            let registry = new_registry();
            let key = FrameKey::new(1, 0);
            let reply = registry.register(key, in_millis(10_000)).await.unwrap();
            assert_eq!(reply.key(), key);
            assert_eq!(registry.len().await, 1);

            assert!(registry.resolve(key, Bytes::from_static(b"abc")).await);
            assert_eq!(reply.await, Ok(Bytes::from_static(b"abc")));
            assert!(registry.is_empty().await);

            assert!(!registry.resolve(key, Bytes::from_static(b"abc")).await);
        });
    }

    #[test]
    fn test_unknown_key() {
        paused_runtime().block_on(async {
            let registry = new_registry();
            assert!(!registry.resolve(FrameKey::new(1, 99), Bytes::new()).await);
            assert!(!registry.cancel(FrameKey::new(1, 99)).await);
        });
    }

    #[test]
    fn test_identifier_in_use() {
        paused_runtime().block_on(async {
            let registry = new_registry();
            let key = FrameKey::new(1, 0);
            let _reply = registry.register(key, in_millis(10_000)).await.unwrap();
            assert_eq!(registry.register(key, in_millis(10_000)).await.err(), Some(RequestError::IdentifierInUse { key }));
        });
    }

    #[test]
    fn test_register_invalid_expiry() {
        paused_runtime().block_on(async {
            let registry = new_registry();
            let result = registry.register(FrameKey::new(1, 0), in_millis(-1)).await;
            assert!(matches!(result, Err(RequestError::InvalidExpiry { .. })));
            assert!(registry.is_empty().await);
        });
    }

    #[test]
    fn test_timeout() {
        paused_runtime().block_on(async {
            let registry = new_registry();
            let key = FrameKey::new(1, 0);
            let reply = registry.register(key, in_millis(1_000)).await.unwrap();

            time::sleep(Duration::from_millis(1_001)).await;
            assert!(registry.is_empty().await);
            assert_eq!(reply.await, Err(RequestError::Timeout { key }));

            // a late reply does not complete anything again
            assert!(!registry.resolve(key, Bytes::new()).await);
        });
    }

    #[test]
    fn test_resolve_aborts_timer() {
        paused_runtime().block_on(async {
            let registry = new_registry();
            let key = FrameKey::new(1, 0);
            let reply = registry.register(key, in_millis(1_000)).await.unwrap();
            assert!(registry.resolve(key, Bytes::from_static(b"x")).await);

            // same key again after the first request completed
            let reply_2 = registry.register(key, in_millis(5_000)).await.unwrap();
            time::sleep(Duration::from_millis(2_000)).await;

            assert_eq!(reply.await, Ok(Bytes::from_static(b"x")));
            assert!(registry.contains(key).await);
            assert!(registry.resolve(key, Bytes::from_static(b"y")).await);
            assert_eq!(reply_2.await, Ok(Bytes::from_static(b"y")));
        });
    }

    #[test]
    fn test_cancel_all() {
        paused_runtime().block_on(async {
            let registry = new_registry();
            let reply_1 = registry.register(FrameKey::new(1, 0), in_millis(1_000)).await.unwrap();
            let reply_2 = registry.register(FrameKey::new(1, 1), in_millis(1_000)).await.unwrap();

            assert_eq!(registry.cancel_all().await, 2);
            assert_eq!(reply_1.await, Err(RequestError::TransportClosed));
            assert_eq!(reply_2.await, Err(RequestError::TransportClosed));
            assert_eq!(registry.cancel_all().await, 0);
        });
    }

    #[test]
    fn test_cancel() {
        paused_runtime().block_on(async {
            let registry = new_registry();
            let key = FrameKey::new(1, 0);
            let reply = registry.register(key, in_millis(1_000)).await.unwrap();
            assert!(registry.cancel(key).await);
            assert_eq!(reply.await, Err(RequestError::TransportClosed));
        });
    }

    #[test]
    fn test_wait_drained() {
        paused_runtime().block_on(async {
            let registry = new_registry();
            registry.wait_drained().await;

            let _reply_1 = registry.register(FrameKey::new(1, 0), in_millis(1_000)).await.unwrap();
            let _reply_2 = registry.register(FrameKey::new(1, 1), in_millis(3_000)).await.unwrap();

            let cloned = registry.clone();
            let waiter = tokio::spawn(async move {
                cloned.wait_drained().await;
                tokio::time::Instant::now()
            });

            let start = tokio::time::Instant::now();
            time::sleep(Duration::from_millis(10)).await;
            assert!(registry.resolve(FrameKey::new(1, 0), Bytes::new()).await);
            assert!(!waiter.is_finished());

            let drained_at = waiter.await.unwrap();
            // the second request times out, somewhere below three seconds of wall clock
            assert!(drained_at - start <= Duration::from_millis(3_000));
            assert!(drained_at - start > Duration::from_millis(10));
        });
    }
}
