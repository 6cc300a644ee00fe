use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::{debug, trace};

use crate::frame::FrameKey;

/// Destinations starting with this prefix address the peer itself. They are only ever routed to a
///  handler registered for exactly that address, never to the default handler.
pub const CONTROL_PREFIX: &str = "peer";

/// Table key under which the default handler is registered
pub const DEFAULT_HANDLER_KEY: &str = "*";


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestMeta {
    pub key: FrameKey,
}


#[async_trait]
pub trait RequestHandler<Req, Rep>: Send + Sync + 'static {
    async fn handle(&self, request: Req, meta: RequestMeta) -> anyhow::Result<Rep>;
}

#[async_trait]
impl<Req, Rep, F, Fut> RequestHandler<Req, Rep> for F
where
    Req: Send + 'static,
    Rep: Send + 'static,
    F: Fn(Req, RequestMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Rep>> + Send + 'static,
{
    async fn handle(&self, request: Req, meta: RequestMeta) -> anyhow::Result<Rep> {
        self(request, meta).await
    }
}


pub type SharedHandler<Req, Rep> = Arc<dyn RequestHandler<Req, Rep>>;

/// Maps destination addresses to request handlers. The table is owned by a single engine and can be
///  modified by the application at any time.
pub struct HandlerRouter<Req, Rep> {
    handlers: Arc<RwLock<FxHashMap<String, SharedHandler<Req, Rep>>>>,
}

impl<Req, Rep> Clone for HandlerRouter<Req, Rep> {
    fn clone(&self) -> Self {
        HandlerRouter {
            handlers: self.handlers.clone(),
        }
    }
}

impl<Req, Rep> Default for HandlerRouter<Req, Rep> {
    fn default() -> Self {
        HandlerRouter {
            handlers: Default::default(),
        }
    }
}

impl<Req: Send + 'static, Rep: Send + 'static> HandlerRouter<Req, Rep> {
    pub fn new() -> HandlerRouter<Req, Rep> {
        Default::default()
    }

    pub async fn resolve(&self, destination: &str) -> Option<SharedHandler<Req, Rep>> {
        let handlers = self.handlers.read().await;

        if let Some(handler) = handlers.get(destination) {
            trace!("routing request for {} to exactly matching handler", destination);
            return Some(handler.clone());
        }
        if destination.starts_with(CONTROL_PREFIX) {
            return None;
        }

        //TODO longest prefix matching before falling back to the default handler
        handlers.get(DEFAULT_HANDLER_KEY).cloned()
    }

    /// Returns the handler previously registered for the address, if any
    pub async fn register_handler(&self, address: impl Into<String>, handler: impl RequestHandler<Req, Rep>) -> Option<SharedHandler<Req, Rep>> {
        self.register_shared(address.into(), Arc::new(handler)).await
    }

    pub async fn register_shared(&self, address: String, handler: SharedHandler<Req, Rep>) -> Option<SharedHandler<Req, Rep>> {
        debug!("registering request handler for {}", address);
        let prev = self.handlers.write().await.insert(address, handler);
        if prev.is_some() {
            debug!("replaced previously registered request handler");
        }
        prev
    }

    pub async fn remove_handler(&self, address: &str) -> Option<SharedHandler<Req, Rep>> {
        debug!("removing request handler for {}", address);
        self.handlers.write().await.remove(address)
    }

    pub async fn set_default_handler(&self, handler: impl RequestHandler<Req, Rep>) -> Option<SharedHandler<Req, Rep>> {
        self.register_shared(DEFAULT_HANDLER_KEY.to_string(), Arc::new(handler)).await
    }

    pub async fn clear_default_handler(&self) -> Option<SharedHandler<Req, Rep>> {
        self.remove_handler(DEFAULT_HANDLER_KEY).await
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tokio::runtime::Builder;

    const META: RequestMeta = RequestMeta { key: FrameKey { batch: 1, id: 1 } };

    struct Fixed(&'static str);

    #[async_trait]
    impl RequestHandler<String, String> for Fixed {
        async fn handle(&self, _request: String, _meta: RequestMeta) -> anyhow::Result<String> {
            Ok(self.0.to_string())
        }
    }

    /// the handler's reply tells which one was picked
    async fn routed_to(router: &HandlerRouter<String, String>, destination: &str) -> Option<String> {
        match router.resolve(destination).await {
            Some(handler) => Some(handler.handle(destination.to_string(), META).await.unwrap()),
            None => None,
        }
    }

    #[rstest]
    #[case::exact("test.alice", true, Some("alice"))]
    #[case::exact_no_default("test.alice", false, Some("alice"))]
    #[case::default("test.bob", true, Some("default"))]
    #[case::no_default("test.bob", false, None)]
    #[case::no_prefix_match("test.alice.sub", true, Some("default"))]
    #[case::control_exact("peer.config", true, Some("config"))]
    #[case::control_never_default("peer.route", true, None)]
    #[case::control_prefix_without_separator("peering", true, None)]
    fn test_resolve(#[case] destination: &str, #[case] with_default: bool, #[case] expected: Option<&str>) {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let router = HandlerRouter::new();
            router.register_handler("test.alice", Fixed("alice")).await;
            router.register_handler("peer.config", Fixed("config")).await;
            if with_default {
                router.set_default_handler(Fixed("default")).await;
            }

            assert_eq!(routed_to(&router, destination).await.as_deref(), expected);
        });
    }

    #[test]
    fn test_register_replaces() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let router = HandlerRouter::new();
            assert!(router.register_handler("test.a", Fixed("first")).await.is_none());

            let prev = router.register_handler("test.a", Fixed("second")).await.unwrap();
            assert_eq!(prev.handle("x".to_string(), META).await.unwrap(), "first");
            assert_eq!(routed_to(&router, "test.a").await.as_deref(), Some("second"));
        });
    }

    #[test]
    fn test_remove_and_clear() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let router = HandlerRouter::new();
            router.register_handler("test.a", Fixed("a")).await;
            router.set_default_handler(Fixed("default")).await;

            assert!(router.remove_handler("test.a").await.is_some());
            assert!(router.remove_handler("test.a").await.is_none());
            assert_eq!(routed_to(&router, "test.a").await.as_deref(), Some("default"));

            assert!(router.clear_default_handler().await.is_some());
            assert_eq!(routed_to(&router, "test.a").await, None);
        });
    }

    #[test]
    fn test_closure_handler() {
        let rt = Builder::new_current_thread().enable_all().build().unwrap();
        rt.block_on(async {
            let router = HandlerRouter::new();
            router.set_default_handler(|request: String, meta: RequestMeta| async move {
                Ok::<_, anyhow::Error>(format!("{} {}", request, meta.key))
            }).await;

            assert_eq!(routed_to(&router, "test.x").await.as_deref(), Some("test.x batch=1 id=1"));
        });
    }
}
