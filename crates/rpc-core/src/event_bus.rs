//! Event Bus (`spec.md` §4.7): named event registration and dispatch,
//! processor-scoped or scope-scoped. Raising with `waiting=true` is a
//! Request Table concern handled by the processor; this module owns the
//! receiving side — one handler per name (per processor, or per scope),
//! invoked when an `Event`/`ScopeEvent` arrives.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::sync::Mutex;

use crate::codec::DynamicValue;
use crate::error::RpcError;

pub type EventHandler =
    Arc<dyn Fn(Option<DynamicValue>) -> BoxFuture<'static, Result<(), RpcError>> + Send + Sync>;

/// A name → handler table. One instance lives on the processor (for
/// processor-scoped events) and one per scope (for scope-scoped events).
#[derive(Default)]
pub struct EventBus {
    handlers: Mutex<HashMap<String, EventHandler>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` under `name`. Fails if a handler is already
    /// registered for this name (`spec.md` §3 "one handler per name per
    /// scope; duplicate registration fails").
    pub async fn register(&self, name: impl Into<String>, handler: EventHandler) -> Result<(), RpcError> {
        let name = name.into();
        let mut handlers = self.handlers.lock().await;
        if handlers.contains_key(&name) {
            return Err(RpcError::DuplicateEventHandler(name));
        }
        handlers.insert(name, handler);
        Ok(())
    }

    pub async fn unregister(&self, name: &str) {
        self.handlers.lock().await.remove(name);
    }

    /// Dispatches a received event to its handler, if one is registered.
    /// `waiting=true` callers await the returned future to complete the
    /// remote's Response; `waiting=false` callers should spawn it and
    /// return immediately (`spec.md` §4.7).
    ///
    /// Returns `Ok(())` when no handler is registered — an event with no
    /// listener is not itself an error, matching the Event/ScopeEvent
    /// "optional" semantics.
    pub async fn dispatch(&self, name: &str, args: Option<DynamicValue>) -> Result<(), RpcError> {
        let handler = self.handlers.lock().await.get(name).cloned();
        match handler {
            Some(handler) => handler(args).await,
            None => Ok(()),
        }
    }

    pub async fn has_handler(&self, name: &str) -> bool {
        self.handlers.lock().await.contains_key(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn dispatch_invokes_the_registered_handler_exactly_once() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        bus.register(
            "test",
            Arc::new(move |_args| {
                let counted = counted.clone();
                Box::pin(async move {
                    counted.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        )
        .await
        .unwrap();

        bus.dispatch("test", None).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn duplicate_registration_is_rejected() {
        let bus = EventBus::new();
        let handler: EventHandler = Arc::new(|_| Box::pin(async { Ok(()) }));
        bus.register("test", handler.clone()).await.unwrap();
        let result = bus.register("test", handler).await;
        assert!(matches!(result, Err(RpcError::DuplicateEventHandler(_))));
    }

    #[tokio::test]
    async fn dispatch_with_no_handler_is_not_an_error() {
        let bus = EventBus::new();
        bus.dispatch("missing", None).await.unwrap();
    }
}
