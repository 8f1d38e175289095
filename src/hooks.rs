//! Hook Bus (C9) — named lifecycle hooks with async fan-out.
//!
//! Registration order is preserved; handlers for one hook may run
//! concurrently with each other, but the caller only observes the hook call
//! returning after every registered handler has settled. A misbehaving
//! observer must never break the request path, so a panicking handler is
//! caught, logged, and swallowed.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookName {
    RequestBefore,
    RequestAfter,
    RequestError,
    MiddlewareBeforeExecute,
    MiddlewareAfterExecute,
    MiddlewareError,
    Close,
}

impl HookName {
    pub fn wire_name(self) -> &'static str {
        match self {
            HookName::RequestBefore => "request:before",
            HookName::RequestAfter => "request:after",
            HookName::RequestError => "request:error",
            HookName::MiddlewareBeforeExecute => "middleware:beforeExecute",
            HookName::MiddlewareAfterExecute => "middleware:afterExecute",
            HookName::MiddlewareError => "middleware:error",
            HookName::Close => "close",
        }
    }
}

pub type HookHandler = Arc<dyn Fn(Arc<Value>) + Send + Sync>;

/// Rebuilt from scratch whenever the `hooks` config key diffs (§9: "make
/// lifecycle explicit... drop all, register all").
#[derive(Default)]
pub struct HookBus {
    handlers: DashMap<HookName, Vec<HookHandler>>,
}

impl HookBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: HookName, handler: HookHandler) {
        self.handlers.entry(name).or_default().push(handler);
    }

    /// Drop every registered handler. Used when rebuilding the hook
    /// container after a `hooks` config diff.
    pub fn clear(&self) {
        self.handlers.clear();
    }

    pub fn handler_count(&self, name: HookName) -> usize {
        self.handlers.get(&name).map(|v| v.len()).unwrap_or(0)
    }

    /// Synchronous variant of `fire`, for call sites that cannot await —
    /// the middleware chain driver runs every slot as a plain in-line call,
    /// since route middlewares are synchronous FFI calls. Handlers run
    /// sequentially in registration order; a panic in one is still caught
    /// and logged, never propagated.
    pub fn fire_sync(&self, name: HookName, payload: Value) {
        let handlers = match self.handlers.get(&name) {
            Some(v) => v.clone(),
            None => return,
        };
        if handlers.is_empty() {
            return;
        }

        let payload = Arc::new(payload);
        for handler in handlers {
            let payload = payload.clone();
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(payload)));
            if let Err(panic) = outcome {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic payload".to_string());
                tracing::error!(hook = name.wire_name(), %message, "hook handler panicked");
            }
        }
    }

    /// Fire a hook, returning once every handler has settled. Handlers are
    /// started in registration order and run concurrently; a panic inside
    /// one is caught and logged, never propagated.
    pub async fn fire(&self, name: HookName, payload: Value) {
        let handlers = match self.handlers.get(&name) {
            Some(v) => v.clone(),
            None => return,
        };
        if handlers.is_empty() {
            return;
        }

        let payload = Arc::new(payload);
        let mut tasks = Vec::with_capacity(handlers.len());
        for handler in handlers {
            let payload = payload.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(payload)));
                if let Err(panic) = outcome {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    tracing::error!(hook = name.wire_name(), %message, "hook handler panicked");
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fire_invokes_all_registered_handlers() {
        let bus = HookBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            bus.register(HookName::RequestAfter, Arc::new(move |_payload| {
                count.fetch_add(1, Ordering::SeqCst);
            }));
        }
        bus.fire(HookName::RequestAfter, Value::Null).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn panicking_handler_is_swallowed() {
        let bus = HookBus::new();
        bus.register(HookName::RequestError, Arc::new(|_payload| panic!("boom")));
        let ran_after = Arc::new(AtomicUsize::new(0));
        let ran_after2 = ran_after.clone();
        bus.register(HookName::RequestError, Arc::new(move |_payload| {
            ran_after2.fetch_add(1, Ordering::SeqCst);
        }));
        bus.fire(HookName::RequestError, Value::Null).await;
        assert_eq!(ran_after.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fire_sync_invokes_handlers_and_swallows_panics() {
        let bus = HookBus::new();
        bus.register(HookName::MiddlewareError, Arc::new(|_payload| panic!("boom")));
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        bus.register(HookName::MiddlewareError, Arc::new(move |_payload| {
            ran2.fetch_add(1, Ordering::SeqCst);
        }));
        bus.fire_sync(HookName::MiddlewareError, Value::Null);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn clear_drops_all_handlers() {
        let bus = HookBus::new();
        bus.register(HookName::Close, Arc::new(|_| {}));
        assert_eq!(bus.handler_count(HookName::Close), 1);
        bus.clear();
        assert_eq!(bus.handler_count(HookName::Close), 0);
    }
}
