//! Event Bus (C11) — in-process pub/sub for dev events, typed by event
//! name. `emit` invokes every subscriber concurrently and awaits
//! completion; a subscriber that panics is logged and never brings down
//! the publisher.

use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    FileAdded,
    FileChanged,
    FileDeleted,
    EnvChanged,
    BuildStarting,
    BuildSuccess,
    BuildError,
    BuildComplete,
    ServerStarting,
    ServerStarted,
    ServerStopping,
    ServerStopped,
    ServerError,
    WatcherReady,
    WatcherError,
    /// `reload:*` family — named by the specific reload sub-event.
    Reload(String),
}

impl EventKind {
    pub fn wire_name(&self) -> String {
        match self {
            EventKind::FileAdded => "file:added".to_string(),
            EventKind::FileChanged => "file:changed".to_string(),
            EventKind::FileDeleted => "file:deleted".to_string(),
            EventKind::EnvChanged => "env:changed".to_string(),
            EventKind::BuildStarting => "build:starting".to_string(),
            EventKind::BuildSuccess => "build:success".to_string(),
            EventKind::BuildError => "build:error".to_string(),
            EventKind::BuildComplete => "build:complete".to_string(),
            EventKind::ServerStarting => "server:starting".to_string(),
            EventKind::ServerStarted => "server:started".to_string(),
            EventKind::ServerStopping => "server:stopping".to_string(),
            EventKind::ServerStopped => "server:stopped".to_string(),
            EventKind::ServerError => "server:error".to_string(),
            EventKind::WatcherReady => "watcher:ready".to_string(),
            EventKind::WatcherError => "watcher:error".to_string(),
            EventKind::Reload(sub) => format!("reload:{sub}"),
        }
    }
}

pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
}

pub type Subscriber = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
pub struct EventBus {
    subscribers: DashMap<String, Vec<Subscriber>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, kind: &EventKind, subscriber: Subscriber) {
        self.subscribers.entry(kind.wire_name()).or_default().push(subscriber);
    }

    /// Subscribe to every event carrying the `reload:` wire prefix,
    /// regardless of sub-name.
    pub fn subscribe_reload_wildcard(&self, subscriber: Subscriber) {
        self.subscribers.entry("reload:*".to_string()).or_default().push(subscriber);
    }

    pub async fn emit(&self, event: Event) {
        let wire_name = event.kind.wire_name();
        let mut subscribers: Vec<Subscriber> =
            self.subscribers.get(&wire_name).map(|v| v.clone()).unwrap_or_default();

        if wire_name.starts_with("reload:") {
            if let Some(wildcard) = self.subscribers.get("reload:*") {
                subscribers.extend(wildcard.clone());
            }
        }

        if subscribers.is_empty() {
            return;
        }

        let event = Arc::new(event);
        let mut tasks = Vec::with_capacity(subscribers.len());
        for subscriber in subscribers {
            let event = event.clone();
            tasks.push(tokio::task::spawn_blocking(move || {
                let outcome =
                    std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| subscriber(&event)));
                if let Err(panic) = outcome {
                    let message = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic payload".to_string());
                    tracing::error!(event = %event.kind.wire_name(), %message, "event subscriber panicked");
                }
            }));
        }
        for task in tasks {
            let _ = task.await;
        }
    }
}
