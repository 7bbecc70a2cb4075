//! Event and messaging system.
//!
//! A small typed publish/subscribe bus shared by every client component.
//! - Soft errors from the network layer.
//! - Settings change notifications.
//! - Engine reset and reload requests.
//!
//! Delivery is synchronous and in registration order. Handlers are invoked
//! after the internal lock is released, so a handler may publish or
//! (un)subscribe without deadlocking.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use tracing::trace;

/// Events carried by the bus.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Recoverable failure surfaced for UI/logging (socket error, bad frame).
    SoftError { message: String },
    /// A settings key changed value.
    SettingsChanged { key: String },
    /// Game state is being reset; local input must be cleared.
    EngineReset,
    /// A required connection dropped without a deliberate teardown.
    ConnectionLost { reason: String },
    /// The client should rebuild itself from scratch.
    ReloadRequested,
}

/// Discriminant of `EngineEvent`, used as the subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SoftError,
    SettingsChanged,
    EngineReset,
    ConnectionLost,
    ReloadRequested,
}

impl EngineEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            EngineEvent::SoftError { .. } => EventKind::SoftError,
            EngineEvent::SettingsChanged { .. } => EventKind::SettingsChanged,
            EngineEvent::EngineReset => EventKind::EngineReset,
            EngineEvent::ConnectionLost { .. } => EventKind::ConnectionLost,
            EngineEvent::ReloadRequested => EventKind::ReloadRequested,
        }
    }

    pub fn soft_error(message: impl Into<String>) -> Self {
        EngineEvent::SoftError {
            message: message.into(),
        }
    }
}

/// Caller-chosen tag restricting delivery to a subset of subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextToken(pub u64);

/// Returned by `subscribe`; pass to `unsubscribe` to remove the handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionToken {
    kind: EventKind,
    id: u64,
}

type Handler = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    context: Option<ContextToken>,
    handler: Handler,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<Subscriber>>,
}

/// Typed event bus. Cloning yields another handle to the same bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<Mutex<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        // A panicking handler never runs under the lock, so poisoning only
        // means a panic elsewhere; the registry itself is still consistent.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Subscribes to every event of `kind`.
    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionToken
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.insert(kind, None, Arc::new(handler))
    }

    /// Subscribes to events of `kind` published with `context`.
    pub fn subscribe_in<F>(
        &self,
        kind: EventKind,
        context: ContextToken,
        handler: F,
    ) -> SubscriptionToken
    where
        F: Fn(&EngineEvent) + Send + Sync + 'static,
    {
        self.insert(kind, Some(context), Arc::new(handler))
    }

    fn insert(
        &self,
        kind: EventKind,
        context: Option<ContextToken>,
        handler: Handler,
    ) -> SubscriptionToken {
        let mut registry = self.registry();
        let id = registry.next_id;
        registry.next_id += 1;
        registry.by_kind.entry(kind).or_default().push(Subscriber {
            id,
            context,
            handler,
        });
        SubscriptionToken { kind, id }
    }

    /// Removes a handler. Returns `false` if it was already gone.
    pub fn unsubscribe(&self, token: SubscriptionToken) -> bool {
        let mut registry = self.registry();
        let Some(subs) = registry.by_kind.get_mut(&token.kind) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.id != token.id);
        before != subs.len()
    }

    /// Delivers `event` to every subscriber of its kind.
    pub fn publish(&self, event: EngineEvent) {
        self.dispatch(&event, None);
    }

    /// Delivers `event` only to subscribers registered with `context`.
    pub fn publish_in(&self, context: ContextToken, event: EngineEvent) {
        self.dispatch(&event, Some(context));
    }

    fn dispatch(&self, event: &EngineEvent, context: Option<ContextToken>) {
        let handlers: Vec<Handler> = {
            let registry = self.registry();
            registry
                .by_kind
                .get(&event.kind())
                .map(|subs| {
                    subs.iter()
                        .filter(|s| context.is_none() || s.context == context)
                        .map(|s| Arc::clone(&s.handler))
                        .collect()
                })
                .unwrap_or_default()
        };
        trace!(kind = ?event.kind(), listeners = handlers.len(), "Publishing event");
        for handler in handlers {
            handler(event);
        }
    }

    /// Number of handlers for `kind`.
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.registry().by_kind.get(&kind).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry();
        let total: usize = registry.by_kind.values().map(Vec::len).sum();
        f.debug_struct("EventBus").field("subscribers", &total).finish()
    }
}
