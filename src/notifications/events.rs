use crate::types::{NotificationEvent, NotificationId, RecordId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Notification,
    ConnectionEstablished,
    MarkAsReadResponse,
    Pong,
    Connected,
    Disconnected,
    ReconnectScheduled,
    ReconnectExhausted,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        Self::Notification,
        Self::ConnectionEstablished,
        Self::MarkAsReadResponse,
        Self::Pong,
        Self::Connected,
        Self::Disconnected,
        Self::ReconnectScheduled,
        Self::ReconnectExhausted,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Notification => "notification",
            Self::ConnectionEstablished => "connection_established",
            Self::MarkAsReadResponse => "mark_as_read_response",
            Self::Pong => "pong",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::ReconnectScheduled => "reconnect_scheduled",
            Self::ReconnectExhausted => "reconnect_exhausted",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SocketEvent {
    Notification(NotificationEvent),
    ConnectionEstablished {
        message: Option<String>,
        user_id: Option<RecordId>,
    },
    MarkAsReadResponse {
        notification_id: NotificationId,
        success: bool,
    },
    Pong,
    Connected,
    Disconnected {
        will_reconnect: bool,
    },
    ReconnectScheduled {
        attempt: u32,
        delay: Duration,
    },
    ReconnectExhausted {
        attempts: u32,
    },
}

impl SocketEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Notification(_) => EventKind::Notification,
            Self::ConnectionEstablished { .. } => EventKind::ConnectionEstablished,
            Self::MarkAsReadResponse { .. } => EventKind::MarkAsReadResponse,
            Self::Pong => EventKind::Pong,
            Self::Connected => EventKind::Connected,
            Self::Disconnected { .. } => EventKind::Disconnected,
            Self::ReconnectScheduled { .. } => EventKind::ReconnectScheduled,
            Self::ReconnectExhausted { .. } => EventKind::ReconnectExhausted,
        }
    }
}

pub type Listener = Arc<dyn Fn(&SocketEvent) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    by_kind: HashMap<EventKind, Vec<(u64, Listener)>>,
}

fn lock(inner: &Mutex<Listeners>) -> MutexGuard<'_, Listeners> {
    inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default, Clone)]
pub struct EventRegistry {
    inner: Arc<Mutex<Listeners>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(
        &self,
        kind: EventKind,
        listener: impl Fn(&SocketEvent) + Send + Sync + 'static,
    ) -> Subscription {
        let mut guard = lock(&self.inner);
        guard.next_id += 1;
        let id = guard.next_id;
        guard
            .by_kind
            .entry(kind)
            .or_default()
            .push((id, Arc::new(listener)));
        Subscription {
            registry: Arc::downgrade(&self.inner),
            kind,
            id,
        }
    }

    /// Listeners are called outside the registry lock, so they may subscribe or
    /// unsubscribe from inside a callback.
    pub fn emit(&self, event: &SocketEvent) {
        let listeners: Vec<Listener> = {
            let guard = lock(&self.inner);
            match guard.by_kind.get(&event.kind()) {
                Some(list) => list.iter().map(|(_, l)| l.clone()).collect(),
                None => return,
            }
        };
        for listener in listeners {
            listener(event);
        }
    }

    pub fn listener_count(&self, kind: EventKind) -> usize {
        lock(&self.inner).by_kind.get(&kind).map_or(0, Vec::len)
    }
}

/// Disposer for a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes its listener"]
pub struct Subscription {
    registry: Weak<Mutex<Listeners>>,
    kind: EventKind,
    id: u64,
}

impl Subscription {
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn unsubscribe(self) {}

    /// Keeps the listener registered for the registry's whole lifetime.
    pub fn detach(mut self) {
        self.registry = Weak::new();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let Some(inner) = self.registry.upgrade() else {
            return;
        };
        let mut guard = lock(&inner);
        if let Some(list) = guard.by_kind.get_mut(&self.kind) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                guard.by_kind.remove(&self.kind);
            }
        }
    }
}
