//! Post-commit event fan-out.
//!
//! Observers subscribe callback slots; the vault fires events after each
//! successful commit, in commit order. A failed operation emits nothing
//! except [`VaultEvent::Error`].

use strongbox_core::hash::Hash256;

/// Observable side effects of vault operations.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VaultEvent {
    /// Owned objects of the named accounts changed.
    Updated(Vec<String>),
    /// First insertion of a transaction, keyed by unsigned hash.
    NewTx(Hash256),
    /// A header was appended to the chain.
    NewBlock(Hash256, u32),
    /// The best height advanced.
    UpdateSyncHeight(u32),
    /// A surfaced failure (also returned synchronously to the caller).
    Error(String),
}

type Handler = Box<dyn Fn(&VaultEvent) + Send + Sync>;

/// Subscriber registry.
#[derive(Default)]
pub struct EventHub {
    handlers: Vec<Handler>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked for every event.
    pub fn subscribe(&mut self, handler: impl Fn(&VaultEvent) + Send + Sync + 'static) {
        self.handlers.push(Box::new(handler));
    }

    /// Drop all subscribers.
    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    /// Deliver an event to every subscriber, in subscription order.
    pub fn emit(&self, event: &VaultEvent) {
        for handler in &self.handlers {
            handler(event);
        }
    }

    /// Deliver a sequence of events in order.
    pub fn emit_all(&self, events: &[VaultEvent]) {
        for event in events {
            self.emit(event);
        }
    }
}

impl std::fmt::Debug for EventHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventHub")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn events_reach_all_subscribers_in_order() {
        let seen: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let mut hub = EventHub::new();
        for tag in ["a", "b"] {
            let seen = seen.clone();
            hub.subscribe(move |event| {
                seen.lock().unwrap().push(format!("{tag}:{event:?}"));
            });
        }
        hub.emit_all(&[
            VaultEvent::UpdateSyncHeight(1),
            VaultEvent::NewBlock(Hash256::ZERO, 1),
        ]);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 4);
        assert!(seen[0].starts_with("a:UpdateSyncHeight"));
        assert!(seen[1].starts_with("b:UpdateSyncHeight"));
        assert!(seen[2].starts_with("a:NewBlock"));
    }

    #[test]
    fn clear_removes_subscribers() {
        let seen: Arc<Mutex<u32>> = Arc::new(Mutex::new(0));
        let mut hub = EventHub::new();
        {
            let seen = seen.clone();
            hub.subscribe(move |_| *seen.lock().unwrap() += 1);
        }
        hub.emit(&VaultEvent::UpdateSyncHeight(1));
        hub.clear();
        hub.emit(&VaultEvent::UpdateSyncHeight(2));
        assert_eq!(*seen.lock().unwrap(), 1);
    }
}
