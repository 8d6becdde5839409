//! Ticket lifecycle listeners.
//!
//! Listeners observe every ticket mutation the factory performs. Dispatch is
//! sequential, in registration order, on the task that triggered the
//! mutation. A failing listener does not stop the others; its
//! [`ListenerError`] is collected and the caller receives all of them once
//! dispatch finishes.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::ticket::Ticket;

/// Lifecycle event delivered to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TicketEvent {
    /// A ticket was persisted for the first time.
    Create,
    /// A live ticket was persisted again and its expiration refreshed.
    Update,
    /// A ticket was removed on explicit logout.
    Remove,
    /// A ticket was removed because it expired.
    Expire,
}

impl TicketEvent {
    /// Stable event code (`ON_CREATE`, `ON_UPDATE`, `ON_REMOVE`, `ON_EXPIRE`).
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Create => "ON_CREATE",
            Self::Update => "ON_UPDATE",
            Self::Remove => "ON_REMOVE",
            Self::Expire => "ON_EXPIRE",
        }
    }

    /// Returns `true` for events after which the ticket no longer exists.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Remove | Self::Expire)
    }
}

impl fmt::Display for TicketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Failure reported by a listener.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{event} {code}: {detail}")]
pub struct ListenerError {
    /// The event being processed.
    pub event: TicketEvent,
    /// Machine-readable failure code.
    pub code: String,
    /// Human-readable detail.
    pub detail: String,
}

impl ListenerError {
    /// Creates a listener error.
    #[must_use]
    pub fn new(event: TicketEvent, code: impl Into<String>, detail: impl Into<String>) -> Self {
        Self { event, code: code.into(), detail: detail.into() }
    }
}

/// Observer of ticket lifecycle events.
///
/// Listeners must tolerate receiving `Remove` or `Expire` more than once for
/// the same ticket ID; duplicate expiry happens when several cluster members
/// sweep the same ticket.
#[async_trait]
pub trait TicketListener: Send + Sync {
    /// Name used in logs.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Handles one event for `ticket`.
    async fn process_ticket_event(
        &self,
        event: TicketEvent,
        ticket: &Ticket,
    ) -> Result<(), ListenerError>;
}

/// Ordered set of registered listeners.
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<Vec<Arc<dyn TicketListener>>>,
}

impl ListenerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a listener.
    pub fn add_listener(&self, listener: Arc<dyn TicketListener>) {
        self.listeners.write().push(listener);
    }

    /// Removes a previously added listener (compared by identity).
    ///
    /// Returns `false` if it was not registered.
    pub fn remove_listener(&self, listener: &Arc<dyn TicketListener>) -> bool {
        let target = Arc::as_ptr(listener).cast::<()>();
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| Arc::as_ptr(l).cast::<()>() != target);
        listeners.len() != before
    }

    /// Snapshot of the registered listeners, in registration order.
    #[must_use]
    pub fn listeners(&self) -> Vec<Arc<dyn TicketListener>> {
        self.listeners.read().clone()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    /// Returns `true` if no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Delivers `event` to every listener and collects their failures.
    #[tracing::instrument(level = "debug", skip(self, ticket), fields(ticket_id = ?ticket.id()))]
    pub async fn dispatch(&self, event: TicketEvent, ticket: &Ticket) -> Vec<ListenerError> {
        let mut failures = Vec::new();
        for listener in self.listeners() {
            if let Err(e) = listener.process_ticket_event(event, ticket).await {
                warn!(listener = listener.name(), error = %e, "ticket listener failed");
                failures.push(e);
            }
        }
        failures
    }
}

impl fmt::Debug for ListenerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let listeners = self.listeners.read();
        f.debug_list().entries(listeners.iter().map(|l| l.name())).finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use chrono::Utc;
    use parking_lot::Mutex;
    use rstest::rstest;

    use super::*;
    use crate::ticket::UserRef;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl TicketListener for Recorder {
        async fn process_ticket_event(
            &self,
            event: TicketEvent,
            _ticket: &Ticket,
        ) -> Result<(), ListenerError> {
            self.log.lock().push(format!("{}:{event}", self.label));
            if self.fail {
                return Err(ListenerError::new(event, "boom", self.label));
            }
            Ok(())
        }
    }

    fn recorder(
        label: &'static str,
        log: &Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> Arc<dyn TicketListener> {
        Arc::new(Recorder { label, log: Arc::clone(log), fail })
    }

    fn ticket() -> Ticket {
        Ticket::new(UserRef::new("alice"), Utc::now())
    }

    #[rstest]
    #[case(TicketEvent::Create, "ON_CREATE", false)]
    #[case(TicketEvent::Update, "ON_UPDATE", false)]
    #[case(TicketEvent::Remove, "ON_REMOVE", true)]
    #[case(TicketEvent::Expire, "ON_EXPIRE", true)]
    fn test_event_codes(#[case] event: TicketEvent, #[case] code: &str, #[case] terminal: bool) {
        assert_eq!(event.code(), code);
        assert_eq!(event.is_terminal(), terminal);
        let wire = format!("\"{}\"", code.trim_start_matches("ON_"));
        assert_eq!(serde_json::to_string(&event).unwrap(), wire);
    }

    #[tokio::test]
    async fn test_dispatch_continues_after_failure() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::new();
        registry.add_listener(recorder("first", &log, true));
        registry.add_listener(recorder("second", &log, false));
        registry.add_listener(recorder("third", &log, true));

        let failures = registry.dispatch(TicketEvent::Remove, &ticket()).await;

        assert_eq!(*log.lock(), ["first:ON_REMOVE", "second:ON_REMOVE", "third:ON_REMOVE"]);
        let details: Vec<_> = failures.iter().map(|f| f.detail.as_str()).collect();
        assert_eq!(details, ["first", "third"]);
    }

    #[tokio::test]
    async fn test_remove_listener_by_identity() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let registry = ListenerRegistry::new();
        let kept = recorder("kept", &log, false);
        let dropped = recorder("dropped", &log, false);
        registry.add_listener(Arc::clone(&kept));
        registry.add_listener(Arc::clone(&dropped));

        assert!(registry.remove_listener(&dropped));
        assert!(!registry.remove_listener(&dropped));
        assert_eq!(registry.len(), 1);

        registry.dispatch(TicketEvent::Create, &ticket()).await;
        assert_eq!(*log.lock(), ["kept:ON_CREATE"]);
    }

    #[tokio::test]
    async fn test_snapshot_is_detached() {
        let registry = ListenerRegistry::new();
        let snapshot = registry.listeners();
        registry.add_listener(recorder("late", &Arc::new(Mutex::new(Vec::new())), false));
        assert!(snapshot.is_empty());
        assert!(!registry.is_empty());
    }
}
