//! Single-logout propagation.
//!
//! [`SingleLogoutListener`] turns the destruction of a ticket into logout
//! requests for every requestor the ticket was valid for. Delivery is
//! delegated to a [`LogoutNotifier`]; each call is bounded by a timeout and
//! failures are reported as one [`ListenerError`] naming the requestors that
//! could not be reached.
//!
//! Remove and expire can both arrive for the same ticket (explicit logout
//! racing the reaper, or several cluster members sweeping it). Tickets
//! already propagated are remembered in a bounded cache and skipped.

use std::{fmt, sync::Arc, time::Duration};

use async_trait::async_trait;
use moka::future::Cache;
use thiserror::Error;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::{
    alias::AliasStore,
    listener::{ListenerError, TicketEvent, TicketListener},
    ticket::{Ticket, TicketId, UserRef},
};

/// Failure code reported when one or more requestors were not notified.
pub const REMOTE_LOGOUT_FAILED: &str = "remote_logout_failed";

/// Default bound on a single notifier call (5 seconds).
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of processed ticket IDs remembered.
pub const DEFAULT_DEDUP_CAPACITY: u64 = 10_000;

/// Default time a processed ticket ID is remembered (10 minutes).
pub const DEFAULT_DEDUP_TTL: Duration = Duration::from_secs(600);

/// One logout request for one requestor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogoutRequest {
    /// The destroyed ticket.
    pub ticket_id: TicketId,
    /// The user who was logged in.
    pub subject: UserRef,
    /// Requestor to notify.
    pub requestor_id: String,
    /// Alias type looked up for the requestor.
    pub alias_type: String,
    /// The requestor's alias for the ticket, if one was issued.
    pub alias: Option<String>,
}

/// Why a requestor could not be notified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum LogoutError {
    /// The requestor answered but refused the logout.
    #[error("logout rejected: {0}")]
    Rejected(String),

    /// The requestor could not be reached.
    #[error("requestor unreachable: {0}")]
    Unreachable(String),

    /// The call did not finish in time.
    #[error("logout call timed out after {0:?}")]
    Timeout(Duration),
}

/// Delivers logout requests to requestors.
#[async_trait]
pub trait LogoutNotifier: Send + Sync {
    /// Display name of a requestor, used in failure reports.
    fn friendly_name(&self, requestor_id: &str) -> String {
        requestor_id.to_owned()
    }

    /// Sends one logout request.
    async fn notify_logout(&self, request: &LogoutRequest) -> Result<(), LogoutError>;
}

/// Listener propagating ticket destruction to every requestor.
pub struct SingleLogoutListener {
    aliases: Arc<dyn AliasStore>,
    notifier: Arc<dyn LogoutNotifier>,
    alias_type: String,
    call_timeout: Duration,
    processed: Cache<TicketId, ()>,
}

#[bon::bon]
impl SingleLogoutListener {
    /// Creates a listener looking up aliases of `alias_type` in `aliases`.
    #[builder]
    pub fn new(
        aliases: Arc<dyn AliasStore>,
        notifier: Arc<dyn LogoutNotifier>,
        #[builder(into)] alias_type: String,
        #[builder(default = DEFAULT_CALL_TIMEOUT)] call_timeout: Duration,
        #[builder(default = DEFAULT_DEDUP_CAPACITY)] dedup_capacity: u64,
        #[builder(default = DEFAULT_DEDUP_TTL)] dedup_ttl: Duration,
    ) -> Self {
        Self {
            aliases,
            notifier,
            alias_type,
            call_timeout,
            processed: Cache::builder()
                .max_capacity(dedup_capacity)
                .time_to_live(dedup_ttl)
                .build(),
        }
    }

    async fn notify(
        &self,
        ticket_id: &TicketId,
        ticket: &Ticket,
        requestor_id: &str,
    ) -> Result<(), LogoutError> {
        let alias = self
            .aliases
            .get_alias(&self.alias_type, requestor_id, ticket_id)
            .await
            .map_err(|e| LogoutError::Unreachable(format!("alias lookup failed: {e}")))?;
        let request = LogoutRequest {
            ticket_id: ticket_id.clone(),
            subject: ticket.owner().clone(),
            requestor_id: requestor_id.to_owned(),
            alias_type: self.alias_type.clone(),
            alias,
        };
        match timeout(self.call_timeout, self.notifier.notify_logout(&request)).await {
            Ok(result) => result,
            Err(_) => Err(LogoutError::Timeout(self.call_timeout)),
        }
    }
}

impl fmt::Debug for SingleLogoutListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleLogoutListener")
            .field("alias_type", &self.alias_type)
            .field("call_timeout", &self.call_timeout)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TicketListener for SingleLogoutListener {
    fn name(&self) -> &str {
        "single-logout"
    }

    #[tracing::instrument(level = "debug", skip(self, ticket), fields(ticket_id = ?ticket.id()))]
    async fn process_ticket_event(
        &self,
        event: TicketEvent,
        ticket: &Ticket,
    ) -> Result<(), ListenerError> {
        if !event.is_terminal() {
            return Ok(());
        }
        let Some(ticket_id) = ticket.id() else {
            return Ok(());
        };
        if self.processed.contains_key(ticket_id) {
            debug!("logout already propagated");
            return Ok(());
        }

        let mut failed = Vec::new();
        for requestor_id in ticket.requestor_ids() {
            if let Err(e) = self.notify(ticket_id, ticket, requestor_id).await {
                warn!(requestor_id, error = %e, "remote logout failed");
                failed.push(self.notifier.friendly_name(requestor_id));
            }
        }

        if !failed.is_empty() {
            return Err(ListenerError::new(event, REMOTE_LOGOUT_FAILED, failed.join(", ")));
        }
        self.processed.insert(ticket_id.clone(), ()).await;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::collections::HashSet;

    use chrono::Utc;
    use parking_lot::Mutex;

    use super::*;
    use crate::alias::{AliasRole, MapAliasStore};

    const PERSISTENT: &str = "persistent";

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<LogoutRequest>>,
        unreachable: HashSet<String>,
        slow: HashSet<String>,
    }

    #[async_trait]
    impl LogoutNotifier for Recorder {
        fn friendly_name(&self, requestor_id: &str) -> String {
            format!("SP {requestor_id}")
        }

        async fn notify_logout(&self, request: &LogoutRequest) -> Result<(), LogoutError> {
            if self.slow.contains(&request.requestor_id) {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            if self.unreachable.contains(&request.requestor_id) {
                return Err(LogoutError::Unreachable(request.requestor_id.clone()));
            }
            self.sent.lock().push(request.clone());
            Ok(())
        }
    }

    fn ticket(requestors: &[&str]) -> Ticket {
        let mut t = Ticket::new(UserRef::new("alice"), Utc::now());
        t.assign_id(TicketId::from("TGT-1"));
        for r in requestors {
            t.add_requestor_id(*r);
        }
        t
    }

    fn listener(notifier: Arc<Recorder>, aliases: Arc<MapAliasStore>) -> SingleLogoutListener {
        SingleLogoutListener::builder()
            .aliases(aliases)
            .notifier(notifier)
            .alias_type(PERSISTENT)
            .call_timeout(Duration::from_millis(50))
            .build()
    }

    #[tokio::test]
    async fn test_notifies_every_requestor_with_alias() {
        let aliases = Arc::new(MapAliasStore::in_memory(AliasRole::ServiceProvider));
        aliases.put_alias(PERSISTENT, "sp1", &TicketId::from("TGT-1"), "a-1").await.unwrap();
        let notifier = Arc::new(Recorder::default());
        let listener = listener(Arc::clone(&notifier), aliases);

        listener.process_ticket_event(TicketEvent::Remove, &ticket(&["sp1", "sp2"])).await.unwrap();

        let sent = notifier.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].alias.as_deref(), Some("a-1"));
        assert_eq!(sent[1].alias, None);
    }

    #[tokio::test]
    async fn test_ignores_non_terminal_events() {
        let notifier = Arc::new(Recorder::default());
        let listener = listener(
            Arc::clone(&notifier),
            Arc::new(MapAliasStore::in_memory(AliasRole::ServiceProvider)),
        );

        listener.process_ticket_event(TicketEvent::Update, &ticket(&["sp1"])).await.unwrap();
        assert!(notifier.sent.lock().is_empty());
    }

    #[tokio::test]
    async fn test_failures_are_aggregated() {
        let notifier = Arc::new(Recorder {
            unreachable: HashSet::from(["sp1".to_owned()]),
            slow: HashSet::from(["sp3".to_owned()]),
            ..Recorder::default()
        });
        let listener = listener(
            Arc::clone(&notifier),
            Arc::new(MapAliasStore::in_memory(AliasRole::ServiceProvider)),
        );

        let err = listener
            .process_ticket_event(TicketEvent::Expire, &ticket(&["sp1", "sp2", "sp3"]))
            .await
            .unwrap_err();

        assert_eq!(err.code, REMOTE_LOGOUT_FAILED);
        assert_eq!(err.detail, "SP sp1, SP sp3");
        assert_eq!(notifier.sent.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_terminal_event_is_skipped() {
        let notifier = Arc::new(Recorder::default());
        let listener = listener(
            Arc::clone(&notifier),
            Arc::new(MapAliasStore::in_memory(AliasRole::ServiceProvider)),
        );
        let t = ticket(&["sp1"]);

        listener.process_ticket_event(TicketEvent::Remove, &t).await.unwrap();
        listener.process_ticket_event(TicketEvent::Expire, &t).await.unwrap();
        assert_eq!(notifier.sent.lock().len(), 1);
    }
}
