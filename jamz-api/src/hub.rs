use dashmap::DashMap;
use jamz_core::service::ConnectionId;
use jamz_sfu::SessionId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::protocol::ServerEvent;

/// Bounded per-connection outbound queue
pub type OutboundSender = mpsc::Sender<ServerEvent>;
pub type OutboundReceiver = mpsc::Receiver<ServerEvent>;

struct ConnectionEntry {
    sender: OutboundSender,
    alive: Arc<AtomicBool>,
    session: Option<SessionId>,
}

/// Where a connection stands
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    InSession(SessionId),
    Terminated,
}

/// Local registry of connections and session membership.
///
/// A connection belongs to at most one session. Relays and broadcasts only
/// ever reach members of the named session.
#[derive(Default)]
pub struct SessionHub {
    connections: DashMap<ConnectionId, ConnectionEntry>,
    sessions: DashMap<SessionId, Vec<ConnectionId>>,
}

impl SessionHub {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a new connection. The returned flag goes false once the
    /// connection is gone or its socket stops accepting writes.
    pub fn register(&self, connection_id: ConnectionId, sender: OutboundSender) -> Arc<AtomicBool> {
        let alive = Arc::new(AtomicBool::new(true));
        self.connections.insert(
            connection_id,
            ConnectionEntry {
                sender,
                alive: Arc::clone(&alive),
                session: None,
            },
        );
        alive
    }

    /// Forget a connection. Call [`SessionHub::leave`] first.
    pub fn unregister(&self, connection_id: &ConnectionId) {
        if let Some((_, entry)) = self.connections.remove(connection_id) {
            entry.alive.store(false, Ordering::Release);
        }
    }

    #[must_use]
    pub fn is_alive(&self, connection_id: &ConnectionId) -> bool {
        self.connections
            .get(connection_id)
            .is_some_and(|c| c.alive.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn state(&self, connection_id: &ConnectionId) -> ConnectionState {
        match self.connections.get(connection_id) {
            Some(entry) => match &entry.session {
                Some(session) => ConnectionState::InSession(session.clone()),
                None => ConnectionState::Connected,
            },
            None => ConnectionState::Terminated,
        }
    }

    #[must_use]
    pub fn session_of(&self, connection_id: &ConnectionId) -> Option<SessionId> {
        self.connections
            .get(connection_id)
            .and_then(|c| c.session.clone())
    }

    /// Add the connection to a session. Returns the members already present,
    /// or `None` if the connection is unknown or already in a session.
    pub fn join(
        &self,
        connection_id: &ConnectionId,
        session_id: &SessionId,
    ) -> Option<Vec<ConnectionId>> {
        {
            let mut entry = self.connections.get_mut(connection_id)?;
            if entry.session.is_some() {
                return None;
            }
            entry.session = Some(session_id.clone());
        }

        let mut members = self.sessions.entry(session_id.clone()).or_default();
        let existing = members.clone();
        members.push(connection_id.clone());
        drop(members);

        info!(
            session_id = %session_id,
            connection_id = %connection_id,
            participants = existing.len() + 1,
            "Participant joined session"
        );
        Some(existing)
    }

    /// Remove the connection from its session. Returns the session and how
    /// many members remain.
    pub fn leave(&self, connection_id: &ConnectionId) -> Option<(SessionId, usize)> {
        let session_id = self.connections.get_mut(connection_id)?.session.take()?;

        let remaining = match self.sessions.get_mut(&session_id) {
            Some(mut members) => {
                members.retain(|c| c != connection_id);
                members.len()
            }
            None => 0,
        };
        if remaining == 0 {
            self.sessions.remove_if(&session_id, |_, members| members.is_empty());
            debug!(session_id = %session_id, "Session has no more participants");
        }

        info!(
            session_id = %session_id,
            connection_id = %connection_id,
            remaining,
            "Participant left session"
        );
        Some((session_id, remaining))
    }

    #[must_use]
    pub fn participants(&self, session_id: &SessionId) -> Vec<ConnectionId> {
        self.sessions
            .get(session_id)
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Queue an event for one connection. Frames for a full queue are dropped.
    pub fn send_to(&self, connection_id: &ConnectionId, event: ServerEvent) -> bool {
        let Some(entry) = self.connections.get(connection_id) else {
            return false;
        };
        if !entry.alive.load(Ordering::Acquire) {
            return false;
        }
        match entry.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    connection_id = %connection_id,
                    event = event.name(),
                    "Outbound queue full, dropping frame for slow client"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                entry.alive.store(false, Ordering::Release);
                false
            }
        }
    }

    /// Send call-setup data within a session: to `to` when it is another
    /// member of the session, otherwise to every member except `from`.
    pub fn relay(
        &self,
        session_id: &SessionId,
        from: &ConnectionId,
        to: Option<&ConnectionId>,
        event: &ServerEvent,
    ) -> usize {
        let members = self.participants(session_id);
        let targets: Vec<&ConnectionId> = match to {
            Some(target) if target != from && members.contains(target) => vec![target],
            _ => members.iter().filter(|c| *c != from).collect(),
        };

        targets
            .into_iter()
            .filter(|target| self.send_to(target, event.clone()))
            .count()
    }

    /// Send to every member of the session, optionally skipping one
    pub fn broadcast(
        &self,
        session_id: &SessionId,
        event: &ServerEvent,
        except: Option<&ConnectionId>,
    ) -> usize {
        self.participants(session_id)
            .iter()
            .filter(|c| Some(*c) != except)
            .filter(|c| self.send_to(c, event.clone()))
            .count()
    }
}
