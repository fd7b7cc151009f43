//! Session registry for the relay server
//!
//! This module is the single source of truth for which participants are live:
//! - Session id assignment (non-zero, strictly increasing, never reused)
//! - Address tracking so inbound datagrams can be mapped to a session
//! - Idempotent re-requests of an id by a client that lost its assignment
//! - Release on disconnect or heartbeat timeout
//!
//! Every other component checks a session here before acting on it.

use log::info;
use shared::SessionId;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Instant;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("server full ({max_sessions} sessions)")]
    ServerFull { max_sessions: usize },
}

/// A live participant connection
#[derive(Debug, Clone)]
pub struct Session {
    /// Identifier assigned by the server
    pub id: SessionId,
    /// Source address of the participant's datagrams
    pub addr: SocketAddr,
    /// When the session was assigned
    pub connected_at: Instant,
    /// Last time we received any packet from this session
    pub last_seen: Instant,
    /// Datagrams received from this session, including the assign request
    pub packets_received: u64,
}

impl Session {
    /// Creates a session marked as seen right now
    pub fn new(id: SessionId, addr: SocketAddr) -> Self {
        let now = Instant::now();
        Self {
            id,
            addr,
            connected_at: now,
            last_seen: now,
            packets_received: 1,
        }
    }

    /// Records inbound traffic from this session
    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
        self.packets_received += 1;
    }
}

/// Result of a session id request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Assignment {
    pub session: SessionId,
    /// True when a new session was created for this request
    pub fresh: bool,
}

/// Tracks every live session and hands out session ids
///
/// Ids start at 1 and only grow, so an id released by a dead session is
/// retired rather than handed to someone else.
pub struct SessionRegistry {
    /// Live sessions indexed by id
    sessions: HashMap<SessionId, Session>,
    /// Next id to hand out
    next_id: u64,
    /// Maximum number of concurrent sessions allowed
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: HashMap::new(),
            next_id: 1,
            max_sessions,
        }
    }

    /// Creates a session for `addr` with a fresh id
    ///
    /// Fails if the registry already holds `max_sessions` live sessions.
    pub fn assign(&mut self, addr: SocketAddr) -> Result<SessionId, RegistryError> {
        if self.sessions.len() >= self.max_sessions {
            return Err(RegistryError::ServerFull {
                max_sessions: self.max_sessions,
            });
        }

        let id = SessionId(self.next_id);
        self.next_id += 1;

        info!("Session {} assigned to {}", id, addr);
        self.sessions.insert(id, Session::new(id, addr));

        Ok(id)
    }

    /// Handles a client asking for its id again
    ///
    /// A live id requested from the address that owns it comes back
    /// unchanged. Otherwise the address keeps the session it already has, and
    /// an address without one gets a fresh id. An id owned by another address
    /// is never handed out.
    pub fn request_resend(
        &mut self,
        requested: SessionId,
        addr: SocketAddr,
    ) -> Result<Assignment, RegistryError> {
        let owned_by_sender = self
            .sessions
            .get(&requested)
            .is_some_and(|session| session.addr == addr);

        let existing = if owned_by_sender {
            Some(requested)
        } else {
            self.find_by_addr(addr)
        };

        match existing {
            Some(session) => {
                self.touch(session);
                Ok(Assignment {
                    session,
                    fresh: false,
                })
            }
            None => Ok(Assignment {
                session: self.assign(addr)?,
                fresh: true,
            }),
        }
    }

    pub fn lookup(&self, id: SessionId) -> Option<&Session> {
        self.sessions.get(&id)
    }

    pub fn is_live(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    /// Removes a session, returning it if it was still live
    ///
    /// Only the first release of an id returns `Some`, which is what makes
    /// session teardown happen exactly once.
    pub fn release(&mut self, id: SessionId) -> Option<Session> {
        let session = self.sessions.remove(&id)?;
        info!("Session {} released ({})", id, session.addr);
        Some(session)
    }

    pub fn find_by_addr(&self, addr: SocketAddr) -> Option<SessionId> {
        self.sessions
            .values()
            .find(|session| session.addr == addr)
            .map(|session| session.id)
    }

    /// Records inbound traffic; returns false for unknown sessions
    pub fn touch(&mut self, id: SessionId) -> bool {
        match self.sessions.get_mut(&id) {
            Some(session) => {
                session.touch();
                true
            }
            None => false,
        }
    }

    /// Ids of every live session, in ascending order
    pub fn live_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
