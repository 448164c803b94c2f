use std::fmt;

use localtime::LocalTime;
use tempest::node::NodeId;

use crate::{Address, ConnId};

/// A peer session. Created on the first successful hello from a peer,
/// destroyed when its connection closes or a newer session for the same
/// peer replaces it.
#[derive(Debug, Clone)]
pub struct Session {
    /// Peer id.
    pub peer: NodeId,
    /// The transport connection the session operates over. Relayed
    /// sessions share the relay's connection.
    pub conn: ConnId,
    /// Set when the session is relayed through another peer.
    pub relay: Option<NodeId>,
    /// Whether announcements are forwarded over this session.
    pub forward_announcements: bool,
    /// Established since.
    pub since: LocalTime,
}

impl Session {
    pub fn is_relayed(&self) -> bool {
        self.relay.is_some()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.relay {
            Some(relay) => write!(f, "{}{} (via {relay})", self.peer, self.conn),
            None => write!(f, "{}{}", self.peer, self.conn),
        }
    }
}

/// State of an outbound lookup connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LookupState {
    /// Not yet dialed.
    #[default]
    Idle,
    /// Dial issued, transport connection pending.
    Connecting,
    /// Connection up, `CreateSession` sent, awaiting the reply.
    Greeting { conn: ConnId },
    /// Session established with the node at the far side.
    Connected {
        peer: NodeId,
        conn: ConnId,
        since: LocalTime,
    },
    /// Waiting to retry after a failure.
    Backoff { retry_at: LocalTime },
    /// Shut down.
    Closed,
}

/// An outbound lookup: an endpoint this node actively dials and keeps
/// dialing, with backoff, until a session is established.
#[derive(Debug, Clone)]
pub struct Lookup {
    pub addr: Address,
    pub state: LookupState,

    /// Consecutive failed connection attempts. Reset on success.
    attempts: usize,
}

impl Lookup {
    pub fn new(addr: Address) -> Self {
        Self {
            addr,
            state: LookupState::Idle,
            attempts: 0,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts
    }

    pub fn attempted(&mut self) {
        self.attempts += 1;
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, LookupState::Connected { .. })
    }

    /// The connection in use, if any.
    pub fn conn(&self) -> Option<ConnId> {
        match self.state {
            LookupState::Greeting { conn } | LookupState::Connected { conn, .. } => Some(conn),
            _ => None,
        }
    }

    pub fn to_connecting(&mut self) {
        self.state = LookupState::Connecting;
    }

    pub fn to_greeting(&mut self, conn: ConnId) {
        self.state = LookupState::Greeting { conn };
    }

    pub fn to_connected(&mut self, peer: NodeId, conn: ConnId, since: LocalTime) {
        self.attempts = 0;
        self.state = LookupState::Connected { peer, conn, since };
    }

    pub fn to_backoff(&mut self, retry_at: LocalTime) {
        self.state = LookupState::Backoff { retry_at };
    }

    pub fn to_closed(&mut self) {
        self.state = LookupState::Closed;
    }
}
