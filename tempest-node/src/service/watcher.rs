//! Connection-close bookkeeping.
//!
//! Components register teardown hooks against a connection; when the
//! transport reports the connection closed, the hooks are drained exactly
//! once, regardless of how the close came about. Hooks are data, executed
//! by the service.
use std::collections::HashMap;

use tempest::node::NodeId;

use crate::{Address, ConnId};

/// A teardown action to run when a connection closes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Teardown {
    /// Destroy the session registered for this peer.
    DestroySession(NodeId),
    /// An outbound lookup lost its connection.
    LookupClosed(Address),
}

#[derive(Debug, Default)]
pub struct Watcher {
    hooks: HashMap<ConnId, Vec<Teardown>>,
}

impl Watcher {
    /// Register a teardown hook for a connection. Duplicate registrations
    /// of the same hook collapse into one.
    pub fn register(&mut self, conn: ConnId, teardown: Teardown) {
        let hooks = self.hooks.entry(conn).or_default();

        if !hooks.contains(&teardown) {
            hooks.push(teardown);
        }
    }

    /// Remove a previously registered hook, eg. when the session it
    /// guards was replaced by a newer one.
    pub fn unregister(&mut self, conn: ConnId, teardown: &Teardown) {
        if let Some(hooks) = self.hooks.get_mut(&conn) {
            hooks.retain(|t| t != teardown);

            if hooks.is_empty() {
                self.hooks.remove(&conn);
            }
        }
    }

    /// Drain the hooks for a closed connection. A second close of the
    /// same connection yields nothing.
    pub fn closed(&mut self, conn: ConnId) -> Vec<Teardown> {
        self.hooks.remove(&conn).unwrap_or_default()
    }

    /// Registered hook count, for one connection.
    pub fn registered(&self, conn: ConnId) -> usize {
        self.hooks.get(&conn).map(Vec::len).unwrap_or(0)
    }
}
