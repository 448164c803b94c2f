//! The node's discovery and session control plane.
//!
//! The service is a deterministic state machine: the transport feeds it
//! connection events and decoded messages, the hub feeds it topic events,
//! and it emits I/O actions through its [`Outbox`]. It owns the session
//! registry, the outbound lookup state machines and the topic factory.
#![warn(clippy::unwrap_used)]
pub mod config;
pub mod forwarder;
pub mod io;
pub mod message;
pub mod session;
pub mod topics;
pub mod watcher;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;

use localtime::LocalTime;
use log::*;
use once_cell::sync::Lazy;

use tempest::hub;
use tempest::hub::Registry;
use tempest::node::NodeId;
use tempest::sample::WireSample;
use tempest::topic::{Attach, Key};

pub use crate::service::config::Config;
pub use crate::service::io::{Io, Outbox};
pub use crate::service::message::{Message, NodeRef};
pub use crate::service::session::{Lookup, LookupState, Session};
pub use crate::service::topics::TopicFactory;
pub use crate::service::watcher::{Teardown, Watcher};
use crate::{Address, ConnId, Link};

/// The agent string advertised on session establishment.
pub static USER_AGENT: Lazy<String> =
    Lazy::new(|| format!("/tempest:{}/", env!("CARGO_PKG_VERSION")));

/// General service error.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("config: {0}")]
    Config(#[from] crate::AddressParseError),
}

/// Why a connection is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// A newer session with the same peer replaced this connection.
    Conflict,
    /// Operator requested disconnect.
    Command,
    /// The service is shutting down.
    Shutdown,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conflict => write!(f, "conflict"),
            Self::Command => write!(f, "command"),
            Self::Shutdown => write!(f, "shutdown"),
        }
    }
}

/// Commands sent to the service by the operator or the hub runtime.
pub enum Command {
    /// Dial an additional lookup endpoint.
    Connect(Address),
    /// A local reader was registered on a topic.
    AttachReader { topic: String, attach: Attach },
    /// A local writer was registered on a topic, producing a key.
    AttachWriter { topic: String, key: Key },
    /// A local writer published a sample.
    Publish {
        topic: String,
        key: Key,
        sample: WireSample,
    },
    /// Re-announce all local topics to all peers.
    AnnounceTopics,
    /// Shut the service down.
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connect(addr) => write!(f, "Connect({addr})"),
            Self::AttachReader { topic, .. } => write!(f, "AttachReader({topic})"),
            Self::AttachWriter { topic, key } => write!(f, "AttachWriter({topic}, {key})"),
            Self::Publish { topic, key, .. } => write!(f, "Publish({topic}, {key})"),
            Self::AnnounceTopics => write!(f, "AnnounceTopics"),
            Self::Shutdown => write!(f, "Shutdown"),
        }
    }
}

/// The node service.
pub struct Service<R> {
    /// Service configuration.
    config: Config,
    /// Local node id.
    id: NodeId,
    /// Local topic registrations and matching state.
    topics: TopicFactory<R>,
    /// Peer sessions.
    sessions: Sessions,
    /// Outbound lookups, from configuration and commands.
    lookups: Vec<Lookup>,
    /// One-hop routes learned from relayed announcements.
    routes: HashMap<NodeId, NodeId>,
    /// Connection-close hooks.
    watcher: Watcher,
    /// I/O outbox.
    outbox: Outbox,
    /// Clock. Tells the time.
    clock: LocalTime,
    /// Set once the service is initialized.
    started_at: Option<LocalTime>,
    /// Set once the service is shut down.
    shutdown: bool,
}

impl<R: Registry> Service<R> {
    pub fn new(id: NodeId, config: Config, registry: R) -> Self {
        Self {
            config,
            topics: TopicFactory::new(id.clone(), registry),
            id,
            sessions: Sessions::default(),
            lookups: Vec::new(),
            routes: HashMap::new(),
            watcher: Watcher::default(),
            outbox: Outbox::default(),
            clock: LocalTime::default(),
            started_at: None,
            shutdown: false,
        }
    }

    /// Get the local node id.
    pub fn node_id(&self) -> &NodeId {
        &self.id
    }

    /// Get the local service time.
    pub fn local_time(&self) -> LocalTime {
        self.clock
    }

    /// Whether the service was initialized, and if so, at what time.
    pub fn started(&self) -> Option<LocalTime> {
        self.started_at
    }

    /// Get service configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Get the existing sessions.
    pub fn sessions(&self) -> &Sessions {
        &self.sessions
    }

    /// Get a session by peer id.
    pub fn session(&self, peer: &NodeId) -> Option<&Session> {
        self.sessions.get(peer)
    }

    /// Get the outbound lookups.
    pub fn lookups(&self) -> &[Lookup] {
        &self.lookups
    }

    /// Get the topic factory.
    pub fn topics(&self) -> &TopicFactory<R> {
        &self.topics
    }

    /// Return the next i/o action to execute.
    #[allow(clippy::should_implement_trait)]
    pub fn next(&mut self) -> Option<Io> {
        self.outbox.next()
    }

    /// Get I/O outbox.
    pub fn outbox_mut(&mut self) -> &mut Outbox {
        &mut self.outbox
    }

    /// Initialize the service: dial the configured lookup endpoints.
    /// Configuration errors surface here, and the node starts no outbound
    /// lookup when they do.
    pub fn initialize(&mut self, time: LocalTime) -> Result<(), Error> {
        debug!(target: "service", "Init @{}", time.as_millis());

        self.clock = time;
        self.started_at = Some(time);

        let mut lookups = Vec::new();
        for addr in &self.config.connect {
            lookups.push(Lookup::new(addr.parse::<Address>()?));
        }
        self.lookups = lookups;

        for i in 0..self.lookups.len() {
            self.connect_lookup(i);
        }
        Ok(())
    }

    /// Update the service clock.
    pub fn tick(&mut self, now: LocalTime) {
        if now >= self.clock {
            self.clock = now;
        }
    }

    /// Run periodic work: retry lookups whose backoff has expired.
    pub fn wake(&mut self) {
        if self.shutdown {
            return;
        }
        let now = self.clock;
        for i in 0..self.lookups.len() {
            if let LookupState::Backoff { retry_at } = self.lookups[i].state {
                if now >= retry_at {
                    self.connect_lookup(i);
                }
            }
        }
    }

    /// Handle an operator or hub command.
    pub fn command(&mut self, cmd: Command) {
        debug!(target: "service", "Received command {:?}", cmd);

        match cmd {
            Command::Connect(addr) => {
                if self.lookups.iter().any(|l| l.addr == addr) {
                    return;
                }
                self.lookups.push(Lookup::new(addr));
                self.connect_lookup(self.lookups.len() - 1);
            }
            Command::AttachReader { topic, attach } => {
                self.topics.register_reader(&topic);
                self.announce_reader(&topic, NodeRef::direct(self.id.clone()), None);

                let msgs = self.topics.on_local_reader(&topic, &attach);
                self.send_all(msgs);
            }
            Command::AttachWriter { topic, key } => {
                self.topics.register_writer(&topic);
                self.announce_writer(&topic, NodeRef::direct(self.id.clone()), None);

                let msgs = self.topics.on_local_writer(&topic, &key);
                self.send_all(msgs);
            }
            Command::Publish { topic, key, sample } => {
                let msgs = self.topics.on_publish(&topic, &key, sample);
                self.send_all(msgs);
            }
            Command::AnnounceTopics => {
                self.announce_topics(
                    self.topics.reader_names(),
                    self.topics.writer_names(),
                    NodeRef::direct(self.id.clone()),
                    None,
                );
            }
            Command::Shutdown => self.shutdown(),
        }
    }

    /// Bridge a hub event into the service.
    pub fn hub_event(&mut self, event: hub::Event) {
        match event {
            hub::Event::ReaderRegistered { topic, attach } => {
                self.command(Command::AttachReader { topic, attach })
            }
            hub::Event::WriterRegistered { topic, key } => {
                self.command(Command::AttachWriter { topic, key })
            }
            hub::Event::Published { topic, key, sample } => {
                self.command(Command::Publish { topic, key, sample })
            }
        }
    }

    /// Shut the service down: drop all sessions and lookups.
    pub fn shutdown(&mut self) {
        info!(target: "service", "Shutting down..");

        self.shutdown = true;

        let conns = self
            .sessions
            .iter()
            .map(|s| s.conn)
            .chain(self.lookups.iter().filter_map(|l| l.conn()))
            .collect::<HashSet<_>>();

        for conn in conns {
            self.outbox.disconnect(conn, DisconnectReason::Shutdown);
        }
        for lookup in self.lookups.iter_mut() {
            lookup.to_closed();
        }
        self.sessions.clear();
        self.routes.clear();
    }

    ////////////////////////////////////////////////////////////////////////
    // Transport events
    ////////////////////////////////////////////////////////////////////////

    /// A transport connection was established.
    pub fn connected(&mut self, conn: ConnId, addr: &Address, link: Link) {
        if self.shutdown {
            self.outbox.disconnect(conn, DisconnectReason::Shutdown);
            return;
        }
        info!(target: "service", "Connected to {addr} ({conn}) ({link:?})");

        if link.is_outbound() {
            let Some(i) = self
                .lookups
                .iter()
                .position(|l| l.state == LookupState::Connecting && &l.addr == addr)
            else {
                debug!(target: "service", "No pending lookup for {addr}; ignoring");
                return;
            };
            self.lookups[i].to_greeting(conn);
            self.watcher
                .register(conn, Teardown::LookupClosed(addr.clone()));
            self.outbox.write(
                conn,
                Message::CreateSession {
                    node: NodeRef::direct(self.id.clone()),
                },
            );
        }
        // Inbound connections become sessions when the peer says hello.
    }

    /// An outbound dial failed before a connection was established.
    pub fn dial_failed(&mut self, addr: &Address) {
        let Some(i) = self.lookups.iter().position(|l| &l.addr == addr) else {
            return;
        };
        self.backoff_lookup(i);
    }

    /// A transport connection closed, for whatever reason.
    pub fn disconnected(&mut self, conn: ConnId) {
        for teardown in self.watcher.closed(conn) {
            match teardown {
                Teardown::DestroySession(peer) => self.destroy_session(&peer, conn),
                Teardown::LookupClosed(addr) => {
                    let Some(i) = self.lookups.iter().position(|l| l.addr == addr) else {
                        continue;
                    };
                    match &self.lookups[i].state {
                        LookupState::Connected { peer, .. } => {
                            // Reconnect immediately; the backoff schedule
                            // only drives failed attempts.
                            info!(target: "service", "Lookup {addr} disconnected; reconnecting..");

                            let peer = peer.clone();
                            self.topics.session_destroyed(&peer);
                            self.routes.remove(&peer);
                            self.routes.retain(|_, via| via != &peer);
                            self.connect_lookup(i);
                        }
                        LookupState::Greeting { .. } => self.backoff_lookup(i),
                        _ => {}
                    }
                }
            }
        }
    }

    /// A message was received on a connection.
    pub fn received_message(&mut self, conn: ConnId, msg: Message) {
        if self.shutdown {
            return;
        }
        trace!(target: "service", "Received {:?} on {}", msg, conn);

        match msg {
            Message::CreateSession { node } => {
                self.handle_create_session(conn, node, None);
            }
            Message::SessionCreated { node, agent } => {
                self.handle_session_created(conn, node, agent);
            }
            Message::AnnounceReader { topic, node } => {
                if node.id == self.id {
                    return;
                }
                self.learn_route(&node);
                let msgs = self.topics.on_announce_reader(&topic, &node.id);
                if !msgs.is_empty() {
                    self.ensure_session(&node.id);
                }
                self.send_all(msgs);

                if !node.is_relayed() {
                    self.announce_reader(&topic, node, Some(conn));
                }
            }
            Message::AnnounceWriter { topic, node } => {
                if node.id == self.id {
                    return;
                }
                self.learn_route(&node);
                let msgs = self.topics.on_announce_writer(&topic, &node.id);
                if !msgs.is_empty() {
                    self.ensure_session(&node.id);
                }
                self.send_all(msgs);

                if !node.is_relayed() {
                    self.announce_writer(&topic, node, Some(conn));
                }
            }
            Message::AnnounceTopics {
                readers,
                writers,
                node,
            } => {
                if node.id == self.id {
                    return;
                }
                self.learn_route(&node);
                let msgs = self.topics.on_announce_topics(&readers, &writers, &node.id);
                if !msgs.is_empty() {
                    self.ensure_session(&node.id);
                }
                self.send_all(msgs);

                if !node.is_relayed() {
                    self.announce_topics(readers, writers, node, Some(conn));
                }
            }
            Message::AttachTopic { topic, from } => {
                let msgs = self.topics.on_attach_topic(&topic, &from);
                self.send_all(msgs);
            }
            Message::DetachTopic { topic, from } => {
                self.topics.on_detach_topic(&topic, &from);
            }
            Message::AnnounceKeys { topic, from, keys } => {
                let msgs = self.topics.on_announce_keys(&topic, &from, keys);
                self.send_all(msgs);
            }
            Message::AttachElements {
                topic,
                from,
                keys,
                spec,
            } => {
                let now = self.clock;
                let msgs = self.topics.on_attach_elements(&topic, &from, keys, &spec, now);
                self.send_all(msgs);
            }
            Message::Samples { topic, key, samples } => {
                self.topics.on_samples(&topic, &key, samples);
            }
            Message::Forward { from, to, body } => {
                self.handle_forward(conn, from, to, *body);
            }
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Announcements
    ////////////////////////////////////////////////////////////////////////

    /// Announce a topic reader on `peer` to the mesh, excluding the
    /// connection the announcement arrived on.
    pub fn announce_reader(&mut self, topic: &str, peer: NodeRef, exclude: Option<ConnId>) {
        let node = self.substitute(peer);
        debug!(target: "service", "Announcing topic reader `{topic}` (peer = `{node}`)");

        forwarder::fan_out(
            &mut self.outbox,
            &Message::AnnounceReader {
                topic: topic.to_owned(),
                node,
            },
            self.sessions.iter(),
            self.lookups.iter(),
            exclude,
        );
    }

    /// Announce a topic writer on `peer` to the mesh.
    pub fn announce_writer(&mut self, topic: &str, peer: NodeRef, exclude: Option<ConnId>) {
        let node = self.substitute(peer);
        debug!(target: "service", "Announcing topic writer `{topic}` (peer = `{node}`)");

        forwarder::fan_out(
            &mut self.outbox,
            &Message::AnnounceWriter {
                topic: topic.to_owned(),
                node,
            },
            self.sessions.iter(),
            self.lookups.iter(),
            exclude,
        );
    }

    /// Bulk-announce topics on `peer` to the mesh.
    pub fn announce_topics(
        &mut self,
        readers: Vec<String>,
        writers: Vec<String>,
        peer: NodeRef,
        exclude: Option<ConnId>,
    ) {
        if readers.is_empty() && writers.is_empty() {
            return;
        }
        let node = self.substitute(peer);
        debug!(
            target: "service",
            "Announcing topics (readers = [{}], writers = [{}], peer = `{node}`)",
            readers.join(", "),
            writers.join(", ")
        );
        forwarder::fan_out(
            &mut self.outbox,
            &Message::AnnounceTopics {
                readers,
                writers,
                node,
            },
            self.sessions.iter(),
            self.lookups.iter(),
            exclude,
        );
    }

    /// The announcement substitution rule: when the announced node has an
    /// established session or lookup connection with us, downstream
    /// listeners are given a ref relayed through us, so they reach it over
    /// that connection.
    fn substitute(&self, peer: NodeRef) -> NodeRef {
        if peer.id != self.id
            && (self.sessions.contains(&peer.id) || self.direct_conn(&peer.id).is_some())
        {
            NodeRef::relayed(peer.id, self.id.clone())
        } else {
            peer
        }
    }

    ////////////////////////////////////////////////////////////////////////
    // Sessions
    ////////////////////////////////////////////////////////////////////////

    fn handle_create_session(&mut self, conn: ConnId, node: NodeRef, relay: Option<NodeId>) {
        let peer = node.id;
        if peer == self.id {
            warn!(target: "service", "Dropping session request from ourselves");
            return;
        }
        let forward_announcements = relay.is_none();
        self.create_or_get(peer.clone(), conn, relay, forward_announcements);
        self.send_to(
            &peer,
            Message::SessionCreated {
                node: NodeRef::direct(self.id.clone()),
                agent: USER_AGENT.clone(),
            },
        );
        // Let the new peer know what we have.
        let readers = self.topics.reader_names();
        let writers = self.topics.writer_names();
        if !readers.is_empty() || !writers.is_empty() {
            self.send_to(
                &peer,
                Message::AnnounceTopics {
                    readers,
                    writers,
                    node: NodeRef::direct(self.id.clone()),
                },
            );
        }
    }

    fn handle_session_created(&mut self, conn: ConnId, node: NodeRef, agent: String) {
        let Some(i) = self
            .lookups
            .iter()
            .position(|l| l.state == LookupState::Greeting { conn })
        else {
            debug!(target: "service", "Unsolicited session reply on {conn}; ignoring");
            return;
        };
        let peer = node.id.clone();
        info!(
            target: "service",
            "Established node session (peer = `{peer}`, agent = {agent}, addr = {})",
            self.lookups[i].addr
        );
        self.lookups[i].to_connected(peer, conn, self.clock);

        // Announce our local reader and writer names to the peer.
        let readers = self.topics.reader_names();
        let writers = self.topics.writer_names();
        if !readers.is_empty() || !writers.is_empty() {
            self.outbox.write(
                conn,
                Message::AnnounceTopics {
                    readers,
                    writers,
                    node: NodeRef::direct(self.id.clone()),
                },
            );
        }
    }

    /// Create a session for a peer, or return the existing one. A session
    /// for the same peer on a different connection is destroyed first and
    /// replaced.
    fn create_or_get(
        &mut self,
        peer: NodeId,
        conn: ConnId,
        relay: Option<NodeId>,
        forward_announcements: bool,
    ) -> bool {
        if let Some(existing) = self.sessions.get(&peer) {
            if existing.conn == conn {
                return false;
            }
            let old = existing.clone();
            warn!(
                target: "service",
                "Session for {peer} on {} replaced by a newer one on {conn}", old.conn
            );
            self.watcher
                .unregister(old.conn, &Teardown::DestroySession(peer.clone()));
            self.destroy_session(&peer, old.conn);

            if !old.is_relayed()
                && self.sessions.on_conn(old.conn).next().is_none()
                && !self.is_lookup_conn(old.conn)
            {
                self.outbox.disconnect(old.conn, DisconnectReason::Conflict);
            }
        }
        let session = Session {
            peer: peer.clone(),
            conn,
            relay,
            forward_announcements,
            since: self.clock,
        };
        info!(target: "service", "Established node session (peer = `{session}`)");

        self.sessions.insert(session);
        self.watcher.register(conn, Teardown::DestroySession(peer));

        true
    }

    /// Destroy the session for `peer`, if it is still the one operating
    /// over `conn`. A stale teardown for a replaced session is a no-op.
    fn destroy_session(&mut self, peer: &NodeId, conn: ConnId) {
        if self.sessions.get(peer).map(|s| s.conn) != Some(conn) {
            return;
        }
        if let Some(session) = self.sessions.remove(peer) {
            info!(target: "service", "Destroyed node session (peer = `{session}`)");
        }
        self.topics.session_destroyed(peer);
        self.routes.remove(peer);
        self.routes.retain(|_, via| via != peer);
    }

    fn is_lookup_conn(&self, conn: ConnId) -> bool {
        self.lookups.iter().any(|l| l.conn() == Some(conn))
    }

    ////////////////////////////////////////////////////////////////////////
    // Lookups
    ////////////////////////////////////////////////////////////////////////

    fn connect_lookup(&mut self, i: usize) {
        let lookup = &mut self.lookups[i];
        debug!(target: "service", "Connecting to lookup {} (attempts = {})..", lookup.addr, lookup.attempts());

        lookup.to_connecting();
        self.outbox.connect(lookup.addr.clone());
    }

    fn backoff_lookup(&mut self, i: usize) {
        let clock = self.clock;
        let lookup = &mut self.lookups[i];
        let delay = self.config.retry_delay(lookup.attempts());

        debug!(
            target: "service",
            "Lookup {} unreachable; retrying in {delay} (attempts = {})",
            lookup.addr,
            lookup.attempts() + 1,
        );
        lookup.attempted();
        lookup.to_backoff(clock + delay);
        self.outbox.wakeup(delay);
    }

    ////////////////////////////////////////////////////////////////////////
    // Routing
    ////////////////////////////////////////////////////////////////////////

    /// Remember how to reach a node announced through a relay.
    fn learn_route(&mut self, node: &NodeRef) {
        if let Some(via) = &node.via {
            if node.id != self.id {
                self.routes.insert(node.id.clone(), via.clone());
            }
        }
    }

    /// Establish a session with a peer we only know through a relay, so
    /// that subscriptions can flow. No-op when the peer is directly
    /// reachable or a session already exists.
    fn ensure_session(&mut self, peer: &NodeId) {
        if peer == &self.id || self.direct_conn(peer).is_some() || self.sessions.contains(peer) {
            return;
        }
        let Some(via) = self.routes.get(peer).cloned() else {
            return;
        };
        let Some(conn) = self.direct_conn(&via) else {
            return;
        };
        debug!(target: "service", "Requesting relayed session with {peer} via {via}");

        self.outbox.write(
            conn,
            Message::Forward {
                from: self.id.clone(),
                to: peer.clone(),
                body: Box::new(Message::CreateSession {
                    node: NodeRef::direct(self.id.clone()),
                }),
            },
        );
    }

    /// Handle a relay envelope: deliver it if it is for us, else pass it
    /// to the target's session, one hop only.
    fn handle_forward(&mut self, conn: ConnId, from: NodeId, to: NodeId, body: Message) {
        if to == self.id {
            // Whatever the payload, the envelope tells us the sender is
            // reachable through the relay at the far end of this
            // connection.
            if let Some(via) = self.direct_peer(conn) {
                if via != from && from != self.id {
                    self.routes.insert(from.clone(), via);
                }
            }
            match body {
                // A session request through a relay creates a relayed
                // session: it operates over the relay's connection.
                Message::CreateSession { node } => {
                    let relay = self.direct_peer(conn);
                    self.handle_create_session(conn, node, relay);
                }
                Message::SessionCreated { node, agent } => {
                    info!(
                        target: "service",
                        "Established relayed node session (peer = `{}`, agent = {agent})", node.id
                    );
                    let relay = self.direct_peer(conn);
                    self.create_or_get(node.id, conn, relay, false);
                }
                body => self.received_message(conn, body),
            }
            return;
        }
        // Route one hop: the target must have a session or lookup with us.
        let Some(target) = self.conn_of(&to) else {
            warn!(target: "service", "Cannot forward to unknown peer {to} (from {from})");
            return;
        };
        if target == conn {
            warn!(target: "service", "Not forwarding message for {to} back on its own connection");
            return;
        }
        self.outbox.write(
            target,
            Message::Forward {
                from,
                to,
                body: Box::new(body),
            },
        );
    }

    /// The non-relayed peer at the far end of a connection, if any.
    fn direct_peer(&self, conn: ConnId) -> Option<NodeId> {
        if let Some(session) = self.sessions.on_conn(conn).find(|s| !s.is_relayed()) {
            return Some(session.peer.clone());
        }
        self.lookups.iter().find_map(|l| match &l.state {
            LookupState::Connected { peer, conn: c, .. } if *c == conn => Some(peer.clone()),
            _ => None,
        })
    }

    /// The connection used to reach a peer directly.
    fn direct_conn(&self, peer: &NodeId) -> Option<ConnId> {
        if let Some(session) = self.sessions.get(peer) {
            if !session.is_relayed() {
                return Some(session.conn);
            }
        }
        self.lookups.iter().find_map(|l| match &l.state {
            LookupState::Connected { peer: p, conn, .. } if p == peer => Some(*conn),
            _ => None,
        })
    }

    /// Any connection on which the peer can be reached, directly or over
    /// its relayed session.
    fn conn_of(&self, peer: &NodeId) -> Option<ConnId> {
        self.direct_conn(peer)
            .or_else(|| self.sessions.get(peer).map(|s| s.conn))
    }

    /// Send a message to a peer: over its direct session or lookup
    /// connection, over its relayed session, or through a learned route.
    /// Unroutable peers are logged and the message dropped.
    fn send_to(&mut self, peer: &NodeId, msg: Message) {
        if let Some(conn) = self.direct_conn(peer) {
            self.outbox.write(conn, msg);
            return;
        }
        if let Some(session) = self.sessions.get(peer) {
            // Relayed session: wrap for the relay to pass on.
            let conn = session.conn;
            self.outbox.write(
                conn,
                Message::Forward {
                    from: self.id.clone(),
                    to: peer.clone(),
                    body: Box::new(msg),
                },
            );
            return;
        }
        if let Some(via) = self.routes.get(peer).cloned() {
            if let Some(conn) = self.direct_conn(&via) {
                self.outbox.write(
                    conn,
                    Message::Forward {
                        from: self.id.clone(),
                        to: peer.clone(),
                        body: Box::new(msg),
                    },
                );
                return;
            }
        }
        warn!(target: "service", "No route to peer {peer}; dropping {msg:?}");
    }

    fn send_all(&mut self, msgs: Vec<(NodeId, Message)>) {
        for (peer, msg) in msgs {
            self.send_to(&peer, msg);
        }
    }
}

/// Holds the peer sessions, indexed by peer id and by connection. The two
/// indexes are kept mutually consistent.
#[derive(Debug, Default)]
pub struct Sessions {
    by_peer: HashMap<NodeId, Session>,
    by_conn: HashMap<ConnId, HashSet<NodeId>>,
}

impl Sessions {
    pub fn get(&self, peer: &NodeId) -> Option<&Session> {
        self.by_peer.get(peer)
    }

    pub fn contains(&self, peer: &NodeId) -> bool {
        self.by_peer.contains_key(peer)
    }

    pub fn len(&self) -> usize {
        self.by_peer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_peer.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.by_peer.values()
    }

    /// The sessions operating over a connection.
    pub fn on_conn(&self, conn: ConnId) -> impl Iterator<Item = &Session> {
        self.by_conn
            .get(&conn)
            .into_iter()
            .flatten()
            .filter_map(|peer| self.by_peer.get(peer))
    }

    fn insert(&mut self, session: Session) {
        self.by_conn
            .entry(session.conn)
            .or_default()
            .insert(session.peer.clone());
        self.by_peer.insert(session.peer.clone(), session);
    }

    fn remove(&mut self, peer: &NodeId) -> Option<Session> {
        let session = self.by_peer.remove(peer)?;

        if let Entry::Occupied(mut e) = self.by_conn.entry(session.conn) {
            e.get_mut().remove(peer);
            if e.get().is_empty() {
                e.remove();
            }
        }
        Some(session)
    }

    fn clear(&mut self) {
        self.by_peer.clear();
        self.by_conn.clear();
    }

    /// Check that the two indexes agree. Used by tests.
    pub fn consistent(&self) -> bool {
        for (peer, session) in &self.by_peer {
            let Some(peers) = self.by_conn.get(&session.conn) else {
                return false;
            };
            if !peers.contains(peer) {
                return false;
            }
        }
        for (conn, peers) in &self.by_conn {
            for peer in peers {
                let Some(session) = self.by_peer.get(peer) else {
                    return false;
                };
                if session.conn != *conn {
                    return false;
                }
            }
        }
        true
    }
}
