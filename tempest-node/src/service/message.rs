use std::fmt;

use tempest::node::NodeId;
use tempest::policy::ReaderConfig;
use tempest::sample::WireSample;
use tempest::topic::Key;

/// How a message names a node: directly, or relayed through a peer that
/// has a session with it. This is the wire form of the original's
/// direct/forwarded proxy pair: a relayed ref is reached by sending a
/// [`Message::Forward`] through `via`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRef {
    pub id: NodeId,
    pub via: Option<NodeId>,
}

impl NodeRef {
    pub fn direct(id: NodeId) -> Self {
        Self { id, via: None }
    }

    pub fn relayed(id: NodeId, via: NodeId) -> Self {
        Self { id, via: Some(via) }
    }

    pub fn is_relayed(&self) -> bool {
        self.via.is_some()
    }
}

impl fmt::Display for NodeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.via {
            Some(via) => write!(f, "{} (via {})", self.id, via),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Messages peers send to each other.
///
/// Announcements (`Announce*`) are idempotent and unordered; the session
/// protocol messages (`AttachTopic` and onward) are ordered per
/// connection.
#[derive(Clone, PartialEq, Eq)]
pub enum Message {
    /// Request a session. The first message sent on an outbound lookup
    /// connection, or relayed through a peer to reach a node we have no
    /// direct connection to.
    CreateSession { node: NodeRef },
    /// Session established; carries the responder's ref.
    SessionCreated { node: NodeRef, agent: String },

    /// A node has a reader for the topic.
    AnnounceReader { topic: String, node: NodeRef },
    /// A node has a writer for the topic.
    AnnounceWriter { topic: String, node: NodeRef },
    /// Bulk announcement of a node's topics, sent on session
    /// establishment.
    AnnounceTopics {
        readers: Vec<String>,
        writers: Vec<String>,
        node: NodeRef,
    },

    /// A reader-side node subscribes to a topic on a writer-side node.
    AttachTopic { topic: String, from: NodeId },
    /// Undo of [`Message::AttachTopic`].
    DetachTopic { topic: String, from: NodeId },
    /// The keys a writer-side node produces on an attached topic.
    AnnounceKeys {
        topic: String,
        from: NodeId,
        keys: Vec<Key>,
    },
    /// Subscribe to elements, with the retention spec the producer should
    /// honor for the late-join replay.
    AttachElements {
        topic: String,
        from: NodeId,
        keys: Vec<Key>,
        spec: ReaderConfig,
    },
    /// A batch of samples for one element.
    Samples {
        topic: String,
        key: Key,
        samples: Vec<WireSample>,
    },

    /// One-hop relay: deliver `body` to `to`, on behalf of `from`.
    Forward {
        from: NodeId,
        to: NodeId,
        body: Box<Message>,
    },
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CreateSession { node } => write!(f, "CreateSession({node})"),
            Self::SessionCreated { node, agent } => {
                write!(f, "SessionCreated({node}, {agent})")
            }
            Self::AnnounceReader { topic, node } => {
                write!(f, "AnnounceReader({topic}, {node})")
            }
            Self::AnnounceWriter { topic, node } => {
                write!(f, "AnnounceWriter({topic}, {node})")
            }
            Self::AnnounceTopics {
                readers,
                writers,
                node,
            } => write!(
                f,
                "AnnounceTopics(readers=[{}], writers=[{}], {node})",
                readers.join(", "),
                writers.join(", ")
            ),
            Self::AttachTopic { topic, from } => write!(f, "AttachTopic({topic}, {from})"),
            Self::DetachTopic { topic, from } => write!(f, "DetachTopic({topic}, {from})"),
            Self::AnnounceKeys { topic, from, keys } => {
                write!(f, "AnnounceKeys({topic}, {from}, {} key(s))", keys.len())
            }
            Self::AttachElements {
                topic, from, keys, ..
            } => write!(f, "AttachElements({topic}, {from}, {} key(s))", keys.len()),
            Self::Samples { topic, key, samples } => {
                write!(f, "Samples({topic}, {key}, {} sample(s))", samples.len())
            }
            Self::Forward { from, to, body } => write!(f, "Forward({from} -> {to}, {body:?})"),
        }
    }
}
