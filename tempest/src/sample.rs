//! Samples: the events that flow over elements.
use serde::Serialize;

use crate::clock::Timestamp;
use crate::node::NodeId;

/// The kind of event a sample carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SampleEvent {
    /// A new instance of the element was created.
    Add,
    /// The element's value was replaced.
    Update,
    /// A delta was applied to the element's value through a registered
    /// updater.
    PartialUpdate,
    /// The element's instance was removed.
    Remove,
}

impl SampleEvent {
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::PartialUpdate)
    }
}

impl std::fmt::Display for SampleEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add => write!(f, "add"),
            Self::Update => write!(f, "update"),
            Self::PartialUpdate => write!(f, "partial-update"),
            Self::Remove => write!(f, "remove"),
        }
    }
}

/// A typed sample, as seen by readers and writers.
///
/// `value` is the full element value after the event was applied; it is
/// `None` for [`SampleEvent::Remove`]. For partial updates, `delta` holds
/// the encoded delta payload so it can be re-sent on the wire, while
/// `value` holds the folded result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sample<V> {
    pub event: SampleEvent,
    pub tag: Option<String>,
    pub timestamp: Timestamp,
    pub origin: NodeId,
    pub seq: u64,
    pub value: Option<V>,
    pub delta: Option<Vec<u8>>,
}

impl<V> Sample<V> {
    pub fn value(&self) -> Option<&V> {
        self.value.as_ref()
    }
}

impl<V: Serialize> Sample<V> {
    /// Encode for the wire. Partial updates carry their delta; other
    /// events carry the full value.
    pub fn to_wire(&self) -> Result<WireSample, serde_json::Error> {
        let payload = match self.event {
            SampleEvent::Remove => Vec::new(),
            SampleEvent::PartialUpdate => self.delta.clone().unwrap_or_default(),
            SampleEvent::Add | SampleEvent::Update => match &self.value {
                Some(v) => serde_json::to_vec(v)?,
                None => Vec::new(),
            },
        };
        Ok(WireSample {
            event: self.event,
            tag: self.tag.clone(),
            timestamp: self.timestamp,
            origin: self.origin.clone(),
            seq: self.seq,
            payload,
        })
    }
}

/// An untyped sample, as carried between nodes. The payload is the encoded
/// value for `Add`/`Update`, the encoded delta for `PartialUpdate`, and
/// empty for `Remove`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireSample {
    pub event: SampleEvent,
    pub tag: Option<String>,
    pub timestamp: Timestamp,
    pub origin: NodeId,
    pub seq: u64,
    pub payload: Vec<u8>,
}
