//! The per-process topic registry.
//!
//! A [`Hub`] owns every topic registered in the process and is the seam
//! between the typed data plane and the node control plane: the control
//! plane drives it through the untyped [`Registry`] trait, and listens on
//! the hub's event feed to learn about registrations and published
//! samples.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crossbeam_channel as chan;
use localtime::LocalTime;

use crate::node::NodeId;
use crate::policy::ReaderConfig;
use crate::sample::WireSample;
use crate::topic::{AnyTopic, Attach, Error, Key};

/// An event emitted by the hub for the node runtime.
#[derive(Debug, Clone)]
pub enum Event {
    /// A local reader was registered on the topic.
    ReaderRegistered { topic: String, attach: Attach },
    /// A local writer was registered on the topic, producing the key.
    WriterRegistered { topic: String, key: Key },
    /// A local writer published a sample.
    Published {
        topic: String,
        key: Key,
        sample: WireSample,
    },
}

/// Interface the node control plane uses to reach local topics.
pub trait Registry: Send + Sync {
    /// The local node identity.
    fn node_id(&self) -> NodeId;
    /// Names of topics with at least one local reader.
    fn reader_topics(&self) -> Vec<String>;
    /// Names of topics with at least one local writer.
    fn writer_topics(&self) -> Vec<String>;
    fn has_reader(&self, topic: &str) -> bool;
    fn has_writer(&self, topic: &str) -> bool;
    /// Keys produced by local writers of `topic`.
    fn writer_keys(&self, topic: &str) -> Vec<Key>;
    /// Per local reader of `topic`: its key filter and the retention spec
    /// to request from producers.
    fn reader_attaches(&self, topic: &str) -> Vec<Attach>;
    /// Producer-side late-join replay for one element.
    fn replay(&self, topic: &str, key: &Key, spec: &ReaderConfig, now: LocalTime)
        -> Vec<WireSample>;
    /// Deliver samples received from a remote writer to local readers.
    fn deliver(&self, topic: &str, key: &Key, samples: Vec<WireSample>);
    /// Remote counterpart accounting, for the blocking wait primitives.
    fn writer_attached(&self, topic: &str, key: &Key);
    fn writer_detached(&self, topic: &str, key: &Key);
    fn reader_attached(&self, topic: &str, key: &Key);
    fn reader_detached(&self, topic: &str, key: &Key);
}

/// The topic registry. Cheap to clone.
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

struct HubInner {
    id: NodeId,
    topics: Mutex<HashMap<String, Arc<dyn AnyTopic>>>,
    events: chan::Sender<Event>,
}

impl Hub {
    /// Create a hub for the given node identity. The returned receiver
    /// carries [`Event`]s for the node runtime; it may be dropped when the
    /// hub is used purely locally.
    pub fn new(id: NodeId) -> (Self, chan::Receiver<Event>) {
        let (events, receiver) = chan::unbounded();

        (
            Self {
                inner: Arc::new(HubInner {
                    id,
                    topics: Mutex::new(HashMap::new()),
                    events,
                }),
            },
            receiver,
        )
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.id.clone()
    }

    pub(crate) fn events(&self) -> chan::Sender<Event> {
        self.inner.events.clone()
    }

    pub(crate) fn register(&self, name: &str, topic: Arc<dyn AnyTopic>) -> Result<(), Error> {
        let mut topics = self.lock();

        if topics.contains_key(name) {
            return Err(Error::Duplicate(name.to_owned()));
        }
        topics.insert(name.to_owned(), topic);

        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn AnyTopic>>> {
        self.inner.topics.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn topic(&self, name: &str) -> Option<Arc<dyn AnyTopic>> {
        self.lock().get(name).cloned()
    }
}

impl Registry for Hub {
    fn node_id(&self) -> NodeId {
        self.inner.id.clone()
    }

    fn reader_topics(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, t)| t.has_reader())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn writer_topics(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter(|(_, t)| t.has_writer())
            .map(|(name, _)| name.clone())
            .collect()
    }

    fn has_reader(&self, topic: &str) -> bool {
        self.topic(topic).map(|t| t.has_reader()).unwrap_or(false)
    }

    fn has_writer(&self, topic: &str) -> bool {
        self.topic(topic).map(|t| t.has_writer()).unwrap_or(false)
    }

    fn writer_keys(&self, topic: &str) -> Vec<Key> {
        self.topic(topic).map(|t| t.writer_keys()).unwrap_or_default()
    }

    fn reader_attaches(&self, topic: &str) -> Vec<Attach> {
        self.topic(topic)
            .map(|t| t.reader_attaches())
            .unwrap_or_default()
    }

    fn replay(
        &self,
        topic: &str,
        key: &Key,
        spec: &ReaderConfig,
        now: LocalTime,
    ) -> Vec<WireSample> {
        self.topic(topic)
            .map(|t| t.replay(key, spec, now))
            .unwrap_or_default()
    }

    fn deliver(&self, topic: &str, key: &Key, samples: Vec<WireSample>) {
        if let Some(t) = self.topic(topic) {
            t.deliver(key, samples);
        }
    }

    fn writer_attached(&self, topic: &str, key: &Key) {
        if let Some(t) = self.topic(topic) {
            t.writer_attached(key);
        }
    }

    fn writer_detached(&self, topic: &str, key: &Key) {
        if let Some(t) = self.topic(topic) {
            t.writer_detached(key);
        }
    }

    fn reader_attached(&self, topic: &str, key: &Key) {
        if let Some(t) = self.topic(topic) {
            t.reader_attached(key);
        }
    }

    fn reader_detached(&self, topic: &str, key: &Key) {
        if let Some(t) = self.topic(topic) {
            t.reader_detached(key);
        }
    }
}
