//! Topic registration and matching.
//!
//! The factory keeps the names of locally registered readers and writers,
//! routes inbound announcements to their local counterparts, and tracks
//! which peers are attached to which elements. It produces the session
//! messages to send; the service routes them.
use std::collections::{BTreeSet, HashMap, HashSet};

use localtime::LocalTime;
use log::*;

use tempest::hub::Registry;
use tempest::node::NodeId;
use tempest::policy::ReaderConfig;
use tempest::sample::WireSample;
use tempest::topic::{Attach, Key};

use crate::service::message::Message;

pub struct TopicFactory<R> {
    local: NodeId,
    registry: R,
    reader_names: BTreeSet<String>,
    writer_names: BTreeSet<String>,
    /// Reader side: peers that announced a writer, by topic.
    remote_writers: HashMap<String, BTreeSet<NodeId>>,
    /// Reader side: topics we have attached to, per peer.
    attached: HashSet<(NodeId, String)>,
    /// Reader side: keys announced by each peer, per topic.
    known_keys: HashMap<(NodeId, String), BTreeSet<Key>>,
    /// Writer side: peers attached to a topic.
    subscribers: HashSet<(NodeId, String)>,
    /// Writer side: elements each peer reader is attached to.
    elements: HashSet<(NodeId, String, Key)>,
}

impl<R: Registry> TopicFactory<R> {
    pub fn new(local: NodeId, registry: R) -> Self {
        Self {
            local,
            registry,
            reader_names: BTreeSet::new(),
            writer_names: BTreeSet::new(),
            remote_writers: HashMap::new(),
            attached: HashSet::new(),
            known_keys: HashMap::new(),
            subscribers: HashSet::new(),
            elements: HashSet::new(),
        }
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn reader_names(&self) -> Vec<String> {
        self.reader_names.iter().cloned().collect()
    }

    pub fn writer_names(&self) -> Vec<String> {
        self.writer_names.iter().cloned().collect()
    }

    /// Record a local reader registration. Returns whether the name is
    /// new.
    pub fn register_reader(&mut self, topic: &str) -> bool {
        self.reader_names.insert(topic.to_owned())
    }

    /// Record a local writer registration. Returns whether the name is
    /// new.
    pub fn register_writer(&mut self, topic: &str) -> bool {
        self.writer_names.insert(topic.to_owned())
    }

    /// A peer announced a topic reader: if we write the topic, offer it
    /// our keys.
    pub fn on_announce_reader(&mut self, topic: &str, peer: &NodeId) -> Vec<(NodeId, Message)> {
        if !self.registry.has_writer(topic) {
            return Vec::new();
        }
        let keys = self.registry.writer_keys(topic);
        if keys.is_empty() {
            return Vec::new();
        }
        debug!(target: "service", "Topic reader `{topic}` announced (peer = `{peer}`)");

        vec![(
            peer.clone(),
            Message::AnnounceKeys {
                topic: topic.to_owned(),
                from: self.local.clone(),
                keys,
            },
        )]
    }

    /// A peer announced a topic writer: if we read the topic, attach to
    /// it.
    pub fn on_announce_writer(&mut self, topic: &str, peer: &NodeId) -> Vec<(NodeId, Message)> {
        self.remote_writers
            .entry(topic.to_owned())
            .or_default()
            .insert(peer.clone());

        if !self.registry.has_reader(topic) {
            return Vec::new();
        }
        debug!(target: "service", "Topic writer `{topic}` announced (peer = `{peer}`)");

        if self.attached.insert((peer.clone(), topic.to_owned())) {
            vec![(
                peer.clone(),
                Message::AttachTopic {
                    topic: topic.to_owned(),
                    from: self.local.clone(),
                },
            )]
        } else {
            // Duplicate announcement; the subscription already exists.
            Vec::new()
        }
    }

    /// Bulk topic announcement, sent by peers on session establishment.
    pub fn on_announce_topics(
        &mut self,
        readers: &[String],
        writers: &[String],
        peer: &NodeId,
    ) -> Vec<(NodeId, Message)> {
        let mut msgs = Vec::new();

        for topic in readers {
            msgs.extend(self.on_announce_reader(topic, peer));
        }
        for topic in writers {
            msgs.extend(self.on_announce_writer(topic, peer));
        }
        msgs
    }

    /// A peer attached to one of our topics: announce the keys we
    /// produce.
    pub fn on_attach_topic(&mut self, topic: &str, peer: &NodeId) -> Vec<(NodeId, Message)> {
        self.subscribers.insert((peer.clone(), topic.to_owned()));

        if !self.registry.has_writer(topic) {
            return Vec::new();
        }
        let keys = self.registry.writer_keys(topic);
        if keys.is_empty() {
            return Vec::new();
        }
        vec![(
            peer.clone(),
            Message::AnnounceKeys {
                topic: topic.to_owned(),
                from: self.local.clone(),
                keys,
            },
        )]
    }

    /// A peer detached from a topic: tear down its element subscriptions.
    pub fn on_detach_topic(&mut self, topic: &str, peer: &NodeId) {
        self.subscribers.remove(&(peer.clone(), topic.to_owned()));

        let elements = std::mem::take(&mut self.elements);
        for (p, t, key) in elements {
            if &p == peer && t == topic {
                self.registry.reader_detached(&t, &key);
            } else {
                self.elements.insert((p, t, key));
            }
        }
    }

    /// A peer announced the keys it produces on a topic: attach every
    /// local reader to the keys it wants, once per key.
    pub fn on_announce_keys(
        &mut self,
        topic: &str,
        peer: &NodeId,
        keys: Vec<Key>,
    ) -> Vec<(NodeId, Message)> {
        let known = self
            .known_keys
            .entry((peer.clone(), topic.to_owned()))
            .or_default();
        let fresh: Vec<Key> = keys.into_iter().filter(|k| known.insert(k.clone())).collect();

        if fresh.is_empty() {
            return Vec::new();
        }
        for key in &fresh {
            self.registry.writer_attached(topic, key);
        }
        let mut msgs = Vec::new();
        for Attach { filter, spec } in self.registry.reader_attaches(topic) {
            let wanted = filter.select(&fresh);
            if wanted.is_empty() {
                continue;
            }
            msgs.push((
                peer.clone(),
                Message::AttachElements {
                    topic: topic.to_owned(),
                    from: self.local.clone(),
                    keys: wanted,
                    spec,
                },
            ));
        }
        msgs
    }

    /// A peer reader attached to our elements: serve the late-join replay
    /// and stream subsequent publishes.
    pub fn on_attach_elements(
        &mut self,
        topic: &str,
        peer: &NodeId,
        keys: Vec<Key>,
        spec: &ReaderConfig,
        now: LocalTime,
    ) -> Vec<(NodeId, Message)> {
        let mut msgs = Vec::new();

        for key in keys {
            let samples = self.registry.replay(topic, &key, spec, now);
            if !samples.is_empty() {
                msgs.push((
                    peer.clone(),
                    Message::Samples {
                        topic: topic.to_owned(),
                        key: key.clone(),
                        samples,
                    },
                ));
            }
            if self
                .elements
                .insert((peer.clone(), topic.to_owned(), key.clone()))
            {
                self.registry.reader_attached(topic, &key);
            }
        }
        msgs
    }

    /// Samples received for one of our elements.
    pub fn on_samples(&mut self, topic: &str, key: &Key, samples: Vec<WireSample>) {
        self.registry.deliver(topic, key, samples);
    }

    /// A local reader was registered: subscribe it to every matching key
    /// already announced, with its own retention spec, and attach to
    /// writers we haven't attached to yet.
    pub fn on_local_reader(&mut self, topic: &str, attach: &Attach) -> Vec<(NodeId, Message)> {
        let mut msgs = Vec::new();

        for peer in self
            .remote_writers
            .get(topic)
            .into_iter()
            .flatten()
            .cloned()
            .collect::<Vec<_>>()
        {
            if self.attached.insert((peer.clone(), topic.to_owned())) {
                msgs.push((
                    peer.clone(),
                    Message::AttachTopic {
                        topic: topic.to_owned(),
                        from: self.local.clone(),
                    },
                ));
            }
        }
        for ((peer, t), keys) in &self.known_keys {
            if t != topic {
                continue;
            }
            let keys = keys.iter().cloned().collect::<Vec<_>>();
            let wanted = attach.filter.select(&keys);
            if wanted.is_empty() {
                continue;
            }
            msgs.push((
                peer.clone(),
                Message::AttachElements {
                    topic: topic.to_owned(),
                    from: self.local.clone(),
                    keys: wanted,
                    spec: attach.spec.clone(),
                },
            ));
        }
        msgs
    }

    /// A local writer was registered: announce its key to attached
    /// subscribers.
    pub fn on_local_writer(&mut self, topic: &str, key: &Key) -> Vec<(NodeId, Message)> {
        self.subscribers
            .iter()
            .filter(|(_, t)| t == topic)
            .map(|(peer, _)| {
                (
                    peer.clone(),
                    Message::AnnounceKeys {
                        topic: topic.to_owned(),
                        from: self.local.clone(),
                        keys: vec![key.clone()],
                    },
                )
            })
            .collect()
    }

    /// A local writer published a sample: stream it to every attached
    /// peer reader.
    pub fn on_publish(
        &mut self,
        topic: &str,
        key: &Key,
        sample: WireSample,
    ) -> Vec<(NodeId, Message)> {
        self.elements
            .iter()
            .filter(|(_, t, k)| t == topic && k == key)
            .map(|(peer, _, _)| {
                (
                    peer.clone(),
                    Message::Samples {
                        topic: topic.to_owned(),
                        key: key.clone(),
                        samples: vec![sample.clone()],
                    },
                )
            })
            .collect()
    }

    /// A peer session was destroyed: drop all state for the peer and
    /// rebalance the counterpart counts.
    pub fn session_destroyed(&mut self, peer: &NodeId) {
        self.remote_writers.retain(|_, peers| {
            peers.remove(peer);
            true
        });
        self.attached.retain(|(p, _)| p != peer);
        self.subscribers.retain(|(p, _)| p != peer);

        let known = std::mem::take(&mut self.known_keys);
        for ((p, topic), keys) in known {
            if &p == peer {
                for key in keys {
                    self.registry.writer_detached(&topic, &key);
                }
            } else {
                self.known_keys.insert((p, topic), keys);
            }
        }
        let elements = std::mem::take(&mut self.elements);
        for (p, topic, key) in elements {
            if &p == peer {
                self.registry.reader_detached(&topic, &key);
            } else {
                self.elements.insert((p, topic, key));
            }
        }
    }
}
