//! Typed topics, writers and readers.
//!
//! A topic is a named channel of keyed samples. Writers produce samples
//! for a single key; readers consume samples for one key, a set of keys,
//! or all keys. Local counterparts are matched directly; remote
//! counterparts are matched by the node control plane through the hub's
//! [`Registry`][crate::hub::Registry] surface, with keys and values
//! crossing the node boundary in their serde encoding.
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crossbeam_channel as chan;
use localtime::LocalTime;
use log::warn;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::clock::Timestamp;
use crate::dispatch::Dispatcher;
use crate::history::ElementHistory;
use crate::hub::{self, Hub};
use crate::node::NodeId;
use crate::policy::{ReaderConfig, Retention, WriterConfig, UNBOUNDED};
use crate::sample::{Sample, SampleEvent, WireSample};

#[derive(Error, Debug)]
pub enum Error {
    #[error("topic `{0}` is already registered")]
    Duplicate(String),
    #[error("a writer for this key is already registered")]
    DuplicateWriter,
    #[error("no updater registered for tag `{0}`")]
    MissingUpdater(String),
    #[error("partial update on an element with no current value")]
    NoCurrentValue,
    #[error("codec: {0}")]
    Codec(#[from] serde_json::Error),
}

/// An element key, in its wire encoding.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key(Vec<u8>);

impl Key {
    pub fn encode<K: Serialize>(key: &K) -> Result<Self, Error> {
        Ok(Self(serde_json::to_vec(key)?))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for Key {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", String::from_utf8_lossy(&self.0))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

/// The keys a reader is interested in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyFilter {
    /// All keys.
    Any,
    /// A single key.
    Exact(Key),
    /// A set of keys.
    Set(BTreeSet<Key>),
}

impl KeyFilter {
    pub fn matches(&self, key: &Key) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(k) => k == key,
            Self::Set(keys) => keys.contains(key),
        }
    }

    /// Restrict a set of announced keys to this filter. When both sides
    /// specify keys, the intersection is used.
    pub fn select(&self, keys: &[Key]) -> Vec<Key> {
        keys.iter().filter(|k| self.matches(k)).cloned().collect()
    }
}

/// A reader's subscription request: which keys it wants, and the retention
/// spec the producer should honor when serving the late-join replay.
#[derive(Debug, Clone)]
pub struct Attach {
    pub filter: KeyFilter,
    pub spec: ReaderConfig,
}

type Updater<V> = Box<dyn Fn(&mut V, &[u8]) -> Result<(), serde_json::Error> + Send + Sync>;

/// A typed topic handle. Cheap to clone; all handles share state.
pub struct Topic<K, V> {
    inner: Arc<TopicInner<K, V>>,
}

impl<K, V> Clone for Topic<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct TopicInner<K, V> {
    name: String,
    node: NodeId,
    events: chan::Sender<hub::Event>,
    state: Mutex<TopicState<V>>,
    /// Wakes writers blocked on [`Writer::wait_for_readers`].
    matched: Condvar,
    key: PhantomData<fn(K) -> K>,
}

struct TopicState<V> {
    updaters: HashMap<String, Updater<V>>,
    reader_default: ReaderConfig,
    writer_default: WriterConfig,
    /// Local producer elements, by encoded key.
    writers: HashMap<Key, WriterElement<V>>,
    /// Local consumer registrations.
    readers: HashMap<u64, ReaderEntry<V>>,
    next_reader: u64,
    /// Folded current value per element, from remote writers.
    remote_values: HashMap<Key, V>,
    /// Attached remote writer elements, by key.
    remote_writers: HashMap<Key, usize>,
    /// Attached remote reader elements, by key.
    remote_readers: HashMap<Key, usize>,
}

struct WriterElement<V> {
    policy: Retention,
    history: ElementHistory<V>,
    current: Option<V>,
    /// Whether the element has a live instance, ie. the last event was not
    /// a `Remove`.
    live: bool,
    seq: u64,
}

struct ReaderEntry<V> {
    filter: KeyFilter,
    queue: Arc<Dispatcher<V>>,
}

impl<K, V> Topic<K, V>
where
    K: Serialize + Send + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    /// Register a new topic on the hub.
    pub fn new(hub: &Hub, name: impl Into<String>) -> Result<Self, Error> {
        let name = name.into();
        let inner = Arc::new(TopicInner {
            name: name.clone(),
            node: hub.node_id(),
            events: hub.events(),
            state: Mutex::new(TopicState {
                updaters: HashMap::new(),
                reader_default: ReaderConfig::default(),
                writer_default: WriterConfig::default(),
                writers: HashMap::new(),
                readers: HashMap::new(),
                next_reader: 0,
                remote_values: HashMap::new(),
                remote_writers: HashMap::new(),
                remote_readers: HashMap::new(),
            }),
            matched: Condvar::new(),
            key: PhantomData,
        });
        hub.register(&name, inner.clone())?;

        Ok(Self { inner })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Register an updater for partial updates tagged `tag`. The updater
    /// set is append-only over the topic's life.
    pub fn set_updater<D, F>(&self, tag: impl Into<String>, f: F)
    where
        D: DeserializeOwned,
        F: Fn(&mut V, D) + Send + Sync + 'static,
    {
        let updater: Updater<V> = Box::new(move |value, bytes| {
            let delta = serde_json::from_slice::<D>(bytes)?;
            f(value, delta);
            Ok(())
        });
        self.inner.lock().updaters.insert(tag.into(), updater);
    }

    /// Set the default configuration applied to readers of this topic.
    pub fn set_reader_default(&self, config: ReaderConfig) {
        self.inner.lock().reader_default = config;
    }

    /// Set the default configuration applied to writers of this topic.
    pub fn set_writer_default(&self, config: WriterConfig) {
        self.inner.lock().writer_default = config;
    }

    /// Create a writer for a single key.
    pub fn writer(&self, key: K) -> Result<Writer<K, V>, Error> {
        self.writer_with(key, WriterConfig::default())
    }

    /// Create a writer for a single key, with configuration overrides.
    pub fn writer_with(&self, key: K, config: WriterConfig) -> Result<Writer<K, V>, Error> {
        let encoded = Key::encode(&key)?;
        let mut state = self.inner.lock();
        let policy = config.or(&state.writer_default).resolve();

        if state.writers.contains_key(&encoded) {
            return Err(Error::DuplicateWriter);
        }
        state.writers.insert(
            encoded.clone(),
            WriterElement {
                policy,
                history: ElementHistory::new(),
                current: None,
                live: false,
                seq: 0,
            },
        );
        for entry in state.readers.values() {
            if entry.filter.matches(&encoded) {
                entry.queue.writer_attached();
            }
        }
        drop(state);

        self.inner
            .events
            .send(hub::Event::WriterRegistered {
                topic: self.inner.name.clone(),
                key: encoded.clone(),
            })
            .ok();

        Ok(Writer {
            topic: self.inner.clone(),
            key,
            encoded,
        })
    }

    /// Create a reader for a single key.
    pub fn reader(&self, key: &K) -> Result<Reader<K, V>, Error> {
        self.reader_with(key, ReaderConfig::default())
    }

    /// Create a reader for a single key, with configuration overrides.
    pub fn reader_with(&self, key: &K, config: ReaderConfig) -> Result<Reader<K, V>, Error> {
        Ok(self.subscribe(KeyFilter::Exact(Key::encode(key)?), config))
    }

    /// Create a reader receiving samples for all keys.
    pub fn any_reader(&self) -> Reader<K, V> {
        self.subscribe(KeyFilter::Any, ReaderConfig::default())
    }

    pub fn any_reader_with(&self, config: ReaderConfig) -> Reader<K, V> {
        self.subscribe(KeyFilter::Any, config)
    }

    /// Create a reader for a set of keys.
    pub fn filtered_reader(
        &self,
        keys: impl IntoIterator<Item = K>,
        config: ReaderConfig,
    ) -> Result<Reader<K, V>, Error> {
        let keys = keys
            .into_iter()
            .map(|k| Key::encode(&k))
            .collect::<Result<BTreeSet<_>, _>>()?;

        Ok(self.subscribe(KeyFilter::Set(keys), config))
    }

    fn subscribe(&self, filter: KeyFilter, config: ReaderConfig) -> Reader<K, V> {
        let now = LocalTime::now();
        let mut state = self.inner.lock();
        let config = config.or(&state.reader_default);
        let policy = config.resolve();
        let queue = Arc::new(Dispatcher::new(policy));

        // Late join: replay matching local producer histories.
        for (key, elem) in &state.writers {
            if filter.matches(key) {
                queue.deliver_all(elem.history.replay(&policy, now), now);
                queue.writer_attached();
            }
        }
        // Remote producers attached before this reader existed.
        for (key, count) in &state.remote_writers {
            if filter.matches(key) {
                for _ in 0..*count {
                    queue.writer_attached();
                }
            }
        }
        let id = state.next_reader;
        state.next_reader += 1;
        state.readers.insert(
            id,
            ReaderEntry {
                filter: filter.clone(),
                queue: queue.clone(),
            },
        );
        drop(state);
        self.inner.matched.notify_all();

        self.inner
            .events
            .send(hub::Event::ReaderRegistered {
                topic: self.inner.name.clone(),
                attach: Attach {
                    filter,
                    spec: spec_of(&policy),
                },
            })
            .ok();

        Reader {
            topic: self.inner.clone(),
            id,
            queue,
        }
    }
}

/// The retention spec a reader sends to producers: its resolved count and
/// lifetime. The clear policy is applied reader-side only.
fn spec_of(policy: &Retention) -> ReaderConfig {
    ReaderConfig {
        sample_count: Some(policy.count.map(|n| n as i64).unwrap_or(UNBOUNDED)),
        sample_lifetime: policy.lifetime,
        clear_history: None,
    }
}

impl<K, V> TopicInner<K, V> {
    fn lock(&self) -> MutexGuard<'_, TopicState<V>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<K, V> TopicInner<K, V>
where
    V: Clone,
{
    /// Deliver a typed sample to the matching local readers.
    fn fan_out(&self, state: &TopicState<V>, key: &Key, sample: &Sample<V>, now: LocalTime) {
        for entry in state.readers.values() {
            if entry.filter.matches(key) {
                entry.queue.deliver(sample.clone(), now);
            }
        }
    }
}

/// A single-key sample producer.
///
/// The element's history lives as long as its writer: dropping the writer
/// drops the retained samples.
pub struct Writer<K, V>
where
    V: Clone,
{
    topic: Arc<TopicInner<K, V>>,
    key: K,
    encoded: Key,
}

impl<K, V> Writer<K, V>
where
    K: Serialize + Send + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    pub fn key(&self) -> &K {
        &self.key
    }

    /// Publish a new value. The first write of an instance is an `Add`;
    /// subsequent writes are `Update`s, until the instance is removed.
    pub fn update(&self, value: V) -> Result<(), Error> {
        let now = LocalTime::now();
        let mut state = self.topic.lock();
        let elem = state
            .writers
            .get_mut(&self.encoded)
            .expect("writer element exists while the writer is alive");
        let event = if elem.live {
            SampleEvent::Update
        } else {
            SampleEvent::Add
        };
        elem.seq += 1;

        let sample = Sample {
            event,
            tag: None,
            timestamp: Timestamp::from(now),
            origin: self.topic.node.clone(),
            seq: elem.seq,
            value: Some(value.clone()),
            delta: None,
        };
        elem.current = Some(value);
        elem.live = true;

        let policy = elem.policy;
        elem.history.push(sample.clone(), &policy, now);

        self.topic.fan_out(&state, &self.encoded, &sample, now);
        drop(state);

        self.publish(&sample);

        Ok(())
    }

    /// Publish a partial update: fold `delta` into the current value with
    /// the updater registered for `tag`.
    pub fn partial_update<D: Serialize>(&self, tag: &str, delta: D) -> Result<(), Error> {
        let now = LocalTime::now();
        let delta = serde_json::to_vec(&delta)?;
        let mut state = self.topic.lock();

        let folded = {
            let elem = state
                .writers
                .get(&self.encoded)
                .expect("writer element exists while the writer is alive");
            let updater = state
                .updaters
                .get(tag)
                .ok_or_else(|| Error::MissingUpdater(tag.to_owned()))?;
            let mut value = elem.current.clone().ok_or(Error::NoCurrentValue)?;
            updater(&mut value, &delta)?;
            value
        };
        let elem = state
            .writers
            .get_mut(&self.encoded)
            .expect("writer element exists while the writer is alive");
        elem.seq += 1;

        let sample = Sample {
            event: SampleEvent::PartialUpdate,
            tag: Some(tag.to_owned()),
            timestamp: Timestamp::from(now),
            origin: self.topic.node.clone(),
            seq: elem.seq,
            value: Some(folded.clone()),
            delta: Some(delta),
        };
        elem.current = Some(folded);

        let policy = elem.policy;
        elem.history.push(sample.clone(), &policy, now);

        self.topic.fan_out(&state, &self.encoded, &sample, now);
        drop(state);

        self.publish(&sample);

        Ok(())
    }

    /// Remove the element's instance.
    pub fn remove(&self) -> Result<(), Error> {
        let now = LocalTime::now();
        let mut state = self.topic.lock();
        let elem = state
            .writers
            .get_mut(&self.encoded)
            .expect("writer element exists while the writer is alive");
        elem.seq += 1;

        let sample = Sample {
            event: SampleEvent::Remove,
            tag: None,
            timestamp: Timestamp::from(now),
            origin: self.topic.node.clone(),
            seq: elem.seq,
            value: None,
            delta: None,
        };
        elem.current = None;
        elem.live = false;

        let policy = elem.policy;
        elem.history.push(sample.clone(), &policy, now);

        self.topic.fan_out(&state, &self.encoded, &sample, now);
        drop(state);

        self.publish(&sample);

        Ok(())
    }

    /// Block until the element has at least one matched reader.
    pub fn wait_for_readers(&self) {
        let mut state = self.topic.lock();
        loop {
            let local = state
                .readers
                .values()
                .filter(|r| r.filter.matches(&self.encoded))
                .count();
            let remote = state.remote_readers.get(&self.encoded).copied().unwrap_or(0);

            if local + remote > 0 {
                return;
            }
            state = self
                .topic
                .matched
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    fn publish(&self, sample: &Sample<V>) {
        match sample.to_wire() {
            Ok(wire) => {
                self.topic
                    .events
                    .send(hub::Event::Published {
                        topic: self.topic.name.clone(),
                        key: self.encoded.clone(),
                        sample: wire,
                    })
                    .ok();
            }
            Err(e) => {
                warn!(target: "topic", "Dropping outbound sample on `{}`: {e}", self.topic.name);
            }
        }
    }
}

impl<K, V> Drop for Writer<K, V>
where
    V: Clone,
{
    fn drop(&mut self) {
        let mut state = self.topic.lock();
        state.writers.remove(&self.encoded);

        for entry in state.readers.values() {
            if entry.filter.matches(&self.encoded) {
                entry.queue.writer_detached();
            }
        }
    }
}

/// A sample consumer. Wraps a [`Dispatcher`].
pub struct Reader<K, V>
where
    V: Clone,
{
    topic: Arc<TopicInner<K, V>>,
    id: u64,
    queue: Arc<Dispatcher<V>>,
}

impl<K, V> Reader<K, V>
where
    V: Clone,
{
    /// Take the next unread sample, blocking until one arrives. Returns
    /// `None` once the reader is closed.
    pub fn next_unread(&self) -> Option<Sample<V>> {
        self.queue.next_unread()
    }

    pub fn try_next_unread(&self) -> Option<Sample<V>> {
        self.queue.try_next_unread()
    }

    /// Drain all unread samples without blocking.
    pub fn all_unread(&self) -> Vec<Sample<V>> {
        self.queue.all_unread()
    }

    pub fn unread(&self) -> usize {
        self.queue.unread()
    }

    /// Block until at least `n` samples are unread.
    pub fn wait_for_unread(&self, n: usize) -> bool {
        self.queue.wait_for_unread(n)
    }

    pub fn wait_for_unread_timeout(&self, n: usize, timeout: std::time::Duration) -> bool {
        self.queue.wait_for_unread_timeout(n, timeout)
    }

    /// Block until the reader has at least one matched writer.
    pub fn wait_for_writers(&self) -> bool {
        self.queue.wait_for_writers()
    }

    pub fn writers(&self) -> usize {
        self.queue.writers()
    }
}

impl<K, V> Drop for Reader<K, V>
where
    V: Clone,
{
    fn drop(&mut self) {
        self.topic.lock().readers.remove(&self.id);
        self.queue.close();
    }
}

/// The object-safe, untyped surface the hub drives. Keys and payloads are
/// in their wire encoding.
pub(crate) trait AnyTopic: Send + Sync {
    fn has_reader(&self) -> bool;
    fn has_writer(&self) -> bool;
    fn writer_keys(&self) -> Vec<Key>;
    fn reader_attaches(&self) -> Vec<Attach>;
    fn replay(&self, key: &Key, spec: &ReaderConfig, now: LocalTime) -> Vec<WireSample>;
    fn deliver(&self, key: &Key, samples: Vec<WireSample>);
    fn writer_attached(&self, key: &Key);
    fn writer_detached(&self, key: &Key);
    fn reader_attached(&self, key: &Key);
    fn reader_detached(&self, key: &Key);
}

impl<K, V> AnyTopic for TopicInner<K, V>
where
    K: Serialize + Send + 'static,
    V: Clone + Serialize + DeserializeOwned + Send + 'static,
{
    fn has_reader(&self) -> bool {
        !self.lock().readers.is_empty()
    }

    fn has_writer(&self) -> bool {
        !self.lock().writers.is_empty()
    }

    fn writer_keys(&self) -> Vec<Key> {
        self.lock().writers.keys().cloned().collect()
    }

    fn reader_attaches(&self) -> Vec<Attach> {
        let state = self.lock();
        state
            .readers
            .values()
            .map(|r| Attach {
                filter: r.filter.clone(),
                spec: spec_of(&r.queue.policy()),
            })
            .collect()
    }

    fn replay(&self, key: &Key, spec: &ReaderConfig, now: LocalTime) -> Vec<WireSample> {
        let state = self.lock();
        let Some(elem) = state.writers.get(key) else {
            return Vec::new();
        };
        elem.history
            .replay(&spec.resolve(), now)
            .iter()
            .filter_map(|s| match s.to_wire() {
                Ok(wire) => Some(wire),
                Err(e) => {
                    warn!(target: "topic", "Dropping replay sample on `{}`: {e}", self.name);
                    None
                }
            })
            .collect()
    }

    fn deliver(&self, key: &Key, samples: Vec<WireSample>) {
        let now = LocalTime::now();
        let mut state = self.lock();
        let TopicState {
            updaters,
            readers,
            remote_values,
            ..
        } = &mut *state;

        for wire in samples {
            let value = match wire.event {
                SampleEvent::Remove => {
                    remote_values.remove(key);
                    None
                }
                SampleEvent::Add | SampleEvent::Update => {
                    match serde_json::from_slice::<V>(&wire.payload) {
                        Ok(v) => {
                            remote_values.insert(key.clone(), v.clone());
                            Some(v)
                        }
                        Err(e) => {
                            warn!(
                                target: "topic",
                                "Dropping sample on `{}` [{}]: invalid payload: {e}",
                                self.name, key
                            );
                            continue;
                        }
                    }
                }
                SampleEvent::PartialUpdate => {
                    let Some(tag) = wire.tag.as_deref() else {
                        warn!(
                            target: "topic",
                            "Dropping partial update on `{}` [{}]: no update tag",
                            self.name, key
                        );
                        continue;
                    };
                    let Some(updater) = updaters.get(tag) else {
                        warn!(
                            target: "topic",
                            "Dropping partial update on `{}` [{}]: no updater for tag `{tag}`",
                            self.name, key
                        );
                        continue;
                    };
                    let Some(mut value) = remote_values.get(key).cloned() else {
                        warn!(
                            target: "topic",
                            "Dropping partial update on `{}` [{}]: no current value",
                            self.name, key
                        );
                        continue;
                    };
                    if let Err(e) = updater(&mut value, &wire.payload) {
                        warn!(
                            target: "topic",
                            "Dropping partial update on `{}` [{}]: {e}",
                            self.name, key
                        );
                        continue;
                    }
                    remote_values.insert(key.clone(), value.clone());
                    Some(value)
                }
            };
            let delta = wire.event.is_partial().then(|| wire.payload.clone());
            let sample = Sample {
                event: wire.event,
                tag: wire.tag,
                timestamp: wire.timestamp,
                origin: wire.origin,
                seq: wire.seq,
                value,
                delta,
            };
            for entry in readers.values() {
                if entry.filter.matches(key) {
                    entry.queue.deliver(sample.clone(), now);
                }
            }
        }
    }

    fn writer_attached(&self, key: &Key) {
        let mut state = self.lock();
        *state.remote_writers.entry(key.clone()).or_insert(0) += 1;

        for entry in state.readers.values() {
            if entry.filter.matches(key) {
                entry.queue.writer_attached();
            }
        }
    }

    fn writer_detached(&self, key: &Key) {
        let mut state = self.lock();
        if let Some(count) = state.remote_writers.get_mut(key) {
            *count = count.saturating_sub(1);
        }
        for entry in state.readers.values() {
            if entry.filter.matches(key) {
                entry.queue.writer_detached();
            }
        }
    }

    fn reader_attached(&self, key: &Key) {
        let mut state = self.lock();
        *state.remote_readers.entry(key.clone()).or_insert(0) += 1;
        drop(state);
        self.matched.notify_all();
    }

    fn reader_detached(&self, key: &Key) {
        let mut state = self.lock();
        if let Some(count) = state.remote_readers.get_mut(key) {
            *count = count.saturating_sub(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hub::Registry as _;
    use crate::policy::ClearHistory;

    fn hub(name: &str) -> Hub {
        let (hub, _events) = Hub::new(NodeId::new("node", name).unwrap());
        hub
    }

    /// Publish the six-sample retention stream: two instances, each
    /// removed after two values.
    fn produce(writer: &Writer<String, String>) {
        writer.update("value1".into()).unwrap();
        writer.update("value2".into()).unwrap();
        writer.remove().unwrap();
        writer.update("value3".into()).unwrap();
        writer.update("value4".into()).unwrap();
        writer.remove().unwrap();
    }

    fn values(samples: &[Sample<String>]) -> Vec<Option<String>> {
        samples.iter().map(|s| s.value.clone()).collect()
    }

    #[test]
    fn test_writer_retention_by_count() {
        let hub = hub("alice");
        let topic = Topic::<String, String>::new(&hub, "topic").unwrap();
        topic.set_reader_default(ReaderConfig {
            clear_history: Some(ClearHistory::Never),
            ..ReaderConfig::default()
        });

        for (config, expected) in [
            (
                WriterConfig {
                    sample_count: Some(UNBOUNDED),
                    clear_history: Some(ClearHistory::Never),
                    ..WriterConfig::default()
                },
                6,
            ),
            (
                WriterConfig {
                    sample_count: Some(4),
                    clear_history: Some(ClearHistory::Never),
                    ..WriterConfig::default()
                },
                4,
            ),
            (
                WriterConfig {
                    clear_history: Some(ClearHistory::OnAdd),
                    ..WriterConfig::default()
                },
                3,
            ),
        ] {
            let writer = topic.writer_with(format!("elem-{expected}"), config).unwrap();
            produce(&writer);

            let reader = topic.reader(writer.key()).unwrap();
            let samples = reader.all_unread();
            assert_eq!(samples.len(), expected);
            assert_eq!(
                samples.last().unwrap().event,
                SampleEvent::Remove,
                "the stream ends on the final remove"
            );
        }
    }

    #[test]
    fn test_reader_retention_by_count() {
        let hub = hub("alice");
        let topic = Topic::<String, String>::new(&hub, "topic").unwrap();
        topic.set_reader_default(ReaderConfig {
            clear_history: Some(ClearHistory::Never),
            ..ReaderConfig::default()
        });
        let writer = topic
            .writer_with(
                "elem1".to_owned(),
                WriterConfig {
                    sample_count: Some(UNBOUNDED),
                    clear_history: Some(ClearHistory::Never),
                    ..WriterConfig::default()
                },
            )
            .unwrap();
        produce(&writer);

        let reader = topic
            .reader_with(writer.key(), ReaderConfig::with_count(4))
            .unwrap();
        assert_eq!(reader.unread(), 4);
        assert_eq!(
            values(&reader.all_unread()),
            vec![
                None,
                Some("value3".into()),
                Some("value4".into()),
                None
            ]
        );

        let reader = topic
            .reader_with(
                writer.key(),
                ReaderConfig {
                    clear_history: Some(ClearHistory::Never),
                    ..ReaderConfig::default()
                },
            )
            .unwrap();
        assert_eq!(reader.unread(), 6);

        let reader = topic
            .reader_with(
                writer.key(),
                ReaderConfig {
                    clear_history: Some(ClearHistory::OnAdd),
                    ..ReaderConfig::default()
                },
            )
            .unwrap();
        assert_eq!(
            values(&reader.all_unread()),
            vec![Some("value3".into()), Some("value4".into()), None]
        );
    }

    #[test]
    fn test_sample_lifetime() {
        let hub = hub("alice");
        let topic = Topic::<String, String>::new(&hub, "topic").unwrap();
        topic.set_reader_default(ReaderConfig {
            clear_history: Some(ClearHistory::Never),
            ..ReaderConfig::default()
        });
        let writer = topic
            .writer_with(
                "elem1".to_owned(),
                WriterConfig {
                    clear_history: Some(ClearHistory::Never),
                    ..WriterConfig::default()
                },
            )
            .unwrap();

        writer.update("value1".into()).unwrap();
        writer.update("value2".into()).unwrap();
        writer.remove().unwrap();
        thread::sleep(Duration::from_millis(250));
        writer.update("value3".into()).unwrap();
        writer.update("value4".into()).unwrap();
        writer.remove().unwrap();

        let now = LocalTime::now();
        let reader = topic
            .reader_with(
                writer.key(),
                ReaderConfig {
                    sample_lifetime: Some(localtime::LocalDuration::from_millis(150)),
                    ..ReaderConfig::default()
                },
            )
            .unwrap();
        assert!(reader.wait_for_unread(3));

        let samples = reader.all_unread();
        assert_eq!(
            values(&samples),
            vec![Some("value3".into()), Some("value4".into()), None]
        );
        for s in &samples {
            assert!(
                s.timestamp.to_local_time() >= now - localtime::LocalDuration::from_millis(150)
            );
        }
    }

    #[derive(Debug, Default, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
    struct Stock {
        price: f64,
    }

    #[test]
    fn test_late_join_partial_update_promotion() {
        let hub = hub("alice");
        let topic = Topic::<String, Stock>::new(&hub, "stocks").unwrap();
        topic.set_reader_default(ReaderConfig {
            sample_count: Some(UNBOUNDED),
            clear_history: Some(ClearHistory::Never),
            ..ReaderConfig::default()
        });
        topic.set_updater("price", |stock: &mut Stock, price: f64| {
            stock.price = price;
        });

        let writer = topic.writer("AAPL".to_owned()).unwrap();
        writer.update(Stock { price: 12.0 }).unwrap();
        writer.partial_update("price", 15.0).unwrap();
        writer.partial_update("price", 18.0).unwrap();

        // A fresh reader with default config sees the stream as produced.
        let reader = topic.reader(writer.key()).unwrap();
        let samples = reader.all_unread();
        assert_eq!(
            samples.iter().map(|s| s.event).collect::<Vec<_>>(),
            vec![
                SampleEvent::Add,
                SampleEvent::PartialUpdate,
                SampleEvent::PartialUpdate
            ]
        );
        assert_eq!(samples[0].value, Some(Stock { price: 12.0 }));
        assert_eq!(samples[1].value, Some(Stock { price: 15.0 }));
        assert_eq!(samples[1].tag.as_deref(), Some("price"));
        assert_eq!(samples[2].value, Some(Stock { price: 18.0 }));

        // A late joiner with room for two sees the oldest delivered sample
        // promoted to a full update.
        let reader = topic
            .reader_with(writer.key(), ReaderConfig::with_count(2))
            .unwrap();
        let samples = reader.all_unread();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].event, SampleEvent::Update);
        assert_eq!(samples[0].value, Some(Stock { price: 15.0 }));
        assert_eq!(samples[1].event, SampleEvent::PartialUpdate);
        assert_eq!(samples[1].value, Some(Stock { price: 18.0 }));
    }

    #[test]
    fn test_clear_history_variants() {
        let hub = hub("alice");
        let topic = Topic::<String, String>::new(&hub, "topic").unwrap();
        topic.set_updater("concat", |value: &mut String, suffix: String| {
            value.push_str(&suffix);
        });
        let writer = topic
            .writer_with(
                "elem1".to_owned(),
                WriterConfig {
                    sample_count: Some(9),
                    clear_history: Some(ClearHistory::Never),
                    ..WriterConfig::default()
                },
            )
            .unwrap();

        // Twenty-two samples; the producer retains the last nine.
        for _ in 0..3 {
            writer.update("x".into()).unwrap();
            writer.update("x".into()).unwrap();
            writer.partial_update("concat", "x".to_owned()).unwrap();
            writer.remove().unwrap();
        }
        writer.update("x".into()).unwrap();

        writer.update("a".into()).unwrap();
        writer.update("b".into()).unwrap();
        writer.partial_update("concat", "c".to_owned()).unwrap();
        writer.remove().unwrap();
        writer.update("d".into()).unwrap();
        writer.update("e".into()).unwrap();
        writer.partial_update("concat", "f".to_owned()).unwrap();
        writer.partial_update("concat", "g".to_owned()).unwrap();
        writer.partial_update("concat", "h".to_owned()).unwrap();

        for (clear, expected) in [
            (ClearHistory::Never, 9),
            (ClearHistory::OnAdd, 5),
            (ClearHistory::OnRemove, 6),
            (ClearHistory::OnAll, 1),
            (ClearHistory::OnAllExceptPartialUpdate, 4),
        ] {
            let reader = topic
                .reader_with(
                    writer.key(),
                    ReaderConfig {
                        clear_history: Some(clear),
                        ..ReaderConfig::default()
                    },
                )
                .unwrap();
            assert_eq!(reader.unread(), expected, "{clear:?}");
        }
    }

    #[test]
    fn test_wait_for_counterparts() {
        let hub = hub("alice");
        let topic = Topic::<String, String>::new(&hub, "topic").unwrap();
        let reader = topic.reader(&"elem1".to_owned()).unwrap();
        assert_eq!(reader.writers(), 0);

        let t = {
            let topic = topic.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                let writer = topic.writer("elem1".to_owned()).unwrap();
                writer.wait_for_readers();
                writer.update("value1".into()).unwrap();
            })
        };
        assert!(reader.wait_for_writers());
        assert_eq!(reader.next_unread().unwrap().value, Some("value1".into()));
        t.join().unwrap();
    }

    /// Samples crossing the hub's untyped surface: encoded on one hub,
    /// replayed and delivered into another, with deltas folded by the
    /// receiving topic's updater.
    #[test]
    fn test_remote_delivery() {
        let alice = hub("alice");
        let bob = hub("bob");

        let source = Topic::<String, Stock>::new(&alice, "stocks").unwrap();
        source.set_updater("price", |stock: &mut Stock, price: f64| {
            stock.price = price;
        });
        let writer = source.writer("AAPL".to_owned()).unwrap();
        writer.update(Stock { price: 12.0 }).unwrap();
        writer.partial_update("price", 15.0).unwrap();

        let sink = Topic::<String, Stock>::new(&bob, "stocks").unwrap();
        sink.set_reader_default(ReaderConfig {
            clear_history: Some(ClearHistory::Never),
            ..ReaderConfig::default()
        });
        sink.set_updater("price", |stock: &mut Stock, price: f64| {
            stock.price = price;
        });
        let reader = sink.reader(&"AAPL".to_owned()).unwrap();

        let key = Key::encode(&"AAPL".to_owned()).unwrap();
        let spec = crate::hub::Registry::reader_attaches(&bob, "stocks")
            .pop()
            .unwrap()
            .spec;
        let replay = alice.replay("stocks", &key, &spec, LocalTime::now());
        assert_eq!(replay.len(), 2);

        bob.deliver("stocks", &key, replay);
        bob.writer_attached("stocks", &key);

        assert!(reader.wait_for_writers());
        let samples = reader.all_unread();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].event, SampleEvent::Add);
        assert_eq!(samples[0].value, Some(Stock { price: 12.0 }));
        assert_eq!(samples[1].event, SampleEvent::PartialUpdate);
        assert_eq!(samples[1].value, Some(Stock { price: 15.0 }));

        // Duplicates from a second replay are dropped.
        let replay = alice.replay("stocks", &key, &spec, LocalTime::now());
        bob.deliver("stocks", &key, replay);
        assert_eq!(reader.unread(), 0);
    }

    /// A partial update with an unknown tag is dropped; the stream stays
    /// live.
    #[test]
    fn test_missing_updater_drops_sample() {
        let alice = hub("alice");
        let bob = hub("bob");

        let source = Topic::<String, Stock>::new(&alice, "stocks").unwrap();
        source.set_updater("price", |stock: &mut Stock, price: f64| {
            stock.price = price;
        });
        let writer = source.writer("AAPL".to_owned()).unwrap();
        writer.update(Stock { price: 12.0 }).unwrap();
        writer.partial_update("price", 15.0).unwrap();
        writer.update(Stock { price: 20.0 }).unwrap();

        // Bob never registers the "price" updater.
        let sink = Topic::<String, Stock>::new(&bob, "stocks").unwrap();
        sink.set_reader_default(ReaderConfig {
            clear_history: Some(ClearHistory::Never),
            ..ReaderConfig::default()
        });
        let reader = sink.reader(&"AAPL".to_owned()).unwrap();

        let key = Key::encode(&"AAPL".to_owned()).unwrap();
        let replay = alice.replay(
            "stocks",
            &key,
            &ReaderConfig::with_count(UNBOUNDED),
            LocalTime::now(),
        );
        bob.deliver("stocks", &key, replay);

        let samples = reader.all_unread();
        assert_eq!(samples.len(), 2, "the partial update is dropped");
        assert_eq!(samples[0].value, Some(Stock { price: 12.0 }));
        assert_eq!(samples[1].value, Some(Stock { price: 20.0 }));
    }

    #[test]
    fn test_duplicate_writer() {
        let hub = hub("alice");
        let topic = Topic::<String, String>::new(&hub, "topic").unwrap();
        let _writer = topic.writer("elem1".to_owned()).unwrap();

        assert!(matches!(
            topic.writer("elem1".to_owned()),
            Err(Error::DuplicateWriter)
        ));
        assert!(matches!(
            Topic::<String, String>::new(&hub, "topic"),
            Err(Error::Duplicate(_))
        ));
    }
}
