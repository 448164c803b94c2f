//! Per-element sample histories.
//!
//! An element history is the ordered sequence of samples retained for a
//! single key, bounded by a [`Retention`] policy. The same type backs the
//! producer side (a writer's retained samples, served to late joiners) and
//! the consumer side (the unread queue behind a reader's dispatcher).
use std::collections::{HashMap, VecDeque};

use localtime::LocalTime;

use crate::node::NodeId;
use crate::policy::Retention;
use crate::sample::{Sample, SampleEvent};

#[derive(Debug, Clone)]
pub struct ElementHistory<V> {
    /// Retained samples, oldest first.
    samples: VecDeque<Sample<V>>,
    /// Highest sequence number seen per writer. Samples at or below the
    /// highwater are dropped as duplicates.
    highwater: HashMap<NodeId, u64>,
}

impl<V> Default for ElementHistory<V> {
    fn default() -> Self {
        Self {
            samples: VecDeque::new(),
            highwater: HashMap::new(),
        }
    }
}

impl<V> ElementHistory<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample<V>> {
        self.samples.iter()
    }

    /// The newest retained sample.
    pub fn last(&self) -> Option<&Sample<V>> {
        self.samples.back()
    }

    pub fn pop_front(&mut self) -> Option<Sample<V>> {
        self.samples.pop_front()
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }
}

impl<V: Clone> ElementHistory<V> {
    /// Append a sample under the given policy. The clear policy is applied
    /// *before* the sample is appended, then the count and lifetime bounds
    /// are enforced. Returns `false` if the sample was dropped as a
    /// duplicate of one already seen from the same writer.
    pub fn push(&mut self, sample: Sample<V>, policy: &Retention, now: LocalTime) -> bool {
        match self.highwater.get(&sample.origin) {
            Some(&seen) if sample.seq <= seen => return false,
            _ => {}
        }
        self.highwater.insert(sample.origin.clone(), sample.seq);

        if policy.clear.clears(sample.event) {
            self.samples.clear();
        }
        self.samples.push_back(sample);

        if let Some(max) = policy.count {
            while self.samples.len() > max {
                self.samples.pop_front();
            }
        }
        if let Some(lifetime) = policy.lifetime {
            let cutoff = now - lifetime;
            while self
                .samples
                .front()
                .map(|s| s.timestamp.to_local_time() < cutoff)
                .unwrap_or(false)
            {
                self.samples.pop_front();
            }
        }
        true
    }

    /// Compute the late-join replay for a reader with the given retention.
    ///
    /// The reader receives at most `policy.count` of the retained samples,
    /// newest last, with samples older than `policy.lifetime` suppressed.
    /// When the reader does not receive the full retained history, or the
    /// oldest delivered sample is a partial update it has no state for,
    /// that sample is promoted to an `Update` carrying the folded value.
    pub fn replay(&self, policy: &Retention, now: LocalTime) -> Vec<Sample<V>> {
        let fresh: Vec<&Sample<V>> = match policy.lifetime {
            Some(lifetime) => {
                let cutoff = now - lifetime;
                self.samples
                    .iter()
                    .filter(|s| s.timestamp.to_local_time() >= cutoff)
                    .collect()
            }
            None => self.samples.iter().collect(),
        };
        let take = policy.count.unwrap_or(fresh.len()).min(fresh.len());
        let mut out: Vec<Sample<V>> = fresh[fresh.len() - take..]
            .iter()
            .map(|s| (*s).clone())
            .collect();

        let truncated = out.len() < self.samples.len();
        if let Some(first) = out.first_mut() {
            let partial = first.event.is_partial();

            if partial || (truncated && first.event == SampleEvent::Add) {
                first.event = SampleEvent::Update;
                first.tag = None;
                first.delta = None;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use localtime::{LocalDuration, LocalTime};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::clock::Timestamp;
    use crate::policy::{ClearHistory, ReaderConfig, WriterConfig, UNBOUNDED};

    fn writer() -> NodeId {
        NodeId::new("node", "writer").unwrap()
    }

    fn sample(event: SampleEvent, value: Option<&str>, seq: u64, time: LocalTime) -> Sample<String> {
        Sample {
            event,
            tag: None,
            timestamp: Timestamp::from(time),
            origin: writer(),
            seq,
            value: value.map(String::from),
            delta: None,
        }
    }

    /// The six-sample stream used by the retention scenarios: two instances,
    /// each removed after two values.
    fn stream(now: LocalTime) -> Vec<Sample<String>> {
        use SampleEvent::*;

        vec![
            sample(Add, Some("value1"), 1, now),
            sample(Update, Some("value2"), 2, now),
            sample(Remove, None, 3, now),
            sample(Add, Some("value3"), 4, now),
            sample(Update, Some("value4"), 5, now),
            sample(Remove, None, 6, now),
        ]
    }

    fn fill(history: &mut ElementHistory<String>, policy: &Retention, now: LocalTime) {
        for s in stream(now) {
            assert!(history.push(s, policy, now));
        }
    }

    #[test]
    fn test_writer_retention_by_count() {
        let now = LocalTime::now();

        // Keep everything.
        let policy = WriterConfig {
            sample_count: Some(UNBOUNDED),
            clear_history: Some(ClearHistory::Never),
            ..WriterConfig::default()
        }
        .resolve();
        let mut history = ElementHistory::new();
        fill(&mut history, &policy, now);
        assert_eq!(
            history.iter().map(|s| s.value.clone()).collect::<Vec<_>>(),
            vec![
                Some("value1".into()),
                Some("value2".into()),
                None,
                Some("value3".into()),
                Some("value4".into()),
                None
            ]
        );

        // Keep the last four.
        let policy = WriterConfig {
            sample_count: Some(4),
            clear_history: Some(ClearHistory::Never),
            ..WriterConfig::default()
        }
        .resolve();
        let mut history = ElementHistory::new();
        fill(&mut history, &policy, now);
        assert_eq!(history.len(), 4);
        assert_eq!(history.iter().next().unwrap().event, SampleEvent::Remove);

        // Keep the current instance only.
        let policy = WriterConfig {
            clear_history: Some(ClearHistory::OnAdd),
            ..WriterConfig::default()
        }
        .resolve();
        let mut history = ElementHistory::new();
        fill(&mut history, &policy, now);
        assert_eq!(history.len(), 3);
        assert_eq!(
            history.iter().next().unwrap().value,
            Some("value3".to_owned())
        );
    }

    #[test]
    fn test_reader_retention_by_count() {
        let now = LocalTime::now();
        let unbounded = WriterConfig {
            sample_count: Some(UNBOUNDED),
            clear_history: Some(ClearHistory::Never),
            ..WriterConfig::default()
        }
        .resolve();
        let mut producer = ElementHistory::new();
        fill(&mut producer, &unbounded, now);

        // The reader-side policy is applied by pushing the replayed stream
        // through a consumer history.
        for (config, expected) in [
            (ReaderConfig::with_count(4), 4),
            (
                ReaderConfig {
                    clear_history: Some(ClearHistory::Never),
                    ..ReaderConfig::default()
                },
                6,
            ),
            (
                ReaderConfig {
                    clear_history: Some(ClearHistory::OnAdd),
                    ..ReaderConfig::default()
                },
                3,
            ),
        ] {
            let policy = config.resolve();
            let mut queue = ElementHistory::new();
            for s in producer.replay(&policy, now) {
                queue.push(s, &policy, now);
            }
            assert_eq!(queue.len(), expected, "{config:?}");
        }
    }

    #[test]
    fn test_duplicate_samples_dropped() {
        let now = LocalTime::now();
        let policy = Retention {
            clear: ClearHistory::Never,
            ..Retention::default()
        };
        let mut history = ElementHistory::new();

        assert!(history.push(sample(SampleEvent::Add, Some("v"), 1, now), &policy, now));
        assert!(!history.push(sample(SampleEvent::Add, Some("v"), 1, now), &policy, now));
        assert!(!history.push(sample(SampleEvent::Update, Some("w"), 0, now), &policy, now));
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_seq_order_within_writer() {
        let now = LocalTime::now();
        let policy = Retention {
            clear: ClearHistory::Never,
            ..Retention::default()
        };
        let mut history = ElementHistory::new();

        for seq in [1, 3, 2, 4] {
            history.push(sample(SampleEvent::Update, Some("v"), seq, now), &policy, now);
        }
        let seqs = history.iter().map(|s| s.seq).collect::<Vec<_>>();
        assert_eq!(seqs, vec![1, 3, 4], "stale seq 2 is dropped");
    }

    #[test]
    fn test_sample_lifetime() {
        let now = LocalTime::now();
        let then = now - LocalDuration::from_millis(300);
        let policy = Retention {
            clear: ClearHistory::Never,
            ..Retention::default()
        };
        let mut producer = ElementHistory::new();

        for (i, t) in [(1, then), (2, then), (3, then), (4, now), (5, now), (6, now)] {
            producer.push(
                sample(SampleEvent::Update, Some("v"), i, t),
                &policy,
                now,
            );
        }

        let reader = Retention {
            lifetime: Some(LocalDuration::from_millis(150)),
            clear: ClearHistory::Never,
            ..Retention::default()
        };
        let replay = producer.replay(&reader, now);
        assert_eq!(replay.len(), 3);
        for s in &replay {
            assert!(s.timestamp.to_local_time() >= now - LocalDuration::from_millis(150));
        }
    }

    #[test]
    fn test_late_join_promotion() {
        let now = LocalTime::now();
        let policy = Retention {
            clear: ClearHistory::Never,
            ..Retention::default()
        };
        let mut producer = ElementHistory::new();

        let mut add = sample(SampleEvent::Add, Some("12"), 1, now);
        add.value = Some("12".into());
        producer.push(add, &policy, now);

        for (seq, value, delta) in [(2, "15", "+3"), (3, "18", "+3")] {
            let mut s = sample(SampleEvent::PartialUpdate, Some(value), seq, now);
            s.tag = Some("price".into());
            s.delta = Some(delta.as_bytes().to_vec());
            producer.push(s, &policy, now);
        }

        // A reader with room for everything sees the stream as produced.
        let full = producer.replay(&Retention::default(), now);
        assert_eq!(
            full.iter().map(|s| s.event).collect::<Vec<_>>(),
            vec![
                SampleEvent::Add,
                SampleEvent::PartialUpdate,
                SampleEvent::PartialUpdate
            ]
        );

        // A reader with room for two sees the oldest delivered sample
        // promoted to a full update.
        let truncated = producer.replay(
            &Retention {
                count: Some(2),
                ..Retention::default()
            },
            now,
        );
        assert_eq!(truncated.len(), 2);
        assert_eq!(truncated[0].event, SampleEvent::Update);
        assert_eq!(truncated[0].value, Some("15".to_owned()));
        assert_eq!(truncated[0].delta, None);
        assert_eq!(truncated[1].event, SampleEvent::PartialUpdate);
        assert_eq!(truncated[1].value, Some("18".to_owned()));
    }

    #[test]
    fn test_replay_promotes_leading_partial_update() {
        let now = LocalTime::now();
        // A producer that cleared on every event retains a lone partial
        // update; a joining reader can't fold it without a base value.
        let policy = Retention {
            clear: ClearHistory::OnAll,
            ..Retention::default()
        };
        let mut producer = ElementHistory::new();
        producer.push(sample(SampleEvent::Add, Some("a"), 1, now), &policy, now);
        let mut s = sample(SampleEvent::PartialUpdate, Some("ab"), 2, now);
        s.tag = Some("concat".into());
        s.delta = Some(b"b".to_vec());
        producer.push(s, &policy, now);

        let replay = producer.replay(&Retention::default(), now);
        assert_eq!(replay.len(), 1);
        assert_eq!(replay[0].event, SampleEvent::Update);
        assert_eq!(replay[0].value, Some("ab".to_owned()));
    }

    /// The mixed 22-sample stream: the producer bounds its history to nine
    /// samples, and readers with each clear policy see 9, 5, 6, 1 and 4
    /// unread samples respectively.
    #[test]
    fn test_clear_history_variants() {
        use SampleEvent::*;

        let now = LocalTime::now();
        let producer_policy = WriterConfig {
            sample_count: Some(9),
            clear_history: Some(ClearHistory::Never),
            ..WriterConfig::default()
        }
        .resolve();
        let mut producer = ElementHistory::new();

        // Thirteen samples of filler followed by the tail the readers see.
        let mut seq = 0;
        let mut push = |history: &mut ElementHistory<String>, event, value: &str| {
            seq += 1;
            let mut s = sample(event, Some(value), seq, now);
            if event == PartialUpdate {
                s.tag = Some("concat".into());
                s.delta = Some(value.as_bytes().to_vec());
            }
            history.push(s, &producer_policy, now);
        };
        for _ in 0..3 {
            push(&mut producer, Add, "x");
            push(&mut producer, Update, "x");
            push(&mut producer, PartialUpdate, "x");
            push(&mut producer, Remove, "");
        }
        push(&mut producer, Add, "x");

        push(&mut producer, Add, "a");
        push(&mut producer, Update, "b");
        push(&mut producer, PartialUpdate, "bc");
        push(&mut producer, Remove, "");
        push(&mut producer, Add, "d");
        push(&mut producer, Update, "e");
        push(&mut producer, PartialUpdate, "ef");
        push(&mut producer, PartialUpdate, "efg");
        push(&mut producer, PartialUpdate, "efgh");

        assert_eq!(seq, 22);
        assert_eq!(producer.len(), 9);

        for (clear, expected) in [
            (ClearHistory::Never, 9),
            (ClearHistory::OnAdd, 5),
            (ClearHistory::OnRemove, 6),
            (ClearHistory::OnAll, 1),
            (ClearHistory::OnAllExceptPartialUpdate, 4),
        ] {
            let policy = Retention {
                clear,
                ..Retention::default()
            };
            let mut queue = ElementHistory::new();
            for s in producer.replay(&policy, now) {
                queue.push(s, &policy, now);
            }
            assert_eq!(queue.len(), expected, "{clear:?}");
        }
    }
}
