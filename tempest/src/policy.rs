//! Sample retention policies.
//!
//! Retention is configured in three layers: per-element config overrides
//! the per-topic default, which overrides the built-in default. Unset
//! fields fall through to the next layer.
use localtime::LocalDuration;

use crate::sample::SampleEvent;

/// Sentinel for an unbounded sample count in configuration.
pub const UNBOUNDED: i64 = -1;

/// When the retained history of an element is cleared.
///
/// The incoming sample is appended *after* the clear, so a clearing event
/// is itself retained.
///
/// The default, when left unset at every layer, is `OnAdd`: a new instance
/// discards the previous instance's samples.
#[derive(
    Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum ClearHistory {
    /// Nothing clears the history.
    Never,
    /// An `Add` clears the history.
    #[default]
    OnAdd,
    /// A `Remove` clears the history.
    OnRemove,
    /// Every event clears the history, partial updates included.
    OnAll,
    /// Every event except `PartialUpdate` clears the history.
    OnAllExceptPartialUpdate,
}

impl ClearHistory {
    /// Whether an incoming event clears the retained history.
    pub fn clears(&self, event: SampleEvent) -> bool {
        match self {
            Self::Never => false,
            Self::OnAdd => event == SampleEvent::Add,
            Self::OnRemove => event == SampleEvent::Remove,
            Self::OnAll => true,
            Self::OnAllExceptPartialUpdate => !event.is_partial(),
        }
    }
}

/// Consumer-side retention configuration. Unset fields inherit.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReaderConfig {
    /// Samples to retain; [`UNBOUNDED`] for no limit.
    pub sample_count: Option<i64>,
    /// Ignore samples older than this.
    pub sample_lifetime: Option<LocalDuration>,
    /// When to clear retained samples.
    pub clear_history: Option<ClearHistory>,
}

impl ReaderConfig {
    pub fn with_count(count: i64) -> Self {
        Self {
            sample_count: Some(count),
            ..Self::default()
        }
    }

    /// Overlay `self` on a topic-level default.
    pub fn or(&self, default: &Self) -> Self {
        Self {
            sample_count: self.sample_count.or(default.sample_count),
            sample_lifetime: self.sample_lifetime.or(default.sample_lifetime),
            clear_history: self.clear_history.or(default.clear_history),
        }
    }

    /// Resolve to an effective retention policy.
    pub fn resolve(&self) -> Retention {
        Retention::resolve(self.sample_count, self.sample_lifetime, self.clear_history)
    }
}

/// Producer-side retention configuration. Unset fields inherit.
#[derive(Debug, Default, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct WriterConfig {
    /// Samples to retain; [`UNBOUNDED`] for no limit.
    pub sample_count: Option<i64>,
    /// Drop retained samples older than this.
    pub sample_lifetime: Option<LocalDuration>,
    /// When to clear retained samples.
    pub clear_history: Option<ClearHistory>,
}

impl WriterConfig {
    pub fn with_count(count: i64) -> Self {
        Self {
            sample_count: Some(count),
            ..Self::default()
        }
    }

    /// Overlay `self` on a topic-level default.
    pub fn or(&self, default: &Self) -> Self {
        Self {
            sample_count: self.sample_count.or(default.sample_count),
            sample_lifetime: self.sample_lifetime.or(default.sample_lifetime),
            clear_history: self.clear_history.or(default.clear_history),
        }
    }

    /// Resolve to an effective retention policy.
    pub fn resolve(&self) -> Retention {
        Retention::resolve(self.sample_count, self.sample_lifetime, self.clear_history)
    }
}

/// An effective, fully-resolved retention policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retention {
    /// Maximum retained samples; `None` is unbounded.
    pub count: Option<usize>,
    /// Maximum retained sample age.
    pub lifetime: Option<LocalDuration>,
    /// Clear policy.
    pub clear: ClearHistory,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            count: None,
            lifetime: None,
            clear: ClearHistory::default(),
        }
    }
}

impl Retention {
    fn resolve(
        count: Option<i64>,
        lifetime: Option<LocalDuration>,
        clear: Option<ClearHistory>,
    ) -> Self {
        let count = match count {
            None => None,
            Some(n) if n < 0 => None,
            Some(n) => Some(n as usize),
        };
        Self {
            count,
            lifetime,
            clear: clear.unwrap_or_default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlay_and_resolve() {
        let default = ReaderConfig {
            sample_count: Some(4),
            sample_lifetime: None,
            clear_history: Some(ClearHistory::Never),
        };
        let cfg = ReaderConfig::with_count(UNBOUNDED).or(&default);

        assert_eq!(cfg.sample_count, Some(UNBOUNDED));
        assert_eq!(cfg.clear_history, Some(ClearHistory::Never));

        let policy = cfg.resolve();
        assert_eq!(policy.count, None);
        assert_eq!(policy.clear, ClearHistory::Never);

        let policy = ReaderConfig::default().or(&default).resolve();
        assert_eq!(policy.count, Some(4));
    }

    #[test]
    fn test_clear_history_matrix() {
        use SampleEvent::*;

        for (policy, add, update, partial, remove) in [
            (ClearHistory::Never, false, false, false, false),
            (ClearHistory::OnAdd, true, false, false, false),
            (ClearHistory::OnRemove, false, false, false, true),
            (ClearHistory::OnAll, true, true, true, true),
            (ClearHistory::OnAllExceptPartialUpdate, true, true, false, true),
        ] {
            assert_eq!(policy.clears(Add), add, "{policy:?}");
            assert_eq!(policy.clears(Update), update, "{policy:?}");
            assert_eq!(policy.clears(PartialUpdate), partial, "{policy:?}");
            assert_eq!(policy.clears(Remove), remove, "{policy:?}");
        }
    }

    #[test]
    fn test_default_clear_history_is_on_add() {
        assert_eq!(ClearHistory::default(), ClearHistory::OnAdd);
        assert_eq!(ReaderConfig::default().resolve().clear, ClearHistory::OnAdd);
    }
}
