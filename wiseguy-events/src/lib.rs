//! Per-worker event accounting: named counters plus execution time
//! histograms, mergeable across collectors so per-request data can be
//! folded into process-wide totals.

use std::fmt;

mod counters;
mod stack;
mod stats;

pub use counters::{CounterMap, ExecTimeMap, DEFAULT_GRANULARITY_MS};
pub use stack::{CollectorId, CollectorStack};
pub use stats::Summary;

#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("can't close a non-leaf event collector")]
    NotTopOfStack,
    #[error("can't close the root event collector")]
    Root,
}

/// Key into the counter and exec-time maps. Labels are restricted to
/// `[-_.A-Za-z0-9]+`; integer keys (histogram buckets) are always valid.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKey {
    Label(String),
    Index(i64),
}

impl EventKey {
    pub fn is_valid(&self) -> bool {
        match self {
            EventKey::Index(_) => true,
            EventKey::Label(label) => {
                !label.is_empty()
                    && label
                        .bytes()
                        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
            }
        }
    }
}

impl fmt::Display for EventKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKey::Label(label) => f.write_str(label),
            EventKey::Index(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for EventKey {
    fn from(label: &str) -> Self {
        EventKey::Label(label.to_string())
    }
}

impl From<String> for EventKey {
    fn from(label: String) -> Self {
        EventKey::Label(label)
    }
}

impl From<i64> for EventKey {
    fn from(n: i64) -> Self {
        EventKey::Index(n)
    }
}

/// One collector: a counter map and an exec-time map that prune and
/// merge together.
#[derive(Clone, Debug, Default)]
pub struct EventCollector {
    pub counter_map: CounterMap,
    pub exec_time_map: ExecTimeMap,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&mut self, key: impl Into<EventKey>, delta: i64, now: i64) {
        self.counter_map.increment(key, delta, now);
    }

    pub fn log_exec_time(&mut self, key: impl Into<EventKey>, exec_time: f64, now: i64) {
        self.exec_time_map.log_exec_time(key, exec_time, now);
    }

    /// Point-wise combination: counts add, `last_updated` takes the max.
    /// Commutative and associative over both maps.
    pub fn merge(&mut self, other: &EventCollector) {
        self.counter_map.merge(&other.counter_map);
        self.exec_time_map.merge(&other.exec_time_map);
    }

    /// Drop every entry whose `last_updated` is older than
    /// `now - max_inactivity` or whose key no longer validates.
    pub fn prune(&mut self, max_inactivity: i64, now: i64) {
        self.counter_map.prune(max_inactivity, now);
        self.exec_time_map.prune(max_inactivity, now);
    }

    pub fn get_log_lines(&self, use_stats_analysis: bool, concise: bool) -> Vec<String> {
        let mut lines = self.counter_map.get_log_lines(concise);
        if use_stats_analysis {
            lines.extend(self.exec_time_map.get_stats_log_lines());
        } else {
            lines.extend(self.exec_time_map.get_log_lines());
        }
        lines
    }
}

impl fmt::Display for EventCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for line in self.get_log_lines(false, false) {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_validation() {
        assert!(EventKey::from("requests").is_valid());
        assert!(EventKey::from("http.200-ok_v1").is_valid());
        assert!(EventKey::from(40i64).is_valid());
        assert!(!EventKey::from("").is_valid());
        assert!(!EventKey::from("bad key").is_valid());
        assert!(!EventKey::from("semi;colon").is_valid());
    }

    #[test]
    fn test_merge_is_commutative() {
        let mut a = EventCollector::new();
        a.increment("hits", 3, 100);
        a.log_exec_time("page", 0.015, 100);

        let mut b = EventCollector::new();
        b.increment("hits", 2, 400);
        b.increment("misses", 1, 50);
        b.log_exec_time("page", 0.042, 300);

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        assert_eq!(ab.counter_map.get("hits"), Some((5, 400)));
        assert_eq!(ab.counter_map.get("hits"), ba.counter_map.get("hits"));
        assert_eq!(ab.counter_map.get("misses"), ba.counter_map.get("misses"));
        assert_eq!(ab.get_log_lines(false, false), ba.get_log_lines(false, false));
    }

    #[test]
    fn test_prune_by_inactivity() {
        let mut c = EventCollector::new();
        c.increment("a", 1, 100);
        c.increment("b", 1, 500);
        c.prune(300, 600);
        assert_eq!(c.counter_map.get("a"), None);
        assert_eq!(c.counter_map.get("b"), Some((1, 500)));
    }
}
