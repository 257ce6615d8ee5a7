use std::collections::HashMap;

use crate::stats::{compute_statistics, Summary};
use crate::EventKey;

/// Histogram bucket width in milliseconds. Execution times are floored
/// into buckets, so bucket 0 means "took less than one granule".
pub const DEFAULT_GRANULARITY_MS: i64 = 10;

/// Map of key -> (count, last updated timestamp in epoch seconds).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CounterMap {
    entries: HashMap<EventKey, (i64, i64)>,
}

impl CounterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: impl Into<EventKey>) -> Option<(i64, i64)> {
        self.entries.get(&key.into()).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&EventKey, &(i64, i64))> {
        self.entries.iter()
    }

    pub fn increment(&mut self, key: impl Into<EventKey>, delta: i64, now: i64) {
        let key = key.into();
        if !key.is_valid() {
            log::warn!("invalid key: '{key}'");
            return;
        }
        let entry = self.entries.entry(key).or_insert((0, now));
        entry.0 += delta;
        if now > entry.1 {
            entry.1 = now;
        }
    }

    pub fn merge(&mut self, other: &CounterMap) {
        for (key, &(value, time_updated)) in other.entries.iter() {
            self.increment(key.clone(), value, time_updated);
        }
    }

    pub fn prune(&mut self, max_inactivity: i64, now: i64) {
        let expiration_time = now - max_inactivity;
        self.entries
            .retain(|key, &mut (_, time_updated)| time_updated >= expiration_time && key.is_valid());
    }

    pub fn get_log_lines(&self, concise: bool) -> Vec<String> {
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        entries
            .into_iter()
            .map(|(key, (value, _))| {
                if concise {
                    format!("{key}: {value}")
                } else {
                    format!("{key}:{value}")
                }
            })
            .collect()
    }
}

/// Map of key -> (bucketed execution time counters, last updated). The
/// inner counter map is keyed by the bucket's millisecond value.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecTimeMap {
    granularity: i64,
    entries: HashMap<EventKey, (CounterMap, i64)>,
}

impl Default for ExecTimeMap {
    fn default() -> Self {
        Self::with_granularity(DEFAULT_GRANULARITY_MS)
    }
}

impl ExecTimeMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_granularity(granularity: i64) -> Self {
        Self {
            granularity,
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: impl Into<EventKey>) -> Option<&(CounterMap, i64)> {
        self.entries.get(&key.into())
    }

    /// Record one execution time, given in seconds, floored into a
    /// `granularity`-sized millisecond bucket.
    pub fn log_exec_time(&mut self, key: impl Into<EventKey>, exec_time: f64, now: i64) {
        let key = key.into();
        if !key.is_valid() {
            log::warn!("invalid key: '{key}'");
            return;
        }
        let exec_time_ms = (exec_time * 1000.0 / self.granularity as f64) as i64 * self.granularity;
        let entry = self
            .entries
            .entry(key)
            .or_insert_with(|| (CounterMap::new(), now));
        entry.0.increment(exec_time_ms, 1, now);
        if now > entry.1 {
            entry.1 = now;
        }
    }

    pub fn merge(&mut self, other: &ExecTimeMap) {
        for (key, (counter_map, time_updated)) in other.entries.iter() {
            match self.entries.get_mut(key) {
                Some(entry) => {
                    entry.0.merge(counter_map);
                    if *time_updated > entry.1 {
                        entry.1 = *time_updated;
                    }
                }
                None => {
                    self.entries
                        .insert(key.clone(), (counter_map.clone(), *time_updated));
                }
            }
        }
    }

    pub fn prune(&mut self, max_inactivity: i64, now: i64) {
        let expiration_time = now - max_inactivity;
        self.entries
            .retain(|key, (_, time_updated)| *time_updated >= expiration_time && key.is_valid());
    }

    pub fn get_log_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut entries: Vec<_> = self.entries.iter().collect();
        entries.sort_by(|a, b| a.0.cmp(b.0));
        for (key, (counter_map, _)) in entries {
            let mut buckets: Vec<_> = counter_map.iter().collect();
            buckets.sort_by(|a, b| a.0.cmp(b.0));
            for (time_ms, (count, _)) in buckets {
                lines.push(format!("{key}.{time_ms}ms: {count}"));
            }
        }
        lines
    }

    pub fn get_stats_log_lines(&self) -> Vec<String> {
        let mut lines = Vec::new();
        let mut stats: Vec<_> = self.get_stats_map(&[]).into_iter().collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        for (key, summary) in stats {
            lines.push(format!(
                "{key}: {:.0}/{:.0}/{:.0}/{:.0} {}",
                summary.min, summary.average, summary.max, summary.std_dev, summary.samples
            ));
        }
        lines
    }

    /// Flatten each key's buckets into a sample list and summarize it.
    pub fn get_stats_map(&self, percentiles: &[u32]) -> Vec<(EventKey, Summary)> {
        let mut stats_map = Vec::with_capacity(self.entries.len());
        for (key, (counter_map, _)) in self.entries.iter() {
            let mut samples = Vec::new();
            for (bucket, (count, _)) in counter_map.iter() {
                if let EventKey::Index(time_ms) = bucket {
                    for _ in 0..*count {
                        samples.push(*time_ms);
                    }
                }
            }
            if let Some(summary) = compute_statistics(samples, percentiles) {
                stats_map.push((key.clone(), summary));
            }
        }
        stats_map
    }
}
