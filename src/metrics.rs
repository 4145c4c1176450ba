use std::collections::BTreeMap;

use parking_lot::Mutex;

/// A counter increment reported by the engine.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Counter<'a> {
    CommandUsage(&'a str),
    CacheHit(&'a str),
    CacheMiss(&'a str),
}

impl Counter<'_> {
    fn key(&self) -> String {
        match self {
            Counter::CommandUsage(command) => format!("command_usage{{command=\"{command}\"}}"),
            Counter::CacheHit(cache) => format!("cache_hits{{cache=\"{cache}\"}}"),
            Counter::CacheMiss(cache) => format!("cache_misses{{cache=\"{cache}\"}}"),
        }
    }
}

pub trait MetricsSink: Send + Sync {
    fn incr(&self, counter: Counter<'_>);
}

/// In-memory labeled counters.
#[derive(Debug, Default)]
pub struct Metrics {
    counters: Mutex<BTreeMap<String, u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn get(&self, counter: Counter<'_>) -> u64 {
        self.counters.lock().get(&counter.key()).copied().unwrap_or(0)
    }

    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }
}

impl MetricsSink for Metrics {
    fn incr(&self, counter: Counter<'_>) {
        *self.counters.lock().entry(counter.key()).or_insert(0) += 1;
    }
}
