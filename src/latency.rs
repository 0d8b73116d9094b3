//! Timing samples for backing filesystem calls.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

/// Receives one sample per timed backing call.
pub trait LatencySink: Send + Sync {
    fn record(&self, op: &str, arg: &str, elapsed: Duration);
}

#[derive(Debug, Clone)]
pub struct LatencySample {
    pub name: String,
    pub arg: String,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LatencyEntry {
    pub count: u64,
    pub total_ns: u64,
}

/// Point-in-time copy of a [`LatencyMap`], suitable for serialization.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LatencyReport {
    pub ops: BTreeMap<String, LatencyEntry>,
    pub args: BTreeMap<String, BTreeMap<String, u64>>,
}

/// Aggregates call counts and total time per operation name, plus a tally of
/// the arguments each operation was called with.
#[derive(Debug, Default)]
pub struct LatencyMap {
    inner: Mutex<LatencyReport>,
}

impl LatencyMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, name: &str, arg: &str, elapsed: Duration) {
        let mut inner = self.inner.lock();
        Self::add_locked(&mut inner, name, arg, elapsed);
    }

    pub fn add_many(&self, samples: &[LatencySample]) {
        let mut inner = self.inner.lock();
        for s in samples {
            Self::add_locked(&mut inner, &s.name, &s.arg, s.elapsed);
        }
    }

    fn add_locked(inner: &mut LatencyReport, name: &str, arg: &str, elapsed: Duration) {
        let entry = inner.ops.entry(name.to_string()).or_default();
        entry.count += 1;
        entry.total_ns = entry
            .total_ns
            .saturating_add(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX));

        if !arg.is_empty() {
            *inner
                .args
                .entry(name.to_string())
                .or_default()
                .entry(arg.to_string())
                .or_default() += 1;
        }
    }

    pub fn counts(&self) -> HashMap<String, u64> {
        let inner = self.inner.lock();
        inner
            .ops
            .iter()
            .map(|(k, v)| (k.clone(), v.count))
            .collect()
    }

    /// Mean latency per operation. Use 1e-3 for `unit` to get milliseconds.
    pub fn latencies(&self, unit: f64) -> HashMap<String, f64> {
        let inner = self.inner.lock();
        let mult = 1.0 / (1e9 * unit);
        inner
            .ops
            .iter()
            .filter(|(_, v)| v.count > 0)
            .map(|(k, v)| (k.clone(), mult * v.total_ns as f64 / v.count as f64))
            .collect()
    }

    /// Arguments seen for `name`, most frequent first, formatted as
    /// right-aligned count followed by the argument.
    pub fn top_args(&self, name: &str) -> Vec<String> {
        let mut tallies: Vec<(String, u64)> = {
            let inner = self.inner.lock();
            match inner.args.get(name) {
                Some(m) => m.iter().map(|(k, v)| (k.clone(), *v)).collect(),
                None => return Vec::new(),
            }
        };
        tallies.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        tallies
            .into_iter()
            .map(|(arg, count)| format!("{:>9} {}", count, arg))
            .collect()
    }

    pub fn report(&self) -> LatencyReport {
        self.inner.lock().clone()
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        Ok(serde_json::to_string_pretty(&self.report())?)
    }
}

impl LatencySink for LatencyMap {
    fn record(&self, op: &str, arg: &str, elapsed: Duration) {
        self.add(op, arg, elapsed);
    }
}
