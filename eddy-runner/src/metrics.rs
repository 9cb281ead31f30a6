use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

/// Narrows a metrics query by step name and/or counter name.
#[derive(Debug, Clone, Default)]
pub struct MetricsFilter {
    pub step: Option<String>,
    pub name: Option<String>,
}

impl MetricsFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    fn matches(&self, step: &str, name: &str) -> bool {
        self.step.as_deref().map_or(true, |s| s == step) && self.name.as_deref().map_or(true, |n| n == name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterResult {
    pub step: String,
    pub name: String,
    pub committed: i64,
}

pub trait MetricsQueryable {
    fn query(&self, filter: &MetricsFilter) -> Vec<CounterResult>;
}

/// User counters committed by a run.
#[derive(Debug, Clone, Default)]
pub struct DirectMetrics {
    counters: Arc<Mutex<BTreeMap<(String, String), i64>>>,
}

impl DirectMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn commit(&self, step: &str, counters: &BTreeMap<String, i64>) {
        if counters.is_empty() {
            return;
        }
        let mut guard = self.counters.lock();
        for (name, by) in counters {
            *guard.entry((step.to_string(), name.clone())).or_default() += by;
        }
    }
}

impl MetricsQueryable for DirectMetrics {
    fn query(&self, filter: &MetricsFilter) -> Vec<CounterResult> {
        self.counters
            .lock()
            .iter()
            .filter(|((step, name), _)| filter.matches(step, name))
            .map(|((step, name), v)| CounterResult { step: step.clone(), name: name.clone(), committed: *v })
            .collect()
    }
}
