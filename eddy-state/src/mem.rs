use std::collections::HashMap;

use eddy_core::{EncodedKey, StepId, Timestamp};
use parking_lot::Mutex;

use crate::{KeyedState, TimeDomain, TimerFiring};

type StateKey = (StepId, Option<EncodedKey>);

/// In-memory home of every (step, key) state of one run.
///
/// A task takes its key's state out with [`StateStore::take`] and hands it
/// back on commit, so a state is never shared between a running task and the
/// timer scan.
#[derive(Debug, Default)]
pub struct StateStore {
    inner: Mutex<HashMap<StateKey, KeyedState>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self, step: StepId, key: &Option<EncodedKey>) -> KeyedState {
        self.inner.lock().remove(&(step, key.clone())).unwrap_or_default()
    }

    /// Stores `state`, or drops the slot when the state is empty.
    pub fn put(&self, step: StepId, key: Option<EncodedKey>, state: KeyedState) {
        let mut guard = self.inner.lock();
        if state.is_empty() {
            guard.remove(&(step, key));
        } else {
            guard.insert((step, key), state);
        }
    }

    pub fn remove(&self, step: StepId, key: &Option<EncodedKey>) {
        self.inner.lock().remove(&(step, key.clone()));
    }

    pub fn get(&self, step: StepId, key: &Option<EncodedKey>) -> Option<KeyedState> {
        self.inner.lock().get(&(step, key.clone())).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Removes every due timer of `step`, grouped per key.
    pub fn take_due_timers(&self, step: StepId, input_watermark: Timestamp, now: Timestamp) -> Vec<TimerFiring> {
        let mut guard = self.inner.lock();
        let mut fired = Vec::new();
        for ((s, key), state) in guard.iter_mut() {
            if *s != step {
                continue;
            }
            fired.extend(state.take_due_timers(key, input_watermark, now));
        }
        guard.retain(|_, state| !state.is_empty());
        fired
    }

    pub fn has_timers(&self, domain: TimeDomain) -> bool {
        self.inner.lock().values().any(|s| s.has_timers(domain))
    }
}
