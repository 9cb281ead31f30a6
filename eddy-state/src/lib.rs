//! eddy-state: per-(step, key) state.
//!
//! Evaluators see a [`KeyedState`]: named bag, set and combining cells plus
//! timers. Cells hold JSON so any `serde` type can be stored behind a typed
//! tag. A [`StateStore`] owns the states of a whole run.

use std::collections::BTreeMap;
use std::marker::PhantomData;

use eddy_core::{EncodedKey, Result, Timestamp, Value, Window};
use serde::de::DeserializeOwned;
use serde::Serialize;

pub mod mem;
pub mod timers;

pub use mem::StateStore;
pub use timers::{TimeDomain, TimerFiring, TimerId};

/// Names an append-only list of `T`.
pub struct BagTag<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> BagTag<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

/// Names a duplicate-free collection of `T`.
pub struct SetTag<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> SetTag<T> {
    pub const fn new(name: &'static str) -> Self {
        Self { name, _marker: PhantomData }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combine {
    Sum,
    Max,
    Min,
}

impl Combine {
    pub fn apply(self, acc: i64, v: i64) -> i64 {
        match self {
            Combine::Sum => acc.saturating_add(v),
            Combine::Max => acc.max(v),
            Combine::Min => acc.min(v),
        }
    }
}

/// Names an integer cell folded with a [`Combine`] function.
#[derive(Debug, Clone, Copy)]
pub struct CombiningTag {
    name: &'static str,
    combine: Combine,
}

impl CombiningTag {
    pub const fn new(name: &'static str, combine: Combine) -> Self {
        Self { name, combine }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeyedState {
    bags: BTreeMap<&'static str, Vec<Value>>,
    sets: BTreeMap<&'static str, Vec<Value>>,
    combined: BTreeMap<&'static str, i64>,
    timers: BTreeMap<TimerId, Timestamp>,
}

impl KeyedState {
    pub fn is_empty(&self) -> bool {
        self.bags.values().all(Vec::is_empty)
            && self.sets.values().all(Vec::is_empty)
            && self.combined.is_empty()
            && self.timers.is_empty()
    }

    pub fn bag_read<T: DeserializeOwned>(&self, tag: &BagTag<T>) -> Result<Vec<T>> {
        let Some(items) = self.bags.get(tag.name) else { return Ok(Vec::new()) };
        items.iter().map(|v| Ok(T::deserialize(v)?)).collect()
    }

    pub fn bag_add<T: Serialize>(&mut self, tag: &BagTag<T>, item: &T) -> Result<()> {
        let v = serde_json::to_value(item)?;
        self.bags.entry(tag.name).or_default().push(v);
        Ok(())
    }

    pub fn bag_len<T>(&self, tag: &BagTag<T>) -> usize {
        self.bags.get(tag.name).map_or(0, Vec::len)
    }

    pub fn bag_clear<T>(&mut self, tag: &BagTag<T>) {
        self.bags.remove(tag.name);
    }

    /// Replaces the bag contents wholesale.
    pub fn bag_write<T: Serialize>(&mut self, tag: &BagTag<T>, items: &[T]) -> Result<()> {
        let encoded = items.iter().map(serde_json::to_value).collect::<std::result::Result<Vec<_>, _>>()?;
        if encoded.is_empty() {
            self.bags.remove(tag.name);
        } else {
            self.bags.insert(tag.name, encoded);
        }
        Ok(())
    }

    pub fn set_read<T: DeserializeOwned>(&self, tag: &SetTag<T>) -> Result<Vec<T>> {
        let Some(items) = self.sets.get(tag.name) else { return Ok(Vec::new()) };
        items.iter().map(|v| Ok(T::deserialize(v)?)).collect()
    }

    pub fn set_contains<T: Serialize>(&self, tag: &SetTag<T>, item: &T) -> Result<bool> {
        let v = serde_json::to_value(item)?;
        Ok(self.sets.get(tag.name).is_some_and(|items| items.contains(&v)))
    }

    /// Returns whether the item was newly added.
    pub fn set_add<T: Serialize>(&mut self, tag: &SetTag<T>, item: &T) -> Result<bool> {
        let v = serde_json::to_value(item)?;
        let items = self.sets.entry(tag.name).or_default();
        if items.contains(&v) {
            return Ok(false);
        }
        items.push(v);
        Ok(true)
    }

    pub fn set_remove<T: Serialize>(&mut self, tag: &SetTag<T>, item: &T) -> Result<()> {
        let v = serde_json::to_value(item)?;
        if let Some(items) = self.sets.get_mut(tag.name) {
            items.retain(|x| x != &v);
            if items.is_empty() {
                self.sets.remove(tag.name);
            }
        }
        Ok(())
    }

    pub fn combining_add(&mut self, tag: &CombiningTag, v: i64) {
        self.combined
            .entry(tag.name)
            .and_modify(|acc| *acc = tag.combine.apply(*acc, v))
            .or_insert(v);
    }

    pub fn combining_read(&self, tag: &CombiningTag) -> Option<i64> {
        self.combined.get(tag.name).copied()
    }

    pub fn combining_clear(&mut self, tag: &CombiningTag) {
        self.combined.remove(tag.name);
    }

    /// Sets or replaces the timer in `id`'s slot.
    pub fn set_timer(&mut self, id: TimerId, timestamp: Timestamp) {
        self.timers.insert(id, timestamp);
    }

    pub fn clear_timer(&mut self, id: &TimerId) -> Option<Timestamp> {
        self.timers.remove(id)
    }

    pub fn timer(&self, id: &TimerId) -> Option<Timestamp> {
        self.timers.get(id).copied()
    }

    pub fn timers(&self) -> impl Iterator<Item = (&TimerId, Timestamp)> {
        self.timers.iter().map(|(id, ts)| (id, *ts))
    }

    pub fn has_timers(&self, domain: TimeDomain) -> bool {
        self.timers.keys().any(|id| id.domain == domain)
    }

    pub fn clear_timers_for_window(&mut self, window: &Window) {
        self.timers.retain(|id, _| &id.window != window);
    }

    /// Re-keys every timer of `from` onto `to`, keeping the earlier timestamp on collision.
    pub fn move_timers(&mut self, from: &Window, to: &Window) {
        if from == to {
            return;
        }
        let moved: Vec<(TimerId, Timestamp)> = self
            .timers
            .iter()
            .filter(|(id, _)| &id.window == from)
            .map(|(id, ts)| (id.clone(), *ts))
            .collect();
        for (id, ts) in moved {
            self.timers.remove(&id);
            let target = TimerId { window: to.clone(), ..id };
            let slot = self.timers.entry(target).or_insert(ts);
            *slot = (*slot).min(ts);
        }
    }

    /// Removes and returns due timers, earliest first.
    pub fn take_due_timers(
        &mut self,
        key: &Option<EncodedKey>,
        input_watermark: Timestamp,
        now: Timestamp,
    ) -> Vec<TimerFiring> {
        let due: Vec<TimerId> = self
            .timers
            .iter()
            .filter(|(id, ts)| id.is_due(**ts, input_watermark, now))
            .map(|(id, _)| id.clone())
            .collect();
        let mut fired: Vec<TimerFiring> = due
            .into_iter()
            .filter_map(|id| {
                let timestamp = self.timers.remove(&id)?;
                Some(TimerFiring { key: key.clone(), id, timestamp })
            })
            .collect();
        fired.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        fired
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::TimestampedValue;
    use serde_json::json;

    const ELEMENTS: BagTag<(Window, TimestampedValue)> = BagTag::new("elements");
    const SEEN: SetTag<Window> = SetTag::new("seen");
    const COUNT: CombiningTag = CombiningTag::new("count", Combine::Sum);

    fn w(start: i64, end: i64) -> Window {
        Window::interval(Timestamp::from_secs(start), Timestamp::from_secs(end))
    }

    #[test]
    fn typed_cells_round_trip() {
        let mut s = KeyedState::default();
        assert!(s.is_empty());
        s.bag_add(&ELEMENTS, &(w(0, 10), TimestampedValue::new(json!("a"), Timestamp::from_secs(1))))
            .unwrap();
        assert!(s.set_add(&SEEN, &w(0, 10)).unwrap());
        assert!(!s.set_add(&SEEN, &w(0, 10)).unwrap());
        s.combining_add(&COUNT, 2);
        s.combining_add(&COUNT, 3);

        let bag = s.bag_read(&ELEMENTS).unwrap();
        assert_eq!(bag[0].1.value, json!("a"));
        assert_eq!(s.set_read(&SEEN).unwrap(), vec![w(0, 10)]);
        assert_eq!(s.combining_read(&COUNT), Some(5));

        s.bag_clear(&ELEMENTS);
        s.set_remove(&SEEN, &w(0, 10)).unwrap();
        s.combining_clear(&COUNT);
        assert!(s.is_empty());
    }

    #[test]
    fn due_timers_are_taken_once() {
        let mut s = KeyedState::default();
        let event = TimerId::new(w(0, 10), "end", TimeDomain::Watermark);
        let processing = TimerId::new(w(0, 10), "delay", TimeDomain::RealTime);
        s.set_timer(event.clone(), Timestamp::from_secs(10));
        s.set_timer(processing.clone(), Timestamp::from_secs(100));

        let key = Some(b"k".to_vec());
        assert!(s.take_due_timers(&key, Timestamp::from_secs(9), Timestamp::ZERO).is_empty());
        let fired = s.take_due_timers(&key, Timestamp::from_secs(10), Timestamp::ZERO);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, event);
        assert!(s.take_due_timers(&key, Timestamp::MAX, Timestamp::ZERO).is_empty());
        assert!(s.has_timers(TimeDomain::RealTime));
        let fired = s.take_due_timers(&key, Timestamp::MAX, Timestamp::from_secs(100));
        assert_eq!(fired[0].id, processing);
        assert!(s.is_empty());
    }

    #[test]
    fn moving_timers_keeps_earliest() {
        let mut s = KeyedState::default();
        s.set_timer(TimerId::new(w(0, 10), "t", TimeDomain::RealTime), Timestamp::from_secs(3));
        s.set_timer(TimerId::new(w(0, 20), "t", TimeDomain::RealTime), Timestamp::from_secs(7));
        s.move_timers(&w(0, 10), &w(0, 20));
        let timers: Vec<_> = s.timers().map(|(id, ts)| (id.clone(), ts)).collect();
        assert_eq!(timers, vec![(TimerId::new(w(0, 20), "t", TimeDomain::RealTime), Timestamp::from_secs(3))]);
    }
}
