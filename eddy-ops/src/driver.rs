//! Per-key windowing and triggering.
//!
//! [`TriggerDriver`] owns no data: it reads and rewrites the [`KeyedState`]
//! of one key. Elements wait in a bag tagged with their window; triggers keep
//! integer values per (window, tag); timers are keyed by (window, tag, domain).

use std::collections::{BTreeMap, BTreeSet};

use eddy_core::{Result, Timestamp, TimestampedValue, WindowedValue, Window};
use eddy_state::{BagTag, Combine, CombiningTag, KeyedState, SetTag, TimeDomain, TimerFiring, TimerId};
use tracing::debug;

use crate::trigger::TriggerContext;
use crate::window::{AccumulationMode, Windowing};

const KNOWN_WINDOWS: SetTag<Window> = SetTag::new("known_windows");
const FINISHED_WINDOWS: SetTag<Window> = SetTag::new("finished_windows");
const UNFIRED_WINDOWS: SetTag<Window> = SetTag::new("unfired_windows");
const LAST_KNOWN_TIME: CombiningTag = CombiningTag::new("last_known_time", Combine::Max);
const LAST_KNOWN_WATERMARK: CombiningTag = CombiningTag::new("last_known_watermark", Combine::Max);
const ELEMENTS: BagTag<(Window, TimestampedValue)> = BagTag::new("elements");
const WINDOW_TAG_VALUES: BagTag<(Window, String, i64)> = BagTag::new("window_tag_values");

/// Timer tag of the end-of-life timer every window gets.
pub const GC_TIMER_TAG: &str = "__gc";

/// Values emitted by one firing of one window.
#[derive(Debug, Clone, PartialEq)]
pub struct Pane {
    pub window: Window,
    pub values: Vec<TimestampedValue>,
}

impl Pane {
    pub fn timestamp(&self) -> Timestamp {
        self.window.max_timestamp()
    }
}

#[derive(Debug, Default)]
pub struct DriverOutput {
    pub panes: Vec<Pane>,
    /// Elements ignored because their window had expired or finished.
    pub dropped: usize,
}

#[derive(Debug, Clone)]
pub struct TriggerDriver {
    windowing: Windowing,
}

impl TriggerDriver {
    pub fn new(windowing: Windowing) -> Self {
        Self { windowing }
    }

    pub fn windowing(&self) -> &Windowing {
        &self.windowing
    }

    pub fn is_gc_timer(timer: &TimerFiring) -> bool {
        timer.id.tag == GC_TIMER_TAG && timer.id.domain == TimeDomain::Watermark
    }

    /// Last moment the window accepts data.
    fn gc_time(&self, window: &Window) -> Timestamp {
        window.max_timestamp() + self.windowing.allowed_lateness
    }

    fn is_expired(&self, window: &Window, watermark: Timestamp) -> bool {
        watermark > self.gc_time(window)
    }

    fn observe(&self, state: &mut KeyedState, input_watermark: Timestamp, now: Timestamp) -> (Timestamp, Timestamp) {
        state.combining_add(&LAST_KNOWN_WATERMARK, input_watermark.micros());
        state.combining_add(&LAST_KNOWN_TIME, now.micros());
        let wm = state.combining_read(&LAST_KNOWN_WATERMARK).map_or(input_watermark, Timestamp::from_micros);
        let time = state.combining_read(&LAST_KNOWN_TIME).map_or(now, Timestamp::from_micros);
        (wm, time)
    }

    pub fn process_elements(
        &self,
        state: &mut KeyedState,
        elements: &[WindowedValue],
        input_watermark: Timestamp,
        now: Timestamp,
    ) -> Result<DriverOutput> {
        let (watermark, now) = self.observe(state, input_watermark, now);
        let finished: BTreeSet<Window> = state.set_read(&FINISHED_WINDOWS)?.into_iter().collect();

        let mut by_window: BTreeMap<Window, Vec<TimestampedValue>> = BTreeMap::new();
        let mut dropped = 0;
        for wv in elements {
            for w in &wv.windows {
                if self.is_expired(w, watermark) || finished.contains(w) {
                    dropped += 1;
                    continue;
                }
                by_window
                    .entry(w.clone())
                    .or_default()
                    .push(TimestampedValue::new(wv.value.clone(), wv.timestamp));
            }
        }
        if by_window.is_empty() {
            if self.is_idle(state)? {
                state.combining_clear(&LAST_KNOWN_WATERMARK);
                state.combining_clear(&LAST_KNOWN_TIME);
            }
            return Ok(DriverOutput { panes: Vec::new(), dropped });
        }

        if self.windowing.window_fn.is_merging() {
            let known: BTreeSet<Window> = state.set_read(&KNOWN_WINDOWS)?.into_iter().collect();
            if by_window.keys().any(|w| !known.contains(w)) {
                let all: Vec<Window> = known.iter().chain(by_window.keys()).cloned().collect();
                for (to_merge, result) in self.windowing.window_fn.merge(&all) {
                    self.merge_windows(state, &to_merge, &result, now)?;
                    for w in to_merge.iter().filter(|w| **w != result) {
                        if let Some(values) = by_window.remove(w) {
                            by_window.entry(result.clone()).or_default().extend(values);
                        }
                    }
                }
            }
        }

        for (w, values) in &by_window {
            self.open_window(state, w)?;
            state.set_add(&UNFIRED_WINDOWS, w)?;
            for v in values {
                state.bag_add(&ELEMENTS, &(w.clone(), v.clone()))?;
                let mut ctx = WindowContext::new(state, w.clone(), now);
                self.windowing.trigger.on_element(w, &mut ctx)?;
            }
        }

        let interest: BTreeSet<Window> = by_window.into_keys().collect();
        let panes = self.fire_eligible(state, TimeDomain::Watermark, watermark, Some(&interest), now)?;
        Ok(DriverOutput { panes, dropped })
    }

    /// Handles one fired timer; the timer has already been removed from `state`.
    pub fn process_timer(
        &self,
        state: &mut KeyedState,
        timer: &TimerFiring,
        input_watermark: Timestamp,
        now: Timestamp,
    ) -> Result<DriverOutput> {
        let (watermark, now) = self.observe(state, input_watermark, now);
        let window = timer.window();
        if Self::is_gc_timer(timer) {
            return self.collect_garbage(state, window);
        }
        if !state.set_contains(&KNOWN_WINDOWS, window)? {
            return Ok(DriverOutput::default());
        }
        let interest = BTreeSet::from([window.clone()]);
        let panes = self.fire_eligible(state, timer.domain(), watermark, Some(&interest), now)?;
        Ok(DriverOutput { panes, dropped: 0 })
    }

    fn open_window(&self, state: &mut KeyedState, w: &Window) -> Result<()> {
        if state.set_add(&KNOWN_WINDOWS, w)? {
            let gc = TimerId::new(w.clone(), GC_TIMER_TAG, TimeDomain::Watermark);
            state.set_timer(gc, self.gc_time(w).successor());
        }
        Ok(())
    }

    /// Moves elements, tag values, timers and bookkeeping of `to_merge` onto `result`.
    fn merge_windows(&self, state: &mut KeyedState, to_merge: &[Window], result: &Window, now: Timestamp) -> Result<()> {
        debug!(windows = to_merge.len(), result = %result, "merging windows");
        let retag = |w: Window| if to_merge.contains(&w) { result.clone() } else { w };

        let values: Vec<(Window, String, i64)> = state
            .bag_read(&WINDOW_TAG_VALUES)?
            .into_iter()
            .map(|(w, tag, v)| (retag(w), tag, v))
            .collect();
        state.bag_write(&WINDOW_TAG_VALUES, &values)?;

        let elements: Vec<(Window, TimestampedValue)> =
            state.bag_read(&ELEMENTS)?.into_iter().map(|(w, v)| (retag(w), v)).collect();
        state.bag_write(&ELEMENTS, &elements)?;

        let mut unfired = false;
        for w in to_merge.iter().filter(|w| *w != result) {
            state.move_timers(w, result);
            state.set_remove(&KNOWN_WINDOWS, w)?;
            if state.set_contains(&UNFIRED_WINDOWS, w)? {
                unfired = true;
                state.set_remove(&UNFIRED_WINDOWS, w)?;
            }
        }
        if unfired {
            state.set_add(&UNFIRED_WINDOWS, result)?;
        }
        state.set_add(&KNOWN_WINDOWS, result)?;
        let gc = TimerId::new(result.clone(), GC_TIMER_TAG, TimeDomain::Watermark);
        state.set_timer(gc, self.gc_time(result).successor());

        let mut ctx = WindowContext::new(state, result.clone(), now);
        self.windowing.trigger.on_merge(to_merge, result, &mut ctx)
    }

    fn fire_eligible(
        &self,
        state: &mut KeyedState,
        domain: TimeDomain,
        watermark: Timestamp,
        interest: Option<&BTreeSet<Window>>,
        now: Timestamp,
    ) -> Result<Vec<Pane>> {
        let elements = state.bag_read(&ELEMENTS)?;
        let mut by_window: BTreeMap<Window, Vec<TimestampedValue>> = BTreeMap::new();
        for (w, v) in &elements {
            by_window.entry(w.clone()).or_default().push(v.clone());
        }

        let mut panes = Vec::new();
        let mut fired = BTreeSet::new();
        let mut finished = BTreeSet::new();
        for (w, values) in by_window {
            if interest.is_some_and(|i| !i.contains(&w)) {
                continue;
            }
            let mut ctx = WindowContext::new(state, w.clone(), now);
            if !self.windowing.trigger.should_fire(domain, watermark, &w, &mut ctx)? {
                continue;
            }
            if self.windowing.trigger.on_fire(watermark, &w, &mut ctx)? {
                finished.insert(w.clone());
            }
            debug!(window = %w, values = values.len(), "trigger fired");
            state.set_remove(&UNFIRED_WINDOWS, &w)?;
            fired.insert(w.clone());
            panes.push(Pane { window: w, values });
        }
        if fired.is_empty() {
            return Ok(panes);
        }

        let discarding = self.windowing.accumulation_mode == AccumulationMode::Discarding;
        let keep: Vec<(Window, TimestampedValue)> = elements
            .into_iter()
            .filter(|(w, _)| !finished.contains(w) && !(discarding && fired.contains(w)))
            .collect();
        state.bag_write(&ELEMENTS, &keep)?;
        for w in &finished {
            self.finish_window(state, w)?;
        }
        Ok(panes)
    }

    /// The window will never fire again. Only its GC timer survives, to
    /// forget the finished marker once late data can no longer arrive.
    fn finish_window(&self, state: &mut KeyedState, w: &Window) -> Result<()> {
        clear_window_tags(state, w)?;
        state.clear_timers_for_window(w);
        state.set_timer(TimerId::new(w.clone(), GC_TIMER_TAG, TimeDomain::Watermark), self.gc_time(w).successor());
        state.set_remove(&KNOWN_WINDOWS, w)?;
        state.set_remove(&UNFIRED_WINDOWS, w)?;
        state.set_add(&FINISHED_WINDOWS, w)?;
        Ok(())
    }

    fn collect_garbage(&self, state: &mut KeyedState, w: &Window) -> Result<DriverOutput> {
        if state.set_contains(&FINISHED_WINDOWS, w)? {
            state.set_remove(&FINISHED_WINDOWS, w)?;
            if self.is_idle(state)? {
                state.combining_clear(&LAST_KNOWN_WATERMARK);
                state.combining_clear(&LAST_KNOWN_TIME);
            }
            return Ok(DriverOutput::default());
        }
        if !state.set_contains(&KNOWN_WINDOWS, w)? {
            return Ok(DriverOutput::default());
        }
        let (mine, rest): (Vec<_>, Vec<_>) = state.bag_read(&ELEMENTS)?.into_iter().partition(|(x, _)| x == w);
        let mut panes = Vec::new();
        if state.set_contains(&UNFIRED_WINDOWS, w)? && !mine.is_empty() {
            debug!(window = %w, values = mine.len(), "final pane at window expiry");
            panes.push(Pane { window: w.clone(), values: mine.into_iter().map(|(_, v)| v).collect() });
        }
        state.bag_write(&ELEMENTS, &rest)?;
        clear_window_tags(state, w)?;
        state.clear_timers_for_window(w);
        state.set_remove(&KNOWN_WINDOWS, w)?;
        state.set_remove(&UNFIRED_WINDOWS, w)?;
        if self.is_idle(state)? {
            state.combining_clear(&LAST_KNOWN_WATERMARK);
            state.combining_clear(&LAST_KNOWN_TIME);
        }
        Ok(DriverOutput { panes, dropped: 0 })
    }

    /// Earliest timestamp this key may still emit at, `None` when nothing is open.
    pub fn watermark_hold(&self, state: &KeyedState) -> Result<Option<Timestamp>> {
        let watermark = state.combining_read(&LAST_KNOWN_WATERMARK).map_or(Timestamp::MIN, Timestamp::from_micros);
        let mut hold: Option<Timestamp> = None;
        for w in state.set_read(&KNOWN_WINDOWS)? {
            // an early firing does not release the on-time pane's hold
            let at = if watermark < w.end() {
                w.max_timestamp()
            } else {
                self.gc_time(&w)
            };
            hold = Some(hold.map_or(at, |h| h.min(at)));
        }
        Ok(hold)
    }

    /// Whether the key still has windows or timers worth keeping.
    pub fn is_idle(&self, state: &KeyedState) -> Result<bool> {
        Ok(state.set_read(&KNOWN_WINDOWS)?.is_empty()
            && state.set_read(&FINISHED_WINDOWS)?.is_empty()
            && state.timers().next().is_none())
    }
}

fn clear_window_tags(state: &mut KeyedState, w: &Window) -> Result<()> {
    let values: Vec<(Window, String, i64)> =
        state.bag_read(&WINDOW_TAG_VALUES)?.into_iter().filter(|(x, _, _)| x != w).collect();
    state.bag_write(&WINDOW_TAG_VALUES, &values)
}

/// Trigger context bound to one window of one key's state.
struct WindowContext<'s> {
    state: &'s mut KeyedState,
    window: Window,
    now: Timestamp,
}

impl<'s> WindowContext<'s> {
    fn new(state: &'s mut KeyedState, window: Window, now: Timestamp) -> Self {
        Self { state, window, now }
    }
}

impl TriggerContext for WindowContext<'_> {
    fn current_time(&self) -> Timestamp {
        self.now
    }

    fn set_timer(&mut self, name: &str, domain: TimeDomain, timestamp: Timestamp) {
        self.state.set_timer(TimerId::new(self.window.clone(), name, domain), timestamp);
    }

    fn clear_timer(&mut self, name: &str, domain: TimeDomain) {
        self.state.clear_timer(&TimerId::new(self.window.clone(), name, domain));
    }

    fn add_state(&mut self, tag: &str, value: i64) -> Result<()> {
        self.state.bag_add(&WINDOW_TAG_VALUES, &(self.window.clone(), tag.to_string(), value))
    }

    fn get_state(&self, tag: &str, combine: Combine) -> Result<Option<i64>> {
        Ok(self
            .state
            .bag_read(&WINDOW_TAG_VALUES)?
            .into_iter()
            .filter(|(w, t, _)| *w == self.window && t == tag)
            .map(|(_, _, v)| v)
            .reduce(|a, b| combine.apply(a, b)))
    }

    fn clear_state(&mut self, tag: &str) -> Result<()> {
        let values: Vec<(Window, String, i64)> = self
            .state
            .bag_read(&WINDOW_TAG_VALUES)?
            .into_iter()
            .filter(|(w, t, _)| !(*w == self.window && t == tag))
            .collect();
        self.state.bag_write(&WINDOW_TAG_VALUES, &values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trigger::Trigger;
    use crate::window::WindowFn;
    use chrono::Duration;
    use serde_json::json;

    fn secs(s: i64) -> Timestamp {
        Timestamp::from_secs(s)
    }

    fn w(start: i64, end: i64) -> Window {
        Window::interval(secs(start), secs(end))
    }

    fn element(v: serde_json::Value, ts: i64, windowing: &Windowing) -> WindowedValue {
        WindowedValue::new(v, secs(ts), windowing.window_fn.assign(secs(ts)))
    }

    fn fire_timers(driver: &TriggerDriver, state: &mut KeyedState, wm: Timestamp) -> Vec<Pane> {
        let mut panes = Vec::new();
        for t in state.take_due_timers(&None, wm, Timestamp::ZERO) {
            panes.extend(driver.process_timer(state, &t, wm, Timestamp::ZERO).unwrap().panes);
        }
        panes
    }

    fn values(p: &Pane) -> Vec<serde_json::Value> {
        p.values.iter().map(|v| v.value.clone()).collect()
    }

    #[test]
    fn on_time_pane_waits_for_watermark() {
        let windowing = Windowing::new(WindowFn::fixed(Duration::seconds(10)));
        let driver = TriggerDriver::new(windowing.clone());
        let mut state = KeyedState::default();
        let input = vec![element(json!("a"), 1, &windowing), element(json!("b"), 4, &windowing)];
        let out = driver.process_elements(&mut state, &input, secs(0), Timestamp::ZERO).unwrap();
        assert!(out.panes.is_empty());
        assert_eq!(driver.watermark_hold(&state).unwrap(), Some(w(0, 10).max_timestamp()));

        assert!(fire_timers(&driver, &mut state, secs(9)).is_empty());
        let panes = fire_timers(&driver, &mut state, secs(10));
        assert_eq!(panes.len(), 1);
        assert_eq!(values(&panes[0]), vec![json!("a"), json!("b")]);
        assert_eq!(panes[0].timestamp(), w(0, 10).max_timestamp());
        // no lateness: the window expires together with its on-time pane
        assert_eq!(driver.watermark_hold(&state).unwrap(), None);
        assert!(state.is_empty());
    }

    #[test]
    fn discarding_mode_empties_bag_after_fire() {
        let windowing = Windowing::new(WindowFn::Global).with_trigger(Trigger::repeatedly(Trigger::AfterCount(2)));
        let driver = TriggerDriver::new(windowing.clone());
        let mut state = KeyedState::default();
        let input = vec![element(json!(1), 1, &windowing), element(json!(2), 2, &windowing)];
        let out = driver.process_elements(&mut state, &input, Timestamp::MIN, Timestamp::ZERO).unwrap();
        assert_eq!(out.panes.len(), 1);
        assert_eq!(state.bag_len(&ELEMENTS), 0);

        let out = driver.process_elements(&mut state, &input, Timestamp::MIN, Timestamp::ZERO).unwrap();
        assert_eq!(values(&out.panes[0]), vec![json!(1), json!(2)]);
    }

    #[test]
    fn accumulating_mode_keeps_fired_elements() {
        let windowing = Windowing::new(WindowFn::Global)
            .with_trigger(Trigger::repeatedly(Trigger::AfterCount(2)))
            .accumulating();
        let driver = TriggerDriver::new(windowing.clone());
        let mut state = KeyedState::default();
        let first = vec![element(json!(1), 1, &windowing), element(json!(2), 2, &windowing)];
        let out = driver.process_elements(&mut state, &first, Timestamp::MIN, Timestamp::ZERO).unwrap();
        assert_eq!(out.panes.len(), 1);
        assert_eq!(state.bag_len(&ELEMENTS), 2);

        let second = vec![element(json!(3), 3, &windowing), element(json!(4), 4, &windowing)];
        let out = driver.process_elements(&mut state, &second, Timestamp::MIN, Timestamp::ZERO).unwrap();
        assert_eq!(values(&out.panes[0]), vec![json!(1), json!(2), json!(3), json!(4)]);
    }

    #[test]
    fn merging_sessions_migrates_state_and_clears_old_windows() {
        let windowing = Windowing::new(WindowFn::sessions(Duration::seconds(10)))
            .with_trigger(Trigger::AfterCount(100));
        let driver = TriggerDriver::new(windowing.clone());
        let mut state = KeyedState::default();

        driver.process_elements(&mut state, &[element(json!("a"), 0, &windowing)], secs(-100), Timestamp::ZERO).unwrap();
        driver.process_elements(&mut state, &[element(json!("b"), 25, &windowing)], secs(-100), Timestamp::ZERO).unwrap();
        let tag_sum = |state: &KeyedState, window: Window| {
            let ctx_state = &mut state.clone();
            WindowContext::new(ctx_state, window, Timestamp::ZERO).get_state("count", Combine::Sum).unwrap()
        };
        assert_eq!(tag_sum(&state, w(0, 10)), Some(1));
        assert_eq!(tag_sum(&state, w(25, 35)), Some(1));

        // bridges both sessions
        driver.process_elements(&mut state, &[element(json!("c"), 8, &windowing)], secs(-100), Timestamp::ZERO).unwrap();
        driver.process_elements(&mut state, &[element(json!("d"), 16, &windowing)], secs(-100), Timestamp::ZERO).unwrap();

        let merged = w(0, 35);
        assert_eq!(state.set_read(&KNOWN_WINDOWS).unwrap(), vec![merged.clone()]);
        assert_eq!(tag_sum(&state, merged.clone()), Some(4));
        let leftovers: Vec<_> = state
            .bag_read(&WINDOW_TAG_VALUES)
            .unwrap()
            .into_iter()
            .filter(|(x, _, _)| *x != merged)
            .collect();
        assert!(leftovers.is_empty());
        assert!(state.bag_read(&ELEMENTS).unwrap().iter().all(|(x, _)| *x == merged));
        assert!(state.timers().all(|(id, _)| id.window == merged));

        let panes = fire_timers(&driver, &mut state, Timestamp::MAX);
        assert_eq!(panes.len(), 1);
        assert_eq!(panes[0].window, merged);
        assert_eq!(panes[0].values.len(), 4);
    }

    #[test]
    fn expired_windows_are_dropped_and_late_data_fires_late_pane() {
        let windowing = Windowing::new(WindowFn::fixed(Duration::seconds(10)))
            .with_allowed_lateness(Duration::seconds(5));
        let driver = TriggerDriver::new(windowing.clone());
        let mut state = KeyedState::default();

        driver.process_elements(&mut state, &[element(json!("a"), 1, &windowing)], secs(0), Timestamp::ZERO).unwrap();
        assert_eq!(fire_timers(&driver, &mut state, secs(10)).len(), 1);

        // late but within lateness: fires immediately
        let out = driver.process_elements(&mut state, &[element(json!("b"), 2, &windowing)], secs(12), Timestamp::ZERO).unwrap();
        assert_eq!(out.panes.len(), 1);
        assert_eq!(values(&out.panes[0]), vec![json!("b")]);
        assert_eq!(driver.watermark_hold(&state).unwrap(), Some(w(0, 10).max_timestamp() + Duration::seconds(5)));

        // beyond lateness: dropped
        let out = driver.process_elements(&mut state, &[element(json!("c"), 3, &windowing)], secs(16), Timestamp::ZERO).unwrap();
        assert!(out.panes.is_empty());
        assert_eq!(out.dropped, 1);
    }

    #[test]
    fn early_firing_keeps_the_on_time_hold() {
        let windowing = Windowing::new(WindowFn::fixed(Duration::seconds(10)))
            .with_trigger(Trigger::after_watermark(Some(Trigger::AfterCount(1)), Some(Trigger::AfterCount(1))))
            .with_allowed_lateness(Duration::seconds(5))
            .accumulating();
        let driver = TriggerDriver::new(windowing.clone());
        let mut state = KeyedState::default();
        let out = driver.process_elements(&mut state, &[element(json!(1), 1, &windowing)], secs(0), Timestamp::ZERO).unwrap();
        assert_eq!(out.panes.len(), 1);
        assert_eq!(driver.watermark_hold(&state).unwrap(), Some(w(0, 10).max_timestamp()));

        let panes = fire_timers(&driver, &mut state, secs(12));
        assert_eq!(panes.len(), 1);
        assert_eq!(values(&panes[0]), vec![json!(1)]);
        assert_eq!(driver.watermark_hold(&state).unwrap(), Some(w(0, 10).max_timestamp() + Duration::seconds(5)));
    }

    #[test]
    fn expiry_flushes_unfired_elements() {
        let windowing = Windowing::new(WindowFn::fixed(Duration::seconds(10))).with_trigger(Trigger::AfterCount(5));
        let driver = TriggerDriver::new(windowing.clone());
        let mut state = KeyedState::default();
        driver.process_elements(&mut state, &[element(json!("a"), 1, &windowing)], secs(0), Timestamp::ZERO).unwrap();
        let panes = fire_timers(&driver, &mut state, secs(11));
        assert_eq!(panes.len(), 1);
        assert_eq!(values(&panes[0]), vec![json!("a")]);
        assert!(state.is_empty());
    }

    #[test]
    fn finished_window_ignores_new_elements() {
        let windowing = Windowing::new(WindowFn::fixed(Duration::seconds(10))).with_trigger(Trigger::AfterCount(1));
        let driver = TriggerDriver::new(windowing.clone());
        let mut state = KeyedState::default();
        let out = driver.process_elements(&mut state, &[element(json!("a"), 1, &windowing)], secs(0), Timestamp::ZERO).unwrap();
        assert_eq!(out.panes.len(), 1);
        let out = driver.process_elements(&mut state, &[element(json!("b"), 2, &windowing)], secs(0), Timestamp::ZERO).unwrap();
        assert!(out.panes.is_empty());
        assert_eq!(out.dropped, 1);
        assert_eq!(driver.watermark_hold(&state).unwrap(), None);
    }
}
