use chrono::Duration;
use eddy_core::{Timestamp, Window};

use crate::trigger::Trigger;

fn micros(d: Duration) -> i64 {
    d.num_microseconds().unwrap_or(i64::MAX)
}

/// Assigns timestamps to windows and, for sessions, merges overlapping ones.
#[derive(Debug, Clone, PartialEq)]
pub enum WindowFn {
    Global,
    Fixed { size: Duration, offset: Duration },
    Sliding { size: Duration, period: Duration, offset: Duration },
    Sessions { gap: Duration },
}

impl WindowFn {
    pub fn fixed(size: Duration) -> Self {
        WindowFn::Fixed { size, offset: Duration::zero() }
    }

    pub fn sliding(size: Duration, period: Duration) -> Self {
        WindowFn::Sliding { size, period, offset: Duration::zero() }
    }

    pub fn sessions(gap: Duration) -> Self {
        WindowFn::Sessions { gap }
    }

    pub fn assign(&self, ts: Timestamp) -> Vec<Window> {
        match *self {
            WindowFn::Global => vec![Window::Global],
            WindowFn::Fixed { size, offset } => {
                let size = micros(size).max(1);
                let t = ts.micros();
                let start = t.saturating_sub(t.saturating_sub(micros(offset)).rem_euclid(size));
                vec![Window::interval(Timestamp::from_micros(start), Timestamp::from_micros(start.saturating_add(size)))]
            }
            WindowFn::Sliding { size, period, offset } => {
                let size = micros(size).max(1);
                let period = micros(period).max(1);
                let t = ts.micros();
                let last_start = t.saturating_sub(t.saturating_sub(micros(offset)).rem_euclid(period));
                let mut out = Vec::new();
                let mut start = last_start;
                while start > t.saturating_sub(size) {
                    out.push(Window::interval(Timestamp::from_micros(start), Timestamp::from_micros(start.saturating_add(size))));
                    start = start.saturating_sub(period);
                }
                out
            }
            WindowFn::Sessions { gap } => vec![Window::interval(ts, ts + gap)],
        }
    }

    pub fn is_merging(&self) -> bool {
        matches!(self, WindowFn::Sessions { .. })
    }

    /// Groups of windows that must be merged, each with its merge result.
    /// Only groups of two or more windows are reported.
    pub fn merge(&self, windows: &[Window]) -> Vec<(Vec<Window>, Window)> {
        if !self.is_merging() {
            return Vec::new();
        }
        let mut sorted: Vec<Window> = windows.to_vec();
        sorted.sort_by_key(|w| (w.start(), w.end()));
        sorted.dedup();

        let mut merges = Vec::new();
        let mut run: Vec<Window> = Vec::new();
        let mut end = Timestamp::MIN;
        for w in sorted {
            if !run.is_empty() && end > w.start() {
                end = end.max(w.end());
                run.push(w);
                continue;
            }
            close_run(&mut merges, std::mem::take(&mut run), end);
            end = w.end();
            run.push(w);
        }
        close_run(&mut merges, run, end);
        merges
    }
}

fn close_run(merges: &mut Vec<(Vec<Window>, Window)>, run: Vec<Window>, end: Timestamp) {
    if run.len() > 1 {
        let start = run[0].start();
        merges.push((run, Window::interval(start, end)));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccumulationMode {
    #[default]
    Discarding,
    Accumulating,
}

/// Everything a grouping step needs to know about how its input is windowed.
#[derive(Debug, Clone, PartialEq)]
pub struct Windowing {
    pub window_fn: WindowFn,
    pub trigger: Trigger,
    pub accumulation_mode: AccumulationMode,
    pub allowed_lateness: Duration,
}

impl Default for Windowing {
    fn default() -> Self {
        Self::new(WindowFn::Global)
    }
}

impl Windowing {
    pub fn new(window_fn: WindowFn) -> Self {
        Self {
            window_fn,
            trigger: Trigger::Default,
            accumulation_mode: AccumulationMode::Discarding,
            allowed_lateness: Duration::zero(),
        }
    }

    pub fn with_trigger(mut self, trigger: Trigger) -> Self {
        self.trigger = trigger;
        self
    }

    pub fn accumulating(mut self) -> Self {
        self.accumulation_mode = AccumulationMode::Accumulating;
        self
    }

    pub fn discarding(mut self) -> Self {
        self.accumulation_mode = AccumulationMode::Discarding;
        self
    }

    pub fn with_allowed_lateness(mut self, lateness: Duration) -> Self {
        self.allowed_lateness = lateness;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn w(start: i64, end: i64) -> Window {
        Window::interval(Timestamp::from_secs(start), Timestamp::from_secs(end))
    }

    #[test]
    fn fixed_windows_align_to_epoch_and_offset() {
        let f = WindowFn::fixed(Duration::seconds(60));
        assert_eq!(f.assign(Timestamp::from_secs(75)), vec![w(60, 120)]);
        assert_eq!(f.assign(Timestamp::from_secs(-1)), vec![w(-60, 0)]);
        let shifted = WindowFn::Fixed { size: Duration::seconds(60), offset: Duration::seconds(10) };
        assert_eq!(shifted.assign(Timestamp::from_secs(75)), vec![w(70, 130)]);
    }

    #[test]
    fn sliding_assigns_every_overlapping_window() {
        let f = WindowFn::sliding(Duration::seconds(60), Duration::seconds(15));
        let wins = f.assign(Timestamp::from_secs(30));
        assert_eq!(wins, vec![w(30, 90), w(15, 75), w(0, 60), w(-15, 45)]);
        assert!(wins.iter().all(|x| x.contains(Timestamp::from_secs(30))));
    }

    #[test]
    fn sessions_merge_overlapping_runs() {
        let f = WindowFn::sessions(Duration::seconds(10));
        let merges = f.merge(&[w(0, 10), w(5, 15), w(30, 40), w(14, 24)]);
        assert_eq!(merges, vec![(vec![w(0, 10), w(5, 15), w(14, 24)], w(0, 24))]);
        assert!(f.merge(&[w(0, 10), w(10, 20)]).is_empty());
        assert!(WindowFn::fixed(Duration::seconds(10)).merge(&[w(0, 10), w(0, 10)]).is_empty());
    }
}
