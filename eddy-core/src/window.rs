use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// A region of event time that elements are grouped into.
///
/// Interval windows are half-open: `[start, end)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Window {
    Global,
    Interval { start: Timestamp, end: Timestamp },
}

impl Window {
    pub fn interval(start: Timestamp, end: Timestamp) -> Self {
        Window::Interval { start, end }
    }

    pub fn start(&self) -> Timestamp {
        match self {
            Window::Global => Timestamp::MIN,
            Window::Interval { start, .. } => *start,
        }
    }

    pub fn end(&self) -> Timestamp {
        match self {
            Window::Global => Timestamp::MAX,
            Window::Interval { end, .. } => *end,
        }
    }

    /// Largest timestamp that still falls into the window.
    pub fn max_timestamp(&self) -> Timestamp {
        match self {
            Window::Global => Timestamp::from_micros(i64::MAX - 1),
            Window::Interval { end, .. } => end.predecessor(),
        }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        self.start() <= ts && ts <= self.max_timestamp()
    }

    pub fn intersects(&self, other: &Window) -> bool {
        self.start() < other.end() && other.start() < self.end()
    }

    /// Smallest interval covering both windows.
    pub fn span(&self, other: &Window) -> Window {
        match (self, other) {
            (Window::Global, _) | (_, Window::Global) => Window::Global,
            _ => Window::interval(self.start().min(other.start()), self.end().max(other.end())),
        }
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Window::Global => write!(f, "GlobalWindow"),
            Window::Interval { start, end } => write!(f, "[{start}, {end})"),
        }
    }
}
