use std::fmt;

use eddy_core::{EncodedKey, Timestamp, Window};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TimeDomain {
    /// Event time, compared against a step's input watermark.
    Watermark,
    /// Processing time, compared against the run's clock.
    RealTime,
}

impl fmt::Display for TimeDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeDomain::Watermark => write!(f, "WATERMARK"),
            TimeDomain::RealTime => write!(f, "REAL_TIME"),
        }
    }
}

/// A timer slot: at most one pending timestamp per (window, tag, domain).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId {
    pub window: Window,
    pub tag: String,
    pub domain: TimeDomain,
}

impl TimerId {
    pub fn new(window: Window, tag: impl Into<String>, domain: TimeDomain) -> Self {
        Self { window, tag: tag.into(), domain }
    }

    /// Whether a timer set for `timestamp` is due.
    pub fn is_due(&self, timestamp: Timestamp, input_watermark: Timestamp, now: Timestamp) -> bool {
        match self.domain {
            TimeDomain::Watermark => timestamp <= input_watermark,
            TimeDomain::RealTime => timestamp <= now,
        }
    }
}

/// A timer that fired for one key of one step, delivered back to that step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct TimerFiring {
    pub key: Option<EncodedKey>,
    pub id: TimerId,
    pub timestamp: Timestamp,
}

impl TimerFiring {
    pub fn window(&self) -> &Window {
        &self.id.window
    }

    pub fn domain(&self) -> TimeDomain {
        self.id.domain
    }
}
