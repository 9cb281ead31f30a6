use std::fmt;
use std::ops::{Add, Sub};

use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

/// Event or processing time in microseconds since the epoch.
///
/// `Timestamp::MIN` and `Timestamp::MAX` double as the -inf/+inf watermark
/// sentinels; arithmetic saturates so a sentinel never wraps.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const MIN: Timestamp = Timestamp(i64::MIN);
    pub const MAX: Timestamp = Timestamp(i64::MAX);
    pub const ZERO: Timestamp = Timestamp(0);

    pub const fn from_micros(micros: i64) -> Self {
        Timestamp(micros)
    }

    pub const fn from_millis(millis: i64) -> Self {
        Timestamp(millis.saturating_mul(1_000))
    }

    pub const fn from_secs(secs: i64) -> Self {
        Timestamp(secs.saturating_mul(1_000_000))
    }

    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Timestamp(dt.timestamp_micros())
    }

    pub const fn micros(self) -> i64 {
        self.0
    }

    pub const fn millis(self) -> i64 {
        self.0 / 1_000
    }

    /// `None` for the sentinels and anything chrono cannot represent.
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        if self.is_sentinel() {
            return None;
        }
        DateTime::<Utc>::from_timestamp_micros(self.0)
    }

    pub const fn is_sentinel(self) -> bool {
        self.0 == i64::MIN || self.0 == i64::MAX
    }

    /// The timestamp one granule (a microsecond) earlier.
    pub const fn predecessor(self) -> Self {
        if self.0 == i64::MIN || self.0 == i64::MAX {
            return self;
        }
        Timestamp(self.0 - 1)
    }

    pub const fn successor(self) -> Self {
        if self.0 == i64::MIN || self.0 == i64::MAX {
            return self;
        }
        Timestamp(self.0 + 1)
    }
}

fn duration_micros(d: Duration) -> i64 {
    d.num_microseconds()
        .unwrap_or(if d < Duration::zero() { i64::MIN } else { i64::MAX })
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        if self.is_sentinel() {
            return self;
        }
        Timestamp(self.0.saturating_add(duration_micros(rhs)))
    }
}

impl Sub<Duration> for Timestamp {
    type Output = Timestamp;

    fn sub(self, rhs: Duration) -> Timestamp {
        if self.is_sentinel() {
            return self;
        }
        Timestamp(self.0.saturating_sub(duration_micros(rhs)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Timestamp::MIN => write!(f, "-inf"),
            Timestamp::MAX => write!(f, "+inf"),
            Timestamp(us) => match self.to_datetime() {
                Some(dt) => write!(f, "{}", dt.to_rfc3339()),
                None => write!(f, "{us}us"),
            },
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp::from_datetime(dt)
    }
}

/// Source of processing time for a run.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct RealClock;

impl Clock for RealClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_datetime(Utc::now())
    }
}

/// Manually advanced clock used by test streams.
#[derive(Debug)]
pub struct TestClock {
    now: Mutex<Timestamp>,
}

impl TestClock {
    pub fn new(start: Timestamp) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn advance(&self, by: Duration) -> Timestamp {
        let mut now = self.now.lock();
        *now = *now + by;
        *now
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new(Timestamp::ZERO)
    }
}

impl Clock for TestClock {
    fn now(&self) -> Timestamp {
        *self.now.lock()
    }
}
