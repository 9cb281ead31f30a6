//! Offset ranges and the tracker a bounded read claims records through.

use std::fmt;
use std::sync::Arc;

use eddy_core::{Error, Result};

/// Stop offset of a range without a known end.
pub const OFFSET_INFINITY: i64 = i64::MAX;

/// Distance from `from` to `to`; wide enough for any pair of offsets.
fn span(from: i64, to: i64) -> i128 {
    i128::from(to) - i128::from(from)
}

/// Half-open range `[start, stop)` of record offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OffsetRange {
    pub start: i64,
    pub stop: i64,
}

impl OffsetRange {
    pub fn new(start: i64, stop: i64) -> Result<Self> {
        if start > stop {
            return Err(Error::InvalidPipeline(format!("start offset {start} exceeds stop offset {stop}")));
        }
        Ok(Self { start, stop })
    }

    /// Saturates at `i64::MAX` for ranges that end at [`OFFSET_INFINITY`].
    pub fn len(&self) -> i64 {
        self.stop.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.stop
    }

    /// Cuts the range into pieces of about `desired` offsets, never shorter
    /// than `min` and without a trailing piece under a quarter of `desired`.
    pub fn split(&self, desired: i64, min: i64) -> Vec<OffsetRange> {
        let max_size = desired.max(min).max(1);
        let mut out = Vec::new();
        let mut start = self.start;
        while start < self.stop {
            let mut stop = start.saturating_add(max_size).min(self.stop);
            let remaining = self.stop.saturating_sub(stop);
            if remaining < desired / 4 || remaining < min {
                stop = self.stop;
            }
            out.push(OffsetRange { start, stop });
            start = stop;
        }
        out
    }
}

impl fmt::Display for OffsetRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.stop)
    }
}

type UnclaimedCallback = Arc<dyn Fn(i64) -> i64 + Send + Sync>;

/// Tracks which offsets of a range have been read and lets the range be
/// shrunk (split) while a read is in progress.
///
/// Records that start a new block are claimed with [`try_claim`]; records
/// inside a block only report their position with [`set_current_position`].
///
/// [`try_claim`]: OffsetRangeTracker::try_claim
/// [`set_current_position`]: OffsetRangeTracker::set_current_position
#[derive(Clone)]
pub struct OffsetRangeTracker {
    start: i64,
    stop: i64,
    last_record_start: Option<i64>,
    last_split_point: Option<i64>,
    split_points_seen: u64,
    unclaimed: Option<UnclaimedCallback>,
}

impl fmt::Debug for OffsetRangeTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OffsetRangeTracker")
            .field("start", &self.start)
            .field("stop", &self.stop)
            .field("last_record_start", &self.last_record_start)
            .field("split_points_seen", &self.split_points_seen)
            .finish()
    }
}

impl OffsetRangeTracker {
    pub fn new(start: i64, stop: i64) -> Result<Self> {
        OffsetRange::new(start, stop)?;
        Ok(Self {
            start,
            stop,
            last_record_start: None,
            last_split_point: None,
            split_points_seen: 0,
            unclaimed: None,
        })
    }

    pub fn start_position(&self) -> i64 {
        self.start
    }

    pub fn stop_position(&self) -> i64 {
        self.stop
    }

    pub fn last_record_start(&self) -> Option<i64> {
        self.last_record_start
    }

    fn validate(&self, record_start: i64, split_point: bool) -> Result<()> {
        if record_start < self.start {
            return Err(Error::invariant(format!(
                "record at {record_start} before the range start {}",
                self.start
            )));
        }
        if let Some(last) = self.last_record_start {
            if record_start < last {
                return Err(Error::invariant(format!(
                    "record at {record_start} after a record at {last}: positions must not decrease"
                )));
            }
        }
        if split_point && self.last_split_point == Some(record_start) {
            return Err(Error::invariant(format!("split point at {record_start} claimed twice")));
        }
        if !split_point && self.last_record_start.is_none() {
            return Err(Error::invariant(format!(
                "first record (at {record_start}) must be at a split point"
            )));
        }
        Ok(())
    }

    /// Claims the record starting at `record_start`. Returns `false` once the
    /// position is at or past the stop, after which the read must end.
    pub fn try_claim(&mut self, record_start: i64) -> Result<bool> {
        self.validate(record_start, true)?;
        if record_start >= self.stop {
            return Ok(false);
        }
        self.last_split_point = Some(record_start);
        self.last_record_start = Some(record_start);
        self.split_points_seen += 1;
        Ok(true)
    }

    /// Reports a record that is not a split point; it may lie past the stop.
    pub fn set_current_position(&mut self, record_start: i64) -> Result<()> {
        self.validate(record_start, false)?;
        self.last_record_start = Some(record_start);
        Ok(())
    }

    /// Shrinks the range to stop at `position`. Returns the new stop and the
    /// fraction of the former range before it, or `None` when the split is
    /// refused.
    pub fn try_split(&mut self, position: i64) -> Option<(i64, f64)> {
        let last = self.last_record_start?;
        if position <= last || position < self.start || position >= self.stop {
            return None;
        }
        let fraction = span(self.start, position) as f64 / span(self.start, self.stop) as f64;
        self.stop = position;
        Some((position, fraction))
    }

    pub fn position_at_fraction(&self, fraction: f64) -> Result<i64> {
        if self.stop == OFFSET_INFINITY {
            return Err(Error::invariant("position at fraction of an unbounded range"));
        }
        let offset = (fraction * span(self.start, self.stop) as f64).ceil() as i128;
        let position = i128::from(self.start) + offset;
        i64::try_from(position).map_err(|_| Error::invariant(format!("position {position} out of range")))
    }

    pub fn fraction_consumed(&self) -> f64 {
        match self.last_record_start {
            None => 0.0,
            Some(_) if self.stop == OFFSET_INFINITY || self.stop == self.start => 0.0,
            Some(last) => (span(self.start, last) as f64 / span(self.start, self.stop) as f64).min(1.0),
        }
    }

    /// Lets [`split_points`](Self::split_points) report how many split points
    /// remain before a given stop offset.
    pub fn set_split_points_unclaimed_callback(&mut self, f: impl Fn(i64) -> i64 + Send + Sync + 'static) {
        self.unclaimed = Some(Arc::new(f));
    }

    /// Split points fully consumed and, when known, those not yet claimed.
    pub fn split_points(&self) -> (u64, Option<i64>) {
        let consumed = self.split_points_seen.saturating_sub(1);
        (consumed, self.unclaimed.as_ref().map(|f| f(self.stop)))
    }
}
