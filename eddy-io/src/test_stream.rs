//! Scripted sequence of elements, watermark moves and processing-time
//! advances used to drive streaming pipelines deterministically.

use chrono::Duration;
use eddy_core::{Timestamp, TimestampedValue, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum TestEvent {
    Elements(Vec<TimestampedValue>),
    Watermark(Timestamp),
    ProcessingTime(Duration),
}

/// Builder for a list of [`TestEvent`]s.
///
/// ```
/// use eddy_io::TestStream;
/// use eddy_core::Timestamp;
///
/// let stream = TestStream::new()
///     .advance_watermark_to(Timestamp::from_secs(10))
///     .add_elements(vec![serde_json::json!("a")])
///     .advance_watermark_to_infinity();
/// assert_eq!(stream.events().len(), 3);
/// ```
#[derive(Debug, Clone)]
pub struct TestStream {
    events: Vec<TestEvent>,
    current_watermark: Timestamp,
}

impl Default for TestStream {
    fn default() -> Self {
        Self::new()
    }
}

impl TestStream {
    pub fn new() -> Self {
        Self { events: Vec::new(), current_watermark: Timestamp::MIN }
    }

    /// Values without a timestamp are stamped with the current watermark.
    pub fn add_elements(mut self, values: impl IntoIterator<Item = Value>) -> Self {
        let wm = self.current_watermark;
        let elements = values.into_iter().map(|v| TimestampedValue::new(v, wm)).collect();
        self.events.push(TestEvent::Elements(elements));
        self
    }

    pub fn add_timestamped(mut self, values: impl IntoIterator<Item = TimestampedValue>) -> Self {
        self.events.push(TestEvent::Elements(values.into_iter().collect()));
        self
    }

    pub fn advance_watermark_to(mut self, watermark: Timestamp) -> Self {
        self.current_watermark = watermark;
        self.events.push(TestEvent::Watermark(watermark));
        self
    }

    pub fn advance_watermark_to_infinity(self) -> Self {
        self.advance_watermark_to(Timestamp::MAX)
    }

    pub fn advance_processing_time(mut self, by: Duration) -> Self {
        self.events.push(TestEvent::ProcessingTime(by));
        self
    }

    pub fn events(&self) -> &[TestEvent] {
        &self.events
    }

    pub fn into_events(self) -> Vec<TestEvent> {
        self.events
    }
}
