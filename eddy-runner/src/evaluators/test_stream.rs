use std::sync::Arc;

use eddy_core::{CollectionId, Error, Result, TestClock, Timestamp, Value, WindowedValue};
use eddy_io::{TestEvent, TestStream};
use serde_json::json;
use tracing::{debug, instrument};

use super::TransformEvaluator;
use crate::bundle::UncommittedBundle;
use crate::context::{ExecutionContext, TransformResult};

/// Marker element telling the evaluator which event comes next and what the
/// stream's watermark is.
pub(crate) fn position(index: usize, watermark: Timestamp) -> Value {
    json!({ "index": index, "watermark": watermark.micros() })
}

/// Replays one event of a [`TestStream`] per task and hands itself the rest
/// as unprocessed work, holding its output at the stream's watermark.
pub struct TestStreamEvaluator {
    ctx: ExecutionContext,
    stream: Arc<TestStream>,
    output: CollectionId,
    clock: Option<Arc<TestClock>>,
    index: usize,
    watermark: Timestamp,
}

impl TestStreamEvaluator {
    pub fn new(ctx: ExecutionContext, stream: Arc<TestStream>, output: CollectionId, clock: Option<Arc<TestClock>>) -> Self {
        Self { ctx, stream, output, clock, index: 0, watermark: Timestamp::MIN }
    }
}

impl TransformEvaluator for TestStreamEvaluator {
    fn process_element(&mut self, element: &WindowedValue) -> Result<()> {
        let bad = || Error::invariant(format!("malformed test stream position {}", element.value));
        let index = element.value.get("index").and_then(Value::as_u64).ok_or_else(bad)?;
        let watermark = element.value.get("watermark").and_then(Value::as_i64).ok_or_else(bad)?;
        self.index = usize::try_from(index).map_err(|_| bad())?;
        self.watermark = Timestamp::from_micros(watermark);
        Ok(())
    }

    #[instrument(name = "test_stream", skip_all, fields(step = %self.ctx.step_name, index = self.index))]
    fn finish_bundle(self: Box<Self>) -> Result<TransformResult> {
        let mut result = self.ctx.result();
        let events = self.stream.events();
        let mut watermark = self.watermark;
        match events.get(self.index) {
            Some(TestEvent::Elements(values)) => {
                let mut bundle = UncommittedBundle::new(Some(self.output));
                for v in values {
                    bundle.add(WindowedValue::timestamped(v.value.clone(), v.timestamp));
                }
                result.elements_processed = bundle.len() as u64;
                result.outputs.push(bundle);
            }
            Some(TestEvent::Watermark(next)) => {
                if *next < watermark {
                    return Err(Error::invariant(format!(
                        "test stream watermark moved backwards from {watermark} to {next}"
                    )));
                }
                watermark = *next;
            }
            Some(TestEvent::ProcessingTime(by)) => {
                let clock = self
                    .clock
                    .as_ref()
                    .ok_or_else(|| Error::invariant("test stream needs the test clock"))?;
                let now = clock.advance(*by);
                debug!(%now, "processing time advanced");
            }
            None => {}
        }
        let next = self.index + 1;
        if next < events.len() {
            let mut rest = UncommittedBundle::new(None);
            rest.add(WindowedValue::timestamped(position(next, watermark), Timestamp::MAX));
            result.unprocessed = Some(rest);
            result.hold = Some(watermark);
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use eddy_core::{Clock, StepId};

    fn step(stream: &Arc<TestStream>, clock: &Arc<TestClock>, at: Value) -> Result<TransformResult> {
        let ctx = ExecutionContext::new(StepId(0), "Events");
        let mut eval = Box::new(TestStreamEvaluator::new(ctx, stream.clone(), CollectionId(0), Some(clock.clone())));
        eval.process_element(&WindowedValue::timestamped(at, Timestamp::MIN))?;
        eval.finish_bundle()
    }

    #[test]
    fn replays_events_one_per_task() {
        let stream = Arc::new(
            TestStream::new()
                .advance_watermark_to(Timestamp::from_secs(10))
                .add_elements(vec![json!("a")])
                .advance_processing_time(Duration::seconds(5)),
        );
        let clock = Arc::new(TestClock::default());

        let r = step(&stream, &clock, position(0, Timestamp::MIN)).unwrap();
        assert!(r.outputs.is_empty());
        assert_eq!(r.hold, Some(Timestamp::from_secs(10)));
        let next = r.unprocessed.unwrap();
        assert_eq!(next.elements[0].value, position(1, Timestamp::from_secs(10)));
        assert_eq!(next.elements[0].timestamp, Timestamp::MAX);

        let r = step(&stream, &clock, position(1, Timestamp::from_secs(10))).unwrap();
        assert_eq!(r.outputs[0].elements[0], WindowedValue::timestamped(json!("a"), Timestamp::from_secs(10)));

        let r = step(&stream, &clock, position(2, Timestamp::from_secs(10))).unwrap();
        assert!(r.unprocessed.is_none());
        assert_eq!(r.hold, None);
        assert_eq!(clock.now(), Timestamp::from_secs(5));
    }

    #[test]
    fn watermark_regression_is_an_invariant_violation() {
        let stream = Arc::new(TestStream::new().advance_watermark_to(Timestamp::from_secs(5)));
        let clock = Arc::new(TestClock::default());
        let err = step(&stream, &clock, position(0, Timestamp::from_secs(20))).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }
}
