use eddy_core::{kv, CollectionId, Coder, JsonCoder, Result, Value, WindowedValue};
use eddy_ops::{DriverOutput, Pane, TriggerDriver, Windowing};
use eddy_state::TimerFiring;
use tracing::{instrument, warn};

use super::TransformEvaluator;
use crate::bundle::{KeyedWorkItem, UncommittedBundle};
use crate::context::{ExecutionContext, TransformResult};

/// Drives the trigger state machine of one key and emits each fired pane as
/// `[key, [values...]]` at the end of its window.
pub struct GroupAlsoByWindowEvaluator {
    ctx: ExecutionContext,
    driver: TriggerDriver,
    output: CollectionId,
    key: Value,
    panes: Vec<Pane>,
    dropped: usize,
    processed: u64,
}

impl GroupAlsoByWindowEvaluator {
    pub fn new(ctx: ExecutionContext, windowing: Windowing, output: CollectionId) -> Result<Self> {
        let key = match &ctx.key {
            Some(encoded) => JsonCoder.decode(encoded)?,
            None => Value::Null,
        };
        Ok(Self { ctx, driver: TriggerDriver::new(windowing), output, key, panes: Vec::new(), dropped: 0, processed: 0 })
    }

    fn absorb(&mut self, out: DriverOutput) {
        self.panes.extend(out.panes);
        self.dropped += out.dropped;
    }
}

impl TransformEvaluator for GroupAlsoByWindowEvaluator {
    fn process_element(&mut self, element: &WindowedValue) -> Result<()> {
        let item = KeyedWorkItem::from_windowed(element, &self.ctx.step_name)?;
        self.processed += item.elements.len() as u64;
        let out = self.driver.process_elements(
            &mut self.ctx.state,
            &item.elements,
            self.ctx.input_watermark,
            self.ctx.now,
        )?;
        self.absorb(out);
        Ok(())
    }

    fn process_timer(&mut self, timer: TimerFiring) -> Result<()> {
        let out = self.driver.process_timer(&mut self.ctx.state, &timer, self.ctx.input_watermark, self.ctx.now)?;
        self.absorb(out);
        Ok(())
    }

    #[instrument(name = "group_also_by_window", skip_all, fields(step = %self.ctx.step_name))]
    fn finish_bundle(mut self: Box<Self>) -> Result<TransformResult> {
        if self.dropped > 0 {
            warn!(key = %self.key, dropped = self.dropped, "dropped elements for expired windows");
        }
        let mut result = self.ctx.result();
        let mut bundle = UncommittedBundle::keyed(Some(self.output), self.ctx.key.clone());
        for pane in std::mem::take(&mut self.panes) {
            let timestamp = pane.timestamp();
            let values: Vec<Value> = pane.values.into_iter().map(|v| v.value).collect();
            bundle.add(WindowedValue::new(kv(self.key.clone(), values), timestamp, vec![pane.window]));
        }
        if !bundle.is_empty() {
            result.outputs.push(bundle);
        }
        result.hold = self.driver.watermark_hold(&self.ctx.state)?;
        result.dropped_late = self.dropped as u64;
        result.elements_processed = self.processed;
        result.state = Some(std::mem::take(&mut self.ctx.state));
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use eddy_core::{StepId, Timestamp};
    use eddy_ops::WindowFn;
    use serde_json::json;

    fn secs(s: i64) -> Timestamp {
        Timestamp::from_secs(s)
    }

    fn keyed_ctx(input_watermark: Timestamp) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(StepId(2), "GBK/GroupAlsoByWindow");
        ctx.key = Some(JsonCoder.encode(&json!("k")).unwrap());
        ctx.input_watermark = input_watermark;
        ctx
    }

    fn work_item(windowing: &Windowing, values: &[(&str, i64)]) -> WindowedValue {
        let elements = values
            .iter()
            .map(|(v, ts)| WindowedValue::new(json!(v), secs(*ts), windowing.window_fn.assign(secs(*ts))))
            .collect();
        KeyedWorkItem { key: json!("k"), elements }.into_windowed().unwrap()
    }

    #[test]
    fn holds_until_end_of_window_then_fires_once() {
        let windowing = Windowing::new(WindowFn::fixed(Duration::seconds(10)));
        let mut eval = Box::new(GroupAlsoByWindowEvaluator::new(keyed_ctx(secs(0)), windowing.clone(), CollectionId(3)).unwrap());
        eval.process_element(&work_item(&windowing, &[("a", 11), ("b", 12)])).unwrap();
        let first = eval.finish_bundle().unwrap();
        assert!(first.outputs.is_empty());
        assert_eq!(first.hold, Some(secs(20).predecessor()));

        let mut state = first.state.unwrap();
        let timers = state.take_due_timers(&first.key, secs(20), Timestamp::ZERO);
        assert_eq!(timers.len(), 2);
        let mut ctx = keyed_ctx(secs(20));
        ctx.state = state;
        let mut eval = Box::new(GroupAlsoByWindowEvaluator::new(ctx, windowing, CollectionId(3)).unwrap());
        for t in timers {
            eval.process_timer(t).unwrap();
        }
        let fired = eval.finish_bundle().unwrap();
        assert_eq!(fired.outputs.len(), 1);
        let pane = &fired.outputs[0].elements[0];
        assert_eq!(pane.value, json!(["k", ["a", "b"]]));
        assert_eq!(pane.timestamp, secs(20).predecessor());
        assert_eq!(fired.hold, None);
        assert!(fired.state.unwrap().is_empty());
    }

    #[test]
    fn expired_elements_are_counted_as_dropped() {
        let windowing = Windowing::new(WindowFn::fixed(Duration::seconds(10)));
        let mut eval = Box::new(GroupAlsoByWindowEvaluator::new(keyed_ctx(secs(30)), windowing.clone(), CollectionId(3)).unwrap());
        eval.process_element(&work_item(&windowing, &[("late", 5)])).unwrap();
        let result = eval.finish_bundle().unwrap();
        assert!(result.outputs.is_empty());
        assert_eq!(result.dropped_late, 1);
        assert_eq!(result.hold, None);
        assert!(result.state.unwrap().is_empty());
    }
}
