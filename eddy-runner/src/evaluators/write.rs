use std::sync::Arc;

use eddy_core::{Error, Result, Timestamp, Value, Window, WindowedValue};
use eddy_io::Sink;
use eddy_state::{BagTag, KeyedState, TimeDomain, TimerFiring, TimerId};
use tracing::{debug, info, instrument};

use super::TransformEvaluator;
use crate::context::{ExecutionContext, TransformResult};

const BUFFER: BagTag<Value> = BagTag::new("write_buffer");
const FINAL_TIMER_TAG: &str = "write_final";

fn final_timer() -> TimerId {
    TimerId::new(Window::Global, FINAL_TIMER_TAG, TimeDomain::Watermark)
}

/// Buffers everything in step state and writes it through one sink session
/// once the input is complete, even when nothing arrived.
pub struct WriteEvaluator {
    ctx: ExecutionContext,
    sink: Arc<dyn Sink>,
    processed: u64,
    written: bool,
}

impl WriteEvaluator {
    pub fn new(ctx: ExecutionContext, sink: Arc<dyn Sink>) -> Self {
        Self { ctx, sink, processed: 0, written: false }
    }

    /// State and hold a write step starts with: the final write is already
    /// scheduled, so a step that never receives a bundle still opens its sink.
    pub fn initial_state() -> (KeyedState, Timestamp) {
        let mut state = KeyedState::default();
        state.set_timer(final_timer(), Timestamp::MAX);
        (state, Timestamp::MIN)
    }

    fn already_written(&self) -> bool {
        self.ctx.output_watermark == Timestamp::MAX
    }
}

impl TransformEvaluator for WriteEvaluator {
    fn process_element(&mut self, element: &WindowedValue) -> Result<()> {
        if self.already_written() {
            return Err(Error::invariant(format!(
                "{} received data after its output was written",
                self.ctx.step_name
            )));
        }
        self.processed += 1;
        self.ctx.state.bag_add(&BUFFER, &element.value)
    }

    fn process_timer(&mut self, timer: TimerFiring) -> Result<()> {
        if timer.id != final_timer() {
            return Err(Error::invariant(format!("unexpected timer {:?} on {}", timer.id, self.ctx.step_name)));
        }
        let values = self.ctx.state.bag_read(&BUFFER)?;
        let mut writer = self.sink.writer()?;
        for v in &values {
            writer.write(v)?;
        }
        writer.close()?;
        self.ctx.state.bag_clear(&BUFFER);
        self.written = true;
        info!(step = %self.ctx.step_name, records = values.len(), "sink written");
        Ok(())
    }

    #[instrument(name = "write", skip_all, fields(step = %self.ctx.step_name))]
    fn finish_bundle(mut self: Box<Self>) -> Result<TransformResult> {
        let mut result = self.ctx.result();
        if self.already_written() {
            debug!("ignoring empty bundle after the sink was written");
            return Ok(result);
        }
        if !self.written {
            self.ctx.state.set_timer(final_timer(), Timestamp::MAX);
            result.hold = Some(Timestamp::MIN);
        }
        result.elements_processed = self.processed;
        result.state = Some(std::mem::take(&mut self.ctx.state));
        Ok(result)
    }
}
