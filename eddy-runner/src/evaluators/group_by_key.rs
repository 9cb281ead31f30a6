//! GroupByKeyOnly in its batch and streaming flavours.

use std::collections::BTreeMap;

use eddy_core::{as_kv, CollectionId, Coder, EncodedKey, Error, JsonCoder, Result, Timestamp, Value, Window, WindowedValue};
use eddy_state::{BagTag, TimeDomain, TimerFiring, TimerId};
use tracing::{debug, instrument};

use super::TransformEvaluator;
use crate::bundle::{KeyedWorkItem, UncommittedBundle};
use crate::context::{ExecutionContext, TransformResult};

const BUFFER: BagTag<WindowedValue> = BagTag::new("gbk_buffer");
const FLUSH_TIMER_TAG: &str = "gbk_flush";

fn flush_timer() -> TimerId {
    TimerId::new(Window::Global, FLUSH_TIMER_TAG, TimeDomain::Watermark)
}

fn split_kv<'a>(step: &str, element: &'a WindowedValue) -> Result<(&'a Value, &'a Value)> {
    as_kv(&element.value).ok_or_else(|| Error::TypeCheck {
        step: step.to_string(),
        message: format!("GroupByKey input must be [key, value] pairs, got {}", element.value),
    })
}

/// Groups elements by encoded key; emits one keyed bundle per key holding a
/// single [`KeyedWorkItem`] of the values.
fn group(coder: &JsonCoder, step: &str, output: CollectionId, elements: Vec<WindowedValue>) -> Result<Vec<UncommittedBundle>> {
    let mut by_key: BTreeMap<EncodedKey, KeyedWorkItem> = BTreeMap::new();
    for element in elements {
        let (key, value) = split_kv(step, &element)?;
        let encoded = coder.encode(key)?;
        by_key
            .entry(encoded)
            .or_insert_with(|| KeyedWorkItem { key: key.clone(), elements: Vec::new() })
            .elements
            .push(element.with_value(value.clone()));
    }
    by_key
        .into_iter()
        .map(|(encoded, kwi)| {
            let mut bundle = UncommittedBundle::keyed(Some(output), Some(encoded));
            bundle.add(kwi.into_windowed()?);
            Ok(bundle)
        })
        .collect()
}

/// Batch flavour: buffers everything in step state, holding the output
/// watermark at -inf, until a +inf timer says the input is complete.
pub struct GroupByKeyOnlyEvaluator {
    ctx: ExecutionContext,
    output: CollectionId,
    coder: JsonCoder,
    flushed: Vec<UncommittedBundle>,
    processed: u64,
}

impl GroupByKeyOnlyEvaluator {
    pub fn new(ctx: ExecutionContext, output: CollectionId) -> Self {
        Self { ctx, output, coder: JsonCoder, flushed: Vec::new(), processed: 0 }
    }
}

impl TransformEvaluator for GroupByKeyOnlyEvaluator {
    fn process_element(&mut self, element: &WindowedValue) -> Result<()> {
        split_kv(&self.ctx.step_name, element)?;
        self.processed += 1;
        self.ctx.state.bag_add(&BUFFER, element)
    }

    fn process_timer(&mut self, timer: TimerFiring) -> Result<()> {
        if timer.id != flush_timer() {
            return Err(Error::invariant(format!("unexpected timer {:?} on {}", timer.id, self.ctx.step_name)));
        }
        let buffered = self.ctx.state.bag_read(&BUFFER)?;
        self.ctx.state.bag_clear(&BUFFER);
        debug!(step = %self.ctx.step_name, elements = buffered.len(), "flushing grouped keys");
        self.flushed = group(&self.coder, &self.ctx.step_name, self.output, buffered)?;
        Ok(())
    }

    #[instrument(name = "group_by_key_only", skip_all, fields(step = %self.ctx.step_name))]
    fn finish_bundle(mut self: Box<Self>) -> Result<TransformResult> {
        let mut result = self.ctx.result();
        if self.ctx.state.bag_len(&BUFFER) > 0 {
            self.ctx.state.set_timer(flush_timer(), Timestamp::MAX);
            result.hold = Some(Timestamp::MIN);
        }
        result.outputs = std::mem::take(&mut self.flushed);
        result.elements_processed = self.processed;
        result.state = Some(std::mem::take(&mut self.ctx.state));
        Ok(result)
    }
}

/// Streaming flavour: groups each bundle on its own and emits it right away.
pub struct StreamingGroupByKeyOnlyEvaluator {
    ctx: ExecutionContext,
    output: CollectionId,
    elements: Vec<WindowedValue>,
}

impl StreamingGroupByKeyOnlyEvaluator {
    pub fn new(ctx: ExecutionContext, output: CollectionId) -> Self {
        Self { ctx, output, elements: Vec::new() }
    }
}

impl TransformEvaluator for StreamingGroupByKeyOnlyEvaluator {
    fn process_element(&mut self, element: &WindowedValue) -> Result<()> {
        split_kv(&self.ctx.step_name, element)?;
        self.elements.push(element.clone());
        Ok(())
    }

    fn finish_bundle(self: Box<Self>) -> Result<TransformResult> {
        let mut result = self.ctx.result();
        result.elements_processed = self.elements.len() as u64;
        result.outputs = group(&JsonCoder, &self.ctx.step_name, self.output, self.elements)?;
        Ok(result)
    }
}
