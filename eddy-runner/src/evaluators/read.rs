use eddy_core::{CollectionId, Result, WindowedValue};
use tracing::{debug, instrument};

use super::TransformEvaluator;
use crate::bundle::UncommittedBundle;
use crate::context::{ExecutionContext, TransformResult};
use crate::graph::ReadSource;

/// Reads a whole source when its impulse arrives and splits the records into
/// bundles of at most `max_elements`, all in the global window at -inf.
pub struct ReadEvaluator {
    ctx: ExecutionContext,
    source: ReadSource,
    output: CollectionId,
    max_elements: usize,
}

impl ReadEvaluator {
    pub fn new(ctx: ExecutionContext, source: ReadSource, output: CollectionId, max_elements: usize) -> Self {
        Self { ctx, source, output, max_elements: max_elements.max(1) }
    }
}

impl TransformEvaluator for ReadEvaluator {
    fn process_element(&mut self, _impulse: &WindowedValue) -> Result<()> {
        Ok(())
    }

    #[instrument(name = "read", skip_all, fields(step = %self.ctx.step_name))]
    fn finish_bundle(self: Box<Self>) -> Result<TransformResult> {
        let (output, max_elements) = (self.output, self.max_elements);
        let mut result = self.ctx.result();
        let mut current = UncommittedBundle::new(Some(output));
        let mut total = 0u64;
        {
            let mut emit = |value| {
                total += 1;
                current.add(WindowedValue::in_global_window(value));
                if current.len() >= max_elements {
                    let full = std::mem::replace(&mut current, UncommittedBundle::new(Some(output)));
                    result.outputs.push(full);
                }
            };
            match &self.source {
                ReadSource::Bounded(source) => {
                    let mut tracker = source.get_range_tracker(None, None)?;
                    source.read(&mut tracker, &mut emit)?;
                }
                ReadSource::Reader(source) => source.read_all(&mut emit)?,
            }
        }
        if !current.is_empty() {
            result.outputs.push(current);
        }
        debug!(records = total, bundles = result.outputs.len(), "source read");
        result.elements_processed = total;
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eddy_core::StepId;
    use eddy_io::CreateSource;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn chunks_into_bounded_bundles() {
        let source = ReadSource::Bounded(Arc::new(CreateSource::new((0..5).map(|i| json!(i)))));
        let mut eval = Box::new(ReadEvaluator::new(ExecutionContext::new(StepId(0), "Read"), source, CollectionId(0), 2));
        eval.start_bundle().unwrap();
        eval.process_element(&WindowedValue::in_global_window(json!(null))).unwrap();
        let result = eval.finish_bundle().unwrap();
        let sizes: Vec<_> = result.outputs.iter().map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(result.outputs[2].elements[0], WindowedValue::in_global_window(json!(4)));
        assert_eq!(result.elements_processed, 5);
        assert!(result.hold.is_none());
    }
}
