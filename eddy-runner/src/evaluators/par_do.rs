use std::sync::Arc;

use eddy_core::{CollectionId, Error, Result, WindowedValue};
use eddy_ops::{DoFn, ProcessContext};
use tracing::{debug, instrument};

use super::TransformEvaluator;
use crate::bundle::UncommittedBundle;
use crate::context::{ExecutionContext, TransformResult};

/// Runs a user function over one bundle. Failures are reported as user-code
/// errors of the step.
pub struct ParDoEvaluator {
    ctx: ExecutionContext,
    dofn: Arc<dyn DoFn>,
    /// Output tag and collection, main output first.
    outputs: Vec<(String, CollectionId)>,
    process: ProcessContext,
    processed: u64,
}

impl ParDoEvaluator {
    pub fn new(ctx: ExecutionContext, dofn: Arc<dyn DoFn>, outputs: Vec<(String, CollectionId)>) -> Self {
        let process = ProcessContext::new(ctx.side_inputs.clone());
        Self { ctx, dofn, outputs, process, processed: 0 }
    }

    fn user_error(&self, source: anyhow::Error) -> Error {
        Error::UserCode { step: self.ctx.step_name.clone(), source }
    }
}

impl TransformEvaluator for ParDoEvaluator {
    fn start_bundle(&mut self) -> Result<()> {
        self.dofn.start_bundle(&mut self.process).map_err(|e| self.user_error(e))
    }

    fn process_element(&mut self, element: &WindowedValue) -> Result<()> {
        self.processed += 1;
        self.dofn.process(element, &mut self.process).map_err(|e| self.user_error(e))
    }

    #[instrument(name = "par_do", skip_all, fields(step = %self.ctx.step_name))]
    fn finish_bundle(mut self: Box<Self>) -> Result<TransformResult> {
        let finished = self.dofn.finish_bundle(&mut self.process);
        finished.map_err(|e| self.user_error(e))?;
        let mut produced = self.process.take_outputs();
        let mut result = self.ctx.result();
        for (tag, collection) in &self.outputs {
            let mut bundle = UncommittedBundle::new(Some(*collection));
            bundle.elements = produced.remove(tag).unwrap_or_default();
            if !bundle.is_empty() {
                result.outputs.push(bundle);
            }
        }
        for (tag, dropped) in &produced {
            debug!(tag = %tag, count = dropped.len(), "discarding output to undeclared tag");
        }
        result.counters = self.process.take_counters();
        result.elements_processed = self.processed;
        Ok(result)
    }
}
