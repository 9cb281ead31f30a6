use eddy_core::{CollectionId, Result, WindowedValue};

use super::TransformEvaluator;
use crate::bundle::UncommittedBundle;
use crate::context::{ExecutionContext, TransformResult};

pub struct FlattenEvaluator {
    ctx: ExecutionContext,
    bundle: UncommittedBundle,
}

impl FlattenEvaluator {
    pub fn new(ctx: ExecutionContext, output: CollectionId) -> Self {
        Self { ctx, bundle: UncommittedBundle::new(Some(output)) }
    }
}

impl TransformEvaluator for FlattenEvaluator {
    fn process_element(&mut self, element: &WindowedValue) -> Result<()> {
        self.bundle.add(element.clone());
        Ok(())
    }

    fn finish_bundle(self: Box<Self>) -> Result<TransformResult> {
        let mut result = self.ctx.result();
        result.elements_processed = self.bundle.len() as u64;
        result.outputs.push(self.bundle);
        Ok(result)
    }
}
