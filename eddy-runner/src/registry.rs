//! Maps transforms to evaluators by walking their capabilities from most to
//! least specific.

use std::collections::HashSet;
use std::sync::Arc;

use eddy_core::config::RunnerOptions;
use eddy_core::{Error, Result, TestClock, Timestamp, WindowedValue};
use serde_json::json;

use crate::bundle::UncommittedBundle;
use crate::context::ExecutionContext;
use crate::evaluators::{
    test_stream, FlattenEvaluator, GroupAlsoByWindowEvaluator, GroupByKeyOnlyEvaluator, ParDoEvaluator,
    ReadEvaluator, StreamingGroupByKeyOnlyEvaluator, TestStreamEvaluator, TransformEvaluator, WriteEvaluator,
};
use crate::graph::{Capability, Pipeline, Step, Transform};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvaluatorKind {
    Read,
    ParDo,
    Flatten,
    GroupByKeyOnly,
    StreamingGroupByKeyOnly,
    GroupAlsoByWindow,
    Write,
    TestStream,
}

impl EvaluatorKind {
    /// Steps with a global view of their own state run one task at a time.
    pub fn must_execute_serially(self) -> bool {
        matches!(
            self,
            EvaluatorKind::GroupByKeyOnly
                | EvaluatorKind::StreamingGroupByKeyOnly
                | EvaluatorKind::GroupAlsoByWindow
                | EvaluatorKind::Write
        )
    }

    /// Whether tasks take the state of their bundle's key rather than the
    /// step-wide state.
    pub fn is_keyed(self) -> bool {
        matches!(self, EvaluatorKind::GroupAlsoByWindow)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RootKind {
    Impulse,
    TestStreamStart,
}

#[derive(Debug)]
pub struct EvaluatorRegistry {
    evaluators: Vec<(Capability, EvaluatorKind)>,
    roots: Vec<(Capability, RootKind)>,
    options: RunnerOptions,
    test_clock: Option<Arc<TestClock>>,
}

impl EvaluatorRegistry {
    pub fn new(options: RunnerOptions, test_clock: Option<Arc<TestClock>>) -> Self {
        let gbk = if options.streaming { EvaluatorKind::StreamingGroupByKeyOnly } else { EvaluatorKind::GroupByKeyOnly };
        let evaluators = vec![
            (Capability::BoundedRead, EvaluatorKind::Read),
            (Capability::Read, EvaluatorKind::Read),
            (Capability::ParDo, EvaluatorKind::ParDo),
            (Capability::Flatten, EvaluatorKind::Flatten),
            (Capability::GroupByKeyOnly, gbk),
            (Capability::GroupAlsoByWindow, EvaluatorKind::GroupAlsoByWindow),
            (Capability::Write, EvaluatorKind::Write),
            (Capability::TestStream, EvaluatorKind::TestStream),
        ];
        let roots = vec![(Capability::Read, RootKind::Impulse), (Capability::TestStream, RootKind::TestStreamStart)];
        Self { evaluators, roots, options, test_clock }
    }

    fn not_implemented(step: &Step) -> Error {
        let capability = step.transform.capabilities().first().map(ToString::to_string).unwrap_or_default();
        Error::NotImplemented { transform: step.name.clone(), capability }
    }

    pub fn lookup(&self, step: &Step) -> Result<EvaluatorKind> {
        step.transform
            .capabilities()
            .iter()
            .find_map(|cap| self.evaluators.iter().find(|(c, _)| c == cap).map(|(_, kind)| *kind))
            .ok_or_else(|| Self::not_implemented(step))
    }

    fn root_kind(&self, step: &Step) -> Result<RootKind> {
        step.transform
            .capabilities()
            .iter()
            .find_map(|cap| self.roots.iter().find(|(c, _)| c == cap).map(|(_, kind)| *kind))
            .ok_or_else(|| Self::not_implemented(step))
    }

    /// The bundle that starts a root step.
    pub fn root_bundle(&self, step: &Step) -> Result<UncommittedBundle> {
        let value = match self.root_kind(step)? {
            RootKind::Impulse => json!(null),
            RootKind::TestStreamStart => test_stream::position(0, Timestamp::MIN),
        };
        let mut bundle = UncommittedBundle::new(None);
        bundle.add(WindowedValue::in_global_window(value));
        Ok(bundle)
    }

    /// Checks that every step can run before anything is dispatched.
    pub fn validate(&self, pipeline: &Pipeline) -> Result<()> {
        let mut names = HashSet::new();
        for step in pipeline.steps() {
            if !names.insert(step.name.as_str()) {
                return Err(Error::InvalidPipeline(format!("duplicate step name {}", step.name)));
            }
            for view in step.side_inputs() {
                if pipeline.get_view(*view).is_none() {
                    return Err(Error::InvalidPipeline(format!("{} reads unknown side input {view}", step.name)));
                }
            }
            self.lookup(step)?;
            if step.is_root() {
                self.root_kind(step)?;
            }
        }
        Ok(())
    }

    pub fn create(&self, step: &Step, ctx: ExecutionContext) -> Result<Box<dyn TransformEvaluator>> {
        let output = || {
            step.outputs
                .first()
                .copied()
                .ok_or_else(|| Error::InvalidPipeline(format!("{} has no output", step.name)))
        };
        let kind = self.lookup(step)?;
        let evaluator: Box<dyn TransformEvaluator> = match (&step.transform, kind) {
            (Transform::Read(source), EvaluatorKind::Read) => {
                Box::new(ReadEvaluator::new(ctx, source.clone(), output()?, self.options.max_elements_per_bundle))
            }
            (Transform::ParDo(par_do), EvaluatorKind::ParDo) => {
                let outputs = par_do.output_tags().into_iter().zip(step.outputs.iter().copied()).collect();
                Box::new(ParDoEvaluator::new(ctx, par_do.dofn.clone(), outputs))
            }
            (Transform::Flatten, EvaluatorKind::Flatten) => Box::new(FlattenEvaluator::new(ctx, output()?)),
            (Transform::GroupByKeyOnly, EvaluatorKind::GroupByKeyOnly) => {
                Box::new(GroupByKeyOnlyEvaluator::new(ctx, output()?))
            }
            (Transform::GroupByKeyOnly, EvaluatorKind::StreamingGroupByKeyOnly) => {
                Box::new(StreamingGroupByKeyOnlyEvaluator::new(ctx, output()?))
            }
            (Transform::GroupAlsoByWindow(windowing), EvaluatorKind::GroupAlsoByWindow) => {
                Box::new(GroupAlsoByWindowEvaluator::new(ctx, windowing.clone(), output()?)?)
            }
            (Transform::Write(sink), EvaluatorKind::Write) => Box::new(WriteEvaluator::new(ctx, sink.clone())),
            (Transform::TestStream(stream), EvaluatorKind::TestStream) => Box::new(TestStreamEvaluator::new(
                ctx,
                stream.clone(),
                output()?,
                self.test_clock.clone(),
            )),
            _ => return Err(Self::not_implemented(step)),
        };
        Ok(evaluator)
    }
}
