//! The pipeline graph as an arena: steps, collections and side-input views
//! refer to each other by index only.

use std::fmt;
use std::sync::Arc;

use eddy_core::{CollectionId, StepId, Value, ViewId};
use eddy_io::{BoundedSource, CreateSource, ReaderSource, Sink, TestStream};
use eddy_ops::{AssignWindows, DoFn, Windowing, MAIN_OUTPUT};

#[derive(Clone)]
pub enum ReadSource {
    Bounded(Arc<dyn BoundedSource>),
    Reader(Arc<dyn ReaderSource>),
}

/// An element-wise step: user function, side inputs and declared output tags.
#[derive(Clone)]
pub struct ParDo {
    pub dofn: Arc<dyn DoFn>,
    pub side_inputs: Vec<ViewId>,
    /// Additional tags besides the main output.
    pub tags: Vec<String>,
}

impl ParDo {
    pub fn new(dofn: impl DoFn + 'static) -> Self {
        Self { dofn: Arc::new(dofn), side_inputs: Vec::new(), tags: Vec::new() }
    }

    pub fn with_side_input(mut self, view: ViewId) -> Self {
        self.side_inputs.push(view);
        self
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    /// Main output first, then the extra tags in declaration order.
    pub fn output_tags(&self) -> Vec<String> {
        std::iter::once(MAIN_OUTPUT.to_string()).chain(self.tags.iter().cloned()).collect()
    }
}

#[derive(Clone)]
pub enum Transform {
    Read(ReadSource),
    ParDo(ParDo),
    Flatten,
    GroupByKeyOnly,
    GroupAlsoByWindow(Windowing),
    Write(Arc<dyn Sink>),
    TestStream(Arc<TestStream>),
    /// A transform known only by its URN; no evaluator handles it.
    Native { urn: String },
}

/// What a transform can do, most specific first in [`Transform::capabilities`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Capability {
    Root,
    Read,
    BoundedRead,
    ElementWise,
    ParDo,
    Flatten,
    Grouping,
    GroupByKeyOnly,
    GroupAlsoByWindow,
    Write,
    TestStream,
    Native(String),
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capability::Native(urn) => write!(f, "{urn}"),
            other => write!(f, "{other:?}"),
        }
    }
}

impl Transform {
    pub fn capabilities(&self) -> Vec<Capability> {
        match self {
            Transform::Read(ReadSource::Bounded(_)) => vec![Capability::BoundedRead, Capability::Read, Capability::Root],
            Transform::Read(ReadSource::Reader(_)) => vec![Capability::Read, Capability::Root],
            Transform::ParDo(_) => vec![Capability::ParDo, Capability::ElementWise],
            Transform::Flatten => vec![Capability::Flatten, Capability::ElementWise],
            Transform::GroupByKeyOnly => vec![Capability::GroupByKeyOnly, Capability::Grouping],
            Transform::GroupAlsoByWindow(_) => vec![Capability::GroupAlsoByWindow, Capability::Grouping],
            Transform::Write(_) => vec![Capability::Write],
            Transform::TestStream(_) => vec![Capability::TestStream, Capability::Root],
            Transform::Native { urn } => vec![Capability::Native(urn.clone())],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Transform::Read(_) => "Read",
            Transform::ParDo(_) => "ParDo",
            Transform::Flatten => "Flatten",
            Transform::GroupByKeyOnly => "GroupByKeyOnly",
            Transform::GroupAlsoByWindow(_) => "GroupAlsoByWindow",
            Transform::Write(_) => "Write",
            Transform::TestStream(_) => "TestStream",
            Transform::Native { .. } => "Native",
        }
    }
}

#[derive(Clone)]
pub struct Step {
    pub id: StepId,
    pub name: String,
    pub transform: Transform,
    pub inputs: Vec<CollectionId>,
    pub outputs: Vec<CollectionId>,
}

impl Step {
    pub fn side_inputs(&self) -> &[ViewId] {
        match &self.transform {
            Transform::ParDo(p) => &p.side_inputs,
            _ => &[],
        }
    }

    pub fn is_root(&self) -> bool {
        self.inputs.is_empty()
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.transform.kind())
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct Collection {
    pub id: CollectionId,
    pub name: String,
    pub producer: StepId,
    pub windowing: Windowing,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ViewKind {
    Iterable,
    List,
    /// Exactly one element, or the default when there is none.
    Singleton { default: Option<Value> },
    /// Built from `[key, value]` pairs.
    Dict,
}

#[derive(Debug, Clone)]
pub struct View {
    pub id: ViewId,
    pub collection: CollectionId,
    pub kind: ViewKind,
}

/// Pipeline under construction; handed to the runner when complete.
///
/// ```
/// use eddy_runner::Pipeline;
/// use serde_json::json;
///
/// let mut p = Pipeline::new();
/// let words = p.create("Create", vec![json!(["a", 1]), json!(["b", 2])]);
/// let grouped = p.group_by_key("Group", words);
/// assert_eq!(p.steps().len(), 3);
/// # let _ = grouped;
/// ```
#[derive(Default, Clone)]
pub struct Pipeline {
    steps: Vec<Step>,
    collections: Vec<Collection>,
    views: Vec<View>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step(&self, id: StepId) -> &Step {
        &self.steps[id.index()]
    }

    pub fn collections(&self) -> &[Collection] {
        &self.collections
    }

    pub fn collection(&self, id: CollectionId) -> &Collection {
        &self.collections[id.index()]
    }

    pub fn views(&self) -> &[View] {
        &self.views
    }

    pub fn get_view(&self, id: ViewId) -> Option<&View> {
        self.views.get(id.index())
    }

    pub fn consumers(&self, collection: CollectionId) -> Vec<StepId> {
        self.steps.iter().filter(|s| s.inputs.contains(&collection)).map(|s| s.id).collect()
    }

    pub fn views_of(&self, collection: CollectionId) -> Vec<ViewId> {
        self.views.iter().filter(|v| v.collection == collection).map(|v| v.id).collect()
    }

    pub fn roots(&self) -> Vec<StepId> {
        self.steps.iter().filter(|s| s.is_root()).map(|s| s.id).collect()
    }

    /// Adds a step with `outputs` fresh output collections.
    pub fn apply(
        &mut self,
        name: impl Into<String>,
        transform: Transform,
        inputs: &[CollectionId],
        outputs: usize,
    ) -> (StepId, Vec<CollectionId>) {
        let id = StepId(self.steps.len());
        let name = name.into();
        let windowing = inputs
            .first()
            .map(|c| self.collection(*c).windowing.clone())
            .unwrap_or_default();
        let mut out = Vec::with_capacity(outputs);
        for ix in 0..outputs {
            let cid = CollectionId(self.collections.len());
            let cname = if ix == 0 { format!("{name}.out") } else { format!("{name}.out{ix}") };
            self.collections.push(Collection { id: cid, name: cname, producer: id, windowing: windowing.clone() });
            out.push(cid);
        }
        self.steps.push(Step { id, name, transform, inputs: inputs.to_vec(), outputs: out.clone() });
        (id, out)
    }

    fn apply_one(&mut self, name: impl Into<String>, transform: Transform, inputs: &[CollectionId]) -> CollectionId {
        let (_, outputs) = self.apply(name, transform, inputs, 1);
        outputs[0]
    }

    pub fn read(&mut self, name: impl Into<String>, source: impl BoundedSource + 'static) -> CollectionId {
        self.apply_one(name, Transform::Read(ReadSource::Bounded(Arc::new(source))), &[])
    }

    pub fn read_from(&mut self, name: impl Into<String>, source: impl ReaderSource + 'static) -> CollectionId {
        self.apply_one(name, Transform::Read(ReadSource::Reader(Arc::new(source))), &[])
    }

    pub fn create(&mut self, name: impl Into<String>, values: impl IntoIterator<Item = Value>) -> CollectionId {
        self.read(name, CreateSource::new(values))
    }

    pub fn test_stream(&mut self, name: impl Into<String>, stream: TestStream) -> CollectionId {
        self.apply_one(name, Transform::TestStream(Arc::new(stream)), &[])
    }

    pub fn par_do(&mut self, name: impl Into<String>, input: CollectionId, dofn: impl DoFn + 'static) -> CollectionId {
        self.apply_one(name, Transform::ParDo(ParDo::new(dofn)), &[input])
    }

    /// ParDo with side inputs or tagged outputs; returns one collection per
    /// output tag, main first.
    pub fn par_do_with(&mut self, name: impl Into<String>, input: CollectionId, par_do: ParDo) -> Vec<CollectionId> {
        let n = par_do.output_tags().len();
        self.apply(name, Transform::ParDo(par_do), &[input], n).1
    }

    pub fn flatten(&mut self, name: impl Into<String>, inputs: &[CollectionId]) -> CollectionId {
        self.apply_one(name, Transform::Flatten, inputs)
    }

    /// Re-windows `input` and records `windowing` on the result for grouping.
    pub fn window_into(&mut self, name: impl Into<String>, input: CollectionId, windowing: Windowing) -> CollectionId {
        let out = self.apply_one(name, Transform::ParDo(ParDo::new(AssignWindows::new(windowing.window_fn.clone()))), &[input]);
        self.collections[out.index()].windowing = windowing;
        out
    }

    /// Groups `[key, value]` pairs per key and window, firing as the input's
    /// windowing dictates. Expands into GroupByKeyOnly and GroupAlsoByWindow.
    pub fn group_by_key(&mut self, name: impl Into<String>, input: CollectionId) -> CollectionId {
        let name = name.into();
        let windowing = self.collection(input).windowing.clone();
        let keyed = self.apply_one(format!("{name}/GroupByKeyOnly"), Transform::GroupByKeyOnly, &[input]);
        self.apply_one(format!("{name}/GroupAlsoByWindow"), Transform::GroupAlsoByWindow(windowing), &[keyed])
    }

    pub fn write(&mut self, name: impl Into<String>, input: CollectionId, sink: impl Sink + 'static) -> StepId {
        self.apply(name, Transform::Write(Arc::new(sink)), &[input], 0).0
    }

    pub fn native(&mut self, name: impl Into<String>, urn: impl Into<String>, inputs: &[CollectionId]) -> CollectionId {
        self.apply_one(name, Transform::Native { urn: urn.into() }, inputs)
    }

    pub fn view(&mut self, collection: CollectionId, kind: ViewKind) -> ViewId {
        let id = ViewId(self.views.len());
        self.views.push(View { id, collection, kind });
        id
    }

    pub fn has_test_stream(&self) -> bool {
        self.steps.iter().any(|s| matches!(s.transform, Transform::TestStream(_)))
    }
}
