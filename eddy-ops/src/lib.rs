//! eddy-ops: user functions, windowing and triggering.
//!
//! Included functions:
//! - `Map` / `FlatMap`: one-to-one and one-to-many mapping of JSON values
//! - `Filter`: predicate-based filtering
//! - `KeyBy`: turns a value into a `[key, value]` pair using one of its fields
//! - `WithTimestamps`: event time from a field (epoch millis or RFC3339)
//! - `AssignWindows`: re-windows elements with a [`WindowFn`]
//! - `AggregatePanes`: count/sum/avg/distinct over grouped `[key, [values]]` panes

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use chrono::{DateTime, Utc};
use eddy_core::{as_kv, kv, Timestamp, Value, ViewId, WindowedValue};
use tracing::instrument;

pub mod driver;
pub mod trigger;
pub mod window;

pub use driver::{DriverOutput, Pane, TriggerDriver};
pub use trigger::{NestedContext, Trigger, TriggerContext};
pub use window::{AccumulationMode, WindowFn, Windowing};

/// Tag of the output every ParDo has.
pub const MAIN_OUTPUT: &str = "main";

/// What a [`DoFn`] sees while processing one bundle: side inputs, output
/// buffers per tag and user counters.
#[derive(Debug, Default)]
pub struct ProcessContext {
    side_inputs: Arc<BTreeMap<ViewId, Value>>,
    outputs: BTreeMap<String, Vec<WindowedValue>>,
    counters: BTreeMap<String, i64>,
}

impl ProcessContext {
    pub fn new(side_inputs: Arc<BTreeMap<ViewId, Value>>) -> Self {
        Self { side_inputs, ..Default::default() }
    }

    pub fn side_input(&self, view: ViewId) -> Option<&Value> {
        self.side_inputs.get(&view)
    }

    pub fn output(&mut self, value: WindowedValue) {
        self.output_to(MAIN_OUTPUT, value);
    }

    pub fn output_to(&mut self, tag: &str, value: WindowedValue) {
        self.outputs.entry(tag.to_string()).or_default().push(value);
    }

    /// Outputs `value` with the timestamp and windows of `input`.
    pub fn emit(&mut self, input: &WindowedValue, value: Value) {
        self.output(input.with_value(value));
    }

    /// Adds `by` to a user counter. Negative amounts are committed to the
    /// run's queryable counters but not to the exported prometheus counter.
    pub fn inc_counter(&mut self, name: &str, by: i64) {
        *self.counters.entry(name.to_string()).or_default() += by;
    }

    pub fn take_outputs(&mut self) -> BTreeMap<String, Vec<WindowedValue>> {
        std::mem::take(&mut self.outputs)
    }

    pub fn take_counters(&mut self) -> BTreeMap<String, i64> {
        std::mem::take(&mut self.counters)
    }
}

/// Per-element user code run by a ParDo.
///
/// Example
/// ```no_run
/// use eddy_ops::{DoFn, ProcessContext};
/// use eddy_core::WindowedValue;
///
/// struct Upper;
/// impl DoFn for Upper {
///     fn process(&self, e: &WindowedValue, ctx: &mut ProcessContext) -> anyhow::Result<()> {
///         let s = e.value.as_str().unwrap_or_default().to_uppercase();
///         ctx.emit(e, serde_json::json!(s));
///         Ok(())
///     }
/// }
/// ```
pub trait DoFn: Send + Sync {
    fn start_bundle(&self, _ctx: &mut ProcessContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn process(&self, element: &WindowedValue, ctx: &mut ProcessContext) -> anyhow::Result<()>;

    fn finish_bundle(&self, _ctx: &mut ProcessContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Adapts a closure into a [`DoFn`].
pub struct FnDoFn<F>(pub F);

pub fn from_fn<F>(f: F) -> FnDoFn<F>
where
    F: Fn(&WindowedValue, &mut ProcessContext) -> anyhow::Result<()> + Send + Sync,
{
    FnDoFn(f)
}

impl<F> DoFn for FnDoFn<F>
where
    F: Fn(&WindowedValue, &mut ProcessContext) -> anyhow::Result<()> + Send + Sync,
{
    fn process(&self, element: &WindowedValue, ctx: &mut ProcessContext) -> anyhow::Result<()> {
        (self.0)(element, ctx)
    }
}

/// Map: applies a user function to every value.
///
/// Example
/// ```no_run
/// use eddy_ops::Map;
/// let map = Map::new(|v: &serde_json::Value| Ok(v.clone()));
/// # let _ = map;
/// ```
pub struct Map<F> {
    func: F,
}

impl<F> Map<F>
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> DoFn for Map<F>
where
    F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync,
{
    #[instrument(name = "map_process", skip_all)]
    fn process(&self, element: &WindowedValue, ctx: &mut ProcessContext) -> anyhow::Result<()> {
        let out = (self.func)(&element.value)?;
        ctx.emit(element, out);
        Ok(())
    }
}

/// FlatMap: zero or more outputs per input.
pub struct FlatMap<F> {
    func: F,
}

impl<F> FlatMap<F>
where
    F: Fn(&Value) -> anyhow::Result<Vec<Value>> + Send + Sync,
{
    pub fn new(func: F) -> Self {
        Self { func }
    }
}

impl<F> DoFn for FlatMap<F>
where
    F: Fn(&Value) -> anyhow::Result<Vec<Value>> + Send + Sync,
{
    #[instrument(name = "flat_map_process", skip_all)]
    fn process(&self, element: &WindowedValue, ctx: &mut ProcessContext) -> anyhow::Result<()> {
        for out in (self.func)(&element.value)? {
            ctx.emit(element, out);
        }
        Ok(())
    }
}

/// Filter: keeps inputs that satisfy the predicate.
///
/// Example
/// ```no_run
/// use eddy_ops::Filter;
/// let filter = Filter::new(|v: &serde_json::Value| v.get("ok").and_then(|x| x.as_bool()).unwrap_or(false));
/// # let _ = filter;
/// ```
pub struct Filter<F> {
    pred: F,
}

impl<F> Filter<F>
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    pub fn new(pred: F) -> Self {
        Self { pred }
    }
}

impl<F> DoFn for Filter<F>
where
    F: Fn(&Value) -> bool + Send + Sync,
{
    #[instrument(name = "filter_process", skip_all)]
    fn process(&self, element: &WindowedValue, ctx: &mut ProcessContext) -> anyhow::Result<()> {
        if (self.pred)(&element.value) {
            ctx.output(element.clone());
        } else {
            ctx.inc_counter("filtered", 1);
        }
        Ok(())
    }
}

/// KeyBy: emits `[value[field], value]`; a missing field keys by `null`.
///
/// Example
/// ```no_run
/// use eddy_ops::KeyBy;
/// let key_by = KeyBy::new("word");
/// # let _ = key_by;
/// ```
pub struct KeyBy {
    field: String,
}

impl KeyBy {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl DoFn for KeyBy {
    #[instrument(name = "key_by_process", skip_all)]
    fn process(&self, element: &WindowedValue, ctx: &mut ProcessContext) -> anyhow::Result<()> {
        let key = element.value.get(&self.field).cloned().unwrap_or(Value::Null);
        ctx.emit(element, kv(key, element.value.clone()));
        Ok(())
    }
}

/// Reads an event time from a field holding epoch millis or an RFC3339 string.
pub fn parse_event_time(value: &Value) -> anyhow::Result<Timestamp> {
    match value {
        Value::Number(n) => {
            let ms = n.as_i64().ok_or_else(|| anyhow!("timestamp {n} is not an integer"))?;
            Ok(Timestamp::from_millis(ms))
        }
        Value::String(s) => {
            if let Ok(ms) = s.parse::<i64>() {
                return Ok(Timestamp::from_millis(ms));
            }
            let dt = DateTime::parse_from_rfc3339(s).with_context(|| format!("bad timestamp {s:?}"))?;
            Ok(Timestamp::from_datetime(dt.with_timezone(&Utc)))
        }
        other => Err(anyhow!("unsupported timestamp value {other}")),
    }
}

/// Re-stamps every element with the event time found in `field`.
pub struct WithTimestamps {
    field: String,
}

impl WithTimestamps {
    pub fn new(field: impl Into<String>) -> Self {
        Self { field: field.into() }
    }
}

impl DoFn for WithTimestamps {
    fn process(&self, element: &WindowedValue, ctx: &mut ProcessContext) -> anyhow::Result<()> {
        let raw = element
            .value
            .get(&self.field)
            .ok_or_else(|| anyhow!("missing time field {:?}", self.field))?;
        let timestamp = parse_event_time(raw)?;
        ctx.output(WindowedValue::new(element.value.clone(), timestamp, element.windows.clone()));
        Ok(())
    }
}

/// Replaces each element's windows with those assigned by a [`WindowFn`].
pub struct AssignWindows {
    window_fn: WindowFn,
}

impl AssignWindows {
    pub fn new(window_fn: WindowFn) -> Self {
        Self { window_fn }
    }
}

impl DoFn for AssignWindows {
    fn process(&self, element: &WindowedValue, ctx: &mut ProcessContext) -> anyhow::Result<()> {
        let windows = self.window_fn.assign(element.timestamp);
        ctx.output(WindowedValue::new(element.value.clone(), element.timestamp, windows));
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggKind {
    Count,
    Sum { field: String },
    Avg { field: String },
    Distinct { field: String },
}

fn as_f64(v: &Value) -> f64 {
    match v {
        Value::Number(n) => n.as_f64().unwrap_or(0.0),
        Value::String(s) => s.parse::<f64>().unwrap_or(0.0),
        _ => 0.0,
    }
}

fn stringify(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Folds a grouped pane `[key, [values...]]` into one record
/// `{"key", "window_start", "window_end", <kind>}` per window.
pub struct AggregatePanes {
    kind: AggKind,
}

impl AggregatePanes {
    pub fn new(kind: AggKind) -> Self {
        Self { kind }
    }

    pub fn count() -> Self {
        Self::new(AggKind::Count)
    }

    fn fold(&self, values: &[Value]) -> Value {
        let field_of = |v: &Value, field: &str| v.get(field).cloned().unwrap_or(Value::Null);
        match &self.kind {
            AggKind::Count => serde_json::json!(values.len() as i64),
            AggKind::Sum { field } => serde_json::json!(values.iter().map(|v| as_f64(&field_of(v, field))).sum::<f64>()),
            AggKind::Avg { field } => {
                let sum: f64 = values.iter().map(|v| as_f64(&field_of(v, field))).sum();
                let avg = if values.is_empty() { 0.0 } else { sum / values.len() as f64 };
                serde_json::json!(avg)
            }
            AggKind::Distinct { field } => {
                let set: HashSet<String> = values.iter().map(|v| stringify(&field_of(v, field))).collect();
                serde_json::json!(set.len() as i64)
            }
        }
    }

    fn label(&self) -> &'static str {
        match self.kind {
            AggKind::Count => "count",
            AggKind::Sum { .. } => "sum",
            AggKind::Avg { .. } => "avg",
            AggKind::Distinct { .. } => "distinct",
        }
    }
}

impl DoFn for AggregatePanes {
    #[instrument(name = "aggregate_process", skip_all)]
    fn process(&self, element: &WindowedValue, ctx: &mut ProcessContext) -> anyhow::Result<()> {
        let (key, values) = as_kv(&element.value).ok_or_else(|| anyhow!("expected [key, values] pane"))?;
        let values = values.as_array().ok_or_else(|| anyhow!("pane values must be an array"))?;
        let aggregate = self.fold(values);
        for w in &element.windows {
            let mut obj = serde_json::Map::new();
            obj.insert("key".into(), key.clone());
            obj.insert("window_start".into(), window_bound(w.start()));
            obj.insert("window_end".into(), window_bound(w.end()));
            obj.insert(self.label().into(), aggregate.clone());
            ctx.output(WindowedValue::new(Value::Object(obj), element.timestamp, vec![w.clone()]));
        }
        Ok(())
    }
}

fn window_bound(ts: Timestamp) -> Value {
    if ts.is_sentinel() {
        Value::Null
    } else {
        serde_json::json!(ts.millis())
    }
}
