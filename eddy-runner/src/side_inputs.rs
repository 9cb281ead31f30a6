//! Readiness of side-input views and the tasks waiting on them.

use std::collections::{BTreeMap, HashMap};

use eddy_core::{as_kv, Error, Result, Value, ViewId};
use parking_lot::Mutex;
use tracing::debug;

use crate::graph::{View, ViewKind};

/// Result of asking for a view's value on behalf of a task.
#[derive(Debug)]
pub enum Lookup<T> {
    Ready(Value, T),
    /// The task was parked and comes back from
    /// [`SideInputContainer::finalize_value_and_get_tasks`].
    Blocked,
}

#[derive(Debug)]
struct ViewState<T> {
    kind: ViewKind,
    pending: Vec<Value>,
    value: Option<Value>,
    waiting: Vec<T>,
}

/// All views of a run behind one lock. A view moves from pending to ready
/// exactly once and never back.
#[derive(Debug)]
pub struct SideInputContainer<T> {
    views: Mutex<HashMap<ViewId, ViewState<T>>>,
}

impl<T> SideInputContainer<T> {
    pub fn new<'a>(views: impl IntoIterator<Item = &'a View>) -> Self {
        let views = views
            .into_iter()
            .map(|v| (v.id, ViewState { kind: v.kind.clone(), pending: Vec::new(), value: None, waiting: Vec::new() }))
            .collect();
        Self { views: Mutex::new(views) }
    }

    pub fn get_value_or_schedule_after_output(&self, view: ViewId, task: T) -> Result<Lookup<T>> {
        let mut views = self.views.lock();
        let state = views.get_mut(&view).ok_or_else(|| Error::invariant(format!("unknown side input {view}")))?;
        match &state.value {
            Some(v) => Ok(Lookup::Ready(v.clone(), task)),
            None => {
                state.waiting.push(task);
                Ok(Lookup::Blocked)
            }
        }
    }

    pub fn add_values(&self, view: ViewId, values: impl IntoIterator<Item = Value>) -> Result<()> {
        let mut views = self.views.lock();
        let state = views.get_mut(&view).ok_or_else(|| Error::invariant(format!("unknown side input {view}")))?;
        if state.value.is_some() {
            return Err(Error::invariant(format!("side input {view} received values after it was finalized")));
        }
        state.pending.extend(values);
        Ok(())
    }

    pub fn is_ready(&self, view: ViewId) -> bool {
        self.views.lock().get(&view).is_some_and(|s| s.value.is_some())
    }

    /// Materializes the view and hands back every task that waited for it.
    pub fn finalize_value_and_get_tasks(&self, view: ViewId) -> Result<Vec<T>> {
        let mut views = self.views.lock();
        let state = views.get_mut(&view).ok_or_else(|| Error::invariant(format!("unknown side input {view}")))?;
        if state.value.is_some() {
            return Err(Error::invariant(format!("side input {view} finalized twice")));
        }
        let value = materialize(view, &state.kind, std::mem::take(&mut state.pending))?;
        debug!(%view, waiting = state.waiting.len(), "side input ready");
        state.value = Some(value);
        Ok(std::mem::take(&mut state.waiting))
    }
}

fn materialize(view: ViewId, kind: &ViewKind, values: Vec<Value>) -> Result<Value> {
    let type_error = |message: String| Error::TypeCheck { step: view.to_string(), message };
    match kind {
        ViewKind::Iterable | ViewKind::List => Ok(Value::Array(values)),
        ViewKind::Singleton { default } => match values.len() {
            1 => Ok(values.into_iter().next().unwrap_or(Value::Null)),
            0 => default.clone().ok_or_else(|| type_error("singleton view is empty and has no default".into())),
            n => Err(type_error(format!("singleton view has {n} elements"))),
        },
        ViewKind::Dict => {
            let mut map = BTreeMap::new();
            for v in &values {
                let (k, val) = as_kv(v).ok_or_else(|| type_error(format!("dict view needs [key, value] pairs, got {v}")))?;
                let key = match k {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                if map.insert(key.clone(), val.clone()).is_some() {
                    return Err(type_error(format!("dict view has duplicate key {key}")));
                }
            }
            Ok(Value::Object(map.into_iter().collect()))
        }
    }
}
