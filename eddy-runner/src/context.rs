//! The shared state of one run and its single commit point.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use eddy_core::config::RunnerOptions;
use eddy_core::metrics::RunnerMetrics;
use eddy_core::{
    BundleId, Clock, CollectionId, Coder, EncodedKey, Error, JsonCoder, Result, StepId, Timestamp, Value, ViewId,
};
use eddy_state::{KeyedState, StateStore, TimeDomain, TimerFiring};
use parking_lot::Mutex;
use tracing::debug;

use crate::bundle::{CommittedBundle, UncommittedBundle};
use crate::executor::Task;
use crate::graph::Pipeline;
use crate::metrics::DirectMetrics;
use crate::side_inputs::{Lookup, SideInputContainer};
use crate::watermark::{WatermarkManager, WatermarkUpdate};

/// What an evaluator instance sees of the run: its step's watermarks, the
/// run's clock, the key's state and the resolved side inputs.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub step: StepId,
    pub step_name: String,
    pub key: Option<EncodedKey>,
    pub input_watermark: Timestamp,
    pub output_watermark: Timestamp,
    pub now: Timestamp,
    /// Taken out of the store; handed back through [`TransformResult::state`].
    pub state: KeyedState,
    pub side_inputs: Arc<BTreeMap<ViewId, Value>>,
}

impl ExecutionContext {
    pub fn new(step: StepId, step_name: impl Into<String>) -> Self {
        Self {
            step,
            step_name: step_name.into(),
            key: None,
            input_watermark: Timestamp::MIN,
            output_watermark: Timestamp::MIN,
            now: Timestamp::ZERO,
            state: KeyedState::default(),
            side_inputs: Arc::default(),
        }
    }

    pub fn result(&self) -> TransformResult {
        TransformResult::new(self.step, self.key.clone())
    }
}

/// Output of one evaluator run, committed by [`EvaluationContext::handle_result`].
#[derive(Debug, Default)]
pub struct TransformResult {
    pub step: StepId,
    pub key: Option<EncodedKey>,
    pub outputs: Vec<UncommittedBundle>,
    /// Work the step hands back to itself, such as the rest of a test stream.
    pub unprocessed: Option<UncommittedBundle>,
    /// Earliest timestamp the key may still emit at; `None` releases the hold.
    pub hold: Option<Timestamp>,
    /// State to store for the key; `None` leaves the stored state untouched.
    pub state: Option<KeyedState>,
    pub counters: BTreeMap<String, i64>,
    pub elements_processed: u64,
    pub dropped_late: u64,
}

impl TransformResult {
    pub fn new(step: StepId, key: Option<EncodedKey>) -> Self {
        Self { step, key, ..Default::default() }
    }
}

/// What the executor has to schedule after a commit.
#[derive(Debug, Default)]
pub struct CommitOutcome {
    pub bundles: Vec<(CommittedBundle, Vec<StepId>)>,
    pub unprocessed: Option<CommittedBundle>,
    pub timers: Vec<TimerDelivery>,
    pub unblocked: Vec<Task>,
}

/// Fired timers of one key of one step, delivered in a single task.
#[derive(Debug, Clone)]
pub struct TimerDelivery {
    pub step: StepId,
    pub key: Option<EncodedKey>,
    pub timers: Vec<TimerFiring>,
}

struct CommitState {
    watermarks: WatermarkManager,
    next_bundle: usize,
}

impl CommitState {
    fn next_id(&mut self) -> BundleId {
        let id = BundleId(self.next_bundle);
        self.next_bundle += 1;
        id
    }
}

pub struct EvaluationContext {
    pipeline: Arc<Pipeline>,
    options: RunnerOptions,
    clock: Arc<dyn Clock>,
    state: StateStore,
    side_inputs: SideInputContainer<Task>,
    commit: Mutex<CommitState>,
    metrics: RunnerMetrics,
    counters: DirectMetrics,
    coder: JsonCoder,
}

impl EvaluationContext {
    pub fn new(
        pipeline: Arc<Pipeline>,
        options: RunnerOptions,
        clock: Arc<dyn Clock>,
        metrics: RunnerMetrics,
        counters: DirectMetrics,
    ) -> Self {
        let watermarks = WatermarkManager::new(&pipeline);
        let side_inputs = SideInputContainer::new(pipeline.views());
        Self {
            pipeline,
            options,
            clock,
            state: StateStore::new(),
            side_inputs,
            commit: Mutex::new(CommitState { watermarks, next_bundle: 0 }),
            metrics,
            counters,
            coder: JsonCoder,
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn options(&self) -> &RunnerOptions {
        &self.options
    }

    pub fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub fn metrics(&self) -> &RunnerMetrics {
        &self.metrics
    }

    pub fn encode_key(&self, key: &Value) -> Result<EncodedKey> {
        self.coder.encode(key)
    }

    pub fn create_bundle(&self, collection: CollectionId) -> UncommittedBundle {
        UncommittedBundle::new(Some(collection))
    }

    pub fn create_keyed_bundle(&self, collection: CollectionId, key: EncodedKey) -> UncommittedBundle {
        UncommittedBundle::keyed(Some(collection), Some(key))
    }

    /// Commits the impulse bundle of a root step and registers it as pending.
    pub fn commit_root_bundle(&self, step: StepId, bundle: UncommittedBundle) -> CommittedBundle {
        let mut guard = self.commit.lock();
        let id = guard.next_id();
        let committed = bundle.commit(id, self.clock.now());
        guard.watermarks.add_pending(step, &committed);
        committed
    }

    /// Gives a step state and a hold before any of its tasks runs.
    pub fn seed_step(&self, step: StepId, state: KeyedState, hold: Timestamp) {
        let mut guard = self.commit.lock();
        self.state.put(step, None, state);
        guard.watermarks.set_hold(step, None, hold);
    }

    pub fn get_watermarks(&self, step: StepId) -> (Timestamp, Timestamp) {
        self.commit.lock().watermarks.get_watermarks(step)
    }

    /// Hands the key's state to the task about to run.
    pub fn get_execution_context(
        &self,
        step: StepId,
        key: Option<EncodedKey>,
        side_inputs: Arc<BTreeMap<ViewId, Value>>,
    ) -> ExecutionContext {
        let (input_watermark, output_watermark) = self.get_watermarks(step);
        let state = self.state.take(step, &key);
        ExecutionContext {
            step,
            step_name: self.pipeline.step(step).name.clone(),
            key,
            input_watermark,
            output_watermark,
            now: self.clock.now(),
            state,
            side_inputs,
        }
    }

    pub fn get_value_or_schedule_after_output(&self, view: ViewId, task: Task) -> Result<Lookup<Task>> {
        self.side_inputs.get_value_or_schedule_after_output(view, task)
    }

    /// The single commit point of a run: stores state, commits outputs,
    /// advances watermarks, fires timers and finalizes side inputs, all
    /// under one lock.
    pub fn handle_result(
        &self,
        completed: Option<&CommittedBundle>,
        completed_timers: &[TimerFiring],
        result: TransformResult,
    ) -> Result<CommitOutcome> {
        let pipeline = &self.pipeline;
        let step_name = pipeline.step(result.step).name.as_str();
        let mut guard = self.commit.lock();
        if let Some(state) = result.state {
            self.state.put(result.step, result.key.clone(), state);
        }
        let now = self.clock.now();

        let mut bundles = Vec::with_capacity(result.outputs.len());
        for out in result.outputs {
            let collection = out
                .collection
                .ok_or_else(|| Error::invariant(format!("step {step_name} produced a bundle without a collection")))?;
            let bundle = out.commit(guard.next_id(), now);
            for view in pipeline.views_of(collection) {
                self.side_inputs.add_values(view, bundle.elements().iter().map(|e| e.value.clone()))?;
            }
            debug!(step = step_name, bundle = %bundle.id(), elements = bundle.len(), "bundle committed");
            bundles.push((bundle, pipeline.consumers(collection)));
        }
        let unprocessed = result.unprocessed.map(|u| {
            let id = guard.next_id();
            u.commit(id, now)
        });

        let update = WatermarkUpdate {
            step: result.step,
            key: result.key,
            completed,
            completed_timers,
            unprocessed: unprocessed.as_ref(),
            outputs: &bundles,
            hold: result.hold,
        };
        let advanced = guard.watermarks.update_watermarks(update, &self.state, now);
        for step in advanced {
            let (_, output) = guard.watermarks.get_watermarks(step);
            self.metrics.record_watermark(&pipeline.step(step).name, output);
        }

        self.metrics.elements_processed.with_label_values(&[step_name]).inc_by(result.elements_processed);
        self.metrics.bundles_committed.with_label_values(&[step_name]).inc_by(bundles.len() as u64);
        if result.dropped_late > 0 {
            self.metrics.dropped_late.with_label_values(&[step_name]).inc_by(result.dropped_late);
        }
        for (name, by) in &result.counters {
            match u64::try_from(*by) {
                Ok(by) => self.metrics.user_counters.with_label_values(&[step_name, name]).inc_by(by),
                // prometheus counters only go up; the decrement still reaches DirectMetrics
                Err(_) => debug!(step = step_name, counter = %name, by, "negative increment not exported"),
            }
        }
        self.counters.commit(step_name, &result.counters);

        let timers = self.extract_locked(&mut guard, now);

        let mut unblocked = Vec::new();
        for view in pipeline.views() {
            let producer = pipeline.collection(view.collection).producer;
            if !self.side_inputs.is_ready(view.id) && guard.watermarks.is_done(producer) {
                unblocked.extend(self.side_inputs.finalize_value_and_get_tasks(view.id)?);
            }
        }

        Ok(CommitOutcome { bundles, unprocessed, timers, unblocked })
    }

    fn extract_locked(&self, guard: &mut CommitState, now: Timestamp) -> Vec<TimerDelivery> {
        let mut per_key: HashMap<(StepId, Option<EncodedKey>), Vec<TimerFiring>> = HashMap::new();
        for (step, fired) in guard.watermarks.extract_fired_timers(&self.state, now) {
            for timer in fired {
                per_key.entry((step, timer.key.clone())).or_default().push(timer);
            }
        }
        per_key.into_iter().map(|((step, key), timers)| TimerDelivery { step, key, timers }).collect()
    }

    /// Fires whatever timers the current watermarks and clock make due.
    pub fn extract_fired_timers(&self) -> Vec<TimerDelivery> {
        let mut guard = self.commit.lock();
        self.extract_locked(&mut guard, self.clock.now())
    }

    /// Whether `step` (or, for `None`, the whole pipeline) has finished.
    pub fn is_done(&self, step: Option<StepId>) -> bool {
        let guard = self.commit.lock();
        match step {
            Some(step) => guard.watermarks.is_done(step),
            None => guard.watermarks.all_done(),
        }
    }

    pub fn has_real_time_timers(&self) -> bool {
        self.state.has_timers(TimeDomain::RealTime)
    }

    /// Output watermarks per step, for stall diagnostics.
    pub fn describe_watermarks(&self) -> String {
        let guard = self.commit.lock();
        guard
            .watermarks
            .output_watermarks()
            .map(|(name, wm)| format!("{name}={wm}"))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl std::fmt::Debug for EvaluationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationContext")
            .field("steps", &self.pipeline.steps().len())
            .field("options", &self.options)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
