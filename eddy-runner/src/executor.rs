//! Schedules evaluator tasks on the tokio runtime and feeds their results
//! back through the evaluation context until every watermark is at +inf.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use eddy_core::{EncodedKey, Error, Result, StepId, Value, ViewId};
use eddy_ops::TriggerDriver;
use eddy_state::TimerFiring;
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

use crate::bundle::CommittedBundle;
use crate::context::{CommitOutcome, EvaluationContext, TransformResult};
use crate::evaluators::WriteEvaluator;
use crate::registry::{EvaluatorKind, EvaluatorRegistry};
use crate::side_inputs::Lookup;

/// One unit of work: a bundle and/or fired timers for one step and key.
#[derive(Debug, Clone)]
pub struct Task {
    pub step: StepId,
    pub key: Option<EncodedKey>,
    pub bundle: Option<CommittedBundle>,
    pub timers: Vec<TimerFiring>,
}

impl Task {
    fn bundle(step: StepId, key: Option<EncodedKey>, bundle: CommittedBundle) -> Self {
        Self { step, key, bundle: Some(bundle), timers: Vec::new() }
    }
}

struct Completion {
    task: Task,
    result: Result<TransformResult>,
}

pub(crate) struct Executor {
    ctx: Arc<EvaluationContext>,
    registry: Arc<EvaluatorRegistry>,
    kinds: Vec<EvaluatorKind>,
}

impl Executor {
    pub fn new(ctx: Arc<EvaluationContext>, registry: Arc<EvaluatorRegistry>) -> Result<Self> {
        let kinds = ctx.pipeline().steps().iter().map(|step| registry.lookup(step)).collect::<Result<Vec<_>>>()?;
        Ok(Self { ctx, registry, kinds })
    }

    fn kind(&self, step: StepId) -> EvaluatorKind {
        self.kinds[step.index()]
    }

    fn root_tasks(&self) -> Result<Vec<Task>> {
        let pipeline = self.ctx.pipeline();
        pipeline
            .roots()
            .into_iter()
            .map(|root| {
                let bundle = self.registry.root_bundle(pipeline.step(root))?;
                Ok(Task::bundle(root, None, self.ctx.commit_root_bundle(root, bundle)))
            })
            .collect()
    }

    /// Resolves every side input the task's step reads, or parks the task
    /// until the first unready view is finalized.
    fn resolve_side_inputs(&self, task: &Task) -> Result<Option<Arc<BTreeMap<ViewId, Value>>>> {
        let views = self.ctx.pipeline().step(task.step).side_inputs();
        if views.is_empty() {
            return Ok(Some(Arc::default()));
        }
        let mut values = BTreeMap::new();
        for view in views {
            match self.ctx.get_value_or_schedule_after_output(*view, task.clone())? {
                Lookup::Ready(value, _) => {
                    values.insert(*view, value);
                }
                Lookup::Blocked => {
                    debug!(step = %task.step, %view, "task waits for side input");
                    return Ok(None);
                }
            }
        }
        Ok(Some(Arc::new(values)))
    }

    fn schedule(&self, task: &Task, outcome: CommitOutcome, queue: &mut VecDeque<Task>) {
        for (bundle, consumers) in outcome.bundles {
            for consumer in consumers {
                let key = if self.kind(consumer).is_keyed() { bundle.key().clone() } else { None };
                queue.push_back(Task::bundle(consumer, key, bundle.clone()));
            }
        }
        if let Some(rest) = outcome.unprocessed {
            queue.push_back(Task::bundle(task.step, task.key.clone(), rest));
        }
        for delivery in outcome.timers {
            queue.push_back(Task { step: delivery.step, key: delivery.key, bundle: None, timers: delivery.timers });
        }
        queue.extend(outcome.unblocked);
    }

    fn spawn(&self, task: Task, side_inputs: Arc<BTreeMap<ViewId, Value>>, tx: mpsc::UnboundedSender<Completion>) {
        let ctx = self.ctx.clone();
        let registry = self.registry.clone();
        let step_name = ctx.pipeline().step(task.step).name.clone();
        tokio::spawn(async move {
            let work = task.clone();
            let joined = tokio::task::spawn_blocking(move || run_task(&ctx, &registry, work, side_inputs)).await;
            let result = match joined {
                Ok(result) => result,
                Err(e) if e.is_panic() => Err(Error::UserCode {
                    step: step_name,
                    source: anyhow::anyhow!("task panicked: {}", panic_message(e.into_panic())),
                }),
                Err(e) => Err(Error::UserCode { step: step_name, source: anyhow::anyhow!(e) }),
            };
            let _ = tx.send(Completion { task, result });
        });
    }

    /// Drives the pipeline to completion. The first failure stops dispatch;
    /// tasks already running are drained before it is returned.
    pub async fn run(self) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Completion>();
        let parallelism = self.ctx.options().target_parallelism.max(1);
        let idle_poll = Duration::from_millis(self.ctx.options().idle_poll_interval_ms);
        let test_clock = self.ctx.options().use_test_clock;

        for (ix, kind) in self.kinds.iter().enumerate() {
            if *kind == EvaluatorKind::Write {
                let (state, hold) = WriteEvaluator::initial_state();
                self.ctx.seed_step(StepId(ix), state, hold);
            }
        }
        let mut queue: VecDeque<Task> = self.root_tasks()?.into();
        let mut in_flight = 0usize;
        let mut busy: HashSet<StepId> = HashSet::new();
        let mut waiting: HashMap<StepId, VecDeque<Task>> = HashMap::new();
        // test stream events are replayed only once everything else is idle
        let mut quiescent: VecDeque<Task> = VecDeque::new();
        let mut failure: Option<Error> = None;

        loop {
            while failure.is_none() && in_flight < parallelism {
                let Some(task) = queue.pop_front() else { break };
                if self.kind(task.step) == EvaluatorKind::TestStream {
                    quiescent.push_back(task);
                    continue;
                }
                let serial = self.kind(task.step).must_execute_serially();
                if serial && busy.contains(&task.step) {
                    waiting.entry(task.step).or_default().push_back(task);
                    continue;
                }
                let side_inputs = match self.resolve_side_inputs(&task) {
                    Ok(Some(values)) => values,
                    Ok(None) => continue,
                    Err(e) => {
                        error!(step = %task.step, error = %e, "side input failed");
                        failure = Some(e);
                        break;
                    }
                };
                if serial {
                    busy.insert(task.step);
                }
                trace!(step = %task.step, timers = task.timers.len(), "dispatching task");
                self.spawn(task, side_inputs, tx.clone());
                in_flight += 1;
            }

            if in_flight == 0 {
                if let Some(err) = failure {
                    return Err(err);
                }
                if !queue.is_empty() {
                    continue;
                }
                if self.ctx.is_done(None) {
                    return Ok(());
                }
                let fired = self.ctx.extract_fired_timers();
                if !fired.is_empty() {
                    queue.extend(
                        fired.into_iter().map(|d| Task { step: d.step, key: d.key, bundle: None, timers: d.timers }),
                    );
                    continue;
                }
                if let Some(task) = quiescent.pop_front() {
                    trace!(step = %task.step, "replaying next test stream event");
                    self.spawn(task, Arc::default(), tx.clone());
                    in_flight += 1;
                    continue;
                }
                if self.ctx.has_real_time_timers() && !test_clock {
                    tokio::time::sleep(idle_poll).await;
                    continue;
                }
                return Err(Error::Stalled(self.ctx.describe_watermarks()));
            }

            let Some(Completion { task, result }) = rx.recv().await else {
                return Err(Error::invariant("task channel closed while tasks were running"));
            };
            in_flight -= 1;
            if busy.remove(&task.step) {
                if let Some(next) = waiting.get_mut(&task.step).and_then(VecDeque::pop_front) {
                    queue.push_front(next);
                }
            }
            let committed =
                result.and_then(|r| self.ctx.handle_result(task.bundle.as_ref(), &task.timers, r));
            match committed {
                Ok(outcome) => {
                    if failure.is_none() {
                        self.schedule(&task, outcome, &mut queue);
                    }
                }
                Err(e) => {
                    error!(step = %self.ctx.pipeline().step(task.step).name, error = %e, "task failed");
                    failure.get_or_insert(e);
                }
            }
        }
    }
}

fn run_task(
    ctx: &EvaluationContext,
    registry: &EvaluatorRegistry,
    task: Task,
    side_inputs: Arc<BTreeMap<ViewId, Value>>,
) -> Result<TransformResult> {
    let started = Instant::now();
    let step = ctx.pipeline().step(task.step);
    let exec = ctx.get_execution_context(task.step, task.key, side_inputs);
    let mut evaluator = registry.create(step, exec)?;
    evaluator.start_bundle()?;
    // end-of-window firings before garbage collection of the same window
    let mut timers = task.timers;
    timers.sort_by_key(|t| (TriggerDriver::is_gc_timer(t), t.timestamp));
    for timer in timers {
        evaluator.process_timer(timer)?;
    }
    if let Some(bundle) = &task.bundle {
        for element in bundle.elements() {
            evaluator.process_element(element)?;
        }
    }
    let result = evaluator.finish_bundle()?;
    ctx.metrics()
        .task_latency_ms
        .with_label_values(&[&step.name])
        .observe(started.elapsed().as_secs_f64() * 1000.0);
    Ok(result)
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
