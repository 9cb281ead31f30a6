//! Per-step input and output watermarks, holds and fired-timer bookkeeping.
//!
//! The input watermark of a step is bounded by the output watermarks of the
//! steps producing its inputs and by the earliest element still pending for
//! it. The output watermark is further bounded by the step's holds and by any
//! timer that fired but has not been processed yet. Both only move forward.
//!
//! Timers made due by an input watermark are taken out of state in the same
//! pass that computes the step's output, so the output never runs ahead of a
//! due timer.

use std::collections::{HashMap, HashSet, VecDeque};

use eddy_core::{BundleId, EncodedKey, StepId, Timestamp};
use eddy_state::{StateStore, TimerFiring};
use tracing::debug;

use crate::bundle::CommittedBundle;
use crate::graph::Pipeline;

#[derive(Debug)]
struct StepWatermarks {
    name: String,
    input: Timestamp,
    output: Timestamp,
    pending: HashMap<BundleId, Timestamp>,
    holds: HashMap<Option<EncodedKey>, Timestamp>,
    fired: HashSet<TimerFiring>,
}

impl StepWatermarks {
    fn new(name: String) -> Self {
        Self {
            name,
            input: Timestamp::MIN,
            output: Timestamp::MIN,
            pending: HashMap::new(),
            holds: HashMap::new(),
            fired: HashSet::new(),
        }
    }

    fn has_pending_work(&self) -> bool {
        !self.pending.is_empty() || !self.fired.is_empty()
    }
}

/// Everything one completed task changes for its step.
#[derive(Debug)]
pub struct WatermarkUpdate<'a> {
    pub step: StepId,
    pub key: Option<EncodedKey>,
    pub completed: Option<&'a CommittedBundle>,
    pub completed_timers: &'a [TimerFiring],
    pub unprocessed: Option<&'a CommittedBundle>,
    /// Committed outputs with the steps consuming each.
    pub outputs: &'a [(CommittedBundle, Vec<StepId>)],
    /// `None` releases the key's hold.
    pub hold: Option<Timestamp>,
}

#[derive(Debug)]
pub struct WatermarkManager {
    steps: Vec<StepWatermarks>,
    /// Steps producing the inputs of each step.
    producers: Vec<Vec<StepId>>,
    /// Steps consuming the outputs of each step.
    downstream: Vec<Vec<StepId>>,
    /// Timers taken during a refresh, not yet handed to the executor.
    ready: Vec<(StepId, Vec<TimerFiring>)>,
}

impl WatermarkManager {
    pub fn new(pipeline: &Pipeline) -> Self {
        let steps = pipeline.steps().iter().map(|s| StepWatermarks::new(s.name.clone())).collect();
        let producers = pipeline
            .steps()
            .iter()
            .map(|s| s.inputs.iter().map(|c| pipeline.collection(*c).producer).collect())
            .collect();
        let downstream = pipeline
            .steps()
            .iter()
            .map(|s| {
                let mut out: Vec<StepId> = s.outputs.iter().flat_map(|c| pipeline.consumers(*c)).collect();
                out.sort();
                out.dedup();
                out
            })
            .collect();
        Self { steps, producers, downstream, ready: Vec::new() }
    }

    /// `(input, output)` watermarks of `step`.
    pub fn get_watermarks(&self, step: StepId) -> (Timestamp, Timestamp) {
        let s = &self.steps[step.index()];
        (s.input, s.output)
    }

    /// Sets a hold before `step` has run any task.
    pub fn set_hold(&mut self, step: StepId, key: Option<EncodedKey>, hold: Timestamp) {
        self.steps[step.index()].holds.insert(key, hold);
    }

    /// Registers a bundle that `step` has yet to process.
    pub fn add_pending(&mut self, step: StepId, bundle: &CommittedBundle) {
        if let Some(ts) = bundle.min_timestamp() {
            self.steps[step.index()].pending.insert(bundle.id(), ts);
        }
    }

    /// Applies a completed task and propagates the change downstream, firing
    /// the timers of `state` each new input watermark (or `now`) makes due.
    /// Returns the steps whose output watermark advanced.
    pub fn update_watermarks(&mut self, update: WatermarkUpdate<'_>, state: &StateStore, now: Timestamp) -> Vec<StepId> {
        for (bundle, consumers) in update.outputs {
            for consumer in consumers {
                self.add_pending(*consumer, bundle);
            }
        }
        if let Some(unprocessed) = update.unprocessed {
            self.add_pending(update.step, unprocessed);
        }
        let step = &mut self.steps[update.step.index()];
        if let Some(done) = update.completed {
            step.pending.remove(&done.id());
        }
        for timer in update.completed_timers {
            step.fired.remove(timer);
        }
        match update.hold {
            Some(hold) => {
                if hold < step.output {
                    debug!(step = %step.name, %hold, output = %step.output, "hold below output watermark has no effect");
                }
                step.holds.insert(update.key, hold);
            }
            None => {
                step.holds.remove(&update.key);
            }
        }
        self.refresh(update.step, state, now)
    }

    fn compute_input(&self, step: StepId) -> Timestamp {
        let s = &self.steps[step.index()];
        let pending = s.pending.values().min().map_or(Timestamp::MAX, |ts| ts.predecessor());
        let upstream = self.producers[step.index()]
            .iter()
            .map(|p| self.steps[p.index()].output)
            .min()
            .unwrap_or(Timestamp::MAX);
        pending.min(upstream)
    }

    fn compute_output(&self, step: StepId, input: Timestamp) -> Timestamp {
        let s = &self.steps[step.index()];
        let hold = s.holds.values().min().copied().unwrap_or(Timestamp::MAX);
        let fired = s.fired.iter().map(|t| t.timestamp).min().unwrap_or(Timestamp::MAX);
        input.min(hold).min(fired)
    }

    fn refresh(&mut self, start: StepId, state: &StateStore, now: Timestamp) -> Vec<StepId> {
        let mut advanced = Vec::new();
        let mut work = VecDeque::from([start]);
        while let Some(step) = work.pop_front() {
            let input = self.compute_input(step);
            let s = &mut self.steps[step.index()];
            s.input = s.input.max(input);
            let fired = state.take_due_timers(step, s.input, now);
            if !fired.is_empty() {
                debug!(step = %s.name, count = fired.len(), input = %s.input, "timers fired");
                s.fired.extend(fired.iter().cloned());
                self.ready.push((step, fired));
            }
            let output = self.compute_output(step, input);
            let s = &mut self.steps[step.index()];
            if output > s.output {
                debug!(step = %s.name, from = %s.output, to = %output, "output watermark advanced");
                s.output = output;
                advanced.push(step);
                work.extend(self.downstream[step.index()].iter().copied());
            }
        }
        advanced
    }

    /// Hands out the timers fired by earlier refreshes plus every timer the
    /// current watermarks (or `now`) make due. A fired timer holds its step's
    /// output watermark until the task delivering it completes.
    pub fn extract_fired_timers(&mut self, state: &StateStore, now: Timestamp) -> Vec<(StepId, Vec<TimerFiring>)> {
        let mut out = std::mem::take(&mut self.ready);
        for (ix, s) in self.steps.iter_mut().enumerate() {
            let fired = state.take_due_timers(StepId(ix), s.input, now);
            if fired.is_empty() {
                continue;
            }
            debug!(step = %s.name, count = fired.len(), input = %s.input, "timers fired");
            s.fired.extend(fired.iter().cloned());
            match out.iter_mut().find(|(step, _)| step.index() == ix) {
                Some((_, timers)) => timers.extend(fired),
                None => out.push((StepId(ix), fired)),
            }
        }
        out
    }

    pub fn is_done(&self, step: StepId) -> bool {
        self.steps[step.index()].output == Timestamp::MAX
    }

    pub fn all_done(&self) -> bool {
        self.steps.iter().all(|s| s.output == Timestamp::MAX && !s.has_pending_work())
    }

    pub fn output_watermarks(&self) -> impl Iterator<Item = (&str, Timestamp)> {
        self.steps.iter().map(|s| (s.name.as_str(), s.output))
    }
}
