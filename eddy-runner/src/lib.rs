//! eddy-runner: executes a [`Pipeline`] locally, bundle by bundle, tracking
//! watermarks, state, timers and side inputs the way a distributed runner
//! would.
//!
//! ```no_run
//! use eddy_io::MemorySink;
//! use eddy_runner::{DirectRunner, Pipeline, PipelineState};
//! use eddy_core::config::RunnerOptions;
//! use serde_json::json;
//!
//! # async fn demo() -> eddy_core::Result<()> {
//! let mut p = Pipeline::new();
//! let pairs = p.create("Create", vec![json!(["a", 1]), json!(["a", 2])]);
//! let grouped = p.group_by_key("GroupByKey", pairs);
//! let sink = MemorySink::new();
//! p.write("Write", grouped, sink.clone());
//!
//! let mut run = DirectRunner::new(RunnerOptions::default()).run(p)?;
//! assert_eq!(run.wait_until_finish(None).await?, PipelineState::Done);
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use eddy_core::config::RunnerOptions;
use eddy_core::metrics::RunnerMetrics;
use eddy_core::{Clock, Error, RealClock, Result, TestClock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

pub mod bundle;
pub mod context;
pub mod evaluators;
pub mod executor;
pub mod graph;
pub mod metrics;
pub mod registry;
pub mod side_inputs;
pub mod watermark;

pub use bundle::{CommittedBundle, KeyedWorkItem, UncommittedBundle};
pub use graph::{Capability, ParDo, Pipeline, ReadSource, Step, Transform, View, ViewKind};
pub use metrics::{CounterResult, DirectMetrics, MetricsFilter, MetricsQueryable};

use context::EvaluationContext;
use executor::Executor;
use registry::EvaluatorRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Running,
    Done,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Default)]
pub struct DirectRunner {
    options: RunnerOptions,
}

impl DirectRunner {
    pub fn new(options: RunnerOptions) -> Self {
        Self { options }
    }

    /// Validates the pipeline and starts executing it on the current tokio
    /// runtime.
    pub fn run(&self, pipeline: Pipeline) -> Result<RunResult> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| Error::InvalidConfig("the direct runner needs a tokio runtime".into()))?;
        let mut options = self.options.clone();
        options.validate()?;
        if pipeline.has_test_stream() {
            options.use_test_clock = true;
        }
        let test_clock = options.use_test_clock.then(|| Arc::new(TestClock::default()));
        let clock: Arc<dyn Clock> = match &test_clock {
            Some(clock) => clock.clone(),
            None => Arc::new(RealClock),
        };

        let registry = Arc::new(EvaluatorRegistry::new(options.clone(), test_clock));
        registry.validate(&pipeline)?;

        let metrics = RunnerMetrics::new()?;
        let counters = DirectMetrics::new();
        let steps = pipeline.steps().len();
        let streaming = options.streaming;
        let ctx = Arc::new(EvaluationContext::new(
            Arc::new(pipeline),
            options,
            clock,
            metrics.clone(),
            counters.clone(),
        ));
        let executor = Executor::new(ctx, registry)?;

        info!(steps, streaming, "pipeline started");
        let handle = runtime.spawn(async move {
            let outcome = executor.run().await;
            match &outcome {
                Ok(()) => info!("pipeline finished"),
                Err(e) => warn!(error = %e, "pipeline failed"),
            }
            outcome
        });
        Ok(RunResult { handle: Some(handle), state: PipelineState::Running, metrics, counters })
    }
}

/// Handle to a running pipeline.
pub struct RunResult {
    handle: Option<JoinHandle<Result<()>>>,
    state: PipelineState,
    metrics: RunnerMetrics,
    counters: DirectMetrics,
}

impl RunResult {
    pub fn state(&self) -> PipelineState {
        self.state
    }

    /// Waits for the run to end, or for `timeout`, after which the run is
    /// still `Running`. The first failure is returned as the error; later
    /// calls report `Failed`.
    pub async fn wait_until_finish(&mut self, timeout: Option<Duration>) -> Result<PipelineState> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(self.state);
        };
        let joined = match timeout {
            Some(limit) => match tokio::time::timeout(limit, handle).await {
                Ok(joined) => joined,
                Err(_) => return Ok(PipelineState::Running),
            },
            None => handle.await,
        };
        self.handle = None;
        match joined {
            Ok(Ok(())) => {
                self.state = PipelineState::Done;
                Ok(self.state)
            }
            Ok(Err(e)) => {
                self.state = PipelineState::Failed;
                Err(e)
            }
            Err(e) if e.is_cancelled() => {
                self.state = PipelineState::Cancelled;
                Ok(self.state)
            }
            Err(e) => {
                self.state = PipelineState::Failed;
                Err(Error::Anyhow(anyhow::anyhow!(e)))
            }
        }
    }

    /// User counters committed so far.
    pub fn metrics(&self) -> &DirectMetrics {
        &self.counters
    }

    pub fn runner_metrics(&self) -> &RunnerMetrics {
        &self.metrics
    }
}

impl Drop for RunResult {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            if !handle.is_finished() {
                warn!("run result dropped while the pipeline is still running");
            }
        }
    }
}

impl std::fmt::Debug for RunResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunResult").field("state", &self.state).finish_non_exhaustive()
    }
}
