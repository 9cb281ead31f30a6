use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::Duration;
use eddy_core::config::RunnerOptions;
use eddy_core::{Error, Timestamp, TimestampedValue, Value};
use eddy_io::{MemorySink, TestStream};
use eddy_ops::{from_fn, AggregatePanes, Map, Trigger, WindowFn, Windowing};
use eddy_runner::{
    DirectRunner, MetricsFilter, MetricsQueryable, ParDo, Pipeline, PipelineState, RunResult, ViewKind,
};
use parking_lot::Mutex;
use serde_json::json;

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_env_filter("eddy_runner=debug").with_test_writer().try_init();
}

fn sorted(mut values: Vec<Value>) -> Vec<Value> {
    values.sort_by_key(|v| v.to_string());
    values
}

fn small_bundles() -> RunnerOptions {
    RunnerOptions { max_elements_per_bundle: 1, target_parallelism: 4, ..RunnerOptions::default() }
}

async fn finish(run: &mut RunResult) -> eddy_core::Result<PipelineState> {
    run.wait_until_finish(Some(StdDuration::from_secs(30))).await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn batch_group_by_key() {
    init_tracing();
    let mut p = Pipeline::new();
    let pairs = p.create("Create", vec![json!(["a", 1]), json!(["a", 2]), json!(["b", 3])]);
    let grouped = p.group_by_key("GroupByKey", pairs);
    let sink = MemorySink::new();
    p.write("Write", grouped, sink.clone());

    let mut run = DirectRunner::new(small_bundles()).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);

    let mut out = sorted(sink.values());
    for pane in &mut out {
        let values = pane[1].as_array_mut().unwrap();
        values.sort_by_key(|v| v.as_i64());
    }
    assert_eq!(out, vec![json!(["a", [1, 2]]), json!(["b", [3]])]);
    assert_eq!(sink.sessions(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_stream_fires_each_window_once() {
    init_tracing();
    let stream = TestStream::new()
        .advance_watermark_to(Timestamp::from_secs(10))
        .add_elements(vec![json!("a"), json!("b"), json!("c")])
        .advance_watermark_to(Timestamp::from_secs(20))
        .add_elements(vec![json!("d")]);

    let mut p = Pipeline::new();
    let events = p.test_stream("Events", stream);
    let windowed = p.window_into("Window", events, Windowing::new(WindowFn::fixed(Duration::seconds(10))));
    let keyed = p.par_do("Key", windowed, Map::new(|v: &Value| Ok(json!(["k", v]))));
    let grouped = p.group_by_key("GroupByKey", keyed);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let record = seen.clone();
    let panes = p.par_do(
        "Record",
        grouped,
        from_fn(move |e, ctx| {
            record.lock().push(e.timestamp);
            ctx.output(e.clone());
            Ok(())
        }),
    );
    let sink = MemorySink::new();
    p.write("Write", panes, sink.clone());

    let mut run = DirectRunner::new(RunnerOptions::streaming()).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);

    let mut out = sorted(sink.values());
    out[0][1].as_array_mut().unwrap().sort_by_key(|v| v.to_string());
    assert_eq!(out, vec![json!(["k", ["a", "b", "c"]]), json!(["k", ["d"]])]);

    let mut fired = seen.lock().clone();
    fired.sort();
    assert_eq!(fired, vec![Timestamp::from_secs(20).predecessor(), Timestamp::from_secs(30).predecessor()]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn expired_elements_are_dropped_and_counted() {
    init_tracing();
    let stream = TestStream::new()
        .advance_watermark_to(Timestamp::from_secs(20))
        .add_timestamped(vec![
            TimestampedValue::new(json!("too-late"), Timestamp::from_secs(5)),
            TimestampedValue::new(json!("on-time"), Timestamp::from_secs(25)),
        ])
        .advance_watermark_to_infinity();

    let mut p = Pipeline::new();
    let events = p.test_stream("Events", stream);
    let windowed = p.window_into("Window", events, Windowing::new(WindowFn::fixed(Duration::seconds(10))));
    let keyed = p.par_do("Key", windowed, Map::new(|v: &Value| Ok(json!(["k", v]))));
    let grouped = p.group_by_key("GroupByKey", keyed);
    let counted = p.par_do("Count", grouped, AggregatePanes::count());
    let sink = MemorySink::new();
    p.write("Write", counted, sink.clone());

    let mut run = DirectRunner::new(RunnerOptions::streaming()).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);

    let out = sink.values();
    assert_eq!(out.len(), 1);
    assert_eq!(out[0]["key"], json!("k"));
    assert_eq!(out[0]["count"], json!(1));
    let rendered = run.runner_metrics().render();
    assert!(rendered.contains("eddy_dropped_late_elements_total{step=\"GroupByKey/GroupAlsoByWindow\"} 1"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn streaming_group_by_key_with_tiny_bundles() {
    let mut p = Pipeline::new();
    let pairs = p.create("Create", (0..10).map(|i| json!([i % 2, i])));
    let grouped = p.group_by_key("GroupByKey", pairs);
    let sink = MemorySink::new();
    p.write("Write", grouped, sink.clone());

    let options = RunnerOptions { max_elements_per_bundle: 1, ..RunnerOptions::streaming() };
    let mut run = DirectRunner::new(options).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);

    let mut out = sorted(sink.values());
    for pane in &mut out {
        pane[1].as_array_mut().unwrap().sort_by_key(|v| v.as_i64());
    }
    assert_eq!(out, vec![json!([0, [0, 2, 4, 6, 8]]), json!([1, [1, 3, 5, 7, 9]])]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn side_input_waits_for_its_producer() {
    let mut p = Pipeline::new();
    let offsets = p.create("Offsets", vec![json!(10), json!(20)]);
    let view = p.view(offsets, ViewKind::List);
    let numbers = p.create("Numbers", vec![json!(1), json!(2)]);
    let dofn = from_fn(move |e, ctx| {
        let total: i64 = ctx.side_input(view).and_then(Value::as_array).map(|a| a.iter().filter_map(Value::as_i64).sum()).unwrap_or(0);
        let n = e.value.as_i64().unwrap_or(0);
        ctx.emit(e, json!(n + total));
        if n % 2 == 1 {
            ctx.output_to("odd", e.clone());
        }
        Ok(())
    });
    let outputs = p.par_do_with("AddOffsets", numbers, ParDo::new(dofn).with_side_input(view).with_tag("odd"));
    let main = MemorySink::new();
    let odd = MemorySink::new();
    p.write("WriteMain", outputs[0], main.clone());
    p.write("WriteOdd", outputs[1], odd.clone());

    let mut run = DirectRunner::new(small_bundles()).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);
    assert_eq!(sorted(main.values()), vec![json!(31), json!(32)]);
    assert_eq!(odd.values(), vec![json!(1)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn singleton_side_input_with_many_values_fails() {
    let mut p = Pipeline::new();
    let config = p.create("Config", vec![json!(1), json!(2)]);
    let view = p.view(config, ViewKind::Singleton { default: None });
    let numbers = p.create("Numbers", vec![json!(1)]);
    let out = p.par_do_with(
        "UseConfig",
        numbers,
        ParDo::new(from_fn(|e, ctx| {
            ctx.output(e.clone());
            Ok(())
        }))
        .with_side_input(view),
    );
    p.write("Write", out[0], MemorySink::new());

    let mut run = DirectRunner::new(RunnerOptions::default()).run(p).unwrap();
    let err = finish(&mut run).await.unwrap_err();
    assert!(matches!(err, Error::TypeCheck { .. }), "got {err:?}");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unsupported_transform_is_rejected_before_running() {
    let mut p = Pipeline::new();
    let input = p.create("Create", vec![json!(1)]);
    p.native("Reshuffle", "beam:transform:reshuffle:v1", &[input]);
    match DirectRunner::new(RunnerOptions::default()).run(p) {
        Err(Error::NotImplemented { transform, .. }) => assert_eq!(transform, "Reshuffle"),
        other => panic!("expected NotImplemented, got {other:?}"),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn user_error_fails_the_run() {
    let mut p = Pipeline::new();
    let input = p.create("Create", vec![json!(1), json!(0), json!(2)]);
    let divided = p.par_do(
        "Divide",
        input,
        Map::new(|v: &Value| {
            let n = v.as_i64().unwrap_or(0);
            anyhow::ensure!(n != 0, "division by zero");
            Ok(json!(10 / n))
        }),
    );
    p.write("Write", divided, MemorySink::new());

    let mut run = DirectRunner::new(small_bundles()).run(p).unwrap();
    match finish(&mut run).await {
        Err(Error::UserCode { step, source }) => {
            assert_eq!(step, "Divide");
            assert!(source.to_string().contains("division by zero"));
        }
        other => panic!("expected a user code error, got {other:?}"),
    }
    assert_eq!(run.wait_until_finish(None).await.unwrap(), PipelineState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn panics_surface_as_errors() {
    let mut p = Pipeline::new();
    let input = p.create("Create", vec![json!(1)]);
    let out = p.par_do("Explode", input, from_fn(|_, _| panic!("boom")));
    p.write("Write", out, MemorySink::new());

    let mut run = DirectRunner::new(RunnerOptions::default()).run(p).unwrap();
    let err = finish(&mut run).await.unwrap_err();
    assert!(err.to_string().contains("boom"), "got {err}");
    assert_eq!(run.state(), PipelineState::Failed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn user_counters_are_queryable() {
    let mut p = Pipeline::new();
    let input = p.create("Create", vec![json!("a"), json!("bb"), json!("ccc")]);
    let out = p.par_do(
        "Measure",
        input,
        from_fn(|e, ctx| {
            ctx.inc_counter("chars", e.value.as_str().map_or(0, |s| s.len() as i64));
            ctx.inc_counter("seen", 1);
            ctx.output(e.clone());
            Ok(())
        }),
    );
    p.write("Write", out, MemorySink::new());

    let mut run = DirectRunner::new(small_bundles()).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);
    let seen = run.metrics().query(&MetricsFilter::new().with_name("seen"));
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].step, "Measure");
    assert_eq!(seen[0].committed, 3);
    let chars = run.metrics().query(&MetricsFilter::new().with_step("Measure").with_name("chars"));
    assert_eq!(chars[0].committed, 6);
    assert!(run.runner_metrics().render().contains("eddy_elements_processed_total{step=\"Measure\"} 3"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn processing_time_advances_under_test_clock() {
    let stream = TestStream::new()
        .add_elements(vec![json!(["k", 1])])
        .advance_processing_time(Duration::seconds(30))
        .advance_watermark_to_infinity();
    let mut p = Pipeline::new();
    let events = p.test_stream("Events", stream);
    let grouped = p.group_by_key("GroupByKey", events);
    let sink = MemorySink::new();
    p.write("Write", grouped, sink.clone());

    let mut run = DirectRunner::new(RunnerOptions::default()).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);
    assert_eq!(sink.values(), vec![json!(["k", [1]])]);
}

fn at(value: Value, secs: i64) -> TimestampedValue {
    TimestampedValue::new(value, Timestamp::from_secs(secs))
}

fn sorted_panes(mut panes: Vec<Value>) -> Vec<Value> {
    for pane in &mut panes {
        if let Some(values) = pane[1].as_array_mut() {
            values.sort_by_key(|v| v.to_string());
        }
    }
    panes.sort_by_key(|p| (p[1].as_array().map_or(0, Vec::len), p.to_string()));
    panes
}

fn dropped_late(run: &RunResult) -> String {
    run.runner_metrics()
        .render()
        .lines()
        .filter(|l| l.starts_with("eddy_dropped_late_elements_total{"))
        .collect::<Vec<_>>()
        .join("\n")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn on_time_pane_after_early_firing_survives_a_second_grouping() {
    init_tracing();
    let stream = TestStream::new()
        .add_timestamped(vec![at(json!(["k", 1]), 1)])
        .advance_watermark_to(Timestamp::from_secs(12))
        .advance_watermark_to_infinity();
    let early = Windowing::new(WindowFn::fixed(Duration::seconds(10)))
        .with_trigger(Trigger::after_watermark(Some(Trigger::AfterCount(1)), None))
        .with_allowed_lateness(Duration::seconds(5))
        .accumulating();

    let mut p = Pipeline::new();
    let events = p.test_stream("Events", stream);
    let windowed = p.window_into("Early", events, early);
    let first = p.group_by_key("G1", windowed);
    let sizes = p.par_do(
        "PaneSize",
        first,
        Map::new(|v: &Value| Ok(json!(["k2", v[1].as_array().map_or(0, Vec::len)]))),
    );
    let rewindowed = p.window_into("Fixed", sizes, Windowing::new(WindowFn::fixed(Duration::seconds(10))));
    let second = p.group_by_key("G2", rewindowed);
    let sink = MemorySink::new();
    p.write("Write", second, sink.clone());

    let mut run = DirectRunner::new(RunnerOptions::streaming()).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);
    assert_eq!(sink.values(), vec![json!(["k2", [1, 1]])]);
    assert_eq!(dropped_late(&run), "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn early_on_time_and_late_panes() {
    init_tracing();
    let stream = TestStream::new()
        .add_timestamped(vec![at(json!(["k", "a"]), 1)])
        .advance_watermark_to(Timestamp::from_secs(5))
        .add_timestamped(vec![at(json!(["k", "b"]), 2)])
        .advance_watermark_to(Timestamp::from_secs(12))
        .add_timestamped(vec![at(json!(["k", "c"]), 3)])
        .advance_watermark_to(Timestamp::from_secs(20))
        .add_timestamped(vec![at(json!(["k", "d"]), 4)])
        .advance_watermark_to_infinity();
    let windowing = Windowing::new(WindowFn::fixed(Duration::seconds(10)))
        .with_trigger(Trigger::after_watermark(Some(Trigger::AfterCount(1)), Some(Trigger::AfterCount(1))))
        .with_allowed_lateness(Duration::seconds(5))
        .accumulating();

    let mut p = Pipeline::new();
    let events = p.test_stream("Events", stream);
    let windowed = p.window_into("Window", events, windowing);
    let grouped = p.group_by_key("GroupByKey", windowed);
    let sink = MemorySink::new();
    p.write("Write", grouped, sink.clone());

    let mut run = DirectRunner::new(RunnerOptions::streaming()).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);
    assert_eq!(
        sorted_panes(sink.values()),
        vec![
            json!(["k", ["a"]]),
            json!(["k", ["a", "b"]]),
            json!(["k", ["a", "b"]]),
            json!(["k", ["a", "b", "c"]]),
        ]
    );
    // only the element behind the allowed lateness is lost
    assert_eq!(dropped_late(&run), "eddy_dropped_late_elements_total{step=\"GroupByKey/GroupAlsoByWindow\"} 1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sessions_merge_across_bundles() {
    init_tracing();
    let stream = TestStream::new()
        .add_timestamped(vec![at(json!(["k", "a"]), 0)])
        .add_timestamped(vec![at(json!(["k", "b"]), 25), at(json!(["j", "x"]), 100)])
        .add_timestamped(vec![at(json!(["k", "c"]), 8)])
        .add_timestamped(vec![at(json!(["k", "d"]), 16)])
        .advance_watermark_to_infinity();

    let mut p = Pipeline::new();
    let events = p.test_stream("Events", stream);
    let windowed = p.window_into("Sessions", events, Windowing::new(WindowFn::sessions(Duration::seconds(10))));
    let grouped = p.group_by_key("GroupByKey", windowed);
    let sink = MemorySink::new();
    p.write("Write", grouped, sink.clone());

    let mut run = DirectRunner::new(RunnerOptions::streaming()).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);
    assert_eq!(
        sorted_panes(sink.values()),
        vec![json!(["j", ["x"]]), json!(["k", ["a", "b", "c", "d"]])]
    );
    assert_eq!(dropped_late(&run), "");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn processing_time_trigger_fires_when_the_test_clock_advances() {
    init_tracing();
    let stream = TestStream::new()
        .add_elements(vec![json!(["k", 1])])
        .advance_processing_time(Duration::seconds(20))
        .add_elements(vec![json!(["k", 2])])
        .advance_watermark_to_infinity();
    let windowing = Windowing::new(WindowFn::Global)
        .with_trigger(Trigger::repeatedly(Trigger::AfterProcessingTime(Duration::seconds(10))));

    let mut p = Pipeline::new();
    let events = p.test_stream("Events", stream);
    let windowed = p.window_into("Global", events, windowing);
    let grouped = p.group_by_key("GroupByKey", windowed);
    let sink = MemorySink::new();
    p.write("Write", grouped, sink.clone());

    let mut run = DirectRunner::new(RunnerOptions::streaming()).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);
    // the first pane fires on processing time, the second when the window expires
    assert_eq!(sink.values(), vec![json!(["k", [1]]), json!(["k", [2]])]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_input_still_writes_once() {
    let mut p = Pipeline::new();
    let input = p.create("Create", Vec::<Value>::new());
    let sink = MemorySink::new();
    p.write("Write", input, sink.clone());

    let mut run = DirectRunner::new(RunnerOptions::default()).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);
    assert_eq!(sink.sessions(), 1);
    assert!(sink.values().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn negative_counter_increments_stay_queryable() {
    let mut p = Pipeline::new();
    let input = p.create("Create", vec![json!(5), json!(-2)]);
    let out = p.par_do(
        "Balance",
        input,
        from_fn(|e, ctx| {
            ctx.inc_counter("balance", e.value.as_i64().unwrap_or(0));
            ctx.output(e.clone());
            Ok(())
        }),
    );
    p.write("Write", out, MemorySink::new());

    let mut run = DirectRunner::new(RunnerOptions::default()).run(p).unwrap();
    assert_eq!(finish(&mut run).await.unwrap(), PipelineState::Done);
    let balance = run.metrics().query(&MetricsFilter::new().with_name("balance"));
    assert_eq!(balance[0].committed, 3);
    assert!(run.runner_metrics().render().contains("eddy_user_counter_total{name=\"balance\",step=\"Balance\"} 5"));
}
