//! Replays a scripted stream through one-minute windows with early firings
//! every two elements and a late pane for data arriving within the allowed
//! lateness.

use anyhow::Result;
use chrono::Duration;
use eddy_core::config::RunnerOptions;
use eddy_core::{Timestamp, TimestampedValue};
use eddy_io::{JsonlFileSink, TestStream};
use eddy_ops::{AggregatePanes, KeyBy, Trigger, WindowFn, Windowing};
use eddy_runner::{DirectRunner, MetricsFilter, MetricsQueryable, Pipeline};
use serde_json::json;

fn click(user: &str, secs: i64) -> TimestampedValue {
    TimestampedValue::new(json!({ "user": user, "secs": secs }), Timestamp::from_secs(secs))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();

    let stream = TestStream::new()
        .add_timestamped(vec![click("ana", 5), click("bo", 12), click("ana", 20)])
        .advance_watermark_to(Timestamp::from_secs(30))
        .add_timestamped(vec![click("ana", 45)])
        .advance_watermark_to(Timestamp::from_secs(70))
        .add_timestamped(vec![click("ana", 50), click("bo", 75)])
        .advance_processing_time(Duration::seconds(10))
        .advance_watermark_to_infinity();

    let windowing = Windowing::new(WindowFn::fixed(Duration::minutes(1)))
        .with_trigger(Trigger::after_watermark(Some(Trigger::AfterCount(2)), Some(Trigger::AfterCount(1))))
        .with_allowed_lateness(Duration::seconds(30))
        .accumulating();

    let mut p = Pipeline::new();
    let clicks = p.test_stream("Clicks", stream);
    let windowed = p.window_into("Minutes", clicks, windowing);
    let keyed = p.par_do("ByUser", windowed, KeyBy::new("user"));
    let grouped = p.group_by_key("GroupByUser", keyed);
    let counted = p.par_do("Count", grouped, AggregatePanes::count());
    p.write("Print", counted, JsonlFileSink::stdout());

    let mut run = DirectRunner::new(RunnerOptions::streaming()).run(p)?;
    let state = run.wait_until_finish(None).await?;
    let counters = run.metrics().query(&MetricsFilter::new());
    tracing::info!(?state, counters = counters.len(), "streaming windows finished");
    println!("{}", run.runner_metrics().render());
    Ok(())
}
