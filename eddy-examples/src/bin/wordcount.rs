use anyhow::Result;
use eddy_core::config::RunnerOptions;
use eddy_io::{JsonlFileSink, TextSource};
use eddy_ops::{FlatMap, Map};
use eddy_runner::{DirectRunner, Pipeline};
use serde_json::{json, Value};

const SAMPLE: &[&str] = &[
    "the quick brown fox",
    "jumps over the lazy dog",
    "the dog sleeps",
];

// Usage: wordcount [input.jsonl]; each line is an object with a "text" field.
#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()))
        .init();

    let mut p = Pipeline::new();
    let lines = match std::env::args().nth(1) {
        Some(path) => p.read("ReadLines", TextSource::jsonl(path)),
        None => p.create("ReadLines", SAMPLE.iter().map(|line| json!({ "text": line }))),
    };
    let words = p.par_do(
        "SplitWords",
        lines,
        FlatMap::new(|v: &Value| {
            let text = v.get("text").and_then(Value::as_str).unwrap_or("");
            Ok(text.split_whitespace().map(|w| json!([w.to_lowercase(), 1])).collect())
        }),
    );
    let grouped = p.group_by_key("GroupWords", words);
    let counts = p.par_do(
        "Format",
        grouped,
        Map::new(|v: &Value| {
            let word = v[0].clone();
            let count = v[1].as_array().map_or(0, Vec::len);
            Ok(json!({ "word": word, "count": count }))
        }),
    );
    p.write("Print", counts, JsonlFileSink::stdout());

    let mut run = DirectRunner::new(RunnerOptions::default()).run(p)?;
    let state = run.wait_until_finish(None).await?;
    tracing::info!(?state, "wordcount finished");
    Ok(())
}
