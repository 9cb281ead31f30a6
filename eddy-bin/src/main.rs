use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::{extract::State, routing::get, Router};
use clap::{Parser, Subcommand};
use eddy_core::config::{parse_duration, FileFormat, PipelineConfig};
use eddy_core::metrics::RunnerMetrics;
use eddy_io::{JsonlFileSink, TextSource};
use eddy_ops::{AggregatePanes, KeyBy, WindowFn, Windowing, WithTimestamps};
use eddy_runner::{DirectRunner, Pipeline, PipelineState};

#[derive(Parser, Debug)]
#[command(name = "eddy", version, about = "eddy direct runner CLI", disable_help_subcommand = false)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the windowed count pipeline described by a pipeline.toml
    Run {
        #[arg(short, long)]
        config: PathBuf,
        #[arg(long, default_value_t = 0)]
        http_port: u16,
    },
    /// Parse and validate a pipeline.toml without running it
    Validate {
        #[arg(short, long)]
        config: PathBuf,
    },
}

fn app(metrics: RunnerMetrics) -> Router {
    Router::new().route("/metrics", get(render_metrics)).with_state(metrics)
}

async fn render_metrics(State(metrics): State<RunnerMetrics>) -> String {
    metrics.render()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    tracing_subscriber::fmt().with_env_filter(filter).init();
    let cli = Cli::parse();
    match cli.command {
        Commands::Validate { config } => {
            let cfg = load_config(&config).await?;
            build_pipeline(&cfg)?;
            println!("{} is valid", config.display());
            Ok(())
        }
        Commands::Run { config, http_port } => {
            let cfg = load_config(&config).await?;
            let pipeline = build_pipeline(&cfg)?;
            let mut run = DirectRunner::new(cfg.runner.clone()).run(pipeline)?;
            if http_port != 0 {
                let app = app(run.runner_metrics().clone());
                let addr = SocketAddr::from(([127, 0, 0, 1], http_port));
                let listener = tokio::net::TcpListener::bind(addr).await?;
                tracing::info!("serving /metrics on {}", addr);
                tokio::spawn(async move {
                    if let Err(e) = axum::serve(listener, app).await {
                        tracing::warn!(error = %e, "metrics server stopped");
                    }
                });
            }
            let state = run.wait_until_finish(None).await?;
            anyhow::ensure!(state == PipelineState::Done, "pipeline ended as {state:?}");
            Ok(())
        }
    }
}

async fn load_config(path: &Path) -> anyhow::Result<PipelineConfig> {
    let text = tokio::fs::read_to_string(path).await?;
    Ok(PipelineConfig::from_toml_str(&text)?)
}

fn windowing(cfg: &PipelineConfig) -> anyhow::Result<Windowing> {
    let required = |field: &Option<String>, name: &str| -> anyhow::Result<chrono::Duration> {
        let text = field.as_deref().ok_or_else(|| anyhow::anyhow!("window.{name} is missing"))?;
        Ok(parse_duration(text)?)
    };
    let window_fn = match cfg.window.kind.as_str() {
        "global" => WindowFn::Global,
        "fixed" => WindowFn::fixed(required(&cfg.window.size, "size")?),
        "sliding" => WindowFn::sliding(required(&cfg.window.size, "size")?, required(&cfg.window.slide, "slide")?),
        "session" => WindowFn::sessions(required(&cfg.window.gap, "gap")?),
        other => anyhow::bail!("unsupported window type: {other}"),
    };
    Ok(Windowing::new(window_fn).with_allowed_lateness(parse_duration(&cfg.time.allowed_lateness)?))
}

/// Source -> event times -> windows -> key -> group -> count -> sink.
fn build_pipeline(cfg: &PipelineConfig) -> anyhow::Result<Pipeline> {
    let count_by = cfg.ops.count_by.clone().ok_or_else(|| anyhow::anyhow!("ops.count_by must be set"))?;
    let source = match cfg.source.format {
        FileFormat::Jsonl => TextSource::jsonl(&cfg.source.path),
        FileFormat::Csv => TextSource::csv(&cfg.source.path),
    };
    let sink = match (cfg.sink.kind.as_str(), &cfg.sink.path) {
        ("file", Some(path)) => JsonlFileSink::file(path),
        _ => JsonlFileSink::stdout(),
    };

    let mut p = Pipeline::new();
    let records = p.read("ReadRecords", source);
    let stamped = p.par_do("WithTimestamps", records, WithTimestamps::new(cfg.source.time_field.clone()));
    let windowed = p.window_into("Window", stamped, windowing(cfg)?);
    let keyed = p.par_do("KeyBy", windowed, KeyBy::new(count_by));
    let grouped = p.group_by_key("GroupByKey", keyed);
    let counts = p.par_do("Count", grouped, AggregatePanes::count());
    p.write("Write", counts, sink);
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{self, Body};
    use axum::http::Request;
    use tower::util::ServiceExt;

    const CONFIG: &str = r#"
        [source]
        kind = "file"
        path = "events.jsonl"
        time_field = "ts"

        [time]
        allowed_lateness = "5s"

        [window]
        type = "sliding"
        size = "1m"
        slide = "30s"

        [ops]
        count_by = "word"

        [sink]
        kind = "stdout"
    "#;

    #[tokio::test]
    async fn metrics_endpoint_returns_text() {
        let metrics = RunnerMetrics::new().unwrap();
        metrics.elements_processed.with_label_values(&["Count"]).inc();
        let res = app(metrics)
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(res.status().is_success());
        let body = body::to_bytes(res.into_body(), 1_048_576).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("eddy_elements_processed_total{step=\"Count\"} 1"));
    }

    #[test]
    fn builds_the_count_pipeline() {
        let cfg = PipelineConfig::from_toml_str(CONFIG).unwrap();
        let w = windowing(&cfg).unwrap();
        assert_eq!(w.window_fn, WindowFn::sliding(chrono::Duration::minutes(1), chrono::Duration::seconds(30)));
        assert_eq!(w.allowed_lateness, chrono::Duration::seconds(5));

        let p = build_pipeline(&cfg).unwrap();
        let names: Vec<_> = p.steps().iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "ReadRecords",
                "WithTimestamps",
                "Window",
                "KeyBy",
                "GroupByKey/GroupByKeyOnly",
                "GroupByKey/GroupAlsoByWindow",
                "Count",
                "Write"
            ]
        );
    }

    #[tokio::test]
    async fn loads_config_from_disk() {
        let path = std::env::temp_dir().join(format!("eddy-bin-config-{}.toml", std::process::id()));
        tokio::fs::write(&path, CONFIG).await.unwrap();
        let cfg = load_config(&path).await.unwrap();
        assert_eq!(cfg.ops.count_by.as_deref(), Some("word"));
        assert!(load_config(Path::new("/nonexistent/eddy.toml")).await.is_err());
        tokio::fs::remove_file(&path).await.ok();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn counts_words_per_window() {
        let dir = std::env::temp_dir().join(format!("eddy-bin-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let input = dir.join("words.jsonl");
        let output = dir.join("counts.jsonl");
        std::fs::write(
            &input,
            "{\"word\":\"a\",\"ts\":1000}\n{\"word\":\"a\",\"ts\":2000}\n{\"word\":\"b\",\"ts\":61000}\n",
        )
        .unwrap();
        let text = format!(
            "[source]\nkind = \"file\"\npath = {:?}\ntime_field = \"ts\"\n[time]\n[window]\ntype = \"fixed\"\nsize = \"1m\"\n[ops]\ncount_by = \"word\"\n[sink]\nkind = \"file\"\npath = {:?}\n",
            input, output
        );
        let cfg = PipelineConfig::from_toml_str(&text).unwrap();
        let mut run = DirectRunner::new(cfg.runner.clone()).run(build_pipeline(&cfg).unwrap()).unwrap();
        assert_eq!(run.wait_until_finish(None).await.unwrap(), PipelineState::Done);

        let mut lines: Vec<serde_json::Value> = std::fs::read_to_string(&output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        lines.sort_by_key(|v| v["key"].to_string());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["key"], "a");
        assert_eq!(lines[0]["count"], 2);
        assert_eq!(lines[1]["key"], "b");
        assert_eq!(lines[1]["count"], 1);
        std::fs::remove_dir_all(&dir).ok();
    }
}
