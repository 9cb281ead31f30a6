use std::path::{Path, PathBuf};

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

fn default_parallelism() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

fn default_bundle_size() -> usize {
    1000
}

fn default_idle_poll_ms() -> u64 {
    100
}

/// Knobs for one direct-runner run.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct RunnerOptions {
    /// Selects the streaming GroupByKeyOnly evaluator.
    #[serde(default)]
    pub streaming: bool,
    #[serde(default = "default_parallelism")]
    pub target_parallelism: usize,
    #[serde(default = "default_bundle_size")]
    pub max_elements_per_bundle: usize,
    /// Sleep between polls while only real-clock processing-time timers are pending.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_interval_ms: u64,
    /// Forced on when the pipeline contains a test stream.
    #[serde(default)]
    pub use_test_clock: bool,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            streaming: false,
            target_parallelism: default_parallelism(),
            max_elements_per_bundle: default_bundle_size(),
            idle_poll_interval_ms: default_idle_poll_ms(),
            use_test_clock: false,
        }
    }
}

impl RunnerOptions {
    pub fn streaming() -> Self {
        Self { streaming: true, ..Self::default() }
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let opts: RunnerOptions = toml::from_str(text)?;
        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<()> {
        if self.target_parallelism == 0 {
            return Err(Error::InvalidConfig("target_parallelism must be at least 1".into()));
        }
        if self.max_elements_per_bundle == 0 {
            return Err(Error::InvalidConfig("max_elements_per_bundle must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Jsonl,
    Csv,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SourceConfig {
    pub kind: String, // "file"
    pub path: PathBuf,
    #[serde(default = "default_format")]
    pub format: FileFormat,
    pub time_field: String, // e.g., "event_time" or "ts"
}

fn default_format() -> FileFormat {
    FileFormat::Jsonl
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct TimeConfig {
    #[serde(default = "default_lateness")]
    pub allowed_lateness: String, // e.g., "10s"
}

fn default_lateness() -> String {
    "0s".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WindowConfig {
    #[serde(rename = "type")]
    pub kind: String, // global|fixed|sliding|session
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub slide: Option<String>,
    #[serde(default)]
    pub gap: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct OpsConfig {
    #[serde(default)]
    pub count_by: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SinkConfig {
    pub kind: String, // "file" | "stdout"
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub time: TimeConfig,
    pub window: WindowConfig,
    pub ops: OpsConfig,
    pub sink: SinkConfig,
    #[serde(default)]
    pub runner: RunnerOptions,
}

impl PipelineConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let cfg: PipelineConfig = toml::from_str(text)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.kind.as_str() != "file" {
            return Err(Error::InvalidConfig(format!("unsupported source kind: {}", self.source.kind)));
        }
        match self.sink.kind.as_str() {
            "stdout" => {}
            "file" if self.sink.path.is_some() => {}
            "file" => return Err(Error::InvalidConfig("sink.path must be set for a file sink".into())),
            other => return Err(Error::InvalidConfig(format!("unsupported sink kind: {other}"))),
        }
        if self.ops.count_by.is_none() {
            return Err(Error::InvalidConfig("ops.count_by must be set (e.g., word field)".into()));
        }
        let needs = |field: &Option<String>, name: &str| -> Result<()> {
            match field {
                Some(s) => parse_duration(s).map(|_| ()),
                None => Err(Error::InvalidConfig(format!("window.{name} must be set for {} windows", self.window.kind))),
            }
        };
        match self.window.kind.as_str() {
            "global" => {}
            "fixed" => needs(&self.window.size, "size")?,
            "sliding" => {
                needs(&self.window.size, "size")?;
                needs(&self.window.slide, "slide")?;
            }
            "session" => needs(&self.window.gap, "gap")?,
            other => return Err(Error::InvalidConfig(format!("unsupported window type: {other}"))),
        }
        parse_duration(&self.time.allowed_lateness)?;
        self.runner.validate()
    }
}

/// Parses values like "10s", "500ms", "2m" or "1h"; a bare number means seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let bad = |_| Error::InvalidConfig(format!("invalid duration: {s:?}"));
    if let Some(num) = s.strip_suffix("ms") {
        return Ok(Duration::milliseconds(num.trim().parse::<i64>().map_err(bad)?));
    }
    if let Some(num) = s.strip_suffix('s') {
        return Ok(Duration::seconds(num.trim().parse::<i64>().map_err(bad)?));
    }
    if let Some(num) = s.strip_suffix('m') {
        return Ok(Duration::minutes(num.trim().parse::<i64>().map_err(bad)?));
    }
    if let Some(num) = s.strip_suffix('h') {
        return Ok(Duration::hours(num.trim().parse::<i64>().map_err(bad)?));
    }
    Ok(Duration::seconds(s.parse::<i64>().map_err(bad)?))
}
