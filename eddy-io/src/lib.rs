//! eddy-io: sources, sinks and the scripted test stream.
//! - `CreateSource`: in-memory values, offsets are element indices
//! - `TextSource`: reads JSONL or CSV, offsets are record numbers
//! - `MemorySink`: collects written values for inspection
//! - `JsonlFileSink`: writes JSON lines to stdout or a file

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

use eddy_core::config::FileFormat;
use eddy_core::{Result, Value};
use parking_lot::Mutex;
use tracing::debug;

pub mod range;
pub mod test_stream;

pub use range::{OffsetRange, OffsetRangeTracker, OFFSET_INFINITY};
pub use test_stream::{TestEvent, TestStream};

/// A finite source read in one pass through an offset range.
pub trait BoundedSource: Send + Sync {
    /// Tracker over `[start, stop)`; `None` bounds default to the whole source.
    fn get_range_tracker(&self, start: Option<i64>, stop: Option<i64>) -> Result<OffsetRangeTracker>;

    /// Emits every record the tracker lets it claim.
    fn read(&self, tracker: &mut OffsetRangeTracker, emit: &mut dyn FnMut(Value)) -> Result<()>;
}

/// A source drained by pulling until exhausted.
pub trait ReaderSource: Send + Sync {
    fn read_all(&self, emit: &mut dyn FnMut(Value)) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct CreateSource {
    values: Arc<Vec<Value>>,
}

impl CreateSource {
    pub fn new(values: impl IntoIterator<Item = Value>) -> Self {
        Self { values: Arc::new(values.into_iter().collect()) }
    }
}

impl BoundedSource for CreateSource {
    fn get_range_tracker(&self, start: Option<i64>, stop: Option<i64>) -> Result<OffsetRangeTracker> {
        OffsetRangeTracker::new(start.unwrap_or(0), stop.unwrap_or(self.values.len() as i64))
    }

    fn read(&self, tracker: &mut OffsetRangeTracker, emit: &mut dyn FnMut(Value)) -> Result<()> {
        let mut offset = tracker.start_position();
        while let Some(v) = usize::try_from(offset).ok().and_then(|i| self.values.get(i)) {
            if !tracker.try_claim(offset)? {
                break;
            }
            emit(v.clone());
            offset += 1;
        }
        Ok(())
    }
}

/// Reads a JSONL or CSV file; CSV headers become object fields.
#[derive(Debug, Clone)]
pub struct TextSource {
    pub path: PathBuf,
    pub format: FileFormat,
}

impl TextSource {
    pub fn jsonl(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), format: FileFormat::Jsonl }
    }

    pub fn csv(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), format: FileFormat::Csv }
    }

    fn records(&self, emit: &mut dyn FnMut(Value) -> Result<bool>) -> Result<()> {
        match self.format {
            FileFormat::Jsonl => {
                let reader = BufReader::new(File::open(&self.path)?);
                for line in reader.lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    if !emit(serde_json::from_str(&line)?)? {
                        break;
                    }
                }
            }
            FileFormat::Csv => {
                let mut rdr = csv::ReaderBuilder::new().has_headers(true).from_path(&self.path)?;
                let headers = rdr.headers()?.clone();
                for row in rdr.records() {
                    let row = row?;
                    let mut obj = serde_json::Map::new();
                    for (h, v) in headers.iter().zip(row.iter()) {
                        obj.insert(h.to_string(), serde_json::json!(v));
                    }
                    if !emit(Value::Object(obj))? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }
}

impl BoundedSource for TextSource {
    fn get_range_tracker(&self, start: Option<i64>, stop: Option<i64>) -> Result<OffsetRangeTracker> {
        OffsetRangeTracker::new(start.unwrap_or(0), stop.unwrap_or(OFFSET_INFINITY))
    }

    fn read(&self, tracker: &mut OffsetRangeTracker, emit: &mut dyn FnMut(Value)) -> Result<()> {
        let mut offset = 0i64;
        let mut read = 0usize;
        self.records(&mut |v| {
            let current = offset;
            offset += 1;
            if current < tracker.start_position() {
                return Ok(true);
            }
            if !tracker.try_claim(current)? {
                return Ok(false);
            }
            read += 1;
            emit(v);
            Ok(true)
        })?;
        debug!(path = %self.path.display(), records = read, "text source read");
        Ok(())
    }
}

/// Destination of a Write step.
pub trait Sink: Send + Sync {
    fn writer(&self) -> Result<Box<dyn SinkWriter>>;
}

/// One write session; `close` commits it.
pub trait SinkWriter: Send {
    fn write(&mut self, value: &Value) -> Result<()>;
    fn close(self: Box<Self>) -> Result<()>;
}

/// Keeps written values in memory and counts writer sessions.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<MemorySinkState>>,
}

#[derive(Debug, Default)]
struct MemorySinkState {
    values: Vec<Value>,
    sessions: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn values(&self) -> Vec<Value> {
        self.inner.lock().values.clone()
    }

    /// Number of writer sessions that were closed.
    pub fn sessions(&self) -> usize {
        self.inner.lock().sessions
    }
}

impl Sink for MemorySink {
    fn writer(&self) -> Result<Box<dyn SinkWriter>> {
        Ok(Box::new(MemoryWriter { sink: self.inner.clone(), buffer: Vec::new() }))
    }
}

struct MemoryWriter {
    sink: Arc<Mutex<MemorySinkState>>,
    buffer: Vec<Value>,
}

impl SinkWriter for MemoryWriter {
    fn write(&mut self, value: &Value) -> Result<()> {
        self.buffer.push(value.clone());
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        let mut state = self.sink.lock();
        state.values.extend(self.buffer);
        state.sessions += 1;
        Ok(())
    }
}

/// Writes each value as a single JSON line to stdout or a file.
#[derive(Debug, Clone, Default)]
pub struct JsonlFileSink {
    pub path: Option<PathBuf>,
}

impl JsonlFileSink {
    pub fn stdout() -> Self {
        Self { path: None }
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self { path: Some(path.into()) }
    }
}

impl Sink for JsonlFileSink {
    fn writer(&self) -> Result<Box<dyn SinkWriter>> {
        let out: Box<dyn Write + Send> = match &self.path {
            Some(p) => Box::new(File::create(p)?),
            None => Box::new(std::io::stdout()),
        };
        Ok(Box::new(JsonlWriter { out: BufWriter::new(out), lines: 0 }))
    }
}

struct JsonlWriter {
    out: BufWriter<Box<dyn Write + Send>>,
    lines: usize,
}

impl SinkWriter for JsonlWriter {
    fn write(&mut self, value: &Value) -> Result<()> {
        serde_json::to_writer(&mut self.out, value)?;
        self.out.write_all(b"\n")?;
        self.lines += 1;
        Ok(())
    }

    fn close(mut self: Box<Self>) -> Result<()> {
        self.out.flush()?;
        debug!(lines = self.lines, "jsonl sink closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tmp_file(name: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        p.push(format!("eddy_io_{name}_{nanos}"));
        p
    }

    fn read_all(source: &dyn BoundedSource, start: Option<i64>, stop: Option<i64>) -> Vec<Value> {
        let mut tracker = source.get_range_tracker(start, stop).unwrap();
        let mut out = Vec::new();
        source.read(&mut tracker, &mut |v| out.push(v)).unwrap();
        out
    }

    #[test]
    fn create_source_reads_subranges() {
        let source = CreateSource::new(vec![json!(1), json!(2), json!(3)]);
        assert_eq!(read_all(&source, None, None), vec![json!(1), json!(2), json!(3)]);
        assert_eq!(read_all(&source, Some(1), Some(2)), vec![json!(2)]);
    }

    #[test]
    fn jsonl_source_skips_blank_lines() {
        let path = tmp_file("in.jsonl");
        std::fs::write(&path, "{\"a\":1}\n\n{\"a\":2}\n{\"a\":3}\n").unwrap();
        let source = TextSource::jsonl(&path);
        assert_eq!(read_all(&source, None, None).len(), 3);
        assert_eq!(read_all(&source, Some(1), Some(2)), vec![json!({"a": 2})]);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn csv_source_uses_headers() {
        let path = tmp_file("in.csv");
        std::fs::write(&path, "word,ts\nhello,1000\nworld,2000\n").unwrap();
        let values = read_all(&TextSource::csv(&path), None, None);
        assert_eq!(values[1], json!({"word": "world", "ts": "2000"}));
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn memory_sink_counts_sessions() {
        let sink = MemorySink::new();
        let mut w = sink.writer().unwrap();
        w.write(&json!("a")).unwrap();
        assert!(sink.values().is_empty());
        w.close().unwrap();
        assert_eq!(sink.values(), vec![json!("a")]);
        assert_eq!(sink.sessions(), 1);
    }

    #[test]
    fn jsonl_sink_writes_lines() {
        let path = tmp_file("out.jsonl");
        let sink = JsonlFileSink::file(&path);
        let mut w = sink.writer().unwrap();
        w.write(&json!({"k": 1})).unwrap();
        w.write(&json!({"k": 2})).unwrap();
        w.close().unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\"k\":1}\n{\"k\":2}\n");
        let _ = std::fs::remove_file(path);
    }
}
