//! eddy-core: fundamental types shared by every eddy crate.
//!
//! - `Timestamp`, `Clock` and the -inf/+inf watermark sentinels
//! - `Window`, `WindowedValue`, `TimestampedValue` and KV helpers
//! - `Coder` for key encoding
//! - arena ids for steps, collections, views and bundles
//! - the crate-wide `Error` and `Result`
//! - runner configuration and per-run metrics
//!
//! Quick example:
//! ```no_run
//! use eddy_core::{Timestamp, Window, WindowedValue};
//! let v = WindowedValue::new(serde_json::json!(["k", 1]), Timestamp::from_millis(10), vec![Window::Global]);
//! let (k, _) = eddy_core::as_kv(&v.value).unwrap();
//! assert_eq!(k, "k");
//! ```

pub mod coder;
pub mod config;
pub mod ids;
pub mod metrics;
pub mod time;
pub mod value;
pub mod window;

pub use coder::{Coder, JsonCoder};
pub use ids::{BundleId, CollectionId, StepId, ViewId};
pub use time::{Clock, RealClock, TestClock, Timestamp};
pub use value::{as_kv, kv, EncodedKey, TimestampedValue, Value, WindowedValue};
pub use window::Window;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("type check failed in step {step}: {message}")]
    TypeCheck { step: String, message: String },
    #[error("transform {transform} ({capability}) is not implemented for the direct runner")]
    NotImplemented { transform: String, capability: String },
    #[error("invariant violated: {0}")]
    Invariant(String),
    #[error("error in step {step}: {source}")]
    UserCode {
        step: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("pipeline stalled: {0}")]
    Stalled(String),
    #[error("invalid pipeline: {0}")]
    InvalidPipeline(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
    #[error(transparent)]
    Metrics(#[from] prometheus::Error),
}

impl Error {
    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

pub mod prelude {
    pub use super::{
        as_kv, kv, Clock, CollectionId, Error, Result, StepId, Timestamp, TimestampedValue, Value, ViewId, Window,
        WindowedValue,
    };
}
