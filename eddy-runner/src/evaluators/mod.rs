//! One evaluator per transform kind.
//!
//! An evaluator is created per task with the task's [`ExecutionContext`],
//! sees `start_bundle`, then timers and elements, and returns everything it
//! produced from `finish_bundle`.

use eddy_core::{Error, Result, WindowedValue};
use eddy_state::TimerFiring;

use crate::context::TransformResult;

pub mod flatten;
pub mod group_also_by_window;
pub mod group_by_key;
pub mod par_do;
pub mod read;
pub mod test_stream;
pub mod write;

pub use flatten::FlattenEvaluator;
pub use group_also_by_window::GroupAlsoByWindowEvaluator;
pub use group_by_key::{GroupByKeyOnlyEvaluator, StreamingGroupByKeyOnlyEvaluator};
pub use par_do::ParDoEvaluator;
pub use read::ReadEvaluator;
pub use test_stream::TestStreamEvaluator;
pub use write::WriteEvaluator;

pub trait TransformEvaluator: Send {
    fn start_bundle(&mut self) -> Result<()> {
        Ok(())
    }

    fn process_element(&mut self, element: &WindowedValue) -> Result<()>;

    fn process_timer(&mut self, timer: TimerFiring) -> Result<()> {
        Err(Error::invariant(format!("unexpected timer {:?} on a step without timers", timer.id)))
    }

    fn finish_bundle(self: Box<Self>) -> Result<TransformResult>;
}
