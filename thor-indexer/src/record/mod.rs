//! Event recording and the running totals it maintains

pub mod depth;
pub mod recorder;
pub mod running_totals;

pub use depth::DepthRecorder;
pub use recorder::{EventRecorder, RecordStats};
pub use running_totals::{PoolDepths, RunningTotals};
