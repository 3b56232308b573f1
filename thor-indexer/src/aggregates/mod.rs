//! Rollup views and the refresher keeping them in step with ingestion

pub mod refresher;
pub mod trigger;
pub mod views;

pub use refresher::{AggregateRefresher, RefreshMode, RefreshOutcome, RefresherState};
pub use trigger::{coalescing, Trigger, TriggerReceiver};
pub use views::{AggregateView, Bucket, Metric};
