//! Tracking of which ranges of the capture id space have been routed.

mod tracker;

pub use tracker::{GapScan, GapSummary, GapTracker, ReleaseContext};
