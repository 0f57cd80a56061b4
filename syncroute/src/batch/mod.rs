//! Grouping of routed events into outgoing batches.

mod accumulator;
mod algorithm;

pub use accumulator::{BatchAccumulator, RoutingDecision};
pub use algorithm::BatchSettings;
