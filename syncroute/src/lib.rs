//! Change routing core of a multi-node replication engine.
//!
//! A routing pass claims unrouted ranges of the capture id space from the [`gap`] tracker,
//! evaluates each captured event against its channel policy in the [`router`], and groups
//! the resulting targets into per-node batches through the [`batch`] accumulator. The
//! [`reservation`] manager gates the delivery requests that later stream those batches.
//!
//! [`engine::SyncEngine`] runs all of it from an [`EngineConfig`](config::shared::EngineConfig).

pub mod batch;
pub mod capture;
pub mod catalog;
pub mod concurrency;
pub mod delivery;
pub mod engine;
pub mod error;
pub mod failpoints;
pub mod gap;
mod macros;
pub mod metrics;
pub mod reservation;
pub mod router;
pub mod routing;
pub mod store;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;
pub mod types;
pub mod workers;
