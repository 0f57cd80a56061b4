//! The routing pass: reads unrouted events, routes them and batches the results.

mod pass;
mod reader;

pub use pass::{PassOutcome, PassSummary, RoutingService};
pub use reader::RegroupingReader;
