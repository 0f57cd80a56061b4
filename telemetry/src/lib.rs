//! Tracing setup shared by binaries and tests.

mod logging;

pub use logging::{LogFlusher, TracingError, init_test_tracing, init_tracing};
