//! Capture collaborator interface and an in-memory reference implementation.

mod base;
pub mod memory;

pub use base::{CaptureSource, TransactionVisibility};
