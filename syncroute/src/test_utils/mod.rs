//! Helpers for tests of the routing core, backed by the in-memory stores and collaborators.

pub mod environment;
pub mod event;
pub mod failpoints;

pub use crate::capture::memory::MemoryCaptureSource;
pub use crate::catalog::memory::MemoryNodeCatalog;
pub use crate::store::both::memory::MemoryStore;
