//! Configuration for the routing engine.
//!
//! All structures here are plain serde types. They are loaded once at startup through
//! [`load_config`] and validated before any component is built from them.

mod environment;
mod load;
pub mod shared;

pub use environment::Environment;
pub use load::{Config, LoadConfigError, load_config, load_config_from};
