pub mod lease;
pub mod shutdown;
