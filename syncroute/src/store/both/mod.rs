pub mod configured;
pub mod memory;
pub mod postgres;
