//! Background workers driving routing passes and table maintenance.

pub mod purge;
pub mod routing;

pub use purge::PurgeWorkerHandle;
pub use routing::RoutingWorkerHandle;
