//! Router policy engine: computes the target nodes of captured events.

pub mod column_match;
mod engine;
pub mod expression;
pub mod lookup;
mod policy;
pub mod subselect;

pub use engine::{PolicyBackends, RouterEngine};
pub use expression::{ExpressionBindings, ExpressionEvaluator};
pub use lookup::LookupTableSource;
pub use policy::{ChannelPolicies, ChannelPolicy, RoutingPolicy};
pub use subselect::SubselectExecutor;
