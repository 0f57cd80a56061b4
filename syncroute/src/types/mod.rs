mod batch;
mod event;
mod gap;
mod ids;
mod node;

pub use batch::*;
pub use event::*;
pub use gap::*;
pub use ids::*;
pub use node::*;
