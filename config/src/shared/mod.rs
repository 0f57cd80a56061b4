mod base;
mod channel;
mod connection;
mod engine;
mod reservation;
mod routing;
mod store;

pub use base::*;
pub use channel::*;
pub use connection::*;
pub use engine::*;
pub use reservation::*;
pub use routing::*;
pub use store::*;
