//! Intake of delivery requests from syncing nodes.

mod service;

pub use service::{DEFAULT_CHANNEL_QUEUE, DeliveryService, PullRequest, PullResponse};
