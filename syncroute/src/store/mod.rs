pub mod batch;
pub mod both;
pub mod gap;
pub mod lease;
pub mod migrations;
