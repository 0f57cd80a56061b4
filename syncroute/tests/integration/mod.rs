mod delivery_test;
mod engine_test;
mod routing_test;
