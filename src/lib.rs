//! Courier - reliable domain-event delivery.
//!
//! Takes events raised by aggregates, stages them in a transactional outbox,
//! relays them to an AMQP broker, and re-dispatches them to in-process
//! handlers with retry, dead-lettering, circuit breaking and monitoring.

pub mod admin;
pub mod aggregate;
pub mod broker;
pub mod bus;
pub mod circuit;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod event;
pub mod monitoring;
pub mod outbox;
pub mod publisher;
pub mod reliability;
pub mod utils;

#[cfg(test)]
pub(crate) mod test_utils;
