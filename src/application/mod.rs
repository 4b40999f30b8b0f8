//! Application layer: the admission gate, the scoring pipeline and the
//! services around it.
//!
//! Everything here talks to the outside world only through the ports in
//! [`crate::domain::ports`]. [`gateway::Gateway`] wires the pieces together.

pub mod admission;
pub mod breaker;
pub mod cleanup;
pub mod decision;
pub mod emv;
pub mod extractor;
pub mod failover;
pub mod gateway;
pub mod health;
pub mod ingestion;
pub mod pipeline;
pub mod scoring;
pub mod stability;
