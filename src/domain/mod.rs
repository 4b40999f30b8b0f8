//! Domain model: transactions, features, decisions and the ports the
//! application layer talks to.

pub mod decision;
pub mod features;
pub mod ports;
pub mod scoring;
pub mod transaction;
pub mod velocity;
