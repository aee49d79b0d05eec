//! Shared protocol definitions for wing ↔ relay and edge ↔ login traffic.
//! Keeping this in a dedicated crate lets wings written in other runtimes
//! mirror the envelopes without pulling in the relay itself.

pub mod gossip;
pub mod wing;

pub use gossip::*;
pub use wing::*;
