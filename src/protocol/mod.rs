//! LUCID agent protocol: topics, message envelopes and retained snapshots
//!
//! Everything that crosses the broker is shaped here.

pub mod messages;
pub mod snapshots;
pub mod topics;

pub use messages::*;
pub use topics::*;
