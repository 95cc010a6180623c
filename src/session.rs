//! Session coordination: the task that owns the piece store, the peer
//! table, and the choke scheduler, and drives a download to completion.
//!
//! The coordinator and the per-peer tasks communicate exclusively by
//! message passing. Each peer task sends session events upward; the
//! coordinator answers with peer commands (choke flips, HAVE
//! advertisements, endgame cancels, shutdown) through a per-peer channel.
//! Neither side holds a reference into the other.

mod coordinator;
mod event;
mod peer_task;

pub use coordinator::{Session, SessionError};

#[cfg(test)]
mod tests;
