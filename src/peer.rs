//! Peer wire protocol: handshake, message codec, framed transport, and the
//! per-connection machinery built on top of them.
//!
//! A connection starts with the 68-byte handshake authenticating the
//! torrent, then exchanges length-prefixed messages. [`PeerLink`] owns the
//! socket and splits into a reading half and a back-pressured writing half;
//! [`RequestPipeline`] keeps a window of block requests in flight;
//! [`PeerScorer`] and [`ChokeScheduler`] implement the tit-for-tat policy
//! deciding which peers get our upload bandwidth.

mod bitfield;
mod choking;
mod error;
mod link;
mod message;
mod peer_id;
mod pipeline;
mod scorer;
mod transport;

pub use bitfield::Bitfield;
pub use choking::{ChokeDecision, ChokeScheduler, PeerSample};
pub use error::PeerError;
pub use link::{PeerHandle, PeerLink, PeerReader};
pub use message::{Handshake, Message, MessageId, HANDSHAKE_LEN};
pub use peer_id::PeerId;
pub use pipeline::{BlockRequest, RequestPipeline};
pub use scorer::PeerScorer;
pub use transport::PeerTransport;

#[cfg(test)]
mod tests;
