//! Tracker protocols: peer discovery over HTTP and UDP.
//!
//! Trackers are the rendezvous points of a swarm: a client announces its
//! presence and statistics and receives endpoints of other peers.
//!
//! Two transports are supported behind one [`Tracker`] variant:
//!
//! - **HTTP**: a GET with percent-encoded binary parameters; the response
//!   is a bencoded dictionary whose `peers` key is either a list of
//!   dictionaries or a compact string of 6-byte (IPv4, port) entries.
//! - **UDP** (BEP-15): a connect/announce exchange of fixed binary frames
//!   with exponential retransmission.
//!
//! [`TrackerSet`] fans an announce out to every tracker of a torrent
//! concurrently, returns as soon as one succeeds, and feeds peers found by
//! stragglers through a channel.

mod client;
mod error;
mod http;
mod response;
mod udp;

pub use client::{Tracker, TrackerSet};
pub use error::TrackerError;
pub use http::HttpTracker;
pub use response::{parse_compact_peers, AnnounceRequest, AnnounceResponse, TrackerEvent};
pub use udp::UdpTracker;
